use crate::alarm::Alarm;
use crate::config::Config;
use crate::consent::ConsentStore;
use crate::fingerprint::{self, PlatformQuery};
use crate::prefs::{PREF_NEXT_ALARM, Prefs};
use crate::submit::SubmissionClient;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Outcome of evaluating consent, config and the checkin record.
///
/// Consumed immediately: either a submission starts now, or `next_interval_ms`
/// says how long until the current cadence makes one due (0 when the cycle
/// is skipped outright and existing timers are left alone).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleDecision {
    pub should_report_now: bool,
    pub next_interval_ms: i64,
}

impl ScheduleDecision {
    fn skip() -> Self {
        Self {
            should_report_now: false,
            next_interval_ms: 0,
        }
    }
}

/// The checkin state machine.
///
/// One instance per agent process. Each wake runs a single serialized cycle:
/// evaluate, maybe submit, record the outcome, rearm the alarm. The
/// `in_flight` guard makes the at-most-one-submission invariant structural;
/// a wake that lands while a cycle is outstanding is dropped, not queued.
pub struct CheckinScheduler {
    config: Arc<Config>,
    prefs: Arc<Prefs>,
    consent: Arc<ConsentStore>,
    platform: Arc<dyn PlatformQuery>,
    client: Arc<dyn SubmissionClient>,
    alarm: Arc<dyn Alarm>,
    in_flight: AtomicBool,
}

impl CheckinScheduler {
    pub fn new(
        config: Arc<Config>,
        prefs: Arc<Prefs>,
        consent: Arc<ConsentStore>,
        platform: Arc<dyn PlatformQuery>,
        client: Arc<dyn SubmissionClient>,
        alarm: Arc<dyn Alarm>,
    ) -> Self {
        Self {
            config,
            prefs,
            consent,
            platform,
            client,
            alarm,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn consent(&self) -> &ConsentStore {
        &self.consent
    }

    /// Gate shared by every reporting path: persistent opt-out marker, user
    /// consent, and endpoint configuration. A `false` here means skip with
    /// existing timers left alone.
    pub fn is_eligible(&self) -> bool {
        match self.consent.check_persistent_opt_out_marker() {
            Ok(true) => {
                tracing::debug!("Persistent opt-out set, skipping");
                return false;
            }
            Ok(false) => {}
            Err(e) => {
                // Storage trouble degrades to best effort; re-evaluated next wake.
                tracing::warn!("Opt-out marker check failed: {e}");
            }
        }

        if !self.consent.is_reporting_allowed() {
            tracing::debug!("User has not opted in");
            return false;
        }

        if self.config.endpoint_base().is_none() {
            tracing::error!("This ROM is not configured for statistics");
            return false;
        }

        true
    }

    /// Decide whether a report is due right now.
    ///
    /// Skips (no submission, timers untouched) when [`is_eligible`] says so.
    /// A changed ROM version forces an immediate report regardless of
    /// cadence; so does `force`.
    ///
    /// [`is_eligible`]: Self::is_eligible
    pub fn evaluate(&self, force: bool) -> ScheduleDecision {
        if !self.is_eligible() {
            return ScheduleDecision::skip();
        }

        let record = self.consent.get_checkin_record();
        let Some(last_checked) = record.last_checked_at else {
            // Never synced: fake out the last sync as now, giving the user a
            // full timeframe to opt out before the first report, and arm the
            // first wake.
            match self.consent.seed_last_checked_now() {
                Ok(_) => tracing::info!("First schedule, arming initial sync"),
                Err(e) => tracing::warn!("Failed to seed first sync time: {e}"),
            }
            self.set_alarm(0);
            return ScheduleDecision::skip();
        };

        // Fast path only when a previous report exists; an absent hash means
        // nothing was ever reported, and the first report waits out the
        // timeframe grace like any other.
        let current_hash = self.config.rom_version_hash();
        if let Some(reported) = record.last_reported_version_hash.as_deref() {
            if reported != current_hash {
                tracing::info!("ROM version changed since last report, reporting now");
                return ScheduleDecision {
                    should_report_now: true,
                    next_interval_ms: 0,
                };
            }
        }

        let update_interval = self.config.update_interval_ms();
        let elapsed = (Utc::now() - last_checked).num_milliseconds();
        if elapsed < update_interval && !force {
            let remaining = update_interval - elapsed;
            tracing::debug!(
                "Waiting for next sync in {} hours",
                remaining / crate::config::MILLIS_PER_HOUR
            );
            return ScheduleDecision {
                should_report_now: false,
                next_interval_ms: remaining,
            };
        }

        ScheduleDecision {
            should_report_now: true,
            next_interval_ms: 0,
        }
    }

    /// Start the submission cycle in the background, unless one is already
    /// outstanding. Returns whether a new cycle was dispatched. Never blocks.
    pub fn dispatch_submission(self: &Arc<Self>) -> bool {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Submission already in flight, dropping wake");
            return false;
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run_cycle().await;
            scheduler.in_flight.store(false, Ordering::SeqCst);
        });
        true
    }

    /// Run one full cycle on the caller's task (used by the `once` command).
    /// Returns the submission outcome; `false` without submitting when a
    /// cycle is already in flight.
    pub async fn submit_once(&self) -> bool {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Submission already in flight");
            return false;
        }

        let success = self.run_cycle().await;
        self.in_flight.store(false, Ordering::SeqCst);
        success
    }

    /// One full SUBMITTING → RESCHEDULED pass. Every exit rearms the alarm,
    /// so a failed cycle can never leave the agent permanently silent.
    async fn run_cycle(&self) -> bool {
        let Some(endpoint) = self.config.endpoint_base() else {
            return false;
        };

        let report =
            fingerprint::collect(&*self.platform, &self.config.rom_name, &self.config.rom_version);
        tracing::debug!(
            endpoint = %endpoint,
            device = %report.device_name,
            rom = %report.rom_name,
            version = %report.rom_version,
            "Reporting checkin"
        );

        let success = self.client.submit(&report, &endpoint).await;

        let interval_ms = if success {
            if let Err(e) = self.consent.record_success(&self.config.rom_version_hash()) {
                tracing::warn!("Failed to persist checkin bookkeeping: {e}");
            }
            // 0 = resume the standard cadence from the sync that just happened.
            0
        } else {
            tracing::warn!(
                "Checkin failed, retrying in {} hours",
                self.config.retry_interval_ms / crate::config::MILLIS_PER_HOUR
            );
            self.config.retry_interval_ms
        };

        self.set_alarm(interval_ms);
        success
    }

    /// Arm the one-shot wake `millis_from_now` out, replacing any pending
    /// wake. `millis_from_now <= 0` means "standard cadence": the absolute
    /// next wake is `last_checked_at + timeframe`.
    pub fn set_alarm(&self, millis_from_now: i64) {
        if !self.consent.is_reporting_allowed() {
            return;
        }

        let now = Utc::now();
        let millis = if millis_from_now <= 0 {
            let last_checked = match self.consent.get_checkin_record().last_checked_at {
                Some(t) => t,
                None => match self.consent.seed_last_checked_now() {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!("Failed to seed first sync time: {e}");
                        now
                    }
                },
            };
            (last_checked - now).num_milliseconds() + self.config.update_interval_ms()
        } else {
            millis_from_now
        };

        let fire_at = now + ChronoDuration::milliseconds(millis);
        self.alarm.arm(fire_at);
        tracing::debug!(
            "Next sync attempt in {} hours",
            millis / crate::config::MILLIS_PER_HOUR
        );

        // Bookkeeping only; the armed alarm is the source of truth.
        if let Err(e) = self
            .prefs
            .put_i64(PREF_NEXT_ALARM, fire_at.timestamp_millis())
        {
            tracing::warn!("Failed to persist next alarm time: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::stub::StubPlatform;
    use crate::prefs::PREF_OPT_IN;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    struct RecordingAlarm {
        armed: Mutex<Vec<DateTime<Utc>>>,
    }

    impl RecordingAlarm {
        fn new() -> Self {
            Self {
                armed: Mutex::new(Vec::new()),
            }
        }

        fn last_armed(&self) -> Option<DateTime<Utc>> {
            self.armed.lock().unwrap().last().copied()
        }
    }

    impl Alarm for RecordingAlarm {
        fn arm(&self, fire_at: DateTime<Utc>) {
            self.armed.lock().unwrap().push(fire_at);
        }
    }

    struct StubClient {
        result: bool,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl StubClient {
        fn returning(result: bool) -> Self {
            Self {
                result,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn slow(result: bool, delay: Duration) -> Self {
            Self {
                result,
                delay,
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SubmissionClient for StubClient {
        async fn submit(
            &self,
            _report: &crate::fingerprint::DeviceReport,
            _endpoint_base: &str,
        ) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.result
        }
    }

    struct Fixture {
        scheduler: Arc<CheckinScheduler>,
        client: Arc<StubClient>,
        alarm: Arc<RecordingAlarm>,
        consent: Arc<ConsentStore>,
        _tmp: TempDir,
    }

    fn fixture(client: StubClient, config: Config) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let prefs = Arc::new(Prefs::open(&tmp.path().join("prefs.json")).unwrap());
        let consent = Arc::new(ConsentStore::new(
            Arc::clone(&prefs),
            tmp.path().join("optout"),
        ));
        let client = Arc::new(client);
        let alarm = Arc::new(RecordingAlarm::new());
        let scheduler = Arc::new(CheckinScheduler::new(
            Arc::new(config),
            prefs,
            Arc::clone(&consent),
            Arc::new(StubPlatform::default()),
            Arc::clone(&client) as Arc<dyn SubmissionClient>,
            Arc::clone(&alarm) as Arc<dyn Alarm>,
        ));
        Fixture {
            scheduler,
            client,
            alarm,
            consent,
            _tmp: tmp,
        }
    }

    fn test_config() -> Config {
        Config {
            endpoint_url: Some("https://stats.example/".into()),
            rom_name: "TestRom".into(),
            rom_version: "v1.2".into(),
            ..Config::default()
        }
    }

    async fn wait_for_idle(fx: &Fixture) {
        for _ in 0..200 {
            if !fx.scheduler.in_flight.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("cycle never completed");
    }

    #[tokio::test]
    async fn duplicate_wake_is_dropped_while_in_flight() {
        let fx = fixture(
            StubClient::slow(true, Duration::from_millis(100)),
            test_config(),
        );

        assert!(fx.scheduler.dispatch_submission());
        assert!(!fx.scheduler.dispatch_submission());

        wait_for_idle(&fx).await;
        assert_eq!(fx.client.call_count(), 1);
    }

    #[tokio::test]
    async fn wake_after_completion_submits_again() {
        let fx = fixture(StubClient::returning(true), test_config());

        assert!(fx.scheduler.dispatch_submission());
        wait_for_idle(&fx).await;
        assert!(fx.scheduler.dispatch_submission());
        wait_for_idle(&fx).await;

        assert_eq!(fx.client.call_count(), 2);
    }

    #[tokio::test]
    async fn failure_arms_exact_retry_interval() {
        let fx = fixture(StubClient::returning(false), test_config());

        let before = Utc::now();
        assert!(fx.scheduler.dispatch_submission());
        wait_for_idle(&fx).await;
        let after = Utc::now();

        let fire_at = fx.alarm.last_armed().expect("failure must still rearm");
        let retry = ChronoDuration::milliseconds(crate::config::DEFAULT_RETRY_INTERVAL_MS);
        assert!(fire_at >= before + retry);
        assert!(fire_at <= after + retry);

        // Failure must not touch the checkin record.
        assert_eq!(fx.consent.get_checkin_record(), Default::default());
    }

    #[tokio::test]
    async fn success_records_bookkeeping_and_standard_interval() {
        let fx = fixture(StubClient::returning(true), test_config());

        let before = Utc::now();
        assert!(fx.scheduler.dispatch_submission());
        wait_for_idle(&fx).await;
        let after = Utc::now();

        let record = fx.consent.get_checkin_record();
        assert_eq!(
            record.last_reported_version_hash.as_deref(),
            Some(fingerprint::digest("TestRomv1.2").as_str())
        );
        let checked = record.last_checked_at.unwrap();
        assert!(checked >= before - ChronoDuration::milliseconds(1));
        assert!(checked <= after + ChronoDuration::milliseconds(1));

        // Next wake = last sync + timeframe (1 day by default).
        let fire_at = fx.alarm.last_armed().unwrap();
        let standard = ChronoDuration::milliseconds(crate::config::MILLIS_PER_DAY);
        assert!(fire_at >= before + standard);
        assert!(fire_at <= after + standard);
    }

    #[tokio::test]
    async fn version_change_forces_immediate_report() {
        let fx = fixture(StubClient::returning(true), test_config());

        // Last successful report was for v1.0; the build now runs v1.2.
        fx.consent.seed_last_checked_now().unwrap();
        fx.scheduler
            .prefs
            .put_string(
                crate::prefs::PREF_LAST_REPORT_VERSION,
                &fingerprint::digest("TestRomv1.0"),
            )
            .unwrap();

        let decision = fx.scheduler.evaluate(false);
        assert!(decision.should_report_now);
    }

    #[tokio::test]
    async fn unchanged_version_waits_out_the_cadence() {
        let fx = fixture(StubClient::returning(true), test_config());

        fx.consent.seed_last_checked_now().unwrap();
        fx.consent
            .record_success(&fingerprint::digest("TestRomv1.2"))
            .unwrap();

        let decision = fx.scheduler.evaluate(false);
        assert!(!decision.should_report_now);
        assert!(decision.next_interval_ms > 0);
        assert!(decision.next_interval_ms <= crate::config::MILLIS_PER_DAY);
    }

    #[tokio::test]
    async fn force_overrides_the_cadence_gate() {
        let fx = fixture(StubClient::returning(true), test_config());

        fx.consent
            .record_success(&fingerprint::digest("TestRomv1.2"))
            .unwrap();

        assert!(!fx.scheduler.evaluate(false).should_report_now);
        assert!(fx.scheduler.evaluate(true).should_report_now);
    }

    #[tokio::test]
    async fn first_evaluation_seeds_sync_time_and_arms() {
        let fx = fixture(StubClient::returning(true), test_config());

        let before = Utc::now();
        let decision = fx.scheduler.evaluate(false);
        assert!(!decision.should_report_now);

        // The fake-out last sync gives the user a full timeframe to opt out.
        let record = fx.consent.get_checkin_record();
        assert!(record.last_checked_at.is_some());
        assert!(record.last_reported_version_hash.is_none());

        let fire_at = fx.alarm.last_armed().unwrap();
        assert!(fire_at >= before + ChronoDuration::milliseconds(crate::config::MILLIS_PER_DAY));
    }

    #[tokio::test]
    async fn opted_out_user_is_skipped() {
        let fx = fixture(StubClient::returning(true), test_config());
        fx.consent.set_opted_in(false).unwrap();

        let decision = fx.scheduler.evaluate(false);
        assert!(!decision.should_report_now);
        assert!(fx.alarm.last_armed().is_none());
    }

    #[tokio::test]
    async fn missing_endpoint_disables_reporting() {
        let config = Config {
            endpoint_url: None,
            ..test_config()
        };
        let fx = fixture(StubClient::returning(true), config);

        let decision = fx.scheduler.evaluate(false);
        assert!(!decision.should_report_now);
        assert!(fx.alarm.last_armed().is_none());
    }

    #[tokio::test]
    async fn persistent_opt_out_marker_skips_before_opt_in_check() {
        let tmp = TempDir::new().unwrap();
        let prefs = Arc::new(Prefs::open(&tmp.path().join("prefs.json")).unwrap());
        let marker = tmp.path().join("optout");
        std::fs::write(&marker, "").unwrap();
        let consent = Arc::new(ConsentStore::new(Arc::clone(&prefs), marker));
        let client = Arc::new(StubClient::returning(true));
        let alarm = Arc::new(RecordingAlarm::new());
        let scheduler = Arc::new(CheckinScheduler::new(
            Arc::new(test_config()),
            prefs,
            Arc::clone(&consent),
            Arc::new(StubPlatform::default()),
            Arc::clone(&client) as Arc<dyn SubmissionClient>,
            Arc::clone(&alarm) as Arc<dyn Alarm>,
        ));

        let decision = scheduler.evaluate(false);
        assert!(!decision.should_report_now);
        assert!(!consent.is_reporting_allowed());
        assert!(alarm.last_armed().is_none());
    }

    #[tokio::test]
    async fn set_alarm_leaves_timers_alone_when_opted_out() {
        let fx = fixture(StubClient::returning(true), test_config());
        fx.scheduler
            .prefs
            .put_bool(PREF_OPT_IN, false)
            .unwrap();

        fx.scheduler.set_alarm(1000);
        assert!(fx.alarm.last_armed().is_none());
    }
}
