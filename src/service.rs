use crate::alarm::{AlarmListener, TokioAlarm};
use crate::config::Config;
use crate::consent::ConsentStore;
use crate::prefs::Prefs;
use crate::scheduler::CheckinScheduler;
use crate::submit::HttpSubmissionClient;
use anyhow::Result;
use std::sync::Arc;

/// Wake delivered by the alarm collaborator (or boot/install trigger).
#[derive(Debug, Clone, Copy, Default)]
pub struct WakeSignal {
    /// Ask the user for consent instead of reporting, first boot only.
    pub prompt_user: bool,
}

/// First-run consent prompt collaborator. The agent never blocks on the
/// answer; the user records their choice out of band (`opt-in` / `opt-out`).
pub trait ConsentPrompt: Send + Sync {
    fn show_opt_in_prompt(&self);
}

/// Default prompt: a log line pointing at the CLI. A distribution wires its
/// own notification UI here.
pub struct LogPrompt;

impl ConsentPrompt for LogPrompt {
    fn show_opt_in_prompt(&self) {
        tracing::info!(
            "Anonymous usage reporting is enabled by default; \
             run `romstatsd opt-out` to disable it"
        );
    }
}

/// External-facing entry: receives wake signals and delegates to the
/// scheduler. The wake handler never blocks; the submission runs as a
/// background task behind the scheduler's single-flight guard.
pub struct ReportingEntrypoint {
    scheduler: Arc<CheckinScheduler>,
    prompt: Arc<dyn ConsentPrompt>,
}

impl ReportingEntrypoint {
    pub fn new(scheduler: Arc<CheckinScheduler>, prompt: Arc<dyn ConsentPrompt>) -> Self {
        Self { scheduler, prompt }
    }

    pub fn scheduler(&self) -> &Arc<CheckinScheduler> {
        &self.scheduler
    }

    /// Handle one wake. First-run prompt wins over reporting; otherwise an
    /// eligible install starts a submission cycle in the background.
    pub fn on_wake(&self, signal: WakeSignal) {
        let consent = self.scheduler.consent();

        if signal.prompt_user && consent.first_boot_pending() {
            tracing::debug!("Prompting user for opt-in");
            self.prompt.show_opt_in_prompt();
            if let Err(e) = consent.mark_first_boot_done() {
                tracing::warn!("Failed to persist first-boot flag: {e}");
            }
            return;
        }

        if !self.scheduler.is_eligible() {
            return;
        }

        self.scheduler.dispatch_submission();
    }

    /// Boot/trigger path: unlike an alarm fire this re-checks the cadence,
    /// and a changed ROM version forces an out-of-cycle report.
    ///
    /// A wake that does not submit still rearms: the in-process timer does
    /// not survive a restart, so every boot re-establishes the cadence from
    /// the last sync.
    pub fn launch(&self, force: bool) {
        if !self.scheduler.is_eligible() {
            return;
        }

        if self.scheduler.consent().first_boot_pending() {
            self.on_wake(WakeSignal { prompt_user: true });
            self.scheduler.set_alarm(0);
            return;
        }

        let decision = self.scheduler.evaluate(force);
        if decision.should_report_now {
            self.scheduler.dispatch_submission();
        } else {
            self.scheduler.set_alarm(0);
        }
    }
}

/// Wire up the production agent: file-backed prefs in the state dir, the
/// host platform queries, the HTTPS client, and an in-process alarm.
pub fn build_agent(config: Arc<Config>) -> Result<(Arc<ReportingEntrypoint>, AlarmListener)> {
    let prefs = Arc::new(Prefs::open(&config.state_dir.join("prefs.json"))?);
    let consent = Arc::new(ConsentStore::new(
        Arc::clone(&prefs),
        config.opt_out_marker.clone(),
    ));
    let (alarm, listener) = TokioAlarm::new();

    let scheduler = Arc::new(CheckinScheduler::new(
        Arc::clone(&config),
        prefs,
        consent,
        Arc::new(crate::fingerprint::HostPlatform),
        Arc::new(HttpSubmissionClient::new()),
        Arc::new(alarm),
    ));

    let entry = Arc::new(ReportingEntrypoint::new(scheduler, Arc::new(LogPrompt)));
    Ok((entry, listener))
}

/// Long-running daemon loop: evaluate once at boot, then wait for armed
/// wakes until the process is told to stop. A submission in flight at
/// teardown is simply abandoned; the next boot resumes normal evaluation.
pub async fn run_daemon(
    entry: Arc<ReportingEntrypoint>,
    mut listener: AlarmListener,
) -> Result<()> {
    entry.launch(false);

    loop {
        tokio::select! {
            () = listener.next_fire() => {
                entry.on_wake(WakeSignal::default());
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Shutting down");
                return Ok(());
            }
        }
    }
}
