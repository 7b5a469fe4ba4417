use crate::prefs::{
    PREF_FIRST_BOOT, PREF_LAST_CHECKED, PREF_LAST_REPORT_VERSION, PREF_OPT_IN,
    PREF_OPT_OUT_PERSIST, Prefs,
};
use crate::error::StorageError;
use chrono::{DateTime, TimeZone, Utc};
use std::path::PathBuf;
use std::sync::Arc;

/// Checkin bookkeeping, read on every evaluation and written only after a
/// successful submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckinRecord {
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_reported_version_hash: Option<String>,
}

/// Sole writer of consent flags and checkin bookkeeping.
///
/// The opt-in preference defaults to `true` for a fresh install; the durable
/// opt-out marker (a sentinel file outside the private state dir, surviving a
/// data wipe) overrides everything, permanently.
pub struct ConsentStore {
    prefs: Arc<Prefs>,
    marker_path: PathBuf,
}

impl ConsentStore {
    pub fn new(prefs: Arc<Prefs>, marker_path: PathBuf) -> Self {
        Self { prefs, marker_path }
    }

    /// `false` once the persistent opt-out is set, regardless of the opt-in
    /// flag; otherwise the opt-in flag (default `true`).
    pub fn is_reporting_allowed(&self) -> bool {
        if self.prefs.get_bool(PREF_OPT_OUT_PERSIST, false) {
            return false;
        }
        self.prefs.get_bool(PREF_OPT_IN, true)
    }

    /// Fresh-install check for the durable opt-out marker.
    ///
    /// Runs for real at most once per install: once the opt-in preference
    /// exists the marker is never consulted again, and the call just reports
    /// whether the install is already permanently disabled.
    ///
    /// Returns `true` when reporting must be disabled.
    pub fn check_persistent_opt_out_marker(&self) -> Result<bool, StorageError> {
        if self.prefs.contains(PREF_OPT_IN) {
            return Ok(self.prefs.get_bool(PREF_OPT_OUT_PERSIST, false));
        }

        tracing::debug!("New install, checking for persistent opt-out marker");
        if self.marker_path.exists() {
            tracing::info!(
                marker = %self.marker_path.display(),
                "Persistent opt-out marker found, disabling reporting"
            );
            self.prefs.put_bool(PREF_OPT_IN, false)?;
            self.prefs.put_bool(PREF_FIRST_BOOT, false)?;
            self.prefs.put_bool(PREF_OPT_OUT_PERSIST, true)?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Durably record a successful submission: timestamp now, plus the hash
    /// of the ROM version that was just reported.
    pub fn record_success(&self, rom_version_hash: &str) -> Result<(), StorageError> {
        self.prefs
            .put_i64(PREF_LAST_CHECKED, Utc::now().timestamp_millis())?;
        self.prefs
            .put_string(PREF_LAST_REPORT_VERSION, rom_version_hash)?;
        Ok(())
    }

    pub fn get_checkin_record(&self) -> CheckinRecord {
        CheckinRecord {
            last_checked_at: self
                .prefs
                .get_i64(PREF_LAST_CHECKED)
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            last_reported_version_hash: self.prefs.get_string(PREF_LAST_REPORT_VERSION),
        }
    }

    pub fn first_boot_pending(&self) -> bool {
        self.prefs.get_bool(PREF_FIRST_BOOT, true)
    }

    pub fn mark_first_boot_done(&self) -> Result<(), StorageError> {
        self.prefs.put_bool(PREF_FIRST_BOOT, false)
    }

    /// Explicit user opt-in/opt-out. Does not touch the persistent opt-out.
    pub fn set_opted_in(&self, opted_in: bool) -> Result<(), StorageError> {
        self.prefs.put_bool(PREF_OPT_IN, opted_in)
    }

    /// Fake out the last-sync time for a first schedule, so the user gets a
    /// full timeframe to opt out before anything is sent.
    pub fn seed_last_checked_now(&self) -> Result<DateTime<Utc>, StorageError> {
        let now = Utc::now();
        self.prefs
            .put_i64(PREF_LAST_CHECKED, now.timestamp_millis())?;
        Ok(now)
    }
}
