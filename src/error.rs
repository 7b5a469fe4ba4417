use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for `romstatsd`.
///
/// Each subsystem defines its own error variant. Library callers can match on
/// these to decide recovery strategy; internal code continues to use
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum StatsError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Preference storage ──────────────────────────────────────────────
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    // ── Submission / wire ───────────────────────────────────────────────
    #[error("submit: {0}")]
    Submit(#[from] SubmitError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("failed to save config: {0}")]
    Save(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Preference storage errors ──────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read preferences: {0}")]
    Read(String),

    #[error("failed to persist preferences: {0}")]
    Write(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Submission errors ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("endpoint {url} returned status {status}")]
    Rejected { url: String, status: u16 },

    #[error("transport failure: {0}")]
    Transport(String),
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, StatsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_displays_correctly() {
        let err = StatsError::Config(ConfigError::Load("config.toml: bad key".into()));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn submit_rejected_displays_status() {
        let err = StatsError::Submit(SubmitError::Rejected {
            url: "https://stats.example/submit".into(),
            status: 503,
        });
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn anyhow_interop() {
        let anyhow_err = anyhow::anyhow!("something went wrong");
        let stats_err: StatsError = anyhow_err.into();
        assert!(stats_err.to_string().contains("something went wrong"));
    }

    #[test]
    fn storage_error_displays_correctly() {
        let err = StatsError::Storage(StorageError::Write("disk full".into()));
        assert!(err.to_string().contains("disk full"));
    }
}
