use crate::error::SubmitError;
use crate::fingerprint::DeviceReport;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// One canonical submission contract. The wire details (HTTP library, header
/// vs form encoding) stay behind this boundary; retry policy lives entirely
/// in the scheduler.
#[async_trait]
pub trait SubmissionClient: Send + Sync {
    /// `true` only on a 2xx response with no transport error. Never mutates
    /// persisted state.
    async fn submit(&self, report: &DeviceReport, endpoint_base: &str) -> bool;
}

pub fn build_stats_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// POSTs the report form-encoded to `{base}submit` over TLS.
pub struct HttpSubmissionClient {
    client: Client,
}

impl HttpSubmissionClient {
    pub fn new() -> Self {
        Self {
            client: build_stats_client(),
        }
    }

    async fn post_report(
        &self,
        report: &DeviceReport,
        endpoint_base: &str,
    ) -> Result<(), SubmitError> {
        let url = format!("{endpoint_base}submit");

        let mut fields: Vec<(&str, &str)> = Vec::with_capacity(9);
        if let Some(hash) = report.device_hash.as_deref() {
            fields.push(("device_hash", hash));
        }
        fields.push(("device_name", report.device_name.as_str()));
        fields.push(("device_version", report.device_version.as_str()));
        fields.push(("device_country", report.device_country.as_str()));
        fields.push(("device_carrier", report.device_carrier.as_str()));
        fields.push(("device_carrier_id", report.device_carrier_id.as_str()));
        fields.push(("rom_name", report.rom_name.as_str()));
        fields.push(("rom_version", report.rom_version.as_str()));
        if let Some(cert) = report.sign_cert.as_deref() {
            fields.push(("sign_cert", cert));
        }

        let response = self
            .client
            .post(&url)
            .form(&fields)
            .send()
            .await
            .map_err(|e| SubmitError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SubmitError::Rejected {
                url,
                status: status.as_u16(),
            })
        }
    }
}

#[async_trait]
impl SubmissionClient for HttpSubmissionClient {
    async fn submit(&self, report: &DeviceReport, endpoint_base: &str) -> bool {
        match self.post_report(report, endpoint_base).await {
            Ok(()) => {
                tracing::debug!(endpoint = endpoint_base, "Checkin accepted");
                true
            }
            Err(e) => {
                // Timeouts, DNS failures and non-2xx all land here; the
                // scheduler turns any of them into the retry backoff.
                tracing::warn!("Could not upload stats checkin: {e}");
                false
            }
        }
    }
}
