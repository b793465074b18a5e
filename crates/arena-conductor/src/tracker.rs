use crate::session::SessionRecord;
use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use tracing::{info, warn};

/// Posts finalized sessions to an experiment tracker at
/// `{endpoint}/sessions`.
pub struct TrackerClient {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl TrackerClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(anyhow!("tracker endpoint must not be empty"));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { endpoint, client })
    }

    pub fn sessions_url(&self) -> String {
        format!("{}/sessions", self.endpoint)
    }

    pub fn upload(&self, record: &SessionRecord) -> Result<()> {
        let url = self.sessions_url();
        let response = self
            .client
            .post(&url)
            .json(record)
            .send()
            .with_context(|| format!("tracker request to {} failed", url))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("tracker at {} returned {}", url, status));
        }
        info!(session_id = %record.session_id, url = %url, "session uploaded to tracker");
        Ok(())
    }

    /// Upload that only logs on failure.
    pub fn upload_best_effort(&self, record: &SessionRecord) {
        if let Err(err) = self.upload(record) {
            warn!(
                session_id = %record.session_id,
                error = %err,
                "tracker upload failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    #[test]
    fn sessions_url_trims_trailing_slash() {
        let tracker = TrackerClient::new("http://tracker.local/api/").expect("client");
        assert_eq!(tracker.sessions_url(), "http://tracker.local/api/sessions");
        assert!(TrackerClient::new("/").is_err());
    }

    #[test]
    fn unreachable_tracker_is_not_fatal() {
        let tracker = TrackerClient::new("http://127.0.0.1:9").expect("client");
        let mut session = Session::new();
        session.set_problem("p");
        let record = session.to_record();
        assert!(tracker.upload(&record).is_err());
        tracker.upload_best_effort(&record);
    }
}
