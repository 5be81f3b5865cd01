use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::registry::stream_key;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("invalid metadata service url {url}")]
    InvalidBaseUrl { url: String },
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
}

pub type ReportResult<T> = std::result::Result<T, ReportError>;

/// Wire shape expected by the metadata service. Absent paths are sent as
/// empty strings rather than omitted.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRecord {
    pub stream_name: String,
    pub local_mp4_path: String,
    pub s3_mp4_path: String,
    pub local_hls_path: String,
    pub s3_hls_path: String,
    pub file_size: u64,
    pub environment: String,
    pub recording_metadata: RecordingMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingMetadata {
    pub file_size: u64,
    pub file_format: String,
    pub stream_id: String,
    pub hls_local_path: String,
    pub hls_s3_path: String,
}

#[derive(Debug)]
pub enum ReportOutcome {
    Acked,
    Failed { status: Option<u16>, body: String },
}

/// Posts the completion record once. Delivery is best effort: failures are
/// logged for the operator and never retried.
#[derive(Debug, Clone)]
pub struct MetadataReporter {
    client: Client,
    base_url: String,
}

impl MetadataReporter {
    pub fn new(base_url: &str) -> ReportResult<Self> {
        Url::parse(base_url).map_err(|_| ReportError::InvalidBaseUrl {
            url: base_url.to_string(),
        })?;
        let client = Client::builder()
            .user_agent("SkyRec-Finalizer/1.0")
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint_for(&self, stream_name: &str) -> String {
        format!(
            "{}/recordings/rtmp/{}",
            self.base_url,
            stream_key(stream_name)
        )
    }

    pub async fn report(&self, record: &CompletionRecord) -> ReportOutcome {
        let url = self.endpoint_for(&record.stream_name);
        let response = match self.client.post(&url).json(record).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(url = %url, error = %err, "completion report failed to send");
                return ReportOutcome::Failed {
                    status: None,
                    body: err.to_string(),
                };
            }
        };
        let status = response.status();
        if status == StatusCode::OK {
            info!(url = %url, "completion report acknowledged");
            return ReportOutcome::Acked;
        }
        let body = response.text().await.unwrap_or_default();
        warn!(url = %url, status = %status, body = %body, "completion report rejected");
        ReportOutcome::Failed {
            status: Some(status.as_u16()),
            body,
        }
    }
}
