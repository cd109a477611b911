use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{Identity, SnapshotRecord};

const ENABLE_LOGS: bool = true;

use crate::log_warn;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CloudError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("server responded with status {0}")]
    Status(u16),

    #[error("server does not know this identity")]
    UnknownIdentity,

    #[error("could not decode server response: {0}")]
    Decode(String),
}

/// Body of both push endpoints. `user_id` is the identity key the server
/// should file the snapshot under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub user_id: String,
    pub identity: Identity,
    pub progress: SnapshotRecord,
    pub emergency: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PushAck {
    #[serde(default, alias = "timestamp")]
    pub server_timestamp: Option<i64>,
}

/// Remote durable store. Any 2xx on push counts as persisted.
#[async_trait]
pub trait CloudTransport: Send + Sync {
    async fn push(&self, request: &PushRequest) -> Result<PushAck, CloudError>;

    /// Latest snapshot stored for `id`, still in whatever shape the server
    /// holds it. `None` on 404.
    async fn fetch(&self, id: &str) -> Result<Option<Value>, CloudError>;
}

/// `fetch` bounded by `timeout`. Failures and timeouts read as absent, the
/// way recovery treats them.
pub async fn fetch_latest(
    transport: &dyn CloudTransport,
    id: &str,
    timeout: Duration,
) -> Option<Value> {
    match tokio::time::timeout(timeout, transport.fetch(id)).await {
        Ok(Ok(found)) => found,
        Ok(Err(err)) => {
            log_warn!("cloud fetch for {id} failed: {err}");
            None
        }
        Err(_) => {
            log_warn!("cloud fetch for {id} timed out after {}ms", timeout.as_millis());
            None
        }
    }
}

pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CloudError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|err| CloudError::Network(err.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn classify(err: reqwest::Error) -> CloudError {
    if err.is_timeout() {
        CloudError::Timeout
    } else if err.is_decode() {
        CloudError::Decode(err.to_string())
    } else {
        CloudError::Network(err.to_string())
    }
}

#[async_trait]
impl CloudTransport for HttpTransport {
    async fn push(&self, request: &PushRequest) -> Result<PushAck, CloudError> {
        let path = if request.emergency {
            "/backup-user-data"
        } else {
            "/user-profile"
        };
        let response = self
            .client
            .post(self.url(path))
            .json(request)
            .send()
            .await
            .map_err(classify)?;

        match response.status() {
            status if status.is_success() => {
                let body = response.text().await.map_err(classify)?;
                if body.trim().is_empty() {
                    return Ok(PushAck::default());
                }
                serde_json::from_str(&body).map_err(|err| CloudError::Decode(err.to_string()))
            }
            StatusCode::NOT_FOUND => Err(CloudError::UnknownIdentity),
            status => Err(CloudError::Status(status.as_u16())),
        }
    }

    async fn fetch(&self, id: &str) -> Result<Option<Value>, CloudError> {
        let response = self
            .client
            .get(self.url(&format!("/user-profile/{id}")))
            .send()
            .await
            .map_err(classify)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response.json::<Value>().await.map(Some).map_err(classify),
            status => Err(CloudError::Status(status.as_u16())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_accepts_either_timestamp_field() {
        let ack: PushAck = serde_json::from_str(r#"{"serverTimestamp": 5}"#).expect("parses");
        assert_eq!(ack.server_timestamp, Some(5));
        let ack: PushAck = serde_json::from_str(r#"{"timestamp": 7, "ok": true}"#).expect("parses");
        assert_eq!(ack.server_timestamp, Some(7));
        let ack: PushAck = serde_json::from_str("{}").expect("parses");
        assert_eq!(ack.server_timestamp, None);
    }

    #[test]
    fn base_url_loses_trailing_slash() {
        let transport =
            HttpTransport::new("http://127.0.0.1:9/api/", Duration::from_secs(1)).expect("client");
        assert_eq!(transport.base_url(), "http://127.0.0.1:9/api");
        assert_eq!(transport.url("/user-profile"), "http://127.0.0.1:9/api/user-profile");
    }
}
