//! aria2 JSON-RPC transfer backend.
//!
//! Each session is one aria2 download (plus the payload download that a
//! magnet metadata download is `followedBy`). Downloads are added with
//! `seed-time=0` so aria2 reports `complete` as soon as the payload is on
//! disk instead of seeding indefinitely.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::{TransferBackend, TransferError, TransferFile, TransferSession, TransferState, TransferStatus};
use crate::config::AcquisitionConfig;

const STATUS_KEYS: &[&str] = &[
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "downloadSpeed",
    "files",
    "followedBy",
    "errorCode",
    "errorMessage",
];

/// Minimal aria2 JSON-RPC client.
#[derive(Debug, Clone)]
pub struct Aria2Rpc {
    client: reqwest::Client,
    endpoint: String,
    secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Subset of `aria2.tellStatus` used by sessions. aria2 encodes integers as
/// strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aria2Status {
    pub gid: String,
    pub status: String,
    #[serde(default)]
    pub total_length: String,
    #[serde(default)]
    pub completed_length: String,
    #[serde(default)]
    pub download_speed: String,
    #[serde(default)]
    pub files: Vec<Aria2File>,
    #[serde(default)]
    pub followed_by: Vec<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Aria2File {
    pub path: String,
    #[serde(default)]
    pub length: String,
    #[serde(default)]
    pub selected: Option<String>,
}

impl Aria2Rpc {
    /// Creates a client for the configured endpoint.
    ///
    /// # Errors
    /// - `TransferError::Http` - HTTP client could not be built
    pub fn new(config: &AcquisitionConfig) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .timeout(config.rpc_timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: config.aria2_url.clone(),
            secret: config.aria2_secret.clone(),
        })
    }

    /// Invokes `method` with `params`, prepending the secret token if set.
    ///
    /// # Errors
    /// - `TransferError::Http` - Request failed or body was not JSON
    /// - `TransferError::Rejected` - aria2 returned an error object
    /// - `TransferError::Protocol` - Response had neither result nor error
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, TransferError> {
        let mut all_params = Vec::with_capacity(params.len() + 1);
        if let Some(secret) = &self.secret {
            all_params.push(json!(format!("token:{secret}")));
        }
        all_params.extend(params);

        let body = json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": method,
            "params": all_params,
        });

        tracing::trace!("aria2 call {}", method);
        // aria2 answers errors with a 4xx status and a JSON-RPC error body
        let response: RpcResponse<T> = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        match (response.result, response.error) {
            (Some(result), _) => Ok(result),
            (None, Some(error)) => Err(TransferError::Rejected {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            }),
            (None, None) => Err(TransferError::Protocol {
                reason: format!("{method} returned neither result nor error"),
            }),
        }
    }

    async fn tell_status(&self, gid: &str) -> Result<Aria2Status, TransferError> {
        self.call("aria2.tellStatus", vec![json!(gid), json!(STATUS_KEYS)])
            .await
    }
}

/// [`TransferBackend`] backed by an aria2 daemon.
#[derive(Debug, Clone)]
pub struct Aria2Backend {
    rpc: Aria2Rpc,
}

impl Aria2Backend {
    /// # Errors
    /// - `TransferError::Http` - HTTP client could not be built
    pub fn new(config: &AcquisitionConfig) -> Result<Self, TransferError> {
        Ok(Self {
            rpc: Aria2Rpc::new(config)?,
        })
    }
}

#[async_trait]
impl TransferBackend for Aria2Backend {
    async fn open_session(
        &self,
        locator: &str,
        storage_dir: &Path,
    ) -> Result<Box<dyn TransferSession>, TransferError> {
        let options = json!({
            "dir": storage_dir.to_string_lossy(),
            "seed-time": "0",
            "follow-torrent": "mem",
            "bt-save-metadata": "false",
        });
        let gid: String = self
            .rpc
            .call("aria2.addUri", vec![json!([locator]), options])
            .await?;
        tracing::debug!("aria2 accepted {} as gid {}", locator, gid);

        Ok(Box::new(Aria2Session {
            rpc: self.rpc.clone(),
            locator: locator.to_string(),
            gids: vec![gid],
            metadata_phase: locator.starts_with("magnet:"),
        }))
    }
}

/// One aria2 download chain.
#[derive(Debug)]
pub struct Aria2Session {
    rpc: Aria2Rpc,
    locator: String,
    /// Every gid of this session; the last one is the download being tracked
    gids: Vec<String>,
    /// The tracked gid only fetches magnet metadata
    metadata_phase: bool,
}

impl Aria2Session {
    fn current_gid(&self) -> &str {
        self.gids.last().map(String::as_str).unwrap_or_default()
    }
}

#[async_trait]
impl TransferSession for Aria2Session {
    fn locator(&self) -> &str {
        &self.locator
    }

    async fn status(&mut self) -> Result<TransferStatus, TransferError> {
        let mut status = self.rpc.tell_status(self.current_gid()).await?;

        // Metadata and .torrent downloads hand over to a payload download
        if status.status == "complete"
            && let Some(next) = status.followed_by.first().cloned()
        {
            tracing::debug!("gid {} followed by {}", status.gid, next);
            self.gids.push(next);
            self.metadata_phase = false;
            status = self.rpc.tell_status(self.current_gid()).await?;
        }

        Ok(convert_status(&status, self.metadata_phase))
    }

    async fn teardown(&mut self) -> Result<(), TransferError> {
        let mut first_error = None;
        for gid in &self.gids {
            match self.rpc.tell_status(gid).await {
                Ok(status) if matches!(status.status.as_str(), "active" | "waiting" | "paused") => {
                    if let Err(e) = self
                        .rpc
                        .call::<String>("aria2.forceRemove", vec![json!(gid)])
                        .await
                    {
                        first_error.get_or_insert(e);
                        continue;
                    }
                    // forceRemove is asynchronous; wait until aria2 settles
                    for _ in 0..20 {
                        match self.rpc.tell_status(gid).await {
                            Ok(s) if s.status == "removed" => break,
                            Ok(_) => tokio::time::sleep(Duration::from_millis(50)).await,
                            Err(_) => break,
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                    continue;
                }
            }
            if let Err(e) = self
                .rpc
                .call::<String>("aria2.removeDownloadResult", vec![json!(gid)])
                .await
            {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn convert_status(status: &Aria2Status, metadata_phase: bool) -> TransferStatus {
    let total = parse_u64(&status.total_length);
    let completed = parse_u64(&status.completed_length);
    let speed = parse_u64(&status.download_speed);

    let progress = if metadata_phase || total == 0 {
        0.0
    } else {
        completed as f64 / total as f64
    };
    let time_remaining = (speed > 0 && total >= completed && !metadata_phase)
        .then(|| Duration::from_secs((total - completed) / speed));

    let state = match status.status.as_str() {
        "complete" if status.followed_by.is_empty() => TransferState::Done,
        "error" => TransferState::Aborted {
            reason: format!(
                "aria2 error {}: {}",
                status.error_code.as_deref().unwrap_or("?"),
                status.error_message.as_deref().unwrap_or("unknown error")
            ),
        },
        "removed" => TransferState::Aborted {
            reason: "download removed from aria2".to_string(),
        },
        _ => TransferState::Active,
    };

    let files = if state == TransferState::Done {
        status
            .files
            .iter()
            .filter(|f| f.selected.as_deref() != Some("false") && !f.path.is_empty())
            .filter_map(|f| {
                let path = PathBuf::from(&f.path);
                let name = path.file_name()?.to_str()?.to_string();
                Some(TransferFile {
                    name,
                    path,
                    length: parse_u64(&f.length),
                })
            })
            .collect()
    } else {
        Vec::new()
    };

    TransferStatus {
        progress: if state == TransferState::Done { 1.0 } else { progress },
        time_remaining,
        state,
        files,
    }
}

fn parse_u64(value: &str) -> u64 {
    value.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: &str, total: &str, completed: &str, speed: &str) -> Aria2Status {
        Aria2Status {
            gid: "2089b05ecca3d829".to_string(),
            status: state.to_string(),
            total_length: total.to_string(),
            completed_length: completed.to_string(),
            download_speed: speed.to_string(),
            files: vec![
                Aria2File {
                    path: "/sessions/abc/Bao (2018)/Bao.2018.720p.mkv".to_string(),
                    length: "1000".to_string(),
                    selected: Some("true".to_string()),
                },
                Aria2File {
                    path: "/sessions/abc/Bao (2018)/www.YTS.AM.jpg".to_string(),
                    length: "10".to_string(),
                    selected: Some("true".to_string()),
                },
            ],
            followed_by: Vec::new(),
            error_code: None,
            error_message: None,
        }
    }

    #[test]
    fn test_active_status_progress_and_eta() {
        let converted = convert_status(&status("active", "1000", "250", "25"), false);
        assert_eq!(converted.state, TransferState::Active);
        assert_eq!(converted.progress, 0.25);
        assert_eq!(converted.time_remaining, Some(Duration::from_secs(30)));
        assert!(converted.files.is_empty());
    }

    #[test]
    fn test_metadata_phase_reports_zero_progress() {
        let converted = convert_status(&status("active", "100", "100", "5"), true);
        assert_eq!(converted.progress, 0.0);
        assert_eq!(converted.time_remaining, None);
    }

    #[test]
    fn test_complete_status_lists_files() {
        let converted = convert_status(&status("complete", "1010", "1010", "0"), false);
        assert_eq!(converted.state, TransferState::Done);
        assert_eq!(converted.progress, 1.0);
        let names: Vec<_> = converted.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Bao.2018.720p.mkv", "www.YTS.AM.jpg"]);
    }

    #[test]
    fn test_error_status_aborts() {
        let mut failed = status("error", "0", "0", "0");
        failed.error_code = Some("3".to_string());
        failed.error_message = Some("Resource not found".to_string());
        let converted = convert_status(&failed, false);
        assert!(matches!(
            converted.state,
            TransferState::Aborted { ref reason } if reason.contains("Resource not found")
        ));
    }
}
