// SPDX-License-Identifier: MIT
//! Typed facade over the remote cloud-downloader service.
//!
//! [`RemoteApi`] is the seam the engine programs against; [`RemoteClient`]
//! is the only place in this codebase that issues outbound HTTP for the
//! lifecycle engine. Tests substitute a fake implementation of the trait.

use crate::errors::RemoteError;
use crate::retry::{retry_with_backoff, RetryConfig};
use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

const BASE_URL: &str = "https://www.premiumize.me/api";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// Status of one in-flight or finished remote transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Waiting,
    Running,
    Finished,
    Deleted,
    Banned,
    Error,
    Timeout,
    Seeding,
    Queued,
}

impl TransferStatus {
    /// Statuses that mean the transfer will never progress further and
    /// should be counted against the per-upload retry budget.
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            TransferStatus::Deleted
                | TransferStatus::Banned
                | TransferStatus::Error
                | TransferStatus::Timeout
        )
    }
}

/// One entry from `/transfer/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferItem {
    pub id: String,
    pub name: String,
    pub message: Option<String>,
    pub status: TransferStatus,
    pub progress: Option<f64>,
    pub folder_id: Option<String>,
    pub src: Option<String>,
}

/// One file or subfolder inside a remote folder listing.
#[derive(Debug, Clone)]
pub enum FolderEntry {
    File {
        id: String,
        name: String,
        size: u64,
        link: String,
        direct_link: String,
    },
    Folder {
        id: String,
        name: String,
    },
}

impl FolderEntry {
    pub fn name(&self) -> &str {
        match self {
            FolderEntry::File { name, .. } => name,
            FolderEntry::Folder { name, .. } => name,
        }
    }
}

/// Typed view of the remote cloud-downloader.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Sanity check used at startup; fails if the API key is invalid.
    async fn account_info(&self) -> Result<(), RemoteError>;

    /// Idempotent create-or-lookup of the root folder jobs upload into.
    /// Returns its folder handle whether it already existed or was just
    /// created.
    async fn ensure_root_folder(&self, name: &str) -> Result<String, RemoteError>;

    /// Upload a descriptor file into `parent_folder_id`, returning a
    /// transfer handle. On a duplicate-descriptor rejection, mutates the
    /// file at `path` by appending random trailing whitespace and retries —
    /// the caller should treat `path` as consumed once this call returns.
    async fn upload_descriptor(
        &self,
        path: &Path,
        parent_folder_id: &str,
    ) -> Result<String, RemoteError>;

    async fn list_transfers(&self) -> Result<Vec<TransferItem>, RemoteError>;

    /// Depth-first listing of a completed folder's contents.
    async fn list_folder(&self, folder_id: &str) -> Result<Vec<FolderEntry>, RemoteError>;

    /// Idempotent: an "already gone" response is treated as success.
    async fn retry_transfer(&self, transfer_id: &str) -> Result<(), RemoteError>;

    /// Idempotent: an "already gone" response is treated as success.
    async fn delete_transfer(&self, transfer_id: &str) -> Result<(), RemoteError>;
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateFolderResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RootFolderListResponse {
    status: String,
    #[serde(default)]
    content: Vec<RawFolderEntry>,
}

#[derive(Debug, Deserialize)]
struct FolderListResponse {
    status: String,
    #[serde(default)]
    content: Vec<RawFolderEntry>,
}

#[derive(Debug, Deserialize)]
struct RawFolderEntry {
    id: String,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    directlink: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransferListResponse {
    status: String,
    #[serde(default)]
    transfers: Vec<TransferItem>,
}

#[derive(Debug, Deserialize)]
struct TransferCreateResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

/// `reqwest`-backed implementation of [`RemoteApi`].
pub struct RemoteClient {
    client: Client,
    api_key: String,
    retry_cfg: RetryConfig,
}

impl RemoteClient {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("building the remote HTTP client failed");
        Self {
            client,
            api_key,
            retry_cfg: RetryConfig::default(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{BASE_URL}{path}")
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let resp = self
            .client
            .get(self.url(path))
            .query(&[("apikey", &self.api_key)])
            .send()
            .await?;
        Ok(resp.json::<T>().await?)
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<T, RemoteError> {
        let mut full_form: Vec<(&str, &str)> = form.to_vec();
        full_form.push(("apikey", &self.api_key));
        let resp = self
            .client
            .post(self.url(path))
            .form(&full_form)
            .send()
            .await?;
        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl RemoteApi for RemoteClient {
    async fn account_info(&self) -> Result<(), RemoteError> {
        retry_with_backoff(&self.retry_cfg, || async {
            let resp: StatusResponse = self.get_json("/account/info").await?;
            if resp.status != "success" {
                return Err(RemoteError::Api {
                    status: resp.status,
                    message: resp.message.unwrap_or_default(),
                });
            }
            Ok(())
        })
        .await
    }

    async fn ensure_root_folder(&self, name: &str) -> Result<String, RemoteError> {
        retry_with_backoff(&self.retry_cfg, || async {
            let created: CreateFolderResponse = self
                .post_form("/folder/create", &[("name", name)])
                .await?;
            let already_existed = created.status != "success"
                && created.message.as_deref() == Some("This folder already exists.");
            if created.status != "success" && !already_existed {
                return Err(RemoteError::Api {
                    status: created.status,
                    message: created.message.unwrap_or_default(),
                });
            }

            let listing: RootFolderListResponse = self.get_json("/folder/list").await?;
            if listing.status != "success" {
                return Err(RemoteError::Api {
                    status: listing.status,
                    message: "failed to list root folder".into(),
                });
            }
            listing
                .content
                .into_iter()
                .find(|e| e.name == name)
                .map(|e| e.id)
                .ok_or_else(|| RemoteError::Api {
                    status: "error".into(),
                    message: format!("could not find folder id for {name} after creating it"),
                })
        })
        .await
    }

    async fn upload_descriptor(
        &self,
        path: &Path,
        parent_folder_id: &str,
    ) -> Result<String, RemoteError> {
        if !path.exists() {
            return Err(RemoteError::DescriptorMissing(path.display().to_string()));
        }

        const MAX_DUPLICATE_ATTEMPTS: u32 = 5;
        for attempt in 1..=MAX_DUPLICATE_ATTEMPTS {
            let bytes = tokio::fs::read(path).await?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "descriptor.nzb".to_string());

            let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
            let form = reqwest::multipart::Form::new()
                .text("folder_id", parent_folder_id.to_string())
                .text("apikey", self.api_key.clone())
                .part("file", part);

            let resp: TransferCreateResponse = self
                .client
                .post(self.url("/transfer/create"))
                .multipart(form)
                .send()
                .await?
                .json()
                .await?;

            if resp.status == "success" {
                return resp.id.ok_or_else(|| RemoteError::Api {
                    status: "success".into(),
                    message: "upload succeeded but no transfer id was returned".into(),
                });
            }

            let is_duplicate =
                resp.message.as_deref() == Some("You have already added this nzb file.");
            if !is_duplicate {
                return Err(RemoteError::Api {
                    status: resp.status,
                    message: resp.message.unwrap_or_default(),
                });
            }

            warn!(
                path = %path.display(),
                attempt,
                "remote rejected descriptor as a duplicate — padding with random whitespace and retrying"
            );
            append_random_padding(path).await?;
        }

        Err(RemoteError::DuplicateDescriptorRetriesExhausted {
            attempts: MAX_DUPLICATE_ATTEMPTS,
        })
    }

    async fn list_transfers(&self) -> Result<Vec<TransferItem>, RemoteError> {
        retry_with_backoff(&self.retry_cfg, || async {
            let resp: TransferListResponse = self.get_json("/transfer/list").await?;
            if resp.status != "success" {
                return Err(RemoteError::Api {
                    status: resp.status,
                    message: "failed to list transfers".into(),
                });
            }
            Ok(resp.transfers)
        })
        .await
    }

    async fn list_folder(&self, folder_id: &str) -> Result<Vec<FolderEntry>, RemoteError> {
        retry_with_backoff(&self.retry_cfg, || async {
            let resp: FolderListResponse = self
                .get_json(&format!("/folder/list?id={folder_id}"))
                .await?;
            if resp.status != "success" {
                return Err(RemoteError::Api {
                    status: resp.status,
                    message: "failed to list folder".into(),
                });
            }
            Ok(resp
                .content
                .into_iter()
                .map(|raw| match raw.kind.as_str() {
                    "folder" => FolderEntry::Folder {
                        id: raw.id,
                        name: raw.name,
                    },
                    _ => FolderEntry::File {
                        id: raw.id,
                        name: raw.name,
                        size: raw.size.unwrap_or(0),
                        link: raw.link.unwrap_or_default(),
                        direct_link: raw.directlink.unwrap_or_default(),
                    },
                })
                .collect())
        })
        .await
    }

    async fn retry_transfer(&self, transfer_id: &str) -> Result<(), RemoteError> {
        retry_with_backoff(&self.retry_cfg, || async {
            let resp: StatusResponse = self
                .post_form("/transfer/retry", &[("id", transfer_id)])
                .await?;
            if resp.status != "success" && !is_already_gone(&resp.message) {
                return Err(RemoteError::Api {
                    status: resp.status,
                    message: resp.message.unwrap_or_default(),
                });
            }
            Ok(())
        })
        .await
    }

    async fn delete_transfer(&self, transfer_id: &str) -> Result<(), RemoteError> {
        retry_with_backoff(&self.retry_cfg, || async {
            let resp: StatusResponse = self
                .post_form("/transfer/delete", &[("id", transfer_id)])
                .await?;
            if resp.status != "success" && !is_already_gone(&resp.message) {
                return Err(RemoteError::Api {
                    status: resp.status,
                    message: resp.message.unwrap_or_default(),
                });
            }
            Ok(())
        })
        .await
    }
}

fn is_already_gone(message: &Option<String>) -> bool {
    message
        .as_deref()
        .map(|m| m.to_lowercase().contains("not found") || m.to_lowercase().contains("does not exist"))
        .unwrap_or(false)
}

/// Append 1–100 random trailing spaces to the descriptor at `path`, which
/// is enough to change its bytes and bypass the remote's exact-duplicate
/// check without affecting the content a downstream parser reads.
async fn append_random_padding(path: &Path) -> std::io::Result<()> {
    let padding_len = rand::thread_rng().gen_range(1..=100);
    let padding = vec![b' '; padding_len];
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new().append(true).open(path).await?;
    file.write_all(&padding).await?;
    file.flush().await
}
