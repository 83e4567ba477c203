//! Shared fakes for the engine integration tests: a scripted `RemoteApi`
//! whose transfer/folder state tests manipulate between rounds, a
//! filename-writing `FetcherApi`, and a clock tests can advance by hand to
//! exercise the stuck-transfer deadlines without real sleeps.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use premiumarr::clock::Clock;
use premiumarr::config::Config;
use premiumarr::errors::{FetchError, RemoteError};
use premiumarr::fetcher::FetcherApi;
use premiumarr::remote::{FolderEntry, RemoteApi, TransferItem, TransferStatus};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Build a `Config` rooted at a temp directory, creating the four
/// filesystem roots the engine expects to already exist.
pub fn make_config(root: &Path) -> Config {
    std::fs::create_dir_all(root.join("blackhole")).unwrap();
    std::fs::create_dir_all(root.join("downloads")).unwrap();
    std::fs::create_dir_all(root.join("done")).unwrap();
    std::fs::create_dir_all(root.join("config")).unwrap();

    Config {
        api_key: "test-key".to_string(),
        blackhole_path: root.join("blackhole"),
        download_path: root.join("downloads"),
        done_path: root.join("done"),
        config_path: root.join("config"),
        download_threads: 2,
        download_speed_limit_kb: -1,
        recheck_delay_secs: 60,
        max_retry_count: 6,
        max_cloud_dl_move_retry_count: 3,
        max_state_retry_count: 3,
        remote_root_dir_name: "premiumarr".to_string(),
        log_level: "info".to_string(),
    }
}

/// A clock tests advance deliberately, so stuck-transfer deadlines can be
/// crossed without waiting real minutes.
#[derive(Clone)]
pub struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

impl ManualClock {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Utc::now())))
    }

    pub fn advance(&self, delta: Duration) {
        let mut guard = self.0.lock().unwrap();
        *guard += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

#[derive(Default)]
struct RemoteState {
    next_id: u64,
    transfers: HashMap<String, TransferItem>,
    folders: HashMap<String, Vec<FolderEntry>>,
    delete_calls: Vec<String>,
    retry_calls: Vec<String>,
}

/// A `RemoteApi` whose transfer list and folder contents tests script by
/// hand between engine rounds, standing in for the real cloud-downloader.
#[derive(Clone)]
pub struct ScriptedRemote(Arc<Mutex<RemoteState>>);

impl ScriptedRemote {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(RemoteState::default())))
    }

    /// Register a transfer as if it had already been created, bypassing
    /// `upload_descriptor` — used to simulate state recovered after a crash.
    pub fn seed_transfer(&self, id: &str, name: &str, status: TransferStatus) {
        let mut state = self.0.lock().unwrap();
        state.transfers.insert(
            id.to_string(),
            TransferItem {
                id: id.to_string(),
                name: name.to_string(),
                message: None,
                status,
                progress: None,
                folder_id: None,
                src: None,
            },
        );
    }

    pub fn set_status(&self, id: &str, status: TransferStatus) {
        let mut state = self.0.lock().unwrap();
        if let Some(t) = state.transfers.get_mut(id) {
            t.status = status;
        }
    }

    pub fn set_message(&self, id: &str, message: &str) {
        let mut state = self.0.lock().unwrap();
        if let Some(t) = state.transfers.get_mut(id) {
            t.message = Some(message.to_string());
        }
    }

    pub fn set_folder_id(&self, id: &str, folder_id: &str) {
        let mut state = self.0.lock().unwrap();
        if let Some(t) = state.transfers.get_mut(id) {
            t.folder_id = Some(folder_id.to_string());
        }
    }

    pub fn register_folder(&self, folder_id: &str, entries: Vec<FolderEntry>) {
        self.0.lock().unwrap().folders.insert(folder_id.to_string(), entries);
    }

    pub fn delete_calls(&self) -> Vec<String> {
        self.0.lock().unwrap().delete_calls.clone()
    }

    pub fn retry_calls(&self) -> Vec<String> {
        self.0.lock().unwrap().retry_calls.clone()
    }
}

#[async_trait]
impl RemoteApi for ScriptedRemote {
    async fn account_info(&self) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn ensure_root_folder(&self, _name: &str) -> Result<String, RemoteError> {
        Ok("root-folder".to_string())
    }

    async fn upload_descriptor(
        &self,
        path: &Path,
        _parent_folder_id: &str,
    ) -> Result<String, RemoteError> {
        if !path.exists() {
            return Err(RemoteError::DescriptorMissing(path.display().to_string()));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut state = self.0.lock().unwrap();
        state.next_id += 1;
        let id = format!("T{}", state.next_id);
        state.transfers.insert(
            id.clone(),
            TransferItem {
                id: id.clone(),
                name,
                message: None,
                status: TransferStatus::Waiting,
                progress: None,
                folder_id: None,
                src: None,
            },
        );
        Ok(id)
    }

    async fn list_transfers(&self) -> Result<Vec<TransferItem>, RemoteError> {
        Ok(self.0.lock().unwrap().transfers.values().cloned().collect())
    }

    async fn list_folder(&self, folder_id: &str) -> Result<Vec<FolderEntry>, RemoteError> {
        Ok(self
            .0
            .lock()
            .unwrap()
            .folders
            .get(folder_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn retry_transfer(&self, transfer_id: &str) -> Result<(), RemoteError> {
        self.0.lock().unwrap().retry_calls.push(transfer_id.to_string());
        Ok(())
    }

    async fn delete_transfer(&self, transfer_id: &str) -> Result<(), RemoteError> {
        let mut state = self.0.lock().unwrap();
        state.delete_calls.push(transfer_id.to_string());
        state.transfers.remove(transfer_id);
        Ok(())
    }
}

/// A fetcher that just writes a placeholder file — the engine only needs a
/// real file to land at the right path, not real bytes off the wire.
#[derive(Clone, Default)]
pub struct FakeFetcher;

#[async_trait]
impl FetcherApi for FakeFetcher {
    async fn download(
        &self,
        url: &str,
        destination_directory: &Path,
        filename: &str,
    ) -> Result<(), FetchError> {
        tokio::fs::create_dir_all(destination_directory).await?;
        let dest: PathBuf = destination_directory.join(filename);
        if !dest.exists() {
            tokio::fs::write(&dest, format!("content-of:{url}")).await?;
        }
        Ok(())
    }
}
