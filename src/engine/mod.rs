// SPDX-License-Identifier: MIT
//! The lifecycle engine: a single driver loop that runs the seven polling
//! stages in order, promoting jobs through the state machine and enforcing
//! the retry/timeout budgets.

use crate::clock::Clock;
use crate::config::Config;
use crate::fetcher::FetcherApi;
use crate::integrator::move_and_integrate;
use crate::remote::{RemoteApi, TransferItem, TransferStatus};
use crate::storage::{JobState, Storage};
use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// A descriptor waiting to be handed to the remote facade.
#[derive(Debug, Clone)]
struct UploadItem {
    job_id: i64,
    full_path: PathBuf,
    category_path: String,
}

/// A transfer handle currently being watched for completion.
#[derive(Debug, Clone)]
struct WatchEntry {
    job_id: i64,
}

/// A completed remote transfer waiting to be fetched to local disk.
#[derive(Debug, Clone)]
struct FetchItem {
    job_id: i64,
    name: String,
    folder_id: String,
    category_path: String,
}

const UPLOAD_DEADLINE_MINUTES: i64 = 25;
const PROGRESS_DEADLINE_MINUTES: i64 = 15;
const STUCK_MOVE_MESSAGE_PREFIX: &str = "Moving to cloud";

pub struct Engine<R: RemoteApi, F: FetcherApi, C: Clock> {
    storage: Storage,
    remote: R,
    fetcher: F,
    clock: C,
    config: Config,

    upload_queue: VecDeque<UploadItem>,
    watch_set: Vec<(String, WatchEntry)>,
    fetch_queue: VecDeque<FetchItem>,

    /// Non-`.nzb` paths already logged once at `debug`, so stray files
    /// don't spam the log every round. Cleared only on restart.
    already_logged: HashSet<PathBuf>,

    root_folder_id: Option<String>,
}

impl<R: RemoteApi, F: FetcherApi, C: Clock> Engine<R, F, C> {
    /// Construct the engine and reconstruct its in-memory queues from the
    /// ledger, so a restart picks up exactly where the durable state left off.
    pub async fn new(storage: Storage, remote: R, fetcher: F, clock: C, config: Config) -> Result<Self> {
        let mut engine = Self {
            storage,
            remote,
            fetcher,
            clock,
            config,
            upload_queue: VecDeque::new(),
            watch_set: Vec::new(),
            fetch_queue: VecDeque::new(),
            already_logged: HashSet::new(),
            root_folder_id: None,
        };
        engine.recover_from_ledger().await?;
        Ok(engine)
    }

    async fn recover_from_ledger(&mut self) -> Result<()> {
        for job in self.storage.current_work_in_state(JobState::Found).await? {
            self.upload_queue.push_back(UploadItem {
                job_id: job.id,
                full_path: PathBuf::from(job.full_path),
                category_path: job.category_path,
            });
        }
        for job in self.storage.current_work_in_state(JobState::Uploaded).await? {
            if let Some(dl_id) = job.dl_id.clone() {
                self.watch_set.push((dl_id, WatchEntry { job_id: job.id }));
            }
        }
        for job in self.storage.current_work_in_state(JobState::InCloud).await? {
            if let Some(folder_id) = job.dl_folder_id.clone() {
                self.fetch_queue.push_back(FetchItem {
                    job_id: job.id,
                    name: job.nzb_name,
                    folder_id,
                    category_path: job.category_path,
                });
            }
        }
        info!(
            to_upload = self.upload_queue.len(),
            watching = self.watch_set.len(),
            to_fetch = self.fetch_queue.len(),
            "recovered in-memory queues from ledger"
        );
        Ok(())
    }

    /// Run the driver loop forever. Returns only on an unrecoverable error —
    /// the caller (`main`) is expected to restart the whole engine after a
    /// cool-down.
    pub async fn run(&mut self) -> Result<()> {
        self.bootstrap().await?;
        loop {
            self.run_one_round().await?;
            self.stage_g_sleep().await;
        }
    }

    /// One-time startup handshake: confirms the API key works and resolves
    /// the root folder jobs upload into.
    async fn bootstrap(&mut self) -> Result<()> {
        self.remote
            .account_info()
            .await
            .context("remote account sanity check failed at startup")?;
        let root_folder_id = self
            .remote
            .ensure_root_folder(&self.config.remote_root_dir_name)
            .await
            .context("failed to ensure remote root folder exists")?;
        self.root_folder_id = Some(root_folder_id);
        Ok(())
    }

    /// Run stages A through F once, without the trailing sleep. Exposed so
    /// tests can drive the state machine round by round; `run` wraps this in
    /// the real driver loop.
    pub async fn run_one_round(&mut self) -> Result<()> {
        if self.root_folder_id.is_none() {
            self.bootstrap().await?;
        }
        self.stage_a_ingest().await?;
        self.stage_b_upload().await?;
        self.stage_c_watch().await?;
        self.stage_d_fetch().await?;
        self.stage_e_cleanup().await?;
        self.stage_f_final_move().await?;
        Ok(())
    }

    // ─── Stage A — ingest ───────────────────────────────────────────────────

    async fn stage_a_ingest(&mut self) -> Result<()> {
        let mut found = Vec::new();
        walk_blackhole(&self.config.blackhole_path, &self.config.blackhole_path, &mut found)?;

        for path in found {
            let is_descriptor = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("nzb"))
                .unwrap_or(false);
            if !is_descriptor {
                if self.already_logged.insert(path.clone()) {
                    debug!(path = %path.display(), "ignoring non-descriptor file in blackhole");
                }
                continue;
            }

            let category_path = path
                .parent()
                .and_then(|p| p.strip_prefix(&self.config.blackhole_path).ok())
                .map(|p| format!("/{}", p.display()))
                .unwrap_or_else(|| "/".to_string());
            let nzb_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let full_path_str = path.to_string_lossy().to_string();

            let inserted = self
                .storage
                .insert_if_new(&full_path_str, &category_path, &nzb_name, &self.clock)
                .await?;
            if let Some(job) = inserted {
                info!(job_id = job.id, path = %path.display(), "ingested new descriptor");
                self.upload_queue.push_back(UploadItem {
                    job_id: job.id,
                    full_path: path,
                    category_path,
                });
            }
        }
        Ok(())
    }

    // ─── Stage B — upload ───────────────────────────────────────────────────

    async fn stage_b_upload(&mut self) -> Result<()> {
        let root_folder_id = self
            .root_folder_id
            .clone()
            .context("root folder id missing — engine was not started via run()")?;

        while let Some(item) = self.upload_queue.pop_front() {
            match self
                .remote
                .upload_descriptor(&item.full_path, &root_folder_id)
                .await
            {
                Ok(dl_id) => {
                    let timeout = self.clock.now() + ChronoDuration::minutes(UPLOAD_DEADLINE_MINUTES);
                    self.storage.mark_uploaded(item.job_id, &dl_id, timeout).await?;
                    info!(job_id = item.job_id, dl_id, "uploaded descriptor to remote");
                    self.watch_set.push((dl_id, WatchEntry { job_id: item.job_id }));
                }
                Err(crate::errors::RemoteError::DescriptorMissing(path)) => {
                    error!(job_id = item.job_id, path, "descriptor vanished before upload — marking failed");
                    self.storage.mark_failed(item.job_id).await?;
                }
                Err(err) => {
                    warn!(job_id = item.job_id, %err, "upload failed — will retry next round");
                    self.upload_queue.push_back(item);
                    break;
                }
            }
        }
        Ok(())
    }

    // ─── Stage C — watch cloud transfers ───────────────────────────────────

    async fn stage_c_watch(&mut self) -> Result<()> {
        if self.watch_set.is_empty() {
            return Ok(());
        }

        let transfers = self.remote.list_transfers().await?;
        let mut by_id: std::collections::HashMap<&str, &TransferItem> =
            std::collections::HashMap::new();
        for t in &transfers {
            by_id.insert(t.id.as_str(), t);
        }

        let watched = std::mem::take(&mut self.watch_set);
        let mut still_watching = Vec::new();

        for (dl_id, entry) in watched {
            let Some(item) = by_id.get(dl_id.as_str()).copied() else {
                warn!(job_id = entry.job_id, dl_id, "watched transfer vanished from listing — treating as lost");
                self.degrade_and_requeue_upload(entry.job_id).await?;
                continue;
            };

            if item.status == TransferStatus::Finished {
                let folder_id = item.folder_id.clone().unwrap_or_default();
                let job = self.storage.get(entry.job_id).await?;
                self.storage.mark_in_cloud(entry.job_id, &folder_id).await?;
                info!(job_id = entry.job_id, folder_id, "transfer finished — queued for fetch");
                self.fetch_queue.push_back(FetchItem {
                    job_id: entry.job_id,
                    name: job.nzb_name,
                    folder_id,
                    category_path: job.category_path,
                });
                continue;
            }

            if item.status.is_failed() {
                let new_count = self.storage.increment_dl_retry(entry.job_id).await?;
                if new_count as u32 >= self.config.max_retry_count {
                    error!(job_id = entry.job_id, dl_id, new_count, "remote retry budget exhausted — marking failed");
                    self.storage.mark_failed(entry.job_id).await?;
                    let _ = self.remote.delete_transfer(&dl_id).await;
                    self.archive_descriptor_best_effort(entry.job_id).await;
                    // Skip to the next watched item — never call retry_transfer
                    // on a handle we just marked terminal.
                    continue;
                }
                warn!(job_id = entry.job_id, dl_id, new_count, "remote transfer failed — retrying");
                self.remote.retry_transfer(&dl_id).await?;
                still_watching.push((dl_id, entry));
                continue;
            }

            // Progressing: waiting / running / queued / seeding.
            let job = self.storage.get(entry.job_id).await?;
            let observed_prefix = item.message.as_deref().map(|m| prefix3(m));
            let stored_prefix = job.message.as_deref().map(|m| prefix3(m));

            if observed_prefix.is_some() && observed_prefix != stored_prefix {
                let new_message = item.message.clone().unwrap_or_default();
                let new_deadline = self.clock.now() + ChronoDuration::minutes(PROGRESS_DEADLINE_MINUTES);
                self.storage
                    .set_message_and_timeout(entry.job_id, &new_message, new_deadline)
                    .await?;
                still_watching.push((dl_id, entry));
                continue;
            }

            let past_deadline = job
                .timeout_at()
                .map(|deadline| self.clock.now() > deadline)
                .unwrap_or(false);
            if !past_deadline {
                still_watching.push((dl_id, entry));
                continue;
            }

            let is_stuck_move = job
                .message
                .as_deref()
                .map(|m| m.starts_with(STUCK_MOVE_MESSAGE_PREFIX))
                .unwrap_or(false);
            if is_stuck_move {
                if job.cld_dl_move_retry_c as u32 >= self.config.max_cloud_dl_move_retry_count {
                    error!(job_id = entry.job_id, dl_id, "stuck-move retry budget exhausted — marking failed");
                    self.storage.mark_failed(entry.job_id).await?;
                } else {
                    warn!(job_id = entry.job_id, dl_id, "transfer stuck moving to cloud — restarting upload chain");
                    let _ = self.remote.delete_transfer(&dl_id).await;
                    self.degrade_and_requeue_upload(entry.job_id).await?;
                }
                continue;
            }

            error!(job_id = entry.job_id, dl_id, message = ?job.message, "unexpected stuck state — leaving for operator");
            still_watching.push((dl_id, entry));
        }

        self.watch_set = still_watching;
        Ok(())
    }

    async fn degrade_and_requeue_upload(&mut self, job_id: i64) -> Result<()> {
        self.storage.reset_to_found(job_id, true, false).await?;
        self.requeue_if_found(job_id).await
    }

    /// Re-populate the in-memory upload queue for a job the ledger already
    /// shows as `found` (e.g. degraded by `move_and_integrate` itself, which
    /// writes straight to the ledger with no engine-side queue access).
    /// A no-op if the job ended up `failed` instead — nothing to requeue.
    async fn requeue_if_found(&mut self, job_id: i64) -> Result<()> {
        let job = self.storage.get(job_id).await?;
        if job.state() == JobState::Found {
            self.upload_queue.push_back(UploadItem {
                job_id,
                full_path: PathBuf::from(job.full_path),
                category_path: job.category_path,
            });
        }
        Ok(())
    }

    async fn archive_descriptor_best_effort(&self, job_id: i64) {
        let Ok(job) = self.storage.get(job_id).await else {
            return;
        };
        let src = PathBuf::from(&job.full_path);
        let dst = self.config.archive_path().join(&job.nzb_name);
        if let Err(err) = move_and_integrate(&self.storage, &src, &dst, None, self.config.max_state_retry_count).await
        {
            warn!(job_id, %err, "failed to archive descriptor for terminally failed job");
        }
    }

    // ─── Stage D — local fetch ──────────────────────────────────────────────

    async fn stage_d_fetch(&mut self) -> Result<()> {
        while let Some(item) = self.fetch_queue.pop_front() {
            match self.fetch_one(&item).await {
                Ok(()) => {
                    self.storage.mark_downloaded(item.job_id).await?;
                    info!(job_id = item.job_id, "all files fetched locally");
                }
                Err(err) => {
                    warn!(job_id = item.job_id, %err, "fetch failed — degrading job back to found");
                    self.degrade_and_requeue_upload(item.job_id).await?;
                }
            }
        }
        Ok(())
    }

    async fn fetch_one(&self, item: &FetchItem) -> Result<()> {
        let triples = walk_remote_folder(&self.remote, &item.folder_id, PathBuf::new()).await?;
        for (link, relative_path, filename) in triples {
            let dest_dir = self
                .config
                .download_path
                .join(item.category_path.trim_start_matches('/'))
                .join(&item.name)
                .join(&relative_path);
            self.fetcher
                .download(&link, &dest_dir, &filename)
                .await
                .with_context(|| format!("fetching {filename} for job {}", item.job_id))?;
        }
        Ok(())
    }

    // ─── Stage E — cloud cleanup ────────────────────────────────────────────

    async fn stage_e_cleanup(&mut self) -> Result<()> {
        for job in self.storage.current_work_in_state(JobState::Downloaded).await? {
            if let Some(dl_id) = &job.dl_id {
                if let Err(err) = self.remote.delete_transfer(dl_id).await {
                    debug!(job_id = job.id, %err, "delete_transfer failed (treated as already gone)");
                }
            }
            self.storage.mark_cleaned(job.id).await?;
        }
        Ok(())
    }

    // ─── Stage F — final move ───────────────────────────────────────────────

    async fn stage_f_final_move(&mut self) -> Result<()> {
        for job in self.storage.current_work_in_state(JobState::Cleaned).await? {
            let src = self
                .config
                .download_path
                .join(job.category_path.trim_start_matches('/'))
                .join(&job.nzb_name);
            let dst = self
                .config
                .done_path
                .join(job.category_path.trim_start_matches('/'))
                .join(&job.nzb_name);

            let moved = move_and_integrate(
                &self.storage,
                &src,
                &dst,
                Some(job.id),
                self.config.max_state_retry_count,
            )
            .await;
            if moved.is_err() {
                // The integrator already degraded the job to `found` or
                // marked it `failed` directly on the ledger; restore it to
                // the in-memory upload queue so the chain actually re-runs
                // instead of stalling until the next process restart.
                self.requeue_if_found(job.id).await?;
                continue;
            }

            let descriptor_src = PathBuf::from(&job.full_path);
            let descriptor_dst = self.config.archive_path().join(&job.nzb_name);
            if let Err(err) = move_and_integrate(
                &self.storage,
                &descriptor_src,
                &descriptor_dst,
                None,
                self.config.max_state_retry_count,
            )
            .await
            {
                warn!(job_id = job.id, %err, "failed to archive descriptor after successful move — job still completes");
            }

            self.storage.mark_done(job.id, self.clock.now()).await?;
            info!(job_id = job.id, "job complete");
        }
        Ok(())
    }

    // ─── Stage G — sleep ─────────────────────────────────────────────────────

    async fn stage_g_sleep(&self) {
        tokio::time::sleep(std::time::Duration::from_secs(self.config.recheck_delay_secs)).await;
    }
}

fn prefix3(s: &str) -> &str {
    let end = s.char_indices().nth(3).map(|(i, _)| i).unwrap_or(s.len());
    &s[..end]
}

/// Recursively enumerate every regular file under `dir`, relative to
/// `blackhole_root`. A plain manual walk rather than a crate dependency —
/// the blackhole tree is shallow and this keeps the dependency list small.
fn walk_blackhole(blackhole_root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_blackhole(blackhole_root, &path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

/// Depth-first walk of a remote folder tree, accumulating
/// `(download_link, relative_directory, filename)` triples.
async fn walk_remote_folder<R: RemoteApi + ?Sized>(
    remote: &R,
    root_folder_id: &str,
    root_relative_path: PathBuf,
) -> Result<Vec<(String, PathBuf, String)>, crate::errors::RemoteError> {
    let mut triples = Vec::new();
    let mut stack = vec![(root_folder_id.to_string(), root_relative_path)];

    while let Some((folder_id, relative_path)) = stack.pop() {
        for entry in remote.list_folder(&folder_id).await? {
            match entry {
                crate::remote::FolderEntry::File { name, link, .. } => {
                    triples.push((link, relative_path.clone(), name));
                }
                crate::remote::FolderEntry::Folder { id, name } => {
                    stack.push((id, relative_path.join(name)));
                }
            }
        }
    }
    Ok(triples)
}
