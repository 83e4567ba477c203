// SPDX-License-Identifier: MIT
//! Recursive merge-move of one filesystem tree into another, with an
//! optional hook that degrades a job's ledger state on persistent failure.

use crate::errors::StateRetryError;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::storage::Storage;
use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tracing::{debug, error, warn};

/// Move `src` into `dst`, recursively merging directories and overwriting
/// conflicting files, removing `src` as it empties.
///
/// If `degrade_id` is `None`, a failure propagates as an ordinary error —
/// the caller is expected to retry the whole stage on its own schedule.
///
/// If `degrade_id` is `Some(id)`, a failure instead degrades the job: its
/// `state_retry_count` is incremented, and either the job is marked
/// `failed` (budget exhausted) or reset to `found` with `cld_dl_move_retry_c`
/// incremented — in both cases a [`StateRetryError`] is returned so the
/// caller knows the job has already been handled and should not be retried
/// in place.
pub async fn move_and_integrate(
    storage: &Storage,
    src: &Path,
    dst: &Path,
    degrade_id: Option<i64>,
    max_state_retry_count: u32,
) -> Result<()> {
    let retry_cfg = RetryConfig {
        max_attempts: 2,
        ..RetryConfig::default()
    };

    let result = retry_with_backoff(&retry_cfg, || async {
        move_and_integrate_once(src, dst).await
    })
    .await;

    let Err(err) = result else {
        return Ok(());
    };

    let Some(id) = degrade_id else {
        warn!(src = %src.display(), dst = %dst.display(), %err, "integration failed, no degrade id — caller will retry");
        return Err(anyhow!("failed to move and integrate {}: {err}", src.display()));
    };

    error!(job_id = id, src = %src.display(), dst = %dst.display(), %err, "integration failed — degrading job");
    let new_count = storage.increment_state_retry(id).await?;

    if new_count as u32 >= max_state_retry_count {
        error!(job_id = id, new_count, max_state_retry_count, "state retry budget exhausted — marking failed");
        storage.mark_failed(id).await?;
        return Err(StateRetryError::new(format!(
            "state retry count exceeded for job {id}: {err}"
        ))
        .into());
    }

    warn!(job_id = id, new_count, max_state_retry_count, "degrading job back to found for another attempt");
    storage.reset_to_found(id, true, false).await?;
    Err(StateRetryError::new(format!("failed to move and integrate {}: {err}", src.display())).into())
}

async fn move_and_integrate_once(src: &Path, dst: &Path) -> Result<()> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    tokio::task::spawn_blocking(move || move_and_integrate_sync(&src, &dst))
        .await
        .context("integrator task panicked")?
}

fn move_and_integrate_sync(src: &Path, dst: &Path) -> Result<()> {
    if !src.exists() {
        return Err(anyhow!("source missing: {}", src.display()));
    }

    if src.is_file() {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating parent of {}", dst.display()))?;
        }
        if dst.exists() {
            debug!(dst = %dst.display(), "overwriting existing file");
        }
        std::fs::rename(src, dst).or_else(|_| {
            // Cross-device moves fail with EXDEV under rename(2); fall back
            // to copy + remove for those.
            std::fs::copy(src, dst)?;
            std::fs::remove_file(src)
        })
        .with_context(|| format!("moving file {} to {}", src.display(), dst.display()))?;
        return Ok(());
    }

    std::fs::create_dir_all(dst)
        .with_context(|| format!("creating directory {}", dst.display()))?;

    for entry in std::fs::read_dir(src)
        .with_context(|| format!("reading directory {}", src.display()))?
    {
        let entry = entry?;
        let child_dst = dst.join(entry.file_name());
        move_and_integrate_sync(&entry.path(), &child_dst)?;
    }

    std::fs::remove_dir(src)
        .with_context(|| format!("removing emptied directory {}", src.display()))?;
    Ok(())
}
