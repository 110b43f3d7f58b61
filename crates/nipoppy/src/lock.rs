//! Writer serialization over the canonical tables.
//!
//! At most one process may write the dataset's state tables at a time.
//! A writer claims the lock file (resolved through the layout, by
//! default `.nipoppy/lock`) with create-new semantics, so two
//! concurrent claims can never both succeed, and the file records who
//! holds the claim and for which action. Readers never take the lock:
//! atomic table replacement keeps them consistent.
//!
//! A claim left behind by a dead process is reclaimed once it is older
//! than the staleness window; a claim that cannot be parsed names no
//! live writer and is reclaimed immediately.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NipoppyError;
use crate::layout::{Layout, ensure_dir};
use crate::types::Action;

/// Claims older than this are assumed abandoned and reclaimed.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(3600);

/// Who is writing, as recorded inside the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holder {
    /// `<pid>@<hostname>` of the writing process.
    pub held_by: String,
    pub since: DateTime<Utc>,
    pub action: Option<Action>,
}

impl Holder {
    fn current(action: Option<Action>) -> Self {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        Self {
            held_by: format!("{}@{hostname}", std::process::id()),
            since: Utc::now(),
            action,
        }
    }

    fn is_stale(&self, stale_after: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.since);
        age.num_seconds() >= stale_after.as_secs() as i64
    }
}

/// Guard over the dataset's state tables. The claim is freed when the
/// guard drops; [`DatasetLock::release`] frees it with error reporting.
#[derive(Debug)]
pub struct DatasetLock {
    path: PathBuf,
    released: bool,
}

impl DatasetLock {
    /// Claim the lock for an anonymous write.
    pub fn hold(layout: &Layout) -> Result<Self> {
        Self::claim(layout, None, DEFAULT_STALE_AFTER)
    }

    /// Claim the lock on behalf of one action, so a competing writer's
    /// rejection message says what is currently running.
    pub fn hold_for(layout: &Layout, action: Action) -> Result<Self> {
        Self::claim(layout, Some(action), DEFAULT_STALE_AFTER)
    }

    /// Claim with a custom staleness window.
    pub fn hold_with_staleness(
        layout: &Layout,
        action: Option<Action>,
        stale_after: Duration,
    ) -> Result<Self> {
        Self::claim(layout, action, stale_after)
    }

    fn claim(layout: &Layout, action: Option<Action>, stale_after: Duration) -> Result<Self> {
        let path = layout.path("lock")?;
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }

        let payload = serde_json::to_vec_pretty(&Holder::current(action))
            .context("failed to serialize lock holder")?;

        // The first pass claims outright; the second runs only after a
        // stale or unreadable claim was cleared.
        for final_attempt in [false, true] {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(&payload)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    file.sync_all().ok();
                    return Ok(Self {
                        path,
                        released: false,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists && !final_attempt => {
                    clear_abandoned_claim(&path, stale_after)?;
                }
                Err(err) => {
                    return Err(NipoppyError::persistence(format!(
                        "could not claim dataset lock {}: {err}",
                        path.display()
                    ))
                    .into());
                }
            }
        }
        Err(NipoppyError::persistence(format!(
            "dataset lock {} was claimed by another writer during reclaim",
            path.display()
        ))
        .into())
    }

    /// The current holder, if any process has a claim.
    pub fn holder(layout: &Layout) -> Result<Option<Holder>> {
        let path = layout.path("lock")?;
        if !path.exists() {
            return Ok(None);
        }
        read_holder(&path).map(Some)
    }

    /// Free the claim, surfacing removal failures.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        fs::remove_file(&self.path)
            .with_context(|| format!("failed to remove lock file {}", self.path.display()))
    }
}

impl Drop for DatasetLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Remove a stale or unreadable claim; reject a live one.
fn clear_abandoned_claim(path: &Path, stale_after: Duration) -> Result<()> {
    match read_holder(path) {
        Ok(holder) if holder.is_stale(stale_after) => fs::remove_file(path)
            .with_context(|| format!("failed to reclaim stale lock {}", path.display())),
        Ok(holder) => {
            let what = holder
                .action
                .map(|a| a.to_string())
                .unwrap_or_else(|| "a write".to_string());
            Err(NipoppyError::persistence(format!(
                "dataset is locked by {} (running {what} since {})",
                holder.held_by, holder.since
            ))
            .into())
        }
        Err(_) => fs::remove_file(path)
            .with_context(|| format!("failed to clear unreadable lock {}", path.display())),
    }
}

fn read_holder(path: &Path) -> Result<Holder> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock file {}", path.display()))?;
    let holder: Holder = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse lock holder from {}", path.display()))?;
    Ok(holder)
}
