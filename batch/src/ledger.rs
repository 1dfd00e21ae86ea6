//! The retry ledger: which transfers have failed (and how often), and which have succeeded.
//!
//! Both halves are persisted as JSON in a per-profile log directory:
//!
//! * `{profile}_failed_log_{YYYYMMDDTHHMMSSmmm}.json`, a new file for each invocation, holding an
//!   array of [`RetryRecord`]s;
//! * `{profile}_succeeded_log.json`, shared by all invocations, mapping local path to object id.
//!
//! Every mutation rewrites the affected files in full.  The in-memory state is snapshotted under
//! a short lock and written with `tokio::fs` afterwards; writes are serialized so that a later
//! snapshot never lands before an earlier one.  The ledger is single-process: two processes using
//! the same profile will overwrite each other's succeeded log.
use crate::unit::{Direction, TransferUnit};
use anyhow::Result;
use commons::chrono::{DateTime, Utc};
use commons::{error_kind, Error as CommonsError};
use commons_upload::{RegisteredObject, UploadMode};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// A transfer that has failed and not yet succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub path: PathBuf,
    #[serde(default)]
    pub object_id: Option<String>,
    /// The object was registered by this tool, and should be deleted if the upload is given up
    #[serde(default)]
    pub registered: bool,
    pub file_name: String,
    /// Number of failed attempts so far
    pub attempts: u32,
    pub mode: UploadMode,
    #[serde(default)]
    pub direction: Direction,
    /// False when the last failure will not go away by itself, such as a missing local file
    #[serde(default = "retriable_default")]
    pub retriable: bool,
    #[serde(default)]
    pub last_error: String,
}

fn retriable_default() -> bool {
    true
}

impl RetryRecord {
    pub fn unit(&self) -> TransferUnit {
        TransferUnit::from_key(
            self.direction,
            &self.path,
            &self.file_name,
            self.object_id.clone(),
        )
    }
}

#[derive(Default)]
struct State {
    failed: BTreeMap<PathBuf, RetryRecord>,
    succeeded: BTreeMap<PathBuf, String>,
}

/// Serialized contents of the ledger files, taken under the state lock.
struct Snapshot {
    failed: Option<String>,
    succeeded: Option<String>,
}

pub struct Ledger {
    failed_path: PathBuf,
    succeeded_path: PathBuf,
    state: Mutex<State>,
    writes: tokio::sync::Mutex<()>,
}

pub fn failed_log_name(profile: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}_failed_log_{}.json",
        profile,
        now.format("%Y%m%dT%H%M%S%3f")
    )
}

pub fn succeeded_log_name(profile: &str) -> String {
    format!("{}_succeeded_log.json", profile)
}

/// The most recent failed log for the profile in `dir`, if any.  Names sort lexicographically
/// by time, and a `_N` collision suffix sorts after the name it collided with.  Logs that were
/// claimed but never written are passed over.
pub async fn newest_failed_log(dir: &Path, profile: &str) -> Result<Option<PathBuf>> {
    let prefix = format!("{}_failed_log_", profile);
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CommonsError::local_io(dir, e).into()),
    };
    let mut candidates = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CommonsError::local_io(dir, e))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && name.ends_with(".json") {
            candidates.push(entry.path());
        }
    }
    candidates.sort();
    while let Some(path) = candidates.pop() {
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| CommonsError::local_io(&path, e))?;
        if meta.len() > 0 {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

async fn read_json<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> Result<T> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) if content.trim().is_empty() => Ok(T::default()),
        Ok(content) => serde_json::from_str(&content).map_err(|e| {
            CommonsError::Config(format!("corrupt ledger file {}: {}", path.display(), e)).into()
        }),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(CommonsError::local_io(path, e).into()),
    }
}

async fn write_file(path: &Path, content: String) -> Result<()> {
    tokio::fs::write(path, content)
        .await
        .map_err(|e| CommonsError::local_io(path, e))?;
    Ok(())
}

/// Create this invocation's failed log, empty.  If another invocation already holds the name, a
/// `_1`, `_2`, ... suffix is added until an unused name is found.
async fn claim_failed_log(dir: &Path, profile: &str, now: DateTime<Utc>) -> Result<PathBuf> {
    let name = failed_log_name(profile, now);
    let stem = name.trim_end_matches(".json");
    let mut suffix = 0u32;
    loop {
        let path = match suffix {
            0 => dir.join(&name),
            n => dir.join(format!("{}_{}.json", stem, n)),
        };
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => return Ok(path),
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => suffix += 1,
            Err(e) => return Err(CommonsError::local_io(&path, e).into()),
        }
    }
}

impl Ledger {
    /// Start a new failed log for this invocation, alongside the profile's succeeded log.
    pub async fn open(dir: &Path, profile: &str, now: DateTime<Utc>) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CommonsError::local_io(dir, e))?;
        let failed_path = claim_failed_log(dir, profile, now).await?;
        Self::load(failed_path, dir.join(succeeded_log_name(profile))).await
    }

    /// Continue an existing failed log, loading its records.
    pub async fn resume(dir: &Path, profile: &str, failed_log: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CommonsError::local_io(dir, e))?;
        Self::load(failed_log.to_path_buf(), dir.join(succeeded_log_name(profile))).await
    }

    async fn load(failed_path: PathBuf, succeeded_path: PathBuf) -> Result<Self> {
        let records: Vec<RetryRecord> = read_json(&failed_path).await?;
        let succeeded: BTreeMap<PathBuf, String> = read_json(&succeeded_path).await?;
        let state = State {
            failed: records.into_iter().map(|r| (r.path.clone(), r)).collect(),
            succeeded,
        };
        debug!(
            "ledger {}: {} failed, {} succeeded",
            failed_path.display(),
            state.failed.len(),
            state.succeeded.len()
        );
        Ok(Self {
            failed_path,
            succeeded_path,
            state: Mutex::new(state),
            writes: tokio::sync::Mutex::new(()),
        })
    }

    pub fn failed_log_path(&self) -> &Path {
        &self.failed_path
    }

    pub fn succeeded_log_path(&self) -> &Path {
        &self.succeeded_path
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // the state is rewritten in full on every mutation, so a poisoned lock holds no torn data
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn failed_json(state: &State) -> Result<String> {
        Ok(serde_json::to_string_pretty(
            &state.failed.values().collect::<Vec<_>>(),
        )?)
    }

    fn succeeded_json(state: &State) -> Result<String> {
        Ok(serde_json::to_string_pretty(&state.succeeded)?)
    }

    /// Write out a snapshot.  The caller holds the write gate but not the state lock.
    async fn persist(&self, snapshot: Snapshot) -> Result<()> {
        if let Some(failed) = snapshot.failed {
            write_file(&self.failed_path, failed).await?;
        }
        if let Some(succeeded) = snapshot.succeeded {
            write_file(&self.succeeded_path, succeeded).await?;
        }
        Ok(())
    }

    /// Create or update the record for a failed unit, returning the updated record.  A newly
    /// registered object named by the error is remembered so that retries upload to it.
    pub async fn record_failure(
        &self,
        unit: &TransferUnit,
        mode: UploadMode,
        err: &anyhow::Error,
    ) -> Result<RetryRecord> {
        let key = unit.key();
        let registered = err.downcast_ref::<RegisteredObject>().map(|r| r.0.clone());
        let _writing = self.writes.lock().await;
        let (record, snapshot) = {
            let mut state = self.lock();
            let record = state
                .failed
                .entry(key.clone())
                .or_insert_with(|| RetryRecord {
                    path: key,
                    object_id: None,
                    registered: false,
                    file_name: unit.file_name.clone(),
                    attempts: 0,
                    mode,
                    direction: unit.direction,
                    retriable: true,
                    last_error: String::new(),
                });
            record.attempts += 1;
            record.mode = mode;
            record.retriable = error_kind(err).is_retriable();
            record.last_error = format!("{:#}", err);
            if let Some(id) = registered {
                record.object_id = Some(id);
                record.registered = true;
            } else if let Some(id) = &unit.object_id {
                record.object_id = Some(id.clone());
            }
            let record = record.clone();
            let snapshot = Snapshot {
                failed: Some(Self::failed_json(&state)?),
                succeeded: None,
            };
            (record, snapshot)
        };
        self.persist(snapshot).await?;
        Ok(record)
    }

    /// Remove any failure record under `key` and remember that `written` now holds `object_id`.
    /// The two paths differ when a download landed under another name than the one it was
    /// tracked under.
    pub async fn record_success(&self, key: &Path, written: &Path, object_id: &str) -> Result<()> {
        let _writing = self.writes.lock().await;
        let snapshot = {
            let mut state = self.lock();
            let had_record = state.failed.remove(key).is_some();
            state
                .succeeded
                .insert(written.to_path_buf(), object_id.to_owned());
            let failed = if had_record {
                Some(Self::failed_json(&state)?)
            } else {
                None
            };
            Snapshot {
                failed,
                succeeded: Some(Self::succeeded_json(&state)?),
            }
        };
        self.persist(snapshot).await
    }

    /// Drop a record's object id, after the object has been deleted.
    pub async fn forget_object(&self, key: &Path) -> Result<()> {
        let _writing = self.writes.lock().await;
        let snapshot = {
            let mut state = self.lock();
            match state.failed.get_mut(key) {
                Some(record) => {
                    record.object_id = None;
                    record.registered = false;
                }
                None => return Ok(()),
            }
            Snapshot {
                failed: Some(Self::failed_json(&state)?),
                succeeded: None,
            }
        };
        self.persist(snapshot).await
    }

    /// Drop a stale record for a unit that has already succeeded.
    pub async fn discard(&self, key: &Path) -> Result<()> {
        let _writing = self.writes.lock().await;
        let snapshot = {
            let mut state = self.lock();
            if state.failed.remove(key).is_none() {
                return Ok(());
            }
            Snapshot {
                failed: Some(Self::failed_json(&state)?),
                succeeded: None,
            }
        };
        self.persist(snapshot).await
    }

    /// Mark every record retriable again; used when a user asks to retry a failed log.
    pub async fn rearm(&self) -> Result<()> {
        let _writing = self.writes.lock().await;
        let snapshot = {
            let mut state = self.lock();
            for record in state.failed.values_mut() {
                record.retriable = true;
            }
            Snapshot {
                failed: Some(Self::failed_json(&state)?),
                succeeded: None,
            }
        };
        self.persist(snapshot).await
    }

    pub fn is_succeeded(&self, key: &Path) -> bool {
        self.lock().succeeded.contains_key(key)
    }

    pub fn record(&self, key: &Path) -> Option<RetryRecord> {
        self.lock().failed.get(key).cloned()
    }

    /// A snapshot of all failure records, in path order.
    pub fn records(&self) -> Vec<RetryRecord> {
        self.lock().failed.values().cloned().collect()
    }

    pub fn succeeded(&self) -> BTreeMap<PathBuf, String> {
        self.lock().succeeded.clone()
    }
}
