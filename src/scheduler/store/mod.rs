use crate::errors::{CadenceError, CadenceResult};
use crate::scheduler::registry::HandlerRegistry;
use crate::scheduler::task::TaskHandler;
use crate::scheduler::types::{STORE_VERSION, ScheduledTask, ScheduledTaskRecord, StoreFile};
use crate::utils::atomic_write;
use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// File-backed store of scheduled tasks.
///
/// Every mutation is a whole-file read-modify-write, serialized in-process by
/// a mutex and across processes by an fs2 lock on a sibling `.lock` file (the
/// data file itself is replaced by rename on each write, so it cannot carry
/// the lock). Unreadable or corrupt files read as an empty store.
#[derive(Clone)]
pub struct ScheduleStore {
    path: PathBuf,
    registry: HandlerRegistry,
    write_lock: Arc<Mutex<()>>,
}

impl ScheduleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_registry(path, HandlerRegistry::new())
    }

    pub fn with_registry(path: impl Into<PathBuf>, registry: HandlerRegistry) -> Self {
        Self {
            path: path.into(),
            registry,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Make a handler resolvable by name when schedules are loaded.
    pub fn register_handler(&self, handler: TaskHandler) {
        self.registry.register(handler);
    }

    /// Insert or replace a schedule by id.
    pub async fn save_schedule(&self, task: &ScheduledTask) -> CadenceResult<()> {
        let record = task.to_record();
        self.modify(move |schedules| upsert(schedules, record)).await?;
        debug!("Saved schedule '{}'", task.id);
        Ok(())
    }

    pub async fn update_schedule(&self, task: &ScheduledTask) -> CadenceResult<()> {
        let record = task.to_record();
        let existed = self.modify(move |schedules| upsert(schedules, record)).await?;
        if !existed {
            debug!("Schedule '{}' was not persisted yet; inserted", task.id);
        }
        Ok(())
    }

    pub async fn delete_schedule(&self, id: &str) -> CadenceResult<bool> {
        self.modify(|schedules| {
            let before = schedules.len();
            schedules.retain(|s| s.id != id);
            schedules.len() != before
        })
        .await
    }

    pub async fn get_schedule(&self, id: &str) -> Option<ScheduledTask> {
        let _guard = self.write_lock.lock().await;
        let record = self
            .read_locked()
            .schedules
            .into_iter()
            .find(|s| s.id == id)?;
        let handler = self.registry.resolve(&record.task.handler);
        Some(ScheduledTask::from_record(record, handler))
    }

    /// Load live schedules, resolving handlers through the registry.
    ///
    /// One-shot schedules whose `run_at` has passed are dropped as expired;
    /// overdue recurring schedules are kept so the scheduler catches them up.
    pub async fn load_schedules(&self) -> Vec<ScheduledTask> {
        let now = Utc::now();
        self.load_records()
            .await
            .into_iter()
            .filter(|record| {
                if record.status.is_terminal() {
                    return false;
                }
                let expired = !record.recurring && record.run_at.is_none_or(|at| at < now);
                if expired {
                    debug!("Dropping expired one-shot schedule '{}'", record.id);
                }
                !expired
            })
            .map(|record| {
                let handler = self.registry.resolve(&record.task.handler);
                ScheduledTask::from_record(record, handler)
            })
            .collect()
    }

    /// Raw persisted records, without expiry filtering or handler resolution.
    pub async fn load_records(&self) -> Vec<ScheduledTaskRecord> {
        let _guard = self.write_lock.lock().await;
        self.read_locked().schedules
    }

    pub async fn clear_all(&self) -> CadenceResult<()> {
        self.modify(|schedules| schedules.clear()).await
    }

    async fn modify<R>(
        &self,
        mutate: impl FnOnce(&mut Vec<ScheduledTaskRecord>) -> R,
    ) -> CadenceResult<R> {
        let _guard = self.write_lock.lock().await;
        let lock_file = self
            .open_lock_file()
            .map_err(|e| CadenceError::Persistence(format!("{e:#}")))?;
        lock_file.lock_exclusive().map_err(|e| {
            CadenceError::Persistence(format!("Failed to lock schedule store: {e}"))
        })?;

        let mut file = self.read_file();
        let out = mutate(&mut file.schedules);
        file.version = STORE_VERSION;
        file.saved_at = Some(Utc::now());
        self.write_file(&file)
            .map_err(|e| CadenceError::Persistence(format!("{e:#}")))?;
        Ok(out)
    }

    /// Read under a shared cross-process lock. Caller holds `write_lock`.
    fn read_locked(&self) -> StoreFile {
        match self.open_lock_file() {
            Ok(lock_file) => {
                if let Err(e) = lock_file.lock_shared() {
                    warn!("Failed to take shared lock on schedule store: {}", e);
                }
                self.read_file()
            }
            Err(e) => {
                warn!("{:#}", e);
                self.read_file()
            }
        }
    }

    fn read_file(&self) -> StoreFile {
        if !self.path.exists() {
            return StoreFile::default();
        }
        let parsed = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))
            .and_then(|content| {
                serde_json::from_str::<StoreFile>(&content)
                    .with_context(|| format!("Failed to parse {}", self.path.display()))
            });
        match parsed {
            Ok(file) => {
                if file.version > STORE_VERSION {
                    warn!(
                        "Schedule store version {} is newer than supported version {}",
                        file.version, STORE_VERSION
                    );
                }
                file
            }
            Err(e) => {
                warn!("Schedule store unreadable, treating as empty: {:#}", e);
                StoreFile::default()
            }
        }
    }

    fn write_file(&self, file: &StoreFile) -> Result<()> {
        let content = serde_json::to_string_pretty(file)?;
        atomic_write(&self.path, &content)
            .with_context(|| format!("Failed to write schedule store {}", self.path.display()))
    }

    fn open_lock_file(&self) -> Result<fs::File> {
        let mut name = self
            .path
            .file_name()
            .context("Schedule store path has no file name")?
            .to_os_string();
        name.push(".lock");
        let lock_path = self.path.with_file_name(name);
        if let Some(parent) = lock_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file {}", lock_path.display()))
    }
}

impl std::fmt::Debug for ScheduleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Returns whether a record with the same id already existed.
fn upsert(schedules: &mut Vec<ScheduledTaskRecord>, record: ScheduledTaskRecord) -> bool {
    if let Some(existing) = schedules.iter_mut().find(|s| s.id == record.id) {
        *existing = record;
        true
    } else {
        schedules.push(record);
        false
    }
}
