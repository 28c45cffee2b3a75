use fs2::FileExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::fs;
use uuid::Uuid;

use super::{prepare_append, CreateOutcome, History, HistoryStore, InstanceRecord, ProviderError};
use crate::Event;

/// Filesystem-backed history store.
///
/// Layout under `root`:
/// - `<instance>/instance.json`: the `InstanceRecord`
/// - `<instance>/history.jsonl`: one JSON array of events per appended batch
/// - `.dedup/<uuid-v5(key)>`: owner instance id of a dedup key
/// - `.locks/`: advisory lock files
///
/// A batch occupies a single line, so a line torn by a crash is dropped as a
/// whole on read and appends stay all-or-nothing. Read-check-write sequences
/// hold an exclusive file lock, so several stores (or processes) may share a
/// root.
pub struct FsHistoryStore {
    root: PathBuf,
    // Keeps this store's own tasks off the blocking pool while they wait
    lock: Mutex<()>,
}

impl FsHistoryStore {
    /// Create a new store rooted at the given directory path.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        // best-effort create; real failures surface on first use
        let _ = std::fs::create_dir_all(path.join(".dedup"));
        let _ = std::fs::create_dir_all(path.join(".locks").join("instances"));
        Self {
            root: path,
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn inst_root(&self, instance: &str) -> PathBuf {
        self.root.join(instance)
    }

    fn record_path(&self, instance: &str) -> PathBuf {
        self.inst_root(instance).join("instance.json")
    }

    fn history_path(&self, instance: &str) -> PathBuf {
        self.inst_root(instance).join("history.jsonl")
    }

    fn instance_lock_path(&self, instance: &str) -> PathBuf {
        self.root.join(".locks").join("instances").join(format!("{instance}.lock"))
    }

    fn create_lock_path(&self) -> PathBuf {
        self.root.join(".locks").join("create.lock")
    }

    /// Take an advisory lock on `path`. It is released when the returned file
    /// is dropped.
    async fn file_lock(&self, path: PathBuf, exclusive: bool) -> Result<std::fs::File, ProviderError> {
        tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            if exclusive {
                FileExt::lock_exclusive(&file)?;
            } else {
                FileExt::lock_shared(&file)?;
            }
            Ok(file)
        })
        .await
        .map_err(|e| ProviderError::permanent("lock", e.to_string()))?
        .map_err(|e| ProviderError::io("lock", e))
    }

    fn dedup_path(&self, key: &str) -> PathBuf {
        let hashed = Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes());
        self.root.join(".dedup").join(hashed.to_string())
    }

    async fn load_record(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        match fs::read_to_string(self.record_path(instance)).await {
            Ok(data) => serde_json::from_str(&data)
                .map(Some)
                .map_err(|e| ProviderError::permanent("read_instance", format!("{instance}: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProviderError::io("read_instance", e)),
        }
    }

    /// Parse the history file. Lines that do not parse (a torn tail) are skipped.
    async fn load_history(&self, instance: &str) -> Result<(Vec<Event>, bool), ProviderError> {
        let data = match fs::read_to_string(self.history_path(instance)).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderError::InstanceNotFound(instance.to_string()))
            }
            Err(e) => return Err(ProviderError::io("read", e)),
        };
        let mut out = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Vec<Event>>(line) {
                Ok(batch) => out.extend(batch),
                Err(e) => tracing::warn!(instance_id = %instance, error = %e, "skipping unreadable history line"),
            }
        }
        let clean_tail = data.is_empty() || data.ends_with('\n');
        Ok((out, clean_tail))
    }

    async fn write_record(&self, record: &InstanceRecord) -> Result<(), ProviderError> {
        let dir = self.inst_root(&record.instance_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| ProviderError::io("create_instance", e))?;
        let body = serde_json::to_string_pretty(record)
            .map_err(|e| ProviderError::permanent("create_instance", e.to_string()))?;
        // Write-then-rename so a crash never leaves a half-written record
        let tmp = dir.join("instance.json.tmp");
        fs::write(&tmp, body)
            .await
            .map_err(|e| ProviderError::io("create_instance", e))?;
        fs::rename(&tmp, self.record_path(&record.instance_id))
            .await
            .map_err(|e| ProviderError::io("create_instance", e))?;
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path(&record.instance_id))
            .await
            .map_err(|e| ProviderError::io("create_instance", e))?;
        Ok(())
    }

    /// Owner of a dedup key, if the key is claimed by a live instance.
    async fn dedup_owner(&self, key: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        match fs::read_to_string(self.dedup_path(key)).await {
            Ok(owner) => self.load_record(owner.trim()).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProviderError::io("create_instance", e)),
        }
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn create_instance(&self, record: InstanceRecord) -> Result<CreateOutcome, ProviderError> {
        let _g = self.lock.lock().await;
        let _file = self.file_lock(self.create_lock_path(), true).await?;
        if let Some(key) = &record.dedup_key {
            if let Some(existing) = self.dedup_owner(key).await? {
                return Ok(CreateOutcome::Existing(existing));
            }
        }
        if fs::try_exists(self.record_path(&record.instance_id))
            .await
            .map_err(|e| ProviderError::io("create_instance", e))?
        {
            return Err(ProviderError::InstanceAlreadyExists(record.instance_id));
        }
        if let Some(key) = &record.dedup_key {
            let path = self.dedup_path(key);
            let mut claim = match fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(f) => f,
                // Claimed by an instance whose record was never written (crash); reclaim
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => fs::OpenOptions::new()
                    .write(true)
                    .truncate(true)
                    .open(&path)
                    .await
                    .map_err(|e| ProviderError::io("create_instance", e))?,
                Err(e) => return Err(ProviderError::io("create_instance", e)),
            };
            claim
                .write_all(record.instance_id.as_bytes())
                .await
                .map_err(|e| ProviderError::io("create_instance", e))?;
            claim
                .sync_all()
                .await
                .map_err(|e| ProviderError::io("create_instance", e))?;
        }
        self.write_record(&record).await?;
        Ok(CreateOutcome::Created)
    }

    async fn read_instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        self.load_record(instance).await
    }

    async fn read(&self, instance: &str) -> Result<History, ProviderError> {
        let _g = self.lock.lock().await;
        let _file = self.file_lock(self.instance_lock_path(instance), false).await?;
        let (events, _) = self.load_history(instance).await?;
        Ok(History::new(events))
    }

    async fn append(&self, instance: &str, expected_version: u64, events: Vec<Event>) -> Result<u64, ProviderError> {
        let _g = self.lock.lock().await;
        let _file = self.file_lock(self.instance_lock_path(instance), true).await?;
        let (existing, clean_tail) = self.load_history(instance).await?;
        let accepted = prepare_append(instance, &existing, expected_version, events)?;
        let new_version = (existing.len() + accepted.len()) as u64;
        if accepted.is_empty() {
            return Ok(new_version);
        }

        let mut line = String::new();
        if !clean_tail {
            line.push('\n');
        }
        line.push_str(
            &serde_json::to_string(&accepted).map_err(|e| ProviderError::permanent("append", e.to_string()))?,
        );
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(self.history_path(instance))
            .await
            .map_err(|e| ProviderError::io("append", e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| ProviderError::io("append", e))?;
        file.sync_data().await.map_err(|e| ProviderError::io("append", e))?;
        Ok(new_version)
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let mut out = Vec::new();
        let mut rd = match fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(ProviderError::io("list_instances", e)),
        };
        while let Some(entry) = rd
            .next_entry()
            .await
            .map_err(|e| ProviderError::io("list_instances", e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if fs::try_exists(entry.path().join("instance.json")).await.unwrap_or(false) {
                out.push(name);
            }
        }
        out.sort();
        Ok(out)
    }

    async fn purge_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let _g = self.lock.lock().await;
        let _create = self.file_lock(self.create_lock_path(), true).await?;
        let _file = self.file_lock(self.instance_lock_path(instance), true).await?;
        let record = self
            .load_record(instance)
            .await?
            .ok_or_else(|| ProviderError::InstanceNotFound(instance.to_string()))?;
        if let Some(key) = &record.dedup_key {
            let _ = fs::remove_file(self.dedup_path(key)).await;
        }
        fs::remove_dir_all(self.inst_root(instance))
            .await
            .map_err(|e| ProviderError::io("purge_instance", e))
    }
}
