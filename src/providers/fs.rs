use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tokio::{fs, io::AsyncWriteExt};

use super::{DEFAULT_HISTORY_CAP, HistoryStore, ProviderError, validate_append, validate_closing, validate_started};
use crate::Event;

const CUSTOM_STATUS_FILE: &str = "custom_status.json";

/// Filesystem store: one directory per instance, one JSONL file per execution
/// (`<root>/<instance>/<execution_id>.jsonl`).
pub struct FsHistoryStore {
    root: PathBuf,
    cap: usize,
    // serializes read-validate-write sequences within this process
    write_lock: Mutex<()>,
}

impl FsHistoryStore {
    /// Store rooted at `root`. With `reset_on_create` any existing data is removed first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        Self::new_with_cap(root, reset_on_create, DEFAULT_HISTORY_CAP)
    }

    pub fn new_with_cap(root: impl AsRef<Path>, reset_on_create: bool, cap: usize) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        // best-effort; every write path re-creates directories it needs
        let _ = std::fs::create_dir_all(&path);
        Self {
            root: path,
            cap,
            write_lock: Mutex::new(()),
        }
    }

    fn inst_root(&self, instance: &str) -> PathBuf {
        self.root.join(instance)
    }

    fn exec_path(&self, instance: &str, execution_id: u64) -> PathBuf {
        self.inst_root(instance).join(format!("{execution_id}.jsonl"))
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<Event>, ProviderError> {
        let data = match fs::read_to_string(path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProviderError::io("read", e)),
        };
        let mut out = Vec::new();
        for (n, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let ev = serde_json::from_str::<Event>(line).map_err(|e| {
                ProviderError::permanent("read", format!("{}:{}: {e}", path.display(), n + 1))
            })?;
            out.push(ev);
        }
        Ok(out)
    }

    async fn write_lines(&self, path: &Path, events: &[Event], create_new: bool) -> Result<(), ProviderError> {
        let mut buf = String::new();
        for ev in events {
            let line = serde_json::to_string(ev).map_err(|e| ProviderError::permanent("append", e.to_string()))?;
            buf.push_str(&line);
            buf.push('\n');
        }
        let mut opts = fs::OpenOptions::new();
        if create_new {
            opts.create_new(true).write(true);
        } else {
            opts.append(true);
        }
        let mut file = opts.open(path).await.map_err(|e| ProviderError::io("append", e))?;
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| ProviderError::io("append", e))?;
        file.flush().await.map_err(|e| ProviderError::io("append", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn create_instance(&self, instance: &str, started: Event) -> Result<(), ProviderError> {
        validate_started(&started)?;
        let _g = self.write_lock.lock().await;
        let inst_dir = self.inst_root(instance);
        if fs::try_exists(&inst_dir)
            .await
            .map_err(|e| ProviderError::io("create_instance", e))?
        {
            return Err(ProviderError::conflict(
                "create_instance",
                format!("instance already exists: {instance}"),
            ));
        }
        fs::create_dir_all(&inst_dir)
            .await
            .map_err(|e| ProviderError::io("create_instance", e))?;
        self.write_lines(&self.exec_path(instance, 1), std::slice::from_ref(&started), true)
            .await
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        match self.latest_execution_id(instance).await {
            Some(latest) => self.read_execution(instance, latest).await,
            None => Ok(Vec::new()),
        }
    }

    async fn read_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError> {
        self.read_file(&self.exec_path(instance, execution_id)).await
    }

    async fn append(&self, instance: &str, execution_id: u64, events: Vec<Event>) -> Result<(), ProviderError> {
        let _g = self.write_lock.lock().await;
        let path = self.exec_path(instance, execution_id);
        let existing = self.read_file(&path).await?;
        validate_append(&existing, &events, self.cap)?;
        self.write_lines(&path, &events, false).await
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let mut max_eid = 0u64;
        if let Ok(mut rd) = fs::read_dir(self.inst_root(instance)).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                if let Some(name) = ent.file_name().to_str()
                    && let Some(stem) = name.strip_suffix(".jsonl")
                    && let Ok(id) = stem.parse::<u64>()
                {
                    max_eid = max_eid.max(id);
                }
            }
        }
        if max_eid == 0 { None } else { Some(max_eid) }
    }

    async fn list_executions(&self, instance: &str) -> Vec<u64> {
        match self.latest_execution_id(instance).await {
            Some(lat) => (1..=lat).collect(),
            None => Vec::new(),
        }
    }

    async fn continue_as_new(
        &self,
        instance: &str,
        execution_id: u64,
        closing: Event,
        started: Event,
    ) -> Result<u64, ProviderError> {
        validate_started(&started)?;
        let _g = self.write_lock.lock().await;
        if self.latest_execution_id(instance).await != Some(execution_id) {
            return Err(ProviderError::conflict(
                "continue_as_new",
                format!("execution {execution_id} is not the latest of {instance}"),
            ));
        }
        let current = self.exec_path(instance, execution_id);
        let existing = self.read_file(&current).await?;
        validate_closing(&existing, &closing, self.cap)?;

        // the next execution is in place before the current one closes; reads
        // always follow the latest execution, so an interrupted close is harmless
        let next = execution_id + 1;
        let staged = self.inst_root(instance).join(format!("{next}.jsonl.tmp"));
        let _ = fs::remove_file(&staged).await;
        self.write_lines(&staged, std::slice::from_ref(&started), true).await?;
        fs::rename(&staged, self.exec_path(instance, next))
            .await
            .map_err(|e| ProviderError::io("continue_as_new", e))?;
        self.write_lines(&current, std::slice::from_ref(&closing), false).await?;
        // custom status belongs to the execution that set it
        let _ = fs::remove_file(self.inst_root(instance).join(CUSTOM_STATUS_FILE)).await;
        Ok(next)
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(mut rd) = fs::read_dir(&self.root).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                let is_dir = ent.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                if is_dir && let Some(name) = ent.file_name().to_str() {
                    out.push(name.to_string());
                }
            }
        }
        out.sort();
        out
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let _g = self.write_lock.lock().await;
        let inst_dir = self.inst_root(instance);
        if !fs::try_exists(&inst_dir)
            .await
            .map_err(|e| ProviderError::io("remove_instance", e))?
        {
            return Err(ProviderError::permanent(
                "remove_instance",
                format!("instance not found: {instance}"),
            ));
        }
        fs::remove_dir_all(&inst_dir)
            .await
            .map_err(|e| ProviderError::io("remove_instance", e))
    }

    async fn set_custom_status(&self, instance: &str, status: Option<String>) -> Result<(), ProviderError> {
        let inst_dir = self.inst_root(instance);
        if !fs::try_exists(&inst_dir)
            .await
            .map_err(|e| ProviderError::io("set_custom_status", e))?
        {
            return Err(ProviderError::permanent(
                "set_custom_status",
                format!("instance not found: {instance}"),
            ));
        }
        let path = inst_dir.join(CUSTOM_STATUS_FILE);
        match status {
            Some(s) => {
                let body =
                    serde_json::to_string(&s).map_err(|e| ProviderError::permanent("set_custom_status", e.to_string()))?;
                fs::write(&path, body)
                    .await
                    .map_err(|e| ProviderError::io("set_custom_status", e))
            }
            None => {
                let _ = fs::remove_file(&path).await;
                Ok(())
            }
        }
    }

    async fn custom_status(&self, instance: &str) -> Option<String> {
        let data = fs::read_to_string(self.inst_root(instance).join(CUSTOM_STATUS_FILE))
            .await
            .ok()?;
        serde_json::from_str(&data).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::EventKind;

    fn started(input: &str) -> Event {
        Event::new(
            1,
            10,
            EventKind::OrchestratorStarted {
                name: "Eternal".into(),
                version: "1.0.0".into(),
                input: input.into(),
                parent: None,
            },
        )
    }

    #[tokio::test]
    async fn executions_roll_over_on_continue_as_new() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(dir.path(), true);
        store.create_instance("i1", started("0")).await.unwrap();
        store
            .append("i1", 1, vec![Event::new(2, 11, EventKind::TimerCreated { fire_at_ms: 20 })])
            .await
            .unwrap();
        store.set_custom_status("i1", Some("waiting".into())).await.unwrap();

        let closing = Event::new(3, 12, EventKind::ContinuedAsNew { input: "1".into() });
        let next = store.continue_as_new("i1", 1, closing, started("1")).await.unwrap();
        assert_eq!(next, 2);
        assert_eq!(store.list_executions("i1").await, vec![1, 2]);
        assert_eq!(store.read("i1").await.unwrap(), vec![started("1")]);
        assert_eq!(store.read_execution("i1", 1).await.unwrap().len(), 3);
        assert_eq!(store.custom_status("i1").await, None);

        // the closed execution rejects further completions
        let late = Event::new(4, 13, EventKind::TimerFired { source_event_id: 2, fire_at_ms: 20 });
        assert!(store.append("i1", 1, vec![late]).await.is_err());
    }

    #[tokio::test]
    async fn next_execution_wins_when_close_was_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(dir.path(), true);
        store.create_instance("i2", started("0")).await.unwrap();
        // the next execution landed but the closing event of the first did not
        let line = serde_json::to_string(&started("1")).unwrap();
        std::fs::write(dir.path().join("i2").join("2.jsonl"), format!("{line}\n")).unwrap();

        assert_eq!(store.latest_execution_id("i2").await, Some(2));
        assert_eq!(store.read("i2").await.unwrap(), vec![started("1")]);
        store
            .append("i2", 2, vec![Event::new(2, 11, EventKind::TimerCreated { fire_at_ms: 30 })])
            .await
            .unwrap();
        let closing = Event::new(2, 12, EventKind::ContinuedAsNew { input: "1".into() });
        let err = store.continue_as_new("i2", 1, closing, started("1")).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn duplicate_create_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(dir.path(), false);
        store.create_instance("dup", started("a")).await.unwrap();
        let err = store.create_instance("dup", started("a")).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.list_instances().await, vec!["dup".to_string()]);
    }

    #[tokio::test]
    async fn custom_status_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsHistoryStore::new(dir.path(), false);
            store.create_instance("s", started("")).await.unwrap();
            store
                .set_custom_status("s", Some("step 2 of 3".into()))
                .await
                .unwrap();
        }
        let store = FsHistoryStore::new(dir.path(), false);
        assert_eq!(store.custom_status("s").await.as_deref(), Some("step 2 of 3"));
        store.remove_instance("s").await.unwrap();
        assert!(store.read("s").await.unwrap().is_empty());
    }
}
