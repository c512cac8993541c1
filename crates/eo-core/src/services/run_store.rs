use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::error::{OrchestratorError, Result};
use crate::models::Run;

/// Atomically persist a serializable value: write a sibling tmp file, fsync,
/// then rename over the target.
pub(crate) async fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| OrchestratorError::State(format!("failed to create state dir: {e}")))?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| OrchestratorError::State(format!("failed to create tmp file: {e}")))?;
        tokio::io::AsyncWriteExt::write_all(&mut file, json.as_bytes())
            .await
            .map_err(|e| OrchestratorError::State(format!("failed to write state: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| OrchestratorError::State(format!("failed to fsync state: {e}")))?;
    }
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| OrchestratorError::State(format!("failed to rename state file: {e}")))?;
    Ok(())
}

pub(crate) async fn read_json_map<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<HashMap<String, T>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| OrchestratorError::State(format!("failed to read state file: {e}")))?;
    Ok(serde_json::from_str(&json)?)
}

/// Durable key-value file of serialized runs, keyed by run id. Writes are
/// serialized through an internal lock so concurrent transitions cannot
/// interleave partial states.
pub struct RunStateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl RunStateStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> Result<HashMap<String, Run>> {
        read_json_map(&self.path).await
    }

    pub async fn save(&self, runs: &HashMap<String, Run>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        atomic_write_json(&self.path, runs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Run, RunStatus};

    fn test_run(id: &str) -> Run {
        let mut run = Run::new(
            id.to_string(),
            "template-a".into(),
            Some("default".into()),
            PathBuf::from("/working").join(id),
        );
        run.status = RunStatus::Running;
        run.pause_count = 2;
        run.total_active_millis = 123456;
        run.progress.generation = Some(17);
        run.progress.coverage = Some(0.42);
        run
    }

    #[tokio::test]
    async fn round_trip_reproduces_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStateStore::new(dir.path().join("run-state.json"));

        let mut runs = HashMap::new();
        runs.insert("01J0A".to_string(), test_run("01J0A"));
        store.save(&runs).await.unwrap();

        let loaded = store.load().await.unwrap();
        let run = &loaded["01J0A"];
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.pause_count, 2);
        assert_eq!(run.total_active_millis, 123456);
        assert_eq!(run.progress.generation, Some(17));
        assert_eq!(run.progress.coverage, Some(0.42));
        assert_eq!(run.template_name, "template-a");
    }

    #[tokio::test]
    async fn load_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStateStore::new(dir.path().join("run-state.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_leaves_no_tmp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run-state.json");
        let store = RunStateStore::new(path.clone());
        store.save(&HashMap::new()).await.unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn state_file_uses_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run-state.json");
        let store = RunStateStore::new(path.clone());

        let mut runs = HashMap::new();
        runs.insert("01J0A".to_string(), test_run("01J0A"));
        store.save(&runs).await.unwrap();

        let json = std::fs::read_to_string(&path).unwrap();
        assert!(json.contains("\"templateName\""));
        assert!(json.contains("\"pauseCount\""));
        assert!(!json.contains("\"template_name\""));
    }
}
