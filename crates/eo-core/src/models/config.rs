use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::template::ServiceKind;

/// Global sync configuration, sourced from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Delay before the first periodic tick, so the compute process has time
    /// to create its output files.
    pub first_tick_delay_ms: u64,
    pub sync_on_pause: bool,
    pub sync_on_stop: bool,
    pub db_sync_enabled: bool,
    pub file_sync_enabled: bool,
    /// Remote host for the binary database sync tool (`user@host`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub central_host: Option<String>,
    /// Base path on the remote host under which per-run directories live.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub central_base_path: Option<String>,
    /// Base URL of the central analysis-sync service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// External incremental-binary-sync executable.
    pub sync_tool: String,
    pub retry_max_attempts: u32,
    pub db_file_timeout_secs: u64,
    pub http_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 5 * 60 * 1000,
            first_tick_delay_ms: 30 * 1000,
            sync_on_pause: true,
            sync_on_stop: true,
            db_sync_enabled: true,
            file_sync_enabled: true,
            central_host: None,
            central_base_path: None,
            service_url: None,
            api_key: None,
            sync_tool: "rdiff-backup".into(),
            retry_max_attempts: 5,
            db_file_timeout_secs: 300,
            http_timeout_secs: 30,
        }
    }
}

impl SyncSettings {
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(v) = env_bool("EVORUN_SYNC_ENABLED") {
            settings.enabled = v;
        }
        if let Some(v) = env_parse::<u64>("EVORUN_SYNC_INTERVAL_MS") {
            settings.interval_ms = v;
        }
        if let Some(v) = env_bool("EVORUN_SYNC_ON_PAUSE") {
            settings.sync_on_pause = v;
        }
        if let Some(v) = env_bool("EVORUN_SYNC_ON_STOP") {
            settings.sync_on_stop = v;
        }
        if let Some(v) = env_bool("EVORUN_SYNC_DB_ENABLED") {
            settings.db_sync_enabled = v;
        }
        if let Some(v) = env_bool("EVORUN_SYNC_FILES_ENABLED") {
            settings.file_sync_enabled = v;
        }
        settings.central_host = std::env::var("EVORUN_SYNC_CENTRAL_HOST").ok();
        settings.central_base_path = std::env::var("EVORUN_SYNC_CENTRAL_PATH").ok();
        settings.service_url = std::env::var("EVORUN_SYNC_SERVICE_URL").ok();
        settings.api_key = std::env::var("EVORUN_SYNC_API_KEY").ok();
        if let Ok(v) = std::env::var("EVORUN_SYNC_TOOL") {
            settings.sync_tool = v;
        }
        if let Some(v) = env_parse::<u32>("EVORUN_SYNC_RETRY_MAX_ATTEMPTS") {
            settings.retry_max_attempts = v;
        }
        settings
    }
}

/// Paths and interpreters the orchestrator needs to spawn processes.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Root for per-run working directories and global persistent state.
    pub working_root: PathBuf,
    /// Root for per-run rolling log files.
    pub logs_root: PathBuf,
    /// Root under which the auxiliary service scripts live.
    pub services_root: PathBuf,
    /// Entry script of the compute CLI.
    pub cli_script_path: PathBuf,
    pub node_interpreter: String,
    pub python_interpreter: String,
    /// Model paths substituted into service arguments, keyed by token name.
    pub model_paths: HashMap<String, String>,
    pub readiness_timeout_secs: u64,
    pub readiness_poll_secs: u64,
    pub sync: SyncSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            working_root: PathBuf::from("working"),
            logs_root: PathBuf::from("logs"),
            services_root: PathBuf::from("services"),
            cli_script_path: PathBuf::from("kromosynth-cli/cli-app/kromosynth.js"),
            node_interpreter: "node".into(),
            python_interpreter: "python3".into(),
            model_paths: HashMap::new(),
            readiness_timeout_secs: 30,
            readiness_poll_secs: 2,
            sync: SyncSettings::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("EVORUN_WORKING_ROOT") {
            config.working_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("EVORUN_LOGS_ROOT") {
            config.logs_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("EVORUN_SERVICES_ROOT") {
            config.services_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("EVORUN_CLI_SCRIPT") {
            config.cli_script_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("EVORUN_NODE_INTERPRETER") {
            config.node_interpreter = v;
        }
        if let Ok(v) = std::env::var("EVORUN_PYTHON_INTERPRETER") {
            config.python_interpreter = v;
        }
        // Comma-separated name=path pairs.
        if let Ok(v) = std::env::var("EVORUN_MODEL_PATHS") {
            for pair in v.split(',') {
                if let Some((name, path)) = pair.split_once('=') {
                    config
                        .model_paths
                        .insert(name.trim().to_string(), path.trim().to_string());
                }
            }
        }
        config.sync = SyncSettings::from_env();
        config
    }

    pub fn run_working_dir(&self, run_id: &str) -> PathBuf {
        self.working_root.join(run_id)
    }

    pub fn run_state_path(&self) -> PathBuf {
        self.working_root.join("run-state.json")
    }

    pub fn sync_state_path(&self) -> PathBuf {
        self.working_root.join("sync-state.json")
    }

    pub fn auto_run_config_path(&self) -> PathBuf {
        self.working_root.join("auto-run-config.json")
    }

    pub fn global_defaults_path(&self) -> PathBuf {
        self.working_root.join("global-defaults.json")
    }

    /// Script and interpreter for one service kind. Variation and rendering
    /// are node services; feature, projection, quality and archive workers
    /// run under python.
    pub fn service_script(&self, kind: ServiceKind) -> (String, PathBuf) {
        let (interpreter, rel) = match kind {
            ServiceKind::Variation => (&self.node_interpreter, "variation/index.js"),
            ServiceKind::Render => (&self.node_interpreter, "render/index.js"),
            ServiceKind::FeatureClap => (&self.python_interpreter, "features/clap_server.py"),
            ServiceKind::GenericFeatures => (&self.python_interpreter, "features/server.py"),
            ServiceKind::RefFeatures => {
                (&self.python_interpreter, "features/reference_server.py")
            }
            ServiceKind::QdhfProjection => {
                (&self.python_interpreter, "projection/qdhf_server.py")
            }
            ServiceKind::UmapProjection => {
                (&self.python_interpreter, "projection/umap_server.py")
            }
            ServiceKind::QualityMusicality => {
                (&self.python_interpreter, "quality/musicality_server.py")
            }
            ServiceKind::Pyribs => (&self.python_interpreter, "archive/pyribs_server.py"),
        };
        (interpreter.clone(), self.services_root.join(rel))
    }
}

/// Per-run start options. Layered lowest-to-highest:
/// `global-defaults.json` file, environment variables, explicit request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RunOptions {
    pub ecosystem_variant: Option<String>,
    pub auto_scheduled: Option<bool>,
    /// Memory ceiling for the compute process, in MB.
    pub compute_max_memory_mb: Option<u64>,
}

impl RunOptions {
    /// Overlay `higher` on top of `self`: set fields in `higher` win.
    pub fn overlaid(mut self, higher: &RunOptions) -> RunOptions {
        if higher.ecosystem_variant.is_some() {
            self.ecosystem_variant = higher.ecosystem_variant.clone();
        }
        if higher.auto_scheduled.is_some() {
            self.auto_scheduled = higher.auto_scheduled;
        }
        if higher.compute_max_memory_mb.is_some() {
            self.compute_max_memory_mb = higher.compute_max_memory_mb;
        }
        self
    }

    pub fn from_env() -> RunOptions {
        RunOptions {
            ecosystem_variant: std::env::var("EVORUN_ECOSYSTEM_VARIANT").ok(),
            auto_scheduled: None,
            compute_max_memory_mb: env_parse::<u64>("EVORUN_COMPUTE_MAX_MEMORY_MB"),
        }
    }

    /// Read `global-defaults.json`; a missing file yields empty defaults.
    pub fn from_defaults_file(path: &Path) -> RunOptions {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => RunOptions::default(),
        }
    }

    /// Full precedence chain: file, then environment, then the request.
    pub fn layered(defaults_path: &Path, request: &RunOptions) -> RunOptions {
        RunOptions::from_defaults_file(defaults_path)
            .overlaid(&RunOptions::from_env())
            .overlaid(request)
    }
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_options_win_over_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let defaults_path = dir.path().join("global-defaults.json");
        std::fs::write(
            &defaults_path,
            r#"{"ecosystemVariant": "default", "computeMaxMemoryMb": 4096}"#,
        )
        .unwrap();

        let request = RunOptions {
            ecosystem_variant: Some("3d".into()),
            ..Default::default()
        };
        let merged = RunOptions::layered(&defaults_path, &request);
        assert_eq!(merged.ecosystem_variant.as_deref(), Some("3d"));
        assert_eq!(merged.compute_max_memory_mb, Some(4096));
    }

    #[test]
    fn missing_defaults_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let merged =
            RunOptions::layered(&dir.path().join("absent.json"), &RunOptions::default());
        assert_eq!(merged, RunOptions::default());
    }

    #[test]
    fn state_paths_live_under_working_root() {
        let config = OrchestratorConfig {
            working_root: PathBuf::from("/var/evorun/working"),
            ..Default::default()
        };
        assert_eq!(
            config.run_state_path(),
            PathBuf::from("/var/evorun/working/run-state.json")
        );
        assert_eq!(
            config.run_working_dir("01J0"),
            PathBuf::from("/var/evorun/working/01J0")
        );
    }
}
