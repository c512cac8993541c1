use std::path::{Path, PathBuf};

use serde_json::json;

use crate::error::{OrchestratorError, Result};
use crate::models::RunConfig;

pub const RUN_CONFIG_FILE: &str = "evolution-run-config.jsonc";
pub const HYPERPARAMETERS_FILE: &str = "evolutionary-hyperparameters.jsonc";
pub const WRAPPER_CONFIG_FILE: &str = "evolution-runs-config.jsonc";

/// Paths of the three working-config files of one run.
#[derive(Debug, Clone)]
pub struct WorkingConfigPaths {
    pub run_config: PathBuf,
    pub hyperparameters: PathBuf,
    pub wrapper: PathBuf,
}

/// Write the run's working-config files: the endpoint-injected compute
/// config, the hyperparameters verbatim from the template, and the wrapper
/// the compute process reads on start. Comments are permitted in template
/// input; the output here is always plain pretty-printed JSON.
pub async fn write_working_configs(
    working_dir: &Path,
    run_id: &str,
    label: &str,
    injected_config: &RunConfig,
    hyperparameters: &serde_json::Value,
) -> Result<WorkingConfigPaths> {
    tokio::fs::create_dir_all(working_dir)
        .await
        .map_err(|e| OrchestratorError::State(format!("failed to create working dir: {e}")))?;

    let paths = WorkingConfigPaths {
        run_config: working_dir.join(RUN_CONFIG_FILE),
        hyperparameters: working_dir.join(HYPERPARAMETERS_FILE),
        wrapper: working_dir.join(WRAPPER_CONFIG_FILE),
    };

    let config_json = serde_json::to_string_pretty(injected_config)?;
    tokio::fs::write(&paths.run_config, config_json).await?;

    let hyper_json = serde_json::to_string_pretty(hyperparameters)?;
    tokio::fs::write(&paths.hyperparameters, hyper_json).await?;

    let wrapper = json!({
        "baseEvolutionRunConfigFile": paths.run_config,
        "baseEvolutionaryHyperparametersFile": paths.hyperparameters,
        "evoRuns": [{
            "label": label,
            "iterations": [{ "id": format!("{run_id}_{label}") }],
        }],
        "currentEvolutionRunIndex": 0,
        "currentEvolutionRunIteration": 0,
    });
    tokio::fs::write(&paths.wrapper, serde_json::to_string_pretty(&wrapper)?).await?;

    Ok(paths)
}

/// Re-derive the run's total generations from the on-disk working config.
/// Persisted values are never trusted; stale ones self-heal here.
pub async fn total_generations_from_disk(run_config_path: &Path) -> Option<u64> {
    let text = tokio::fs::read_to_string(run_config_path).await.ok()?;
    let config: RunConfig = serde_json::from_str(&text).ok()?;
    config.total_generations()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_all_three_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            number_of_evals: Some(640),
            batch_size: Some(32),
            ..Default::default()
        };
        let paths = write_working_configs(
            dir.path(),
            "01J0TEST",
            "single-map",
            &config,
            &serde_json::json!({"mutationRate": 0.1}),
        )
        .await
        .unwrap();

        assert!(paths.run_config.exists());
        assert!(paths.hyperparameters.exists());
        assert!(paths.wrapper.exists());

        let wrapper: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&paths.wrapper).unwrap()).unwrap();
        assert_eq!(
            wrapper["evoRuns"][0]["iterations"][0]["id"],
            "01J0TEST_single-map"
        );
        assert_eq!(wrapper["currentEvolutionRunIndex"], 0);
    }

    #[tokio::test]
    async fn total_generations_rederives_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            number_of_evals: Some(640),
            batch_size: Some(32),
            ..Default::default()
        };
        let paths = write_working_configs(
            dir.path(),
            "01J0TEST",
            "single-map",
            &config,
            &serde_json::Value::Null,
        )
        .await
        .unwrap();

        assert_eq!(total_generations_from_disk(&paths.run_config).await, Some(20));
        assert_eq!(
            total_generations_from_disk(&dir.path().join("missing.jsonc")).await,
            None
        );
    }
}
