use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The closed set of auxiliary service kinds a run may need.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ServiceKind {
    Variation,
    Render,
    FeatureClap,
    GenericFeatures,
    RefFeatures,
    QdhfProjection,
    UmapProjection,
    QualityMusicality,
    Pyribs,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 9] = [
        ServiceKind::Variation,
        ServiceKind::Render,
        ServiceKind::FeatureClap,
        ServiceKind::GenericFeatures,
        ServiceKind::RefFeatures,
        ServiceKind::QdhfProjection,
        ServiceKind::UmapProjection,
        ServiceKind::QualityMusicality,
        ServiceKind::Pyribs,
    ];

    /// The logical process-name stem; the run id is appended after `_`.
    pub fn process_stem(self) -> &'static str {
        match self {
            ServiceKind::Variation => "kromosynth-gRPC-variation",
            ServiceKind::Render => "kromosynth-render",
            ServiceKind::FeatureClap => "kromosynth-features-clap",
            ServiceKind::GenericFeatures => "kromosynth-features-generic",
            ServiceKind::RefFeatures => "kromosynth-features-ref",
            ServiceKind::QdhfProjection => "kromosynth-projection-qdhf",
            ServiceKind::UmapProjection => "kromosynth-projection-umap",
            ServiceKind::QualityMusicality => "kromosynth-quality-musicality",
            ServiceKind::Pyribs => "kromosynth-pyribs",
        }
    }

    /// Offset of this kind's first port inside a run's allocation.
    pub fn port_offset(self) -> u16 {
        match self {
            ServiceKind::Variation => 51,
            ServiceKind::Render => 61,
            ServiceKind::FeatureClap => 71,
            ServiceKind::GenericFeatures => 81,
            ServiceKind::RefFeatures => 91,
            ServiceKind::QdhfProjection => 101,
            ServiceKind::UmapProjection => 111,
            ServiceKind::QualityMusicality => 121,
            ServiceKind::Pyribs => 131,
        }
    }

    /// Minute offset for the staggered periodic-restart schedule.
    /// Stateful kinds return `None` and are never restarted on a schedule.
    pub fn restart_minute(self) -> Option<u32> {
        match self {
            ServiceKind::Variation => Some(10),
            ServiceKind::Render => Some(20),
            ServiceKind::FeatureClap => Some(30),
            ServiceKind::GenericFeatures => Some(40),
            ServiceKind::RefFeatures => Some(50),
            ServiceKind::QualityMusicality => Some(25),
            ServiceKind::QdhfProjection | ServiceKind::UmapProjection | ServiceKind::Pyribs => {
                None
            }
        }
    }

    /// Whether this kind holds state that cannot be reconstructed after a
    /// restart (trained models, in-memory archives).
    pub fn default_stateful(self) -> bool {
        matches!(
            self,
            ServiceKind::QdhfProjection | ServiceKind::UmapProjection | ServiceKind::Pyribs
        )
    }

    pub fn default_instances(self) -> u32 {
        match self {
            ServiceKind::Variation | ServiceKind::Render => 2,
            _ => 1,
        }
    }
}

/// How replicas of a service are laid out.
///
/// `Cluster` replicas share one logical server spread over contiguous ports
/// from the base; `Fork` replicas are fully independent processes (when
/// replicated they still take consecutive ports so each is addressable).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ExecMode {
    Cluster,
    Fork,
}

/// Declarative record of one auxiliary process inside an ecosystem variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    pub kind: ServiceKind,
    #[serde(default = "default_instances")]
    pub instances: u32,
    #[serde(default = "default_exec_mode")]
    pub exec_mode: ExecMode,
    /// Stateful services are never auto-restarted once running.
    #[serde(default)]
    pub stateful: bool,
    /// Memory ceiling in MB that triggers a restart. Stateless only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_memory_restart_mb: Option<u64>,
    /// Default base port; overridden by the run's allocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_port: Option<u16>,
    /// Minute offset of the staggered periodic-restart schedule, overriding
    /// the kind's default. Stateless only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_minute: Option<u32>,
}

fn default_instances() -> u32 {
    1
}

fn default_exec_mode() -> ExecMode {
    ExecMode::Fork
}

impl ServiceDefinition {
    pub fn for_kind(kind: ServiceKind) -> Self {
        Self {
            kind,
            instances: kind.default_instances(),
            exec_mode: if kind.default_instances() > 1 {
                ExecMode::Cluster
            } else {
                ExecMode::Fork
            },
            stateful: kind.default_stateful(),
            max_memory_restart_mb: if kind.default_stateful() {
                None
            } else {
                Some(2048)
            },
            base_port: None,
            restart_minute: None,
        }
    }
}

/// A named service-graph specialization of a template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcosystemVariant {
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
}

/// One classifier class configuration, scanned by the service graph resolver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_extraction_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_extraction_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub z_score_normalisation_reference_features_paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projection_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_endpoint: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classifier {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub class_configurations: Vec<ClassConfiguration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classification_dimensions: Vec<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmaMaeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The compute-run configuration: a semi-open map with a known set of
/// recognized fields. Everything unrecognized passes through `extra`
/// untouched and is written back unchanged into the working config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classifiers: Vec<Classifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cma_mae_config: Option<CmaMaeConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_evals: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_generations: Option<u64>,
    /// Per-kind port overrides applied on top of the allocation defaults.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub ports: HashMap<ServiceKind, u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gene_variation_servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gene_rendering_servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evaluation_feature_servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evaluation_projection_servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evaluation_quality_servers: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RunConfig {
    /// Canonical total-generations derivation: `ceil(numberOfEvals / batchSize)`,
    /// falling back to `maxGenerations` when either divisor field is absent.
    pub fn total_generations(&self) -> Option<u64> {
        match (self.number_of_evals, self.batch_size) {
            (Some(evals), Some(batch)) if batch > 0 => Some(evals.div_ceil(batch)),
            _ => self.max_generations,
        }
    }
}

/// A named, read-only configuration recipe. Templates live outside the core;
/// they arrive already parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub name: String,
    pub run_config: RunConfig,
    /// Evolutionary hyperparameters, written verbatim into the working dir.
    #[serde(default)]
    pub hyperparameters: serde_json::Value,
    #[serde(default)]
    pub ecosystem_variants: HashMap<String, EcosystemVariant>,
}

impl Template {
    pub fn variant(&self, name: &str) -> Option<&EcosystemVariant> {
        self.ecosystem_variants.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_generations_prefers_division() {
        let config = RunConfig {
            number_of_evals: Some(1000),
            batch_size: Some(32),
            max_generations: Some(5),
            ..Default::default()
        };
        assert_eq!(config.total_generations(), Some(32));
    }

    #[test]
    fn total_generations_falls_back_to_max() {
        let config = RunConfig {
            max_generations: Some(500),
            ..Default::default()
        };
        assert_eq!(config.total_generations(), Some(500));
    }

    #[test]
    fn total_generations_ignores_zero_batch() {
        let config = RunConfig {
            number_of_evals: Some(1000),
            batch_size: Some(0),
            max_generations: Some(7),
            ..Default::default()
        };
        assert_eq!(config.total_generations(), Some(7));
    }

    #[test]
    fn run_config_passthrough_round_trip() {
        let json = r#"{
            "numberOfEvals": 100,
            "batchSize": 10,
            "seedFavoured": true,
            "customWeights": [0.1, 0.9]
        }"#;
        let config: RunConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.number_of_evals, Some(100));
        assert_eq!(config.extra.get("seedFavoured"), Some(&serde_json::json!(true)));

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["customWeights"], serde_json::json!([0.1, 0.9]));
        assert_eq!(back["numberOfEvals"], serde_json::json!(100));
    }

    #[test]
    fn service_kind_serializes_camel_case() {
        let json = serde_json::to_string(&ServiceKind::QdhfProjection).unwrap();
        assert_eq!(json, "\"qdhfProjection\"");
        let kind: ServiceKind = serde_json::from_str("\"featureClap\"").unwrap();
        assert_eq!(kind, ServiceKind::FeatureClap);
    }

    #[test]
    fn stateful_kinds_have_no_restart_schedule() {
        for kind in ServiceKind::ALL {
            if kind.default_stateful() {
                assert!(kind.restart_minute().is_none());
            }
        }
    }
}
