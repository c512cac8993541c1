use std::collections::HashMap;

use crate::models::{
    EcosystemVariant, OrchestratorConfig, PortAllocation, RunConfig, ServiceDefinition,
    ServiceKind, SERVICE_NAME_SEPARATOR,
};

use super::supervisor::ProcessSpec;

/// Grid dimensions assumed when the config declares none.
const DEFAULT_DIMENSIONS: usize = 2;
const DEFAULT_DIMENSION_CELLS: u64 = 100;

/// One supervisor-ready spec tagged with the service kind it realizes.
#[derive(Debug)]
pub struct ResolvedService {
    pub kind: ServiceKind,
    pub spec: ProcessSpec,
}

/// The concrete service set derived for one run: supervisor-ready specs,
/// the WebSocket endpoints per kind, and the compute-run config with those
/// endpoints injected.
#[derive(Debug)]
pub struct ResolvedServices {
    pub services: Vec<ResolvedService>,
    pub service_urls: HashMap<ServiceKind, Vec<String>>,
    pub injected_config: RunConfig,
}

/// Scan the compute-run config and derive which service kinds it needs.
pub fn required_kinds(config: &RunConfig) -> Vec<ServiceKind> {
    let mut required = vec![ServiceKind::Variation, ServiceKind::Render];
    let mut add = |kind: ServiceKind, required: &mut Vec<ServiceKind>| {
        if !required.contains(&kind) {
            required.push(kind);
        }
    };

    for classifier in &config.classifiers {
        for class_config in &classifier.class_configurations {
            let feature_type = class_config.feature_extraction_type.as_deref().unwrap_or("");
            let feature_endpoint = class_config
                .feature_extraction_endpoint
                .as_deref()
                .unwrap_or("");
            if feature_type == "clap" {
                add(ServiceKind::FeatureClap, &mut required);
            }
            if feature_type == "vggish" || feature_endpoint.contains("/vggish") {
                add(ServiceKind::GenericFeatures, &mut required);
            }
            if !class_config
                .z_score_normalisation_reference_features_paths
                .is_empty()
                || feature_endpoint.contains("reference_embedding")
            {
                add(ServiceKind::RefFeatures, &mut required);
            }
            if let Some(projection) = class_config.projection_endpoint.as_deref() {
                if projection.contains("qdhf") {
                    add(ServiceKind::QdhfProjection, &mut required);
                }
                if projection.contains("umap")
                    || projection.contains("pca")
                    || projection.contains("quantised")
                {
                    add(ServiceKind::UmapProjection, &mut required);
                }
            }
            if let Some(quality) = class_config.quality_endpoint.as_deref() {
                if quality.contains("musicality") {
                    add(ServiceKind::QualityMusicality, &mut required);
                }
            }
        }
    }

    if config.cma_mae_config.as_ref().is_some_and(|c| c.enabled) {
        add(ServiceKind::Pyribs, &mut required);
    }

    required
}

/// Behaviour-space dimensions: the count of numeric entries of
/// `classifiers[0].classificationDimensions`, whose first entry gives the
/// per-dimension cell count.
fn dimensions(config: &RunConfig) -> (usize, u64) {
    let Some(classifier) = config.classifiers.first() else {
        return (DEFAULT_DIMENSIONS, DEFAULT_DIMENSION_CELLS);
    };
    let numeric: Vec<u64> = classifier
        .classification_dimensions
        .iter()
        .filter_map(|v| v.as_u64())
        .collect();
    if numeric.is_empty() {
        (DEFAULT_DIMENSIONS, DEFAULT_DIMENSION_CELLS)
    } else {
        (numeric.len(), numeric[0])
    }
}

fn arg_template(kind: ServiceKind) -> &'static [&'static str] {
    match kind {
        ServiceKind::Variation => &["--port", "{port}"],
        ServiceKind::Render => &["--port", "{port}"],
        ServiceKind::FeatureClap => &["--host", "127.0.0.1", "--port", "{port}", "--model-path", "{modelPath}"],
        ServiceKind::GenericFeatures => &["--host", "127.0.0.1", "--port", "{port}", "--models-path", "{modelPath}"],
        ServiceKind::RefFeatures => &["--host", "127.0.0.1", "--port", "{port}"],
        ServiceKind::QdhfProjection => &["--port", "{port}", "--dimensions", "{dimensions}"],
        ServiceKind::UmapProjection => &["--port", "{port}", "--dimensions", "{dimensions}", "--dimension-cells", "{dimensionCells}"],
        ServiceKind::QualityMusicality => &["--port", "{port}"],
        ServiceKind::Pyribs => &["--port", "{port}", "--dimensions", "{dimensions}", "--dimension-cells", "{dimensionCells}"],
    }
}

/// Instance count for a kind: the config's own server lists win, then the
/// variant's definition.
fn instance_count(kind: ServiceKind, config: &RunConfig, definition: &ServiceDefinition) -> u32 {
    let listed = match kind {
        ServiceKind::Variation => config.gene_variation_servers.len(),
        ServiceKind::Render => config.gene_rendering_servers.len(),
        ServiceKind::FeatureClap | ServiceKind::GenericFeatures | ServiceKind::RefFeatures => {
            config.evaluation_feature_servers.len()
        }
        ServiceKind::QdhfProjection | ServiceKind::UmapProjection => {
            config.evaluation_projection_servers.len()
        }
        ServiceKind::QualityMusicality => config.evaluation_quality_servers.len(),
        ServiceKind::Pyribs => 0,
    };
    if listed > 0 {
        listed as u32
    } else {
        definition.instances.max(1)
    }
}

/// Resolve the service graph for one run into concrete supervisor specs.
///
/// Port bases come from the config's ports table when present, else from the
/// run's allocation; argument templates are patched with the port,
/// dimensions, and model paths.
pub fn resolve(
    run_id: &str,
    config: &RunConfig,
    variant: &EcosystemVariant,
    allocation: &PortAllocation,
    orchestrator: &OrchestratorConfig,
) -> ResolvedServices {
    let required = required_kinds(config);
    let (dims, dim_cells) = dimensions(config);

    let mut services = Vec::new();
    let mut service_urls: HashMap<ServiceKind, Vec<String>> = HashMap::new();

    for kind in required {
        let definition = variant
            .services
            .iter()
            .find(|d| d.kind == kind)
            .cloned()
            .unwrap_or_else(|| ServiceDefinition::for_kind(kind));

        let base_port = config
            .ports
            .get(&kind)
            .copied()
            .unwrap_or_else(|| allocation.port_for(kind, 0));
        let instances = instance_count(kind, config, &definition);

        let urls: Vec<String> = (0..instances)
            .map(|i| format!("ws://127.0.0.1:{}", base_port + i as u16))
            .collect();
        service_urls.insert(kind, urls);

        let name = format!("{}{}{}", kind.process_stem(), SERVICE_NAME_SEPARATOR, run_id);
        let (interpreter, script) = orchestrator.service_script(kind);
        let model_path = orchestrator
            .model_paths
            .get(kind.process_stem())
            .cloned()
            .unwrap_or_default();

        let mut spec = ProcessSpec::new(name.clone(), script, orchestrator.services_root.clone());
        spec.interpreter = Some(interpreter);
        spec.instances = instances;
        spec.exec_mode = definition.exec_mode;

        // Replicas occupy consecutive ports from the base, so any replicated
        // service takes its port via the PORT variable, which the supervisor
        // offsets per instance. Single instances keep the plain --port arg.
        let replicated = instances > 1;
        let mut args = Vec::new();
        let mut skip_next = false;
        for token in arg_template(kind) {
            if skip_next {
                skip_next = false;
                continue;
            }
            if replicated && *token == "--port" {
                skip_next = true;
                continue;
            }
            args.push(
                token
                    .replace("{port}", &base_port.to_string())
                    .replace("{dimensions}", &dims.to_string())
                    .replace("{dimensionCells}", &dim_cells.to_string())
                    .replace("{modelPath}", &model_path),
            );
        }
        spec.args = args;
        if replicated {
            spec.env.push(("PORT".into(), base_port.to_string()));
        }

        if definition.stateful {
            // Stateful services are never auto-restarted once running.
            spec.autorestart = false;
            spec.max_memory_restart_mb = None;
            spec.restart_cron = None;
        } else {
            spec.autorestart = true;
            spec.max_memory_restart_mb = definition.max_memory_restart_mb;
            spec.restart_cron = definition
                .restart_minute
                .or_else(|| kind.restart_minute())
                .map(|minute| format!("{minute} */2 * * *"));
        }

        spec.out_log = Some(orchestrator.logs_root.join(format!("{name}.out.log")));
        spec.err_log = Some(orchestrator.logs_root.join(format!("{name}.err.log")));

        services.push(ResolvedService { kind, spec });
    }

    let injected_config = inject_endpoints(config, &service_urls);

    ResolvedServices {
        services,
        service_urls,
        injected_config,
    }
}

/// Substitute the resolved WebSocket endpoints into the recognized
/// server-list fields of the compute-run config. Unrecognized fields pass
/// through untouched.
pub fn inject_endpoints(
    config: &RunConfig,
    service_urls: &HashMap<ServiceKind, Vec<String>>,
) -> RunConfig {
    let mut injected = config.clone();
    let urls_of = |kind: ServiceKind| service_urls.get(&kind).cloned().unwrap_or_default();

    injected.gene_variation_servers = urls_of(ServiceKind::Variation);
    injected.gene_rendering_servers = urls_of(ServiceKind::Render);

    let mut feature_urls = urls_of(ServiceKind::FeatureClap);
    feature_urls.extend(urls_of(ServiceKind::GenericFeatures));
    feature_urls.extend(urls_of(ServiceKind::RefFeatures));
    injected.evaluation_feature_servers = feature_urls;

    let mut projection_urls = urls_of(ServiceKind::QdhfProjection);
    projection_urls.extend(urls_of(ServiceKind::UmapProjection));
    injected.evaluation_projection_servers = projection_urls;

    injected.evaluation_quality_servers = urls_of(ServiceKind::QualityMusicality);

    injected
}
