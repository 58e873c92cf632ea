//! Pipeline configuration: the JSON document `flowtap run` loads, and the
//! feature-graph builder that turns its `features` list into a
//! [`flowtap_engine::GraphFactory`].

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use flowtap_common::{FlowError, FlowResult};
use flowtap_engine::table::TableConfig;
use flowtap_engine::GraphFactory;
use flowtap_features::builtins::Get;
use flowtap_features::graph::FeatureNode;
use flowtap_features::registry::{self, Arity};
use flowtap_features::FeatureGraph;
use flowtap_io::KeyField;

/// One entry in a configuration's `features` list: a registered feature
/// name plus the ids (positions in the same list) of any earlier entries
/// that feed it. Raw-packet features take no inputs; unary aggregators take
/// exactly one; `and`/`or` take one or more; `get` takes one (its index is
/// given separately, since the registry's arg-type pattern for `get` is
/// constant-only rather than another graph node).
#[derive(Debug, Clone, Deserialize)]
pub struct FeatureExpr {
    pub feature: String,
    #[serde(default)]
    pub inputs: Vec<usize>,
    #[serde(default)]
    pub index: Option<u64>,
}

/// The JSON-shaped document described in spec.md section 6.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub features: Vec<FeatureExpr>,
    pub key: Vec<KeyField>,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default = "default_idle_timeout_ns")]
    pub idle_timeout_ns: u64,
    #[serde(default = "default_active_timeout_ns")]
    pub active_timeout_ns: u64,
    #[serde(default)]
    pub per_packet: bool,
    #[serde(default = "default_true")]
    pub tcp_expiry: bool,
    #[serde(default = "default_workers")]
    pub workers: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_ring_depth")]
    pub ring_depth: u32,
}

fn default_idle_timeout_ns() -> u64 {
    flowtap_engine::flow::DEFAULT_IDLE_TIMEOUT_NS as u64
}
fn default_active_timeout_ns() -> u64 {
    flowtap_engine::flow::DEFAULT_ACTIVE_TIMEOUT_NS as u64
}
fn default_true() -> bool {
    true
}
fn default_workers() -> u32 {
    1
}
fn default_batch_size() -> u32 {
    flowtap_engine::buffer::DEFAULT_BATCH_SIZE as u32
}
fn default_ring_depth() -> u32 {
    flowtap_engine::buffer::DEFAULT_RING_DEPTH as u32
}

impl PipelineConfig {
    /// Load and parse a config file. Any failure here is a configuration
    /// error (exit code 1), never an internal one.
    pub fn load(path: &Path) -> FlowResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| FlowError::Config(e.to_string()))?;
        let config: Self = serde_json::from_str(&text).map_err(|e| FlowError::Config(e.to_string()))?;
        if config.per_packet {
            return Err(FlowError::Config(
                "per_packet: true is not supported — the engine only exports one record per flow".into(),
            ));
        }
        Ok(config)
    }

    pub fn table_config(&self) -> TableConfig {
        TableConfig {
            idle_timeout_ns: self.idle_timeout_ns as i64,
            active_timeout_ns: self.active_timeout_ns as i64,
            tcp_expiry: self.tcp_expiry,
        }
    }

    /// Names of every exported feature, in declared order, for exporter
    /// column headers.
    pub fn feature_names(&self) -> Vec<String> {
        self.features.iter().map(|f| f.feature.clone()).collect()
    }

    /// Build a [`GraphFactory`] from the configured feature list, validating
    /// arities and input references against the registry.
    pub fn graph_factory(&self) -> FlowResult<GraphFactory> {
        let exprs = self.features.clone();
        let mut ctors: Vec<Box<dyn Fn() -> Box<dyn FeatureNode> + Send + Sync>> =
            Vec::with_capacity(exprs.len());
        let mut edges = vec![Vec::new(); exprs.len()];
        let mut roots = Vec::new();

        for (i, expr) in exprs.iter().enumerate() {
            let def = registry::lookup(&expr.feature)
                .ok_or_else(|| FlowError::Config(format!("unknown feature '{}'", expr.feature)))?;

            match def.arity {
                Arity::RawPacket => {
                    if !expr.inputs.is_empty() {
                        return Err(FlowError::Config(format!(
                            "'{}' takes no inputs, got {}",
                            expr.feature,
                            expr.inputs.len()
                        )));
                    }
                    roots.push(i);
                }
                Arity::Unary => {
                    if expr.inputs.len() != 1 {
                        return Err(FlowError::Config(format!(
                            "'{}' requires exactly one input",
                            expr.feature
                        )));
                    }
                }
                Arity::Variadic => {
                    if expr.inputs.is_empty() {
                        return Err(FlowError::Config(format!(
                            "'{}' requires at least one input",
                            expr.feature
                        )));
                    }
                }
                Arity::Indexed => {
                    if expr.inputs.len() != 1 {
                        return Err(FlowError::Config(format!(
                            "'{}' requires exactly one value input plus a constant index",
                            expr.feature
                        )));
                    }
                }
            }

            for &input in &expr.inputs {
                if input >= i {
                    return Err(FlowError::Config(format!(
                        "'{}' references input {} which is not an earlier entry",
                        expr.feature, input
                    )));
                }
                edges[input].push(i);
            }

            let feature_name = expr.feature.clone();
            let inputs = expr.inputs.clone();
            let index = expr.index.unwrap_or(0);
            ctors.push(Box::new(move || {
                let mut node = if feature_name == "get" {
                    Box::new(Get::new(index)) as Box<dyn FeatureNode>
                } else {
                    (def.ctor)()
                };
                node.set_arguments(0, &inputs);
                node
            }));
        }

        let exports: Vec<usize> = (0..exprs.len()).collect();
        let ctors = Arc::new(ctors);
        let edges = Arc::new(edges);
        let roots = Arc::new(roots);
        let exports = Arc::new(exports);

        Ok(Arc::new(move || {
            let nodes = ctors.iter().map(|ctor| ctor()).collect();
            FeatureGraph::new(nodes, (*edges).clone(), (*roots).clone(), (*exports).clone())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_feature() {
        let config = PipelineConfig {
            features: vec![FeatureExpr {
                feature: "notAFeature".to_string(),
                inputs: vec![],
                index: None,
            }],
            key: vec![KeyField::Protocol],
            bidirectional: true,
            idle_timeout_ns: 1,
            active_timeout_ns: 1,
            per_packet: false,
            tcp_expiry: true,
            workers: 1,
            batch_size: 1,
            ring_depth: 1,
        };
        assert!(config.graph_factory().is_err());
    }

    #[test]
    fn builds_factory_for_raw_and_unary_chain() {
        let config = PipelineConfig {
            features: vec![
                FeatureExpr {
                    feature: "octetTotalCount".to_string(),
                    inputs: vec![],
                    index: None,
                },
                FeatureExpr {
                    feature: "mean".to_string(),
                    inputs: vec![0],
                    index: None,
                },
            ],
            key: vec![KeyField::Protocol],
            bidirectional: true,
            idle_timeout_ns: 1,
            active_timeout_ns: 1,
            per_packet: false,
            tcp_expiry: true,
            workers: 1,
            batch_size: 1,
            ring_depth: 1,
        };
        let factory = config.graph_factory().expect("valid config");
        let _graph = factory();
    }

    #[test]
    fn load_rejects_per_packet_true() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("flowtap-config-test-{:?}.json", std::thread::current().id()));
        fs::write(
            &path,
            r#"{"features":[{"feature":"octetTotalCount","inputs":[]}],"key":["protocol"],"per_packet":true}"#,
        )
        .expect("can write to temp dir");
        let result = PipelineConfig::load(&path);
        let _ = fs::remove_file(&path);
        assert!(matches!(result, Err(FlowError::Config(_))));
    }
}
