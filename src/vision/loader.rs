//! Versioned model loading.
//!
//! A strict load is tried first. When the runtime rejects a node attribute written
//! by an older exporter and that attribute is allowlisted, the attribute is removed
//! from the serialized ONNX graph and the load is retried.

use std::path::Path;
use std::sync::LazyLock;

use prost::Message;
use regex::Regex;
use thiserror::Error;
use tracing::{info, warn};

use super::onnx_proto::{ModelProto, NodeProto};
use crate::error::StartupError;

static LEGACY_ATTRIBUTE_ERROR: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"Unrecognized attribute: (\w+) for operator (\w+)"));

/// Attribute the runtime refused, as parsed from its error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyAttribute {
    pub attribute: String,
    pub op_type: String,
}

/// Matches a runtime load error against the allowlisted legacy attributes.
///
/// Anything else, including an unknown attribute name, yields `None`.
pub fn recognize_legacy_attribute(message: &str, allowlist: &[String]) -> Option<LegacyAttribute> {
    let pattern = LEGACY_ATTRIBUTE_ERROR.as_ref().ok()?;
    let caps = pattern.captures(message)?;
    let attribute = caps.get(1)?.as_str();
    if !allowlist.iter().any(|a| a == attribute) {
        return None;
    }
    Some(LegacyAttribute {
        attribute: attribute.to_string(),
        op_type: caps.get(2)?.as_str().to_string(),
    })
}

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("malformed ONNX model: {0}")]
    Decode(#[from] prost::DecodeError),
}

fn strip_nodes(nodes: &mut [NodeProto], attribute: &str, op_type: Option<&str>) -> usize {
    let mut removed = 0;
    for node in nodes {
        if op_type.map_or(true, |wanted| node.op_type.as_deref() == Some(wanted)) {
            let before = node.attribute.len();
            node.attribute.retain(|attr| attr.name.as_deref() != Some(attribute));
            removed += before - node.attribute.len();
        }

        // Control-flow attributes (If/Loop/Scan bodies) embed whole graphs.
        for attr in &mut node.attribute {
            if let Some(graph) = attr.g.as_mut() {
                removed += strip_nodes(&mut graph.node, attribute, op_type);
            }
            for graph in &mut attr.graphs {
                removed += strip_nodes(&mut graph.node, attribute, op_type);
            }
        }
    }
    removed
}

/// Removes attribute `attribute` from every node (optionally only nodes of
/// `op_type`) of a serialized ONNX model, local functions included. Returns the
/// new bytes and the number of attributes removed; the input is returned as is
/// when nothing matched.
pub fn strip_node_attribute(
    model: &[u8],
    attribute: &str,
    op_type: Option<&str>,
) -> Result<(Vec<u8>, usize), RewriteError> {
    let mut proto = ModelProto::decode(model)?;

    let mut removed = 0;
    if let Some(graph) = proto.graph.as_mut() {
        removed += strip_nodes(&mut graph.node, attribute, op_type);
    }
    for function in &mut proto.functions {
        removed += strip_nodes(&mut function.node, attribute, op_type);
    }

    if removed == 0 {
        return Ok((model.to_vec(), 0));
    }
    Ok((proto.encode_to_vec(), removed))
}

/// Loads models, retrying once per allowlisted legacy attribute.
pub struct ModelLoader {
    legacy_attributes: Vec<String>,
}

impl ModelLoader {
    pub fn new(legacy_attributes: Vec<String>) -> Self {
        Self { legacy_attributes }
    }

    /// Drives `commit` until it accepts the model or fails with an error that
    /// cannot be repaired by stripping an attribute.
    pub fn load_with<S, F>(
        &self,
        path: &Path,
        mut bytes: Vec<u8>,
        mut commit: F,
    ) -> Result<S, StartupError>
    where
        F: FnMut(&[u8]) -> Result<S, String>,
    {
        let load_error = |reason: String| StartupError::ModelLoad {
            path: path.to_path_buf(),
            reason,
        };
        let mut stripped: Vec<LegacyAttribute> = Vec::new();

        loop {
            let message = match commit(&bytes) {
                Ok(session) => {
                    info!(model_size = bytes.len(), rewrites = stripped.len(), "model loaded");
                    return Ok(session);
                }
                Err(message) => message,
            };

            let legacy = match recognize_legacy_attribute(&message, &self.legacy_attributes) {
                Some(legacy) if !stripped.contains(&legacy) => legacy,
                _ => return Err(load_error(message)),
            };

            let (rewritten, removed) =
                strip_node_attribute(&bytes, &legacy.attribute, Some(&legacy.op_type))
                    .map_err(|e| load_error(format!("{message}; rewrite failed: {e}")))?;
            if removed == 0 {
                return Err(load_error(message));
            }

            warn!(
                attribute = %legacy.attribute,
                op_type = %legacy.op_type,
                removed,
                "stripping legacy attribute and retrying model load"
            );
            bytes = rewritten;
            stripped.push(legacy);
        }
    }
}

#[cfg(feature = "ml")]
mod runtime {
    use std::path::Path;

    use ort::session::Session;
    use tracing::instrument;

    use super::ModelLoader;
    use crate::error::StartupError;

    impl ModelLoader {
        #[instrument(skip(self), fields(path = %path.display()))]
        pub fn load(&self, path: &Path) -> Result<Session, StartupError> {
            let bytes = std::fs::read(path).map_err(|source| StartupError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            self.load_bytes(path, bytes)
        }

        pub fn load_bytes(&self, path: &Path, bytes: Vec<u8>) -> Result<Session, StartupError> {
            self.load_with(path, bytes, commit)
        }
    }

    fn commit(bytes: &[u8]) -> Result<Session, String> {
        Session::builder()
            .map_err(|e| e.to_string())?
            .commit_from_memory(bytes)
            .map_err(|e| e.to_string())
    }
}


#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::vision::onnx_proto::testing::{int_attribute, model, node};
    use crate::vision::onnx_proto::{AttributeProto, GraphProto, TensorProto};

    const DEPTHWISE_GROUPS: &str =
        "Load model failed: Unrecognized attribute: groups for operator DepthwiseConv2D";

    fn encode(nodes: Vec<NodeProto>) -> Vec<u8> {
        model(nodes, &[1, 3], &[1, 3]).encode_to_vec()
    }

    fn count_attribute(bytes: &[u8], name: &str) -> usize {
        fn walk(nodes: &[NodeProto], name: &str) -> usize {
            nodes
                .iter()
                .map(|n| {
                    let own = n
                        .attribute
                        .iter()
                        .filter(|a| a.name.as_deref() == Some(name))
                        .count();
                    let nested: usize = n
                        .attribute
                        .iter()
                        .flat_map(|a| a.g.iter().chain(a.graphs.iter()))
                        .map(|g| walk(&g.node, name))
                        .sum();
                    own + nested
                })
                .sum()
        }
        let proto = ModelProto::decode(bytes).unwrap();
        proto.graph.map_or(0, |g| walk(&g.node, name))
    }

    fn has_attribute(bytes: &[u8], name: &str) -> bool {
        count_attribute(bytes, name) > 0
    }

    fn loader() -> ModelLoader {
        ModelLoader::new(vec!["groups".to_string()])
    }

    #[test]
    fn recognizes_allowlisted_attribute_errors() {
        let allow = vec!["groups".to_string()];
        assert_eq!(
            recognize_legacy_attribute(DEPTHWISE_GROUPS, &allow),
            Some(LegacyAttribute {
                attribute: "groups".into(),
                op_type: "DepthwiseConv2D".into(),
            })
        );
    }

    #[test]
    fn ignores_other_errors() {
        let allow = vec!["groups".to_string()];
        let dilations = "Unrecognized attribute: dilations for operator Conv";
        assert_eq!(recognize_legacy_attribute(dilations, &allow), None);
        assert_eq!(recognize_legacy_attribute("protobuf parsing failed", &allow), None);
    }

    #[test]
    fn strips_attribute_only_from_matching_op() {
        let bytes = encode(vec![
            node("DepthwiseConv2D", vec![int_attribute("groups", 1), int_attribute("strides", 2)]),
            node("Conv", vec![int_attribute("groups", 1)]),
        ]);
        assert_eq!(count_attribute(&bytes, "groups"), 2);

        let (rewritten, removed) =
            strip_node_attribute(&bytes, "groups", Some("DepthwiseConv2D")).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(count_attribute(&rewritten, "groups"), 1);
        assert_eq!(count_attribute(&rewritten, "strides"), 1);
    }

    #[test]
    fn strips_everywhere_without_op_filter() {
        let bytes = encode(vec![
            node("DepthwiseConv2D", vec![int_attribute("groups", 1)]),
            node("Conv", vec![int_attribute("groups", 4)]),
        ]);
        let (rewritten, removed) = strip_node_attribute(&bytes, "groups", None).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(count_attribute(&rewritten, "groups"), 0);
    }

    #[test]
    fn strips_inside_control_flow_subgraphs() {
        let body = GraphProto {
            node: vec![node("DepthwiseConv2D", vec![int_attribute("groups", 1)])],
            ..Default::default()
        };
        let branch = AttributeProto {
            name: Some("then_branch".into()),
            g: Some(body.clone()),
            ..Default::default()
        };
        let bodies = AttributeProto {
            name: Some("branches".into()),
            graphs: vec![body],
            ..Default::default()
        };
        let bytes = encode(vec![node("If", vec![branch, bodies])]);
        assert_eq!(count_attribute(&bytes, "groups"), 2);

        let (rewritten, removed) =
            strip_node_attribute(&bytes, "groups", Some("DepthwiseConv2D")).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(count_attribute(&rewritten, "groups"), 0);
        assert_eq!(count_attribute(&rewritten, "then_branch"), 1);
    }

    #[test]
    fn rewrite_keeps_weights_and_metadata() {
        let depthwise = node("DepthwiseConv2D", vec![int_attribute("groups", 1)]);
        let mut proto = model(vec![depthwise], &[1, 3], &[1, 3]);
        let weights = TensorProto {
            name: Some("w".into()),
            dims: vec![2, 2],
            data_type: Some(1),
            raw_data: Some(vec![7; 16]),
            ..Default::default()
        };
        if let Some(graph) = proto.graph.as_mut() {
            graph.initializer.push(weights.clone());
        }
        let (rewritten, _) = strip_node_attribute(&proto.encode_to_vec(), "groups", None).unwrap();

        let decoded = ModelProto::decode(rewritten.as_slice()).unwrap();
        assert_eq!(decoded.producer_name, proto.producer_name);
        assert_eq!(decoded.opset_import, proto.opset_import);
        let graph = decoded.graph.unwrap();
        assert_eq!(graph.initializer, vec![weights]);
        assert_eq!(graph.input, proto.graph.unwrap().input);
    }

    #[test]
    fn leaves_model_untouched_when_nothing_matches() {
        let bytes = encode(vec![node("Relu", vec![int_attribute("alpha", 1)])]);
        let (rewritten, removed) = strip_node_attribute(&bytes, "groups", None).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(rewritten, bytes);
    }

    #[test]
    fn rejects_malformed_models() {
        let mut bytes = encode(vec![node("Conv", vec![int_attribute("groups", 1)])]);
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            strip_node_attribute(&bytes, "groups", None),
            Err(RewriteError::Decode(_))
        ));
    }

    #[test]
    fn legacy_attribute_is_stripped_and_load_retried() {
        let bytes = encode(vec![
            node("DepthwiseConv2D", vec![int_attribute("groups", 1)]),
            node("Relu", vec![]),
        ]);
        let attempts = Cell::new(0);

        let loaded = loader()
            .load_with(Path::new("model.onnx"), bytes, |candidate| {
                attempts.set(attempts.get() + 1);
                if has_attribute(candidate, "groups") {
                    Err(DEPTHWISE_GROUPS.to_string())
                } else {
                    Ok(candidate.to_vec())
                }
            })
            .unwrap();

        assert_eq!(attempts.get(), 2);
        assert!(!has_attribute(&loaded, "groups"));
    }

    #[test]
    fn unrecognized_errors_are_fatal() {
        let bytes = encode(vec![node("DepthwiseConv2D", vec![int_attribute("groups", 1)])]);
        let attempts = Cell::new(0);

        let err = loader()
            .load_with(Path::new("model.onnx"), bytes, |_| -> Result<(), String> {
                attempts.set(attempts.get() + 1);
                Err("protobuf parsing failed".into())
            })
            .unwrap_err();

        assert_eq!(attempts.get(), 1);
        assert!(matches!(
            err,
            StartupError::ModelLoad { ref reason, .. } if reason == "protobuf parsing failed"
        ));
    }

    #[test]
    fn attributes_outside_the_allowlist_are_fatal() {
        let bytes = encode(vec![node("DepthwiseConv2D", vec![int_attribute("groups", 1)])]);
        let result = ModelLoader::new(Vec::new())
            .load_with(Path::new("model.onnx"), bytes, |_| -> Result<(), String> {
                Err(DEPTHWISE_GROUPS.to_string())
            });
        assert!(matches!(result, Err(StartupError::ModelLoad { .. })));
    }

    #[test]
    fn error_naming_an_absent_node_is_fatal() {
        // the runtime blames DepthwiseConv2D but only Conv carries the attribute
        let bytes = encode(vec![node("Conv", vec![int_attribute("groups", 1)])]);
        let attempts = Cell::new(0);

        let result = loader().load_with(Path::new("model.onnx"), bytes, |_| -> Result<(), String> {
            attempts.set(attempts.get() + 1);
            Err(DEPTHWISE_GROUPS.to_string())
        });

        assert_eq!(attempts.get(), 1);
        assert!(matches!(result, Err(StartupError::ModelLoad { .. })));
    }

    #[test]
    fn same_attribute_is_not_stripped_twice() {
        let bytes = encode(vec![node("DepthwiseConv2D", vec![int_attribute("groups", 1)])]);
        let attempts = Cell::new(0);

        let result = loader().load_with(Path::new("model.onnx"), bytes, |_| -> Result<(), String> {
            attempts.set(attempts.get() + 1);
            Err(DEPTHWISE_GROUPS.to_string())
        });

        assert_eq!(attempts.get(), 2);
        assert!(matches!(
            result,
            Err(StartupError::ModelLoad { ref reason, .. })
                if reason.contains("Unrecognized attribute: groups")
        ));
    }

    #[cfg(feature = "ml")]
    mod runtime {
        use super::*;
        use crate::vision::onnx_proto::testing::model_bytes;

        #[test]
        fn garbage_bytes_fail_to_load() {
            let garbage = b"not an onnx model".to_vec();
            let result = loader().load_bytes(Path::new("garbage.onnx"), garbage);
            assert!(matches!(result, Err(StartupError::ModelLoad { .. })));
        }

        #[test]
        fn minimal_model_loads() {
            let bytes = model_bytes(vec![node("Identity", vec![])], &[1, 3], &[1, 3]);
            assert!(loader().load_bytes(Path::new("identity.onnx"), bytes).is_ok());
        }

        #[test]
        fn runtime_rejection_of_legacy_attribute_is_repaired() {
            let relu = node("Relu", vec![int_attribute("groups", 1)]);
            let bytes = model_bytes(vec![relu], &[1, 3], &[1, 3]);

            let strict =
                ModelLoader::new(Vec::new()).load_bytes(Path::new("relu.onnx"), bytes.clone());
            assert!(matches!(
                strict,
                Err(StartupError::ModelLoad { ref reason, .. })
                    if reason.contains("Unrecognized attribute: groups")
            ));

            assert!(loader().load_bytes(Path::new("relu.onnx"), bytes).is_ok());
        }

        #[test]
        fn missing_file_is_a_read_error() {
            let dir = tempfile::tempdir().unwrap();
            let result = loader().load(&dir.path().join("absent.onnx"));
            assert!(matches!(result, Err(StartupError::Read { .. })));
        }
    }
}
