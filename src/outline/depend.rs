use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FarmError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependType {
    /// All frames wait for all frames of the other layer
    LayerOnLayer,
    /// Frame N waits for frame N of the other layer
    FrameByFrame,
    LayerOnFrame,
    FrameOnLayer,
}

impl fmt::Display for DependType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DependType::LayerOnLayer => "LAYER_ON_LAYER",
            DependType::FrameByFrame => "FRAME_BY_FRAME",
            DependType::LayerOnFrame => "LAYER_ON_FRAME",
            DependType::FrameOnLayer => "FRAME_ON_LAYER",
        };
        f.write_str(s)
    }
}

/// A dependency stored on the dependent layer, naming its target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Depend {
    pub kind: DependType,
    pub on_layer: String,
}

impl Depend {
    pub fn new(kind: DependType, on_layer: impl Into<String>) -> Self {
        Self {
            kind,
            on_layer: on_layer.into(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Fail with `DependencyCycle` if the graph `layer -> [targets]` has a cycle.
///
/// Nodes are visited in key order so the reported path is deterministic.
pub fn check_acyclic(graph: &BTreeMap<String, Vec<String>>) -> Result<()> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut path: Vec<&str> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        graph: &'a BTreeMap<String, Vec<String>>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Result<()> {
        match marks.get(node) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|n| *n == node).unwrap_or(0);
                let mut cycle: Vec<&str> = path[start..].to_vec();
                cycle.push(node);
                return Err(FarmError::DependencyCycle(cycle.join(" -> ")));
            }
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        path.push(node);
        if let Some(targets) = graph.get(node) {
            for target in targets {
                visit(target, graph, marks, path)?;
            }
        }
        path.pop();
        marks.insert(node, Mark::Done);
        Ok(())
    }

    for node in graph.keys() {
        visit(node, graph, &mut marks, &mut path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        edges
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn acyclic_graph_passes() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]);
        assert!(check_acyclic(&g).is_ok());
    }

    #[test]
    fn cycle_is_reported_with_path() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        match check_acyclic(&g) {
            Err(FarmError::DependencyCycle(path)) => assert_eq!(path, "a -> b -> c -> a"),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn depend_type_serializes_screaming_snake() {
        let d = Depend::new(DependType::FrameByFrame, "maya_layer");
        let text = serde_yaml::to_string(&d).unwrap();
        assert!(text.contains("kind: FRAME_BY_FRAME"));
        assert!(text.contains("on_layer: maya_layer"));
    }
}
