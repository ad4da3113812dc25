//! ---
//! cosim_section: "01-core-functionality"
//! cosim_subsection: "module"
//! cosim_type: "source"
//! cosim_scope: "code"
//! cosim_description: "Dataflow graph between simulators and relation graph between entities."
//! cosim_version: "v0.0.0-prealpha"
//! cosim_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};

use petgraph::graph::{DiGraph, NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SimManagerError};
use crate::types::{SimId, SimTime};

/// When data travelling along a dataflow edge becomes visible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeTiming {
    /// Same step, the destination waits for the source.
    #[default]
    Immediate,
    /// Same step, without enforcing order (cycle breaking).
    Weak,
    /// Delivered `time_shift` steps later through the timed input buffer.
    TimeShifted,
}

/// Metadata of a connection from one simulator to another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataflowEdge {
    /// The destination may call `get_data`/`set_data` against the source mid-step.
    #[serde(default)]
    pub async_requests: bool,
    #[serde(default)]
    pub timing: EdgeTiming,
    #[serde(default)]
    pub time_shift: SimTime,
}

impl DataflowEdge {
    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn weak() -> Self {
        Self {
            timing: EdgeTiming::Weak,
            ..Self::default()
        }
    }

    pub fn time_shifted(time_shift: SimTime) -> Self {
        Self {
            timing: EdgeTiming::TimeShifted,
            time_shift,
            ..Self::default()
        }
    }

    pub fn with_async_requests(mut self, enabled: bool) -> Self {
        self.async_requests = enabled;
        self
    }
}

/// Directed graph of data dependencies between simulators.
#[derive(Debug, Default)]
pub struct DataflowGraph {
    graph: DiGraph<SimId, DataflowEdge>,
    index: HashMap<SimId, NodeIndex>,
}

impl DataflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sim(&mut self, sid: &str) -> NodeIndex {
        if let Some(node) = self.index.get(sid) {
            return *node;
        }
        let node = self.graph.add_node(sid.to_owned());
        self.index.insert(sid.to_owned(), node);
        node
    }

    /// Add or replace the edge `src → dest`.
    pub fn connect(&mut self, src: &str, dest: &str, edge: DataflowEdge) {
        let a = self.add_sim(src);
        let b = self.add_sim(dest);
        self.graph.update_edge(a, b, edge);
    }

    pub fn edge(&self, src: &str, dest: &str) -> Option<&DataflowEdge> {
        let a = *self.index.get(src)?;
        let b = *self.index.get(dest)?;
        let edge = self.graph.find_edge(a, b)?;
        self.graph.edge_weight(edge)
    }

    pub fn predecessors(&self, sid: &str) -> Vec<(SimId, DataflowEdge)> {
        self.neighbors(sid, Direction::Incoming)
    }

    pub fn successors(&self, sid: &str) -> Vec<(SimId, DataflowEdge)> {
        self.neighbors(sid, Direction::Outgoing)
    }

    fn neighbors(&self, sid: &str, direction: Direction) -> Vec<(SimId, DataflowEdge)> {
        let Some(node) = self.index.get(sid) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(*node, direction)
            .map(|edge| {
                let other = match direction {
                    Direction::Incoming => edge.source(),
                    Direction::Outgoing => edge.target(),
                };
                (self.graph[other].clone(), edge.weight().clone())
            })
            .collect()
    }

    /// Fail unless `src → dest` exists and allows async requests.
    pub fn assert_async_requests(&self, src: &str, dest: &str) -> Result<()> {
        match self.edge(src, dest) {
            Some(edge) if edge.async_requests => Ok(()),
            Some(_) => Err(SimManagerError::config(
                dest,
                format!(
                    "async requests are not enabled for the connection from \"{src}\" to \"{dest}\"; \
                     connect them with async_requests enabled"
                ),
            )),
            None => Err(SimManagerError::config(
                dest,
                format!(
                    "no connection from \"{src}\" to \"{dest}\"; \
                     connect them with async_requests enabled before calling get_data or set_data"
                ),
            )),
        }
    }
}

/// Node payload of the entity graph, serialized as `{"type": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInfo {
    #[serde(rename = "type")]
    pub entity_type: String,
}

/// Answer to `get_related_entities`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RelatedEntities {
    /// The whole graph.
    Graph {
        nodes: BTreeMap<String, EntityInfo>,
        edges: Vec<(String, String, Map<String, Value>)>,
    },
    /// Neighbors of a single entity.
    Neighbors(BTreeMap<String, EntityInfo>),
    /// Neighbors of each requested entity.
    PerEntity(BTreeMap<String, BTreeMap<String, EntityInfo>>),
}

/// Undirected relations between entities, keyed by full id.
#[derive(Debug, Default)]
pub struct EntityGraph {
    graph: UnGraph<(String, EntityInfo), ()>,
    index: HashMap<String, NodeIndex>,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entity(&mut self, full_id: impl Into<String>, entity_type: impl Into<String>) {
        let full_id = full_id.into();
        let info = EntityInfo {
            entity_type: entity_type.into(),
        };
        match self.index.get(&full_id) {
            Some(node) => self.graph[*node].1 = info,
            None => {
                let node = self.graph.add_node((full_id.clone(), info));
                self.index.insert(full_id, node);
            }
        }
    }

    pub fn contains(&self, full_id: &str) -> bool {
        self.index.contains_key(full_id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Relate two known entities. Relating twice is a no-op.
    pub fn relate(&mut self, a: &str, b: &str) -> Result<()> {
        let left = self.node(a)?;
        let right = self.node(b)?;
        self.graph.update_edge(left, right, ());
        Ok(())
    }

    pub fn full_graph(&self) -> RelatedEntities {
        let nodes = self
            .graph
            .node_weights()
            .map(|(id, info)| (id.clone(), info.clone()))
            .collect();
        let edges = self
            .graph
            .edge_references()
            .map(|edge| {
                (
                    self.graph[edge.source()].0.clone(),
                    self.graph[edge.target()].0.clone(),
                    Map::new(),
                )
            })
            .collect();
        RelatedEntities::Graph { nodes, edges }
    }

    pub fn neighbors(&self, full_id: &str) -> Result<BTreeMap<String, EntityInfo>> {
        let node = self.node(full_id)?;
        Ok(self
            .graph
            .neighbors(node)
            .map(|other| {
                let (id, info) = &self.graph[other];
                (id.clone(), info.clone())
            })
            .collect())
    }

    fn node(&self, full_id: &str) -> Result<NodeIndex> {
        self.index.get(full_id).copied().ok_or_else(|| {
            let sid = full_id.split('.').next().unwrap_or(full_id);
            SimManagerError::config(sid, format!("unknown entity \"{full_id}\""))
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn async_permission_requires_flagged_edge() {
        let mut graph = DataflowGraph::new();
        graph.connect("Grid-0", "Ctrl-0", DataflowEdge::immediate().with_async_requests(true));
        graph.connect("PV-0", "Ctrl-0", DataflowEdge::time_shifted(1));

        assert!(graph.assert_async_requests("Grid-0", "Ctrl-0").is_ok());

        let err = graph.assert_async_requests("PV-0", "Ctrl-0").unwrap_err();
        assert!(err.is_config());
        assert!(err.reason().contains("\"PV-0\"") && err.reason().contains("\"Ctrl-0\""));

        assert!(graph.assert_async_requests("Ctrl-0", "Grid-0").is_err());
        assert_eq!(graph.predecessors("Ctrl-0").len(), 2);
        assert_eq!(graph.successors("PV-0")[0].0, "Ctrl-0");
    }

    #[test]
    fn reconnecting_replaces_edge_metadata() {
        let mut graph = DataflowGraph::new();
        graph.connect("A", "B", DataflowEdge::weak());
        graph.connect("A", "B", DataflowEdge::immediate());
        assert_eq!(graph.edge("A", "B"), Some(&DataflowEdge::immediate()));
        assert_eq!(graph.successors("A").len(), 1);
    }

    #[test]
    fn related_entities_shapes() {
        let mut graph = EntityGraph::new();
        graph.add_entity("Grid-0.n1", "Node");
        graph.add_entity("Grid-0.n2", "Node");
        graph.add_entity("PV-0.pv", "PV");
        graph.relate("PV-0.pv", "Grid-0.n1").unwrap();
        graph.relate("Grid-0.n1", "Grid-0.n2").unwrap();

        let full = serde_json::to_value(graph.full_graph()).unwrap();
        assert_eq!(full["nodes"]["PV-0.pv"], json!({"type": "PV"}));
        assert_eq!(full["edges"].as_array().map(Vec::len), Some(2));
        assert_eq!(full["edges"][0], json!(["PV-0.pv", "Grid-0.n1", {}]));

        let neighbors = graph.neighbors("Grid-0.n1").unwrap();
        assert_eq!(neighbors.len(), 2);
        assert_eq!(neighbors["PV-0.pv"].entity_type, "PV");

        let err = graph.neighbors("Grid-0.missing").unwrap_err();
        assert!(err.is_config());
        assert!(graph.relate("Grid-0.n1", "nowhere").is_err());
    }
}
