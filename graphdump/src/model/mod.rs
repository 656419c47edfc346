//! In-memory model of a decoded dump: a document of nested groups whose
//! leaves are graphs of nodes, edges and basic blocks.

pub mod properties;

pub use properties::*;

use crate::lazy::{LazyGraph, LazyGroup};
use crate::pool::MethodData;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Property key carried by the second of two byte-identical sibling graphs.
pub const PROPERTY_DUPLICATE: &str = "duplicate";

/// The root folder of a parsed dump.
#[derive(Debug, Default)]
pub struct GraphDocument {
    pub properties: Properties,
    pub elements: Vec<FolderElement>,
}

impl GraphDocument {
    pub fn new() -> GraphDocument {
        GraphDocument::default()
    }

    pub fn groups(&self) -> impl Iterator<Item = &Arc<Group>> {
        self.elements.iter().filter_map(|e| match e {
            FolderElement::Group(g) => Some(g),
            _ => None,
        })
    }

    pub fn graphs(&self) -> impl Iterator<Item = &Arc<InputGraph>> {
        self.elements.iter().filter_map(|e| match e {
            FolderElement::Graph(g) => Some(g),
            _ => None,
        })
    }
}

/// One element of a folder: a fully materialized group or graph, or a lazy
/// placeholder backed by a stream-index entry.
#[derive(Clone, Debug)]
pub enum FolderElement {
    Group(Arc<Group>),
    Graph(Arc<InputGraph>),
    LazyGroup(Arc<LazyGroup>),
    LazyGraph(Arc<LazyGraph>),
}

impl FolderElement {
    pub fn name(&self) -> &str {
        match self {
            FolderElement::Group(g) => &g.name,
            FolderElement::Graph(g) => &g.name,
            FolderElement::LazyGroup(g) => g.name(),
            FolderElement::LazyGraph(g) => g.name(),
        }
    }
}

/// A folder of graphs and nested groups, usually one compiled method.
#[derive(Debug, Default)]
pub struct Group {
    pub name: Arc<str>,
    pub short_name: Option<Arc<str>>,
    pub method: Option<Arc<MethodData>>,
    pub bci: i32,
    pub properties: Properties,
    pub elements: Vec<FolderElement>,
}

impl Group {
    pub fn graphs(&self) -> impl Iterator<Item = &Arc<InputGraph>> {
        self.elements.iter().filter_map(|e| match e {
            FolderElement::Graph(g) => Some(g),
            _ => None,
        })
    }

    pub fn subgroups(&self) -> impl Iterator<Item = &Arc<Group>> {
        self.elements.iter().filter_map(|e| match e {
            FolderElement::Group(g) => Some(g),
            _ => None,
        })
    }
}

/// One graph snapshot: nodes keyed by id, materialized edges, basic blocks
/// in stream order and the node-to-block assignment.
#[derive(Debug, Default)]
pub struct InputGraph {
    pub name: Arc<str>,
    pub properties: Properties,
    pub nodes: BTreeMap<i32, InputNode>,
    pub edges: Vec<InputEdge>,
    pub blocks: Vec<InputBlock>,
    pub block_edges: Vec<BlockEdge>,
    pub node_to_block: HashMap<i32, Arc<str>>,
}

impl InputGraph {
    pub fn node(&self, id: i32) -> Option<&InputNode> {
        self.nodes.get(&id)
    }

    pub fn block(&self, name: &str) -> Option<&InputBlock> {
        self.blocks.iter().find(|b| b.name.as_ref() == name)
    }

    /// Name of the block the node was assigned to, if any.
    pub fn block_of(&self, node_id: i32) -> Option<&Arc<str>> {
        self.node_to_block.get(&node_id)
    }

    /// True when the reader marked this graph as byte-identical to its
    /// preceding sibling.
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self.properties.get(PROPERTY_DUPLICATE),
            Some(PropertyValue::Bool(true))
        )
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

/// A node of a graph.  The display name, class and block assignment live in
/// the properties under the system keys `name`, `class`, `id`, `block` and
/// `hasPredecessor`.
#[derive(Debug)]
pub struct InputNode {
    pub id: i32,
    pub properties: Properties,
}

impl InputNode {
    pub fn display_name(&self) -> &str {
        self.properties
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }

    pub fn has_predecessor(&self) -> bool {
        matches!(
            self.properties.get("hasPredecessor"),
            Some(PropertyValue::Bool(true))
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    Input,
    Successor,
}

/// An immutable, materialized edge.  For input edges `from_index` is 1 when
/// the source node also has control successors (port 0 is then the control
/// port), otherwise 0.
#[derive(Clone, Debug, PartialEq)]
pub struct InputEdge {
    pub kind: EdgeKind,
    pub from: i32,
    pub to: i32,
    pub from_index: u16,
    pub to_index: u16,
    pub label: Arc<str>,
    pub edge_type: Option<Arc<str>>,
}

/// A basic block and the ids of the nodes scheduled into it.
#[derive(Clone, Debug, PartialEq)]
pub struct InputBlock {
    pub name: Arc<str>,
    pub nodes: Vec<i32>,
}

/// A control-flow edge between two blocks, by block name.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockEdge {
    pub from: Arc<str>,
    pub to: Arc<str>,
}
