use crate::model::PropertyValue;
use crate::pool::{ConstantPool, MethodData, NodeClassData, StreamPool};

use std::sync::Arc;

/// Control signal returned by a builder to jump over a root record instead
/// of decoding it.  The reader advances the source to `end` and, when a
/// pool is carried, installs it before resuming.
///
/// Returned from [`Builder::start_group`] or [`Builder::start_graph`] it
/// suppresses the record entirely; returned from
/// [`Builder::start_group_content`] the reader still performs its group
/// bookkeeping, so the record decodes to an empty group shell that the
/// following `CLOSE_GROUP` closes.
#[derive(Debug)]
pub struct SkipRoot {
    pub start: u64,
    pub end: u64,
    pub pool: Option<ConstantPool>,
}

pub type RootResult = Result<(), SkipRoot>;

/// Decoded header fields of a group record.
#[derive(Clone, Debug)]
pub struct GroupHeader {
    pub name: Arc<str>,
    pub short_name: Option<Arc<str>>,
    pub method: Option<Arc<MethodData>>,
    pub bci: i32,
}

/// An edge observed while decoding a node's port lists.  `index` is the
/// slot position within the node's inputs (for input edges) or successor
/// ports (for successor edges); skipped negative peers still advance it.
#[derive(Clone, Debug)]
pub struct RawEdge {
    pub label: Arc<str>,
    pub from: i32,
    pub to: i32,
    pub index: u16,
    pub edge_type: Option<Arc<str>>,
}

/// Event sink of the [`BinaryReader`](crate::reader::BinaryReader).
///
/// The reader is agnostic about what a builder does with the events: the
/// [`ModelBuilder`](crate::model_builder::ModelBuilder) materializes the
/// full model, the
/// [`ScanningModelBuilder`](crate::scan::ScanningModelBuilder) records only
/// byte ranges, and the
/// [`SingleGroupBuilder`](crate::single::SingleGroupBuilder) materializes
/// one indexed record.  All methods default to no-ops.
///
/// Events are delivered in stream order on the thread running the parse.
/// Callbacks at record boundaries receive the reader's pool so builders can
/// fork or snapshot it; property events are routed by the builder to its
/// innermost open context (document, group, graph or node).
#[allow(unused_variables)]
pub trait Builder {
    // Stream lifecycle.

    fn start_document(&mut self) {}

    fn end_document(&mut self) {}

    /// A stream header was consumed, declaring the dump version.
    fn stream_header(&mut self, major: u8, minor: u8) {}

    /// A concatenated stream begins: discard per-stream decode state.  The
    /// reader has already restarted the pool.
    fn reset_stream_data(&mut self, pool: &mut StreamPool) {}

    // Groups.

    /// A `BEGIN_GROUP` opcode at offset `pos`, before its body is decoded.
    fn start_group(&mut self, pool: &mut StreamPool, pos: u64) -> RootResult {
        Ok(())
    }

    /// The group header has been decoded; properties and nested records
    /// follow.
    fn start_group_content(&mut self, pool: &mut StreamPool, header: GroupHeader) -> RootResult {
        Ok(())
    }

    /// The group's `CLOSE_GROUP` was consumed; `pos` is one past it.
    fn end_group(&mut self, pool: &mut StreamPool, pos: u64) {}

    // Graphs.

    /// A graph record begins at `pos`.  `nested` is true for a subgraph
    /// parsed as a property value.
    fn start_graph(
        &mut self,
        pool: &mut StreamPool,
        pos: u64,
        title: Arc<str>,
        nested: bool,
    ) -> RootResult {
        Ok(())
    }

    /// The graph record is fully decoded; `pos` is one past its last byte.
    fn end_graph(&mut self, pool: &mut StreamPool, pos: u64) {}

    /// The open graph is byte-identical to its preceding sibling.
    fn mark_graph_duplicate(&mut self) {}

    // Properties.

    fn property(&mut self, key: Arc<str>, value: PropertyValue) {}

    /// The value of `key` is a nested subgraph; the graph events follow.
    fn start_nested_property(&mut self, key: Arc<str>) {}

    // Nodes.

    fn start_node(&mut self, id: i32, has_predecessor: bool, node_class: Arc<NodeClassData>) {}

    fn end_node(&mut self, id: i32) {}

    fn input_edge(&mut self, edge: RawEdge) {}

    fn successor_edge(&mut self, edge: RawEdge) {}

    /// All nodes of the open graph are decoded; materialize edges.
    fn make_graph_edges(&mut self) {}

    // Blocks.

    fn start_block(&mut self, id: i32) {}

    fn block_node(&mut self, node_id: i32) {}

    /// A control-flow edge from block `from` to block `to`.
    fn block_edge(&mut self, from: i32, to: i32) {}

    fn end_block(&mut self, id: i32) {}

    /// All blocks of the open graph are decoded; materialize block edges
    /// and the node-to-block assignment.
    fn make_block_edges(&mut self) {}
}
