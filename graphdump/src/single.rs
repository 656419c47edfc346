use crate::builder::{Builder, GroupHeader, RawEdge, RootResult, SkipRoot};
use crate::model::{FolderElement, PropertyValue};
use crate::model_builder::ModelBuilder;
use crate::pool::{NodeClassData, StreamPool};
use crate::scan::StreamIndex;

use std::sync::Arc;

/// [`Builder`] that materializes a single indexed record.
///
/// Delegates everything to an inner [`ModelBuilder`] but, when the channel
/// covers more than the target record, jumps over foreign roots using the
/// ranges and skip pools the scan left in the [`StreamIndex`].  A foreign
/// root that was never closed in the index decodes normally and is filtered
/// out at extraction.
pub struct SingleGroupBuilder {
    inner: ModelBuilder,
    index: Arc<StreamIndex>,
    target_start: u64,
    folder_level: usize,
    graph_depth: usize,
    /// Start offset of each completed root record, aligned with the inner
    /// document's elements.
    roots_seen: Vec<u64>,
    current_root: Option<u64>,
}

impl SingleGroupBuilder {
    pub fn new(index: Arc<StreamIndex>, target_start: u64) -> SingleGroupBuilder {
        SingleGroupBuilder {
            inner: ModelBuilder::new(),
            index,
            target_start,
            folder_level: 0,
            graph_depth: 0,
            roots_seen: Vec::new(),
            current_root: None,
        }
    }

    /// The materialized target record, if the channel contained it.
    pub fn into_element(self) -> Option<FolderElement> {
        let target = self.target_start;
        let position = self.roots_seen.iter().position(|start| *start == target)?;
        self.inner
            .into_document()
            .elements
            .into_iter()
            .nth(position)
    }

    /// Skip signal for a foreign root at `pos`, when the index knows its
    /// extent.
    fn foreign_root(&self, pos: u64) -> Option<SkipRoot> {
        let entry = self.index.get(pos)?;
        let end = entry.end()?;
        Some(SkipRoot {
            start: pos,
            end,
            pool: entry.skip_pool(),
        })
    }
}

impl Builder for SingleGroupBuilder {
    fn start_group(&mut self, pool: &mut StreamPool, pos: u64) -> RootResult {
        if self.folder_level == 0 {
            if pos != self.target_start
                && let Some(skip) = self.foreign_root(pos)
            {
                return Err(skip);
            }
            self.current_root = Some(pos);
        }
        self.folder_level += 1;
        self.inner.start_group(pool, pos)
    }

    fn start_group_content(&mut self, pool: &mut StreamPool, header: GroupHeader) -> RootResult {
        self.inner.start_group_content(pool, header)
    }

    fn end_group(&mut self, pool: &mut StreamPool, pos: u64) {
        self.folder_level -= 1;
        if self.folder_level == 0
            && let Some(start) = self.current_root.take()
        {
            self.roots_seen.push(start);
        }
        self.inner.end_group(pool, pos)
    }

    fn start_graph(
        &mut self,
        pool: &mut StreamPool,
        pos: u64,
        title: Arc<str>,
        nested: bool,
    ) -> RootResult {
        if !nested && self.folder_level == 0 && self.graph_depth == 0 {
            if pos != self.target_start
                && let Some(skip) = self.foreign_root(pos)
            {
                return Err(skip);
            }
            self.current_root = Some(pos);
        }
        self.graph_depth += 1;
        self.inner.start_graph(pool, pos, title, nested)
    }

    fn end_graph(&mut self, pool: &mut StreamPool, pos: u64) {
        self.graph_depth -= 1;
        if self.folder_level == 0
            && self.graph_depth == 0
            && let Some(start) = self.current_root.take()
        {
            self.roots_seen.push(start);
        }
        self.inner.end_graph(pool, pos)
    }

    fn mark_graph_duplicate(&mut self) {
        self.inner.mark_graph_duplicate()
    }

    fn property(&mut self, key: Arc<str>, value: PropertyValue) {
        self.inner.property(key, value)
    }

    fn start_nested_property(&mut self, key: Arc<str>) {
        self.inner.start_nested_property(key)
    }

    fn start_node(&mut self, id: i32, has_predecessor: bool, node_class: Arc<NodeClassData>) {
        self.inner.start_node(id, has_predecessor, node_class)
    }

    fn end_node(&mut self, id: i32) {
        self.inner.end_node(id)
    }

    fn input_edge(&mut self, edge: RawEdge) {
        self.inner.input_edge(edge)
    }

    fn successor_edge(&mut self, edge: RawEdge) {
        self.inner.successor_edge(edge)
    }

    fn make_graph_edges(&mut self) {
        self.inner.make_graph_edges()
    }

    fn start_block(&mut self, id: i32) {
        self.inner.start_block(id)
    }

    fn block_node(&mut self, node_id: i32) {
        self.inner.block_node(node_id)
    }

    fn block_edge(&mut self, from: i32, to: i32) {
        self.inner.block_edge(from, to)
    }

    fn end_block(&mut self, id: i32) {
        self.inner.end_block(id)
    }

    fn make_block_edges(&mut self) {
        self.inner.make_block_edges()
    }
}
