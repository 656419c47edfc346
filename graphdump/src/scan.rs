use crate::builder::{Builder, GroupHeader, RawEdge, RootResult};
use crate::pool::{ConstantPool, StreamPool};

use roaring::RoaringBitmap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Record kind of a stream-index entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Group,
    Graph,
}

/// Lightweight per-graph facts collected during the scan, available to the
/// user before the graph itself is loaded.
#[derive(Clone, Debug, Default)]
pub struct GraphMetadata {
    pub node_ids: RoaringBitmap,
    /// Symmetric difference against the preceding graph at the same
    /// nesting level; empty for the first graph.
    pub changed_node_ids: RoaringBitmap,
    pub edge_count: u32,
    pub is_duplicate: bool,
}

#[derive(Debug, Default)]
struct EntryState {
    end: Option<u64>,
    skip_pool: Option<ConstantPool>,
    metadata: Option<GraphMetadata>,
}

/// A byte range `[start, end)` of one top-level record, plus the pool
/// states needed to decode it (`initial_pool`) or seek past it
/// (`skip_pool`).
///
/// `start` and `initial_pool` are fixed when the scanner meets the record's
/// beginning; `end`, `skip_pool` and graph metadata arrive when it reaches
/// the record's end, possibly observed later from another thread.
/// Re-decoding `[start, end)` from a clone of `initial_pool` reproduces the
/// original event sequence.
#[derive(Debug)]
pub struct StreamEntry {
    kind: EntryKind,
    major: u8,
    minor: u8,
    start: u64,
    initial_pool: ConstantPool,
    state: Mutex<EntryState>,
}

impl StreamEntry {
    fn open(
        kind: EntryKind,
        major: u8,
        minor: u8,
        start: u64,
        initial_pool: ConstantPool,
    ) -> Arc<StreamEntry> {
        Arc::new(StreamEntry {
            kind,
            major,
            minor,
            start,
            initial_pool,
            state: Mutex::new(EntryState::default()),
        })
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn version(&self) -> (u8, u8) {
        (self.major, self.minor)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> Option<u64> {
        self.state.lock().expect("entry state").end
    }

    /// Pool state required to decode the record, cloned on demand.
    pub fn initial_pool(&self) -> ConstantPool {
        self.initial_pool.clone()
    }

    /// Pool state required to continue past the record without decoding
    /// it; present once the scanner reached the record's end.
    pub fn skip_pool(&self) -> Option<ConstantPool> {
        self.state.lock().expect("entry state").skip_pool.clone()
    }

    pub fn metadata(&self) -> Option<GraphMetadata> {
        self.state.lock().expect("entry state").metadata.clone()
    }

    fn close(&self, end: u64, skip_pool: ConstantPool, metadata: Option<GraphMetadata>) {
        let mut state = self.state.lock().expect("entry state");
        state.end = Some(end);
        state.skip_pool = Some(skip_pool);
        state.metadata = metadata;
    }
}

/// Serializable one-line report of an index entry.
#[derive(Debug, Serialize)]
pub struct EntrySummary {
    pub kind: EntryKind,
    pub start: u64,
    pub end: Option<u64>,
    pub node_count: u64,
    pub changed_node_count: u64,
    pub edge_count: u32,
    pub duplicate: bool,
}

/// Offset-keyed index of every top-level record of a scanned dump.
/// Written sequentially by the scanner thread, read from completer
/// threads.
#[derive(Debug, Default)]
pub struct StreamIndex {
    entries: Mutex<BTreeMap<u64, Arc<StreamEntry>>>,
}

impl StreamIndex {
    pub fn new() -> Arc<StreamIndex> {
        Arc::new(StreamIndex::default())
    }

    fn insert(&self, entry: Arc<StreamEntry>) {
        self.entries
            .lock()
            .expect("index")
            .insert(entry.start(), entry);
    }

    /// Entry beginning exactly at `start`.
    pub fn get(&self, start: u64) -> Option<Arc<StreamEntry>> {
        self.entries.lock().expect("index").get(&start).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("index").len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().expect("index").is_empty()
    }

    /// Snapshot of all entries in stream order.
    pub fn entries(&self) -> Vec<Arc<StreamEntry>> {
        self.entries.lock().expect("index").values().cloned().collect()
    }

    pub fn summary(&self) -> Vec<EntrySummary> {
        self.entries()
            .iter()
            .map(|entry| {
                let metadata = entry.metadata().unwrap_or_default();
                EntrySummary {
                    kind: entry.kind(),
                    start: entry.start(),
                    end: entry.end(),
                    node_count: metadata.node_ids.len(),
                    changed_node_count: metadata.changed_node_ids.len(),
                    edge_count: metadata.edge_count,
                    duplicate: metadata.is_duplicate,
                }
            })
            .collect()
    }
}

/// A top-level record observed by the scanner: enough to build the lazy
/// skeleton of the document.
#[derive(Clone, Debug)]
pub struct ScannedRoot {
    pub kind: EntryKind,
    pub name: Arc<str>,
    pub short_name: Option<Arc<str>>,
    pub entry: Arc<StreamEntry>,
}

struct OpenEntry {
    entry: Arc<StreamEntry>,
    name: Arc<str>,
    short_name: Option<Arc<str>>,
    metadata: Option<GraphMetadata>,
}

/// [`Builder`] that ignores decoded content and records only the byte
/// ranges of top-level records, pool snapshots at their boundaries and
/// per-graph metadata.  One streaming pass over a gigabyte-class dump
/// leaves behind a [`StreamIndex`] and the root skeleton, nothing else.
pub struct ScanningModelBuilder {
    index: Arc<StreamIndex>,
    roots: Vec<ScannedRoot>,
    version: (u8, u8),
    folder_level: usize,
    graph_depth: usize,
    open: Option<OpenEntry>,
    previous_graph_nodes: Option<RoaringBitmap>,
}

impl ScanningModelBuilder {
    pub fn new(index: Arc<StreamIndex>) -> ScanningModelBuilder {
        ScanningModelBuilder {
            index,
            roots: Vec::new(),
            version: (0, 0),
            folder_level: 0,
            graph_depth: 0,
            open: None,
            previous_graph_nodes: None,
        }
    }

    pub fn index(&self) -> &Arc<StreamIndex> {
        &self.index
    }

    /// All observed top-level records, including one left open by a scan
    /// that ended mid-record (its entry has no end yet and is completed by
    /// the lazy-load retry path).
    pub fn into_roots(self) -> Vec<ScannedRoot> {
        let mut roots = self.roots;
        if let Some(open) = self.open {
            roots.push(ScannedRoot {
                kind: open.entry.kind(),
                name: open.name,
                short_name: open.short_name,
                entry: open.entry,
            });
        }
        roots
    }

    /// Resolves a pending pool fork, keeping the latest data current.
    fn fork(pool: &mut StreamPool) {
        if let Some(latest) = pool.fork_if_needed() {
            *pool = latest;
        }
    }

    fn open_entry(&mut self, kind: EntryKind, pool: &mut StreamPool, pos: u64) {
        Self::fork(pool);
        let entry = StreamEntry::open(
            kind,
            self.version.0,
            self.version.1,
            pos,
            pool.to_constant_pool(),
        );
        self.index.insert(entry.clone());
        self.open = Some(OpenEntry {
            entry,
            name: Arc::from(""),
            short_name: None,
            metadata: (kind == EntryKind::Graph).then(GraphMetadata::default),
        });
    }

    fn close_entry(&mut self, pool: &mut StreamPool, pos: u64) {
        Self::fork(pool);
        let Some(mut open) = self.open.take() else {
            return;
        };
        if let Some(metadata) = open.metadata.as_mut() {
            metadata.changed_node_ids = match &self.previous_graph_nodes {
                Some(previous) => previous ^ &metadata.node_ids,
                None => metadata.node_ids.clone(),
            };
            self.previous_graph_nodes = Some(metadata.node_ids.clone());
        }
        open.entry
            .close(pos, pool.to_constant_pool(), open.metadata.clone());
        self.roots.push(ScannedRoot {
            kind: open.entry.kind(),
            name: open.name,
            short_name: open.short_name,
            entry: open.entry,
        });
    }

    fn counting(&mut self) -> Option<&mut GraphMetadata> {
        if self.graph_depth != 1 {
            return None;
        }
        self.open.as_mut().and_then(|open| open.metadata.as_mut())
    }
}

impl Builder for ScanningModelBuilder {
    fn stream_header(&mut self, major: u8, minor: u8) {
        self.version = (major, minor);
    }

    fn reset_stream_data(&mut self, _pool: &mut StreamPool) {
        self.previous_graph_nodes = None;
    }

    fn start_group(&mut self, pool: &mut StreamPool, pos: u64) -> RootResult {
        if self.folder_level == 0 {
            self.open_entry(EntryKind::Group, pool, pos);
        }
        self.folder_level += 1;
        Ok(())
    }

    fn start_group_content(&mut self, _pool: &mut StreamPool, header: GroupHeader) -> RootResult {
        if self.folder_level == 1
            && let Some(open) = self.open.as_mut()
        {
            open.name = header.name;
            open.short_name = header.short_name;
        }
        Ok(())
    }

    fn end_group(&mut self, pool: &mut StreamPool, pos: u64) {
        self.folder_level -= 1;
        if self.folder_level == 0 {
            self.close_entry(pool, pos);
        }
    }

    fn start_graph(
        &mut self,
        pool: &mut StreamPool,
        pos: u64,
        title: Arc<str>,
        nested: bool,
    ) -> RootResult {
        if !nested && self.folder_level == 0 && self.graph_depth == 0 {
            self.open_entry(EntryKind::Graph, pool, pos);
            if let Some(open) = self.open.as_mut() {
                open.name = title;
            }
        }
        self.graph_depth += 1;
        Ok(())
    }

    fn end_graph(&mut self, pool: &mut StreamPool, pos: u64) {
        self.graph_depth -= 1;
        if self.folder_level == 0 && self.graph_depth == 0 {
            self.close_entry(pool, pos);
        }
    }

    fn mark_graph_duplicate(&mut self) {
        if let Some(metadata) = self.counting() {
            metadata.is_duplicate = true;
        }
    }

    fn start_node(&mut self, id: i32, _has_predecessor: bool, _node_class: Arc<crate::pool::NodeClassData>) {
        if let Some(metadata) = self.counting()
            && id >= 0
        {
            metadata.node_ids.insert(id as u32);
        }
    }

    fn input_edge(&mut self, _edge: RawEdge) {
        if let Some(metadata) = self.counting() {
            metadata.edge_count += 1;
        }
    }

    fn successor_edge(&mut self, _edge: RawEdge) {
        if let Some(metadata) = self.counting() {
            metadata.edge_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{BinaryReader, wire};
    use crate::source::BinarySource;
    use crate::testutil::Bytes;
    use std::io::Cursor;

    fn scan(bytes: Vec<u8>) -> (Arc<StreamIndex>, Vec<ScannedRoot>) {
        let index = StreamIndex::new();
        let builder = ScanningModelBuilder::new(index.clone());
        let source = BinarySource::new(Box::new(Cursor::new(bytes)));
        let mut reader = BinaryReader::new(source, builder);
        reader.parse().unwrap();
        (index, reader.into_builder().into_roots())
    }

    #[test]
    fn ranges_cover_top_level_records_only() {
        let prefix = Bytes::default().header();
        let group_start = prefix.0.len() as u64;
        let b = prefix
            .empty_group_open(0, "outer")
            .empty_group_open(1, "inner")
            .close_group()
            .close_group();
        let total = b.0.len() as u64;
        let (index, roots) = scan(b.0);

        assert_eq!(index.len(), 1);
        assert_eq!(roots.len(), 1);
        let entry = index.get(group_start).expect("outer group indexed");
        assert_eq!(entry.kind(), EntryKind::Group);
        assert_eq!(entry.end(), Some(total));
        assert_eq!(roots[0].name.as_ref(), "outer");
    }

    #[test]
    fn graph_metadata_counts_nodes_and_duplicates() {
        let b = Bytes::default()
            .header()
            // A root graph introduces the node class inline.
            .u8(wire::BEGIN_GRAPH)
            .pool_new_string(0, "first")
            .no_props()
            .i32(1)
            .i32(4)
            .node_class_no_ports(70)
            .u8(0)
            .no_props()
            .i32(0)
            // Two identical siblings by reference.
            .one_node_graph(1, "second", 4, 70)
            .one_node_graph(2, "third", 4, 70);
        let (index, roots) = scan(b.0);
        assert_eq!(roots.len(), 3);
        assert_eq!(index.len(), 3);

        let first = roots[0].entry.metadata().unwrap();
        assert!(first.node_ids.contains(4));
        assert_eq!(first.node_ids.len(), 1);
        assert!(!first.is_duplicate);
        // First graph: everything counts as changed.
        assert_eq!(first.changed_node_ids.len(), 1);

        let second = roots[1].entry.metadata().unwrap();
        assert!(!second.is_duplicate, "payload differs from first");
        let third = roots[2].entry.metadata().unwrap();
        assert!(third.is_duplicate, "identical payload to second");
        assert_eq!(third.changed_node_ids.len(), 0);
    }

    #[test]
    fn changed_nodes_are_symmetric_difference() {
        let b = Bytes::default()
            .header()
            // Graph 1: nodes 1, 2.
            .u8(wire::BEGIN_GRAPH)
            .pool_new_string(0, "a")
            .no_props()
            .i32(2)
            .i32(1)
            .node_class_no_ports(70)
            .u8(0)
            .no_props()
            .i32(2)
            .pool_ref(wire::POOL_NODE_CLASS, 70)
            .u8(0)
            .no_props()
            .i32(0)
            // Graph 2: nodes 2, 3.
            .u8(wire::BEGIN_GRAPH)
            .pool_new_string(1, "b")
            .no_props()
            .i32(2)
            .i32(2)
            .pool_ref(wire::POOL_NODE_CLASS, 70)
            .u8(0)
            .no_props()
            .i32(3)
            .pool_ref(wire::POOL_NODE_CLASS, 70)
            .u8(0)
            .no_props()
            .i32(0);
        let (_, roots) = scan(b.0);
        let meta = roots[1].entry.metadata().unwrap();
        let changed: Vec<u32> = meta.changed_node_ids.iter().collect();
        assert_eq!(changed, vec![1, 3]);
    }

    // A record that reads an index which a
    // later record overwrites still resolves the original value through
    // `initial_pool`; `skip_pool` resolves the new one.
    #[test]
    fn pools_snapshot_overwrites_across_records() {
        let first = Bytes::default()
            .header()
            .u8(wire::BEGIN_GROUP)
            .pool_new_string(0, "A")
            .pool_null()
            .pool_null()
            .i32(0)
            .u16(2)
            .pool_prop(1, "k")
            .pool_new_string(5, "alpha")
            .pool_prop(2, "k2")
            .pool_ref(wire::POOL_STRING, 5) // read of index 5
            .close_group();
        let second_start = first.0.len() as u64;
        let b = first
            .u8(wire::BEGIN_GROUP)
            .pool_ref(wire::POOL_STRING, 0) // reuse name "A"
            .pool_null()
            .pool_null()
            .i32(0)
            .u16(1)
            .pool_prop(3, "k")
            .pool_new_string(5, "beta") // overwrite of a read slot
            .close_group();
        let header_len = 6u64;
        let (index, _) = scan(b.0);

        let entry_a = index.get(header_len).unwrap();
        let entry_b = index.get(second_start).unwrap();

        // A's initial pool predates index 5 entirely.
        assert!(entry_a.initial_pool().get(5, 0).is_err());
        // A's skip pool holds the original value even though B overwrote
        // the slot later.
        let alpha = entry_a.skip_pool().unwrap().get(5, 0).unwrap();
        assert_eq!(alpha.to_string(), "alpha");
        // B decodes from a pool still holding "alpha" and leaves "beta".
        let before_b = entry_b.initial_pool().get(5, 0).unwrap();
        assert_eq!(before_b.to_string(), "alpha");
        let after_b = entry_b.skip_pool().unwrap().get(5, 0).unwrap();
        assert_eq!(after_b.to_string(), "beta");
    }

    #[test]
    fn summary_serializes() {
        let b = Bytes::default()
            .header()
            .empty_group_open(0, "G")
            .close_group();
        let (index, _) = scan(b.0);
        let summary = index.summary();
        assert_eq!(summary.len(), 1);
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"kind\":\"group\""));
    }
}
