use crate::builder::{Builder, GroupHeader, RawEdge, RootResult};
use crate::model::{
    BlockEdge, EdgeKind, FolderElement, GraphDocument, Group, InputBlock, InputEdge, InputGraph,
    InputNode, PROPERTY_DUPLICATE, Properties, PropertyValue, intern,
};
use crate::pool::{MethodData, NameLength, NodeClassData, StreamPool};

use itertools::Itertools;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;

/// Property keys the builder itself assigns on nodes.  User-supplied keys
/// that collide are stored under a `!data.` prefix instead.
const SYSTEM_KEYS: [&str; 6] = ["hasPredecessor", "name", "class", "id", "idx", "block"];

#[derive(Default)]
struct PartialGroup {
    name: Arc<str>,
    short_name: Option<Arc<str>>,
    method: Option<Arc<MethodData>>,
    bci: i32,
    properties: Properties,
    elements: Vec<FolderElement>,
}

struct NodeCtx {
    id: i32,
    has_predecessor: bool,
    node_class: Arc<NodeClassData>,
    properties: Properties,
    input_edges: Vec<RawEdge>,
}

#[derive(Default)]
struct GraphCtx {
    name: Arc<str>,
    /// Property key this graph is the value of, when parsed as a nested
    /// subgraph property.
    nested_key: Option<Arc<str>>,
    properties: Properties,
    nodes: BTreeMap<i32, InputNode>,
    node: Option<NodeCtx>,
    input_edges: Vec<RawEdge>,
    successor_edges: Vec<RawEdge>,
    edges: Vec<InputEdge>,
    blocks: Vec<InputBlock>,
    current_block: Option<(i32, Vec<i32>)>,
    raw_block_edges: Vec<(i32, i32)>,
}

/// Default [`Builder`]: materializes every event into the full in-memory
/// model.
///
/// Maintains a stack of parse contexts mirroring the nesting of the stream:
/// open groups, open graphs (subgraph properties nest arbitrarily) and the
/// node currently being decoded.  Every `end_*` restores the previous
/// context exactly.
#[derive(Default)]
pub struct ModelBuilder {
    document: GraphDocument,
    folders: Vec<PartialGroup>,
    graphs: Vec<GraphCtx>,
    nested_keys: Vec<Arc<str>>,
}

impl ModelBuilder {
    pub fn new() -> ModelBuilder {
        ModelBuilder::default()
    }

    pub fn into_document(self) -> GraphDocument {
        self.document
    }

    pub fn document(&self) -> &GraphDocument {
        &self.document
    }

    fn attach(&mut self, element: FolderElement) {
        match self.folders.last_mut() {
            Some(folder) => folder.elements.push(element),
            None => self.document.elements.push(element),
        }
    }

    fn finish_graph(&mut self, ctx: GraphCtx) {
        let node_to_block = ctx.blocks_to_nodes().into_iter().collect();
        let block_edges = ctx
            .raw_block_edges
            .iter()
            .map(|(from, to)| BlockEdge {
                from: intern(&from.to_string()),
                to: intern(&to.to_string()),
            })
            .collect();
        let nested_key = ctx.nested_key;
        let graph = Arc::new(InputGraph {
            name: ctx.name,
            properties: ctx.properties,
            nodes: ctx.nodes,
            edges: ctx.edges,
            blocks: ctx.blocks,
            block_edges,
            node_to_block,
        });
        match nested_key {
            Some(key) => {
                let value = PropertyValue::Graph(graph);
                match self.graphs.last_mut() {
                    Some(outer) => match outer.node.as_mut() {
                        Some(node) => node.properties.set(node_key(&key), value),
                        None => outer.properties.set(key, value),
                    },
                    None => match self.folders.last_mut() {
                        Some(folder) => folder.properties.set(key, value),
                        None => self.document.properties.set(key, value),
                    },
                }
            }
            None => self.attach(FolderElement::Graph(graph)),
        }
    }
}

impl GraphCtx {
    fn blocks_to_nodes(&self) -> Vec<(i32, Arc<str>)> {
        let mut assignment = Vec::new();
        for block in &self.blocks {
            for node in &block.nodes {
                assignment.push((*node, block.name.clone()));
            }
        }
        assignment
    }
}

/// Key under which a user-supplied node property is stored, dodging the
/// system keys the builder assigns itself.
fn node_key(key: &Arc<str>) -> Arc<str> {
    if SYSTEM_KEYS.contains(&key.as_ref()) {
        intern(&format!("!data.{key}"))
    } else {
        key.clone()
    }
}

/// True when an input-edge label belongs to the template port `name`: the
/// bare name or the name followed by a single `[index]` suffix.
fn label_matches_port(label: &str, name: &str) -> bool {
    match label.strip_prefix(name) {
        Some("") => true,
        Some(rest) => rest.starts_with('[') && rest.ends_with(']'),
        None => false,
    }
}

/// Expands a node-name template.  `{p#NAME}` substitutes the property
/// `NAME`, with an optional `/l`, `/m` or `/s` length modifier honoured by
/// length-sensitive values; `{i#NAME}` substitutes the comma-joined source
/// ids of the input edges on port `NAME`.  Substituted text is inserted
/// literally.
pub(crate) fn expand_node_name(
    template: &str,
    properties: &Properties,
    input_edges: &[RawEdge],
) -> String {
    let mut out = String::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        rest = &rest[open + 1..];
        let Some(close) = rest.find('}') else {
            out.push('{');
            break;
        };
        let token = &rest[..close];
        rest = &rest[close + 1..];
        if let Some(spec) = token.strip_prefix("p#") {
            let (name, length) = match spec.split_once('/') {
                Some((name, "s")) => (name, Some(NameLength::Short)),
                Some((name, "m")) => (name, Some(NameLength::Medium)),
                Some((name, "l")) => (name, Some(NameLength::Long)),
                Some((name, _)) => (name, None),
                None => (spec, None),
            };
            match properties.get(name) {
                Some(value) => match length {
                    Some(length) => out.push_str(&value.text_with_length(length)),
                    None => out.push_str(&value.to_string()),
                },
                None => out.push('?'),
            }
        } else if let Some(name) = token.strip_prefix("i#") {
            let ids = input_edges
                .iter()
                .filter(|edge| label_matches_port(&edge.label, name))
                .map(|edge| edge.from.to_string())
                .join(", ");
            out.push_str(&ids);
        } else {
            // Unknown token: keep it visible rather than dropping it.
            out.push('{');
            out.push_str(token);
            out.push('}');
        }
    }
    out.push_str(rest);
    out
}

impl Builder for ModelBuilder {
    fn start_group(&mut self, _pool: &mut StreamPool, _pos: u64) -> RootResult {
        self.folders.push(PartialGroup::default());
        Ok(())
    }

    fn start_group_content(&mut self, _pool: &mut StreamPool, header: GroupHeader) -> RootResult {
        let group = self.folders.last_mut().expect("open group");
        group.name = header.name;
        group.short_name = header.short_name;
        group.method = header.method;
        group.bci = header.bci;
        Ok(())
    }

    fn end_group(&mut self, _pool: &mut StreamPool, _pos: u64) {
        let partial = self.folders.pop().expect("open group");
        let group = Arc::new(Group {
            name: partial.name,
            short_name: partial.short_name,
            method: partial.method,
            bci: partial.bci,
            properties: partial.properties,
            elements: partial.elements,
        });
        self.attach(FolderElement::Group(group));
    }

    fn start_graph(
        &mut self,
        _pool: &mut StreamPool,
        _pos: u64,
        title: Arc<str>,
        nested: bool,
    ) -> RootResult {
        let nested_key = if nested { self.nested_keys.pop() } else { None };
        self.graphs.push(GraphCtx {
            name: title,
            nested_key,
            ..GraphCtx::default()
        });
        Ok(())
    }

    fn end_graph(&mut self, _pool: &mut StreamPool, _pos: u64) {
        let ctx = self.graphs.pop().expect("open graph");
        self.finish_graph(ctx);
    }

    fn mark_graph_duplicate(&mut self) {
        let graph = self.graphs.last_mut().expect("open graph");
        graph
            .properties
            .set(intern(PROPERTY_DUPLICATE), PropertyValue::Bool(true));
    }

    fn property(&mut self, key: Arc<str>, value: PropertyValue) {
        match self.graphs.last_mut() {
            Some(graph) => match graph.node.as_mut() {
                Some(node) => node.properties.set(node_key(&key), value),
                None => graph.properties.set(key, value),
            },
            None => match self.folders.last_mut() {
                Some(folder) => folder.properties.set(key, value),
                None => self.document.properties.set(key, value),
            },
        }
    }

    fn start_nested_property(&mut self, key: Arc<str>) {
        self.nested_keys.push(key);
    }

    fn start_node(&mut self, id: i32, has_predecessor: bool, node_class: Arc<NodeClassData>) {
        let graph = self.graphs.last_mut().expect("open graph");
        graph.node = Some(NodeCtx {
            id,
            has_predecessor,
            node_class,
            properties: Properties::new(),
            input_edges: Vec::new(),
        });
    }

    fn end_node(&mut self, id: i32) {
        let graph = self.graphs.last_mut().expect("open graph");
        let mut node = graph.node.take().expect("open node");
        debug_assert_eq!(node.id, id);

        let template = node.node_class.name_template.clone();
        let name = if template.is_empty() {
            node.node_class.simple_name().to_string()
        } else {
            expand_node_name(&template, &node.properties, &node.input_edges)
        };
        node.properties.set(intern("name"), PropertyValue::Str(intern(&name)));
        node.properties.set(
            intern("class"),
            PropertyValue::Str(node.node_class.class_name.clone()),
        );
        node.properties.set(intern("id"), PropertyValue::Int(id));
        if node.has_predecessor {
            node.properties
                .set(intern("hasPredecessor"), PropertyValue::Bool(true));
        }

        graph.input_edges.append(&mut node.input_edges);
        graph.nodes.insert(
            id,
            InputNode {
                id,
                properties: node.properties,
            },
        );
    }

    fn input_edge(&mut self, edge: RawEdge) {
        let graph = self.graphs.last_mut().expect("open graph");
        match graph.node.as_mut() {
            Some(node) => node.input_edges.push(edge),
            None => graph.input_edges.push(edge),
        }
    }

    fn successor_edge(&mut self, edge: RawEdge) {
        let graph = self.graphs.last_mut().expect("open graph");
        graph.successor_edges.push(edge);
    }

    fn make_graph_edges(&mut self) {
        let graph = self.graphs.last_mut().expect("open graph");
        // Nodes with at least one successor expose their control port at
        // index 0, shifting data outputs to port 1.
        let has_successor: HashSet<i32> =
            graph.successor_edges.iter().map(|edge| edge.from).collect();
        let inputs: Vec<InputEdge> = graph
            .input_edges
            .drain(..)
            .map(|edge| InputEdge {
                kind: EdgeKind::Input,
                from: edge.from,
                to: edge.to,
                from_index: u16::from(has_successor.contains(&edge.from)),
                to_index: edge.index,
                label: edge.label,
                edge_type: edge.edge_type,
            })
            .collect();
        let successors: Vec<InputEdge> = graph
            .successor_edges
            .drain(..)
            .map(|edge| InputEdge {
                kind: EdgeKind::Successor,
                from: edge.from,
                to: edge.to,
                from_index: 0,
                to_index: edge.index,
                label: edge.label,
                edge_type: None,
            })
            .collect();
        graph.edges = inputs;
        graph.edges.extend(successors);
    }

    fn start_block(&mut self, id: i32) {
        let graph = self.graphs.last_mut().expect("open graph");
        graph.current_block = Some((id, Vec::new()));
    }

    fn block_node(&mut self, node_id: i32) {
        let graph = self.graphs.last_mut().expect("open graph");
        if let Some((_, nodes)) = graph.current_block.as_mut() {
            nodes.push(node_id);
        }
    }

    fn block_edge(&mut self, from: i32, to: i32) {
        let graph = self.graphs.last_mut().expect("open graph");
        graph.raw_block_edges.push((from, to));
    }

    fn end_block(&mut self, id: i32) {
        let graph = self.graphs.last_mut().expect("open graph");
        let (block_id, nodes) = graph.current_block.take().expect("open block");
        debug_assert_eq!(block_id, id);
        graph.blocks.push(InputBlock {
            name: intern(&id.to_string()),
            nodes,
        });
    }

    fn make_block_edges(&mut self) {
        let graph = self.graphs.last_mut().expect("open graph");
        // Stamp the block assignment onto the nodes, which are complete by
        // the time blocks arrive.
        let assignment = graph.blocks_to_nodes();
        for (node_id, block_name) in assignment {
            if let Some(node) = graph.nodes.get_mut(&node_id) {
                node.properties
                    .set(intern("block"), PropertyValue::Str(block_name));
            }
        }
    }
}

/// Fully materializes a dump into a [`GraphDocument`].  For gigabyte-class
/// traces prefer [`scan_file`](crate::scan_file), which indexes without
/// retaining contents.
pub fn read_content(content: crate::cache::CachedContent) -> Result<GraphDocument, crate::errors::ReadError> {
    let source = crate::source::BinarySource::new(Box::new(content.channel()));
    let mut reader = crate::reader::BinaryReader::new(source, ModelBuilder::new());
    reader.parse()?;
    Ok(reader.into_builder().into_document())
}

/// Maps and fully reads a dump file.
pub fn read_file(
    path: impl AsRef<std::path::Path>,
) -> Result<GraphDocument, crate::errors::ReadError> {
    read_content(crate::cache::CachedContent::open(path)?)
}

/// Fully reads an in-memory dump.
pub fn read_bytes(bytes: Vec<u8>) -> Result<GraphDocument, crate::errors::ReadError> {
    read_content(crate::cache::CachedContent::from_bytes(bytes))
}
