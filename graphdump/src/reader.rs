use crate::builder::{Builder, GroupHeader, RawEdge, SkipRoot};
use crate::errors::ReadError;
use crate::model::{PropertyValue, intern};
use crate::pool::{
    EnumKlass, EnumValue, FieldData, InputPort, Klass, MethodData, NodeClassData, PoolKind,
    PoolObject, Port, SignatureData, StreamPool,
};
use crate::source::{BinarySource, ContentDigest, Header};

use itertools::Itertools;
use smallvec::SmallVec;
use std::sync::Arc;

/// Record opcodes and tags of the wire format.
pub(crate) mod wire {
    pub const BEGIN_GROUP: u8 = 0x00;
    pub const BEGIN_GRAPH: u8 = 0x01;
    pub const CLOSE_GROUP: u8 = 0x02;

    pub const POOL_NEW: u8 = 0x00;
    pub const POOL_STRING: u8 = 0x01;
    pub const POOL_ENUM: u8 = 0x02;
    pub const POOL_CLASS: u8 = 0x03;
    pub const POOL_METHOD: u8 = 0x04;
    pub const POOL_NULL: u8 = 0x05;
    pub const POOL_NODE_CLASS: u8 = 0x06;
    pub const POOL_FIELD: u8 = 0x07;
    pub const POOL_SIGNATURE: u8 = 0x08;

    pub const PROPERTY_INT: u8 = 0x01;
    pub const PROPERTY_LONG: u8 = 0x02;
    pub const PROPERTY_FLOAT: u8 = 0x03;
    pub const PROPERTY_DOUBLE: u8 = 0x04;
    pub const PROPERTY_POOL: u8 = 0x05;
    pub const PROPERTY_ARRAY: u8 = 0x06;
    pub const PROPERTY_TRUE: u8 = 0x07;
    pub const PROPERTY_FALSE: u8 = 0x08;
    pub const PROPERTY_SUBGRAPH: u8 = 0x09;

    pub const KLASS: u8 = 0x01;
    pub const ENUM_KLASS: u8 = 0x02;
}

fn pool_kind_for_tag(tag: u8) -> Option<PoolKind> {
    match tag {
        wire::POOL_STRING => Some(PoolKind::String),
        wire::POOL_ENUM => Some(PoolKind::Enum),
        wire::POOL_CLASS => Some(PoolKind::Klass),
        wire::POOL_METHOD => Some(PoolKind::Method),
        wire::POOL_NODE_CLASS => Some(PoolKind::NodeClass),
        wire::POOL_FIELD => Some(PoolKind::Field),
        wire::POOL_SIGNATURE => Some(PoolKind::Signature),
        _ => None,
    }
}

/// Outcome of parsing inside a root record: either a hard failure or a
/// builder's request to jump past the record.
enum RootSignal {
    Error(ReadError),
    Skip(SkipRoot),
}

impl From<ReadError> for RootSignal {
    fn from(e: ReadError) -> Self {
        RootSignal::Error(e)
    }
}

type RootStep<T = ()> = Result<T, RootSignal>;

/// The protocol state machine.
///
/// Consumes records from a [`BinarySource`], threads the shared
/// [`StreamPool`] through every pool reference, and emits semantic events
/// to its [`Builder`].  One reader decodes one stream position; re-reading
/// an indexed range uses a fresh reader over a cloned pool.
pub struct BinaryReader<B: Builder> {
    source: BinarySource,
    builder: B,
    pool: StreamPool,
    folder_level: usize,
    /// One digest slot per open folder, for sibling duplicate detection.
    hash_stack: Vec<Option<ContentDigest>>,
    version: Option<(u8, u8)>,
}

impl<B: Builder> BinaryReader<B> {
    pub fn new(source: BinarySource, builder: B) -> Self {
        Self::with_pool(source, builder, StreamPool::new())
    }

    pub fn with_pool(source: BinarySource, builder: B, pool: StreamPool) -> Self {
        BinaryReader {
            source,
            builder,
            pool,
            folder_level: 0,
            hash_stack: Vec::new(),
            version: None,
        }
    }

    /// Installs the declared dump version directly.  Required when decoding
    /// an indexed sub-range, which carries no magic prefix.
    pub fn set_version(&mut self, major: u8, minor: u8) {
        self.version = Some((major, minor));
    }

    pub fn version(&self) -> Option<(u8, u8)> {
        self.version
    }

    pub fn builder(&self) -> &B {
        &self.builder
    }

    pub fn into_builder(self) -> B {
        self.builder
    }

    /// Parses records until the channel is exhausted.  EOF at a record
    /// boundary is the normal terminator; dangling groups are closed.
    /// A `BIGV` header appearing between records starts a concatenated
    /// stream: open groups are closed and pool state is discarded.
    pub fn parse(&mut self) -> Result<(), ReadError> {
        self.builder.start_document();
        self.hash_stack.clear();
        self.hash_stack.push(None);
        let mut first = true;
        loop {
            match self.source.read_header()? {
                Header::Eof => break,
                Header::Stream { major, minor } => {
                    if !first {
                        self.close_dangling_groups();
                        self.pool.restart();
                        self.builder.reset_stream_data(&mut self.pool);
                        self.hash_stack.clear();
                        self.hash_stack.push(None);
                    }
                    self.version = Some((major, minor));
                    self.builder.stream_header(major, minor);
                }
                Header::Absent => {
                    if first && self.version.is_none() {
                        return Err(ReadError::protocol(
                            self.source.mark(),
                            "stream does not begin with the BIGV magic",
                        ));
                    }
                }
            }
            first = false;
            let Some(op) = self.source.try_read_byte()? else {
                break;
            };
            match self.parse_root(op) {
                Ok(()) => {}
                Err(RootSignal::Skip(skip)) => self.skip_root(skip)?,
                Err(RootSignal::Error(e)) => return Err(e),
            }
        }
        self.close_dangling_groups();
        self.builder.end_document();
        Ok(())
    }

    fn close_dangling_groups(&mut self) {
        while self.folder_level > 0 {
            self.folder_level -= 1;
            self.hash_stack.pop();
            self.builder.end_group(&mut self.pool, self.source.mark());
        }
    }

    fn skip_root(&mut self, skip: SkipRoot) -> Result<(), ReadError> {
        debug!(
            "skipping root record [{}, {}) at level {}",
            skip.start, skip.end, self.folder_level
        );
        self.source.skip_to(skip.end)?;
        if let Some(constants) = skip.pool {
            self.pool = StreamPool::resuming(constants, self.pool.generation() + 1);
        }
        Ok(())
    }

    fn parse_root(&mut self, op: u8) -> RootStep {
        // The opcode byte is already consumed.
        let start = self.source.mark() - 1;
        match op {
            wire::BEGIN_GROUP => self.parse_group(start),
            wire::BEGIN_GRAPH => {
                let title = self.read_pool_string()?;
                self.parse_graph(start, title, false)
            }
            wire::CLOSE_GROUP => {
                if self.folder_level == 0 {
                    return Err(ReadError::UnbalancedGroups { offset: start }.into());
                }
                self.folder_level -= 1;
                self.hash_stack.pop();
                self.builder.end_group(&mut self.pool, self.source.mark());
                Ok(())
            }
            other => Err(ReadError::protocol(
                start,
                format!("unknown top-level opcode {other:#04x}"),
            )
            .into()),
        }
    }

    fn parse_group(&mut self, start: u64) -> RootStep {
        self.builder
            .start_group(&mut self.pool, start)
            .map_err(RootSignal::Skip)?;
        let name = self.read_pool_string()?;
        let short_name = self.read_pool_string_opt()?;
        let method = self.read_pool_method_opt()?;
        let bci = self.source.read_int()?;
        let header = GroupHeader {
            name,
            short_name,
            method,
            bci,
        };
        let content = self.builder.start_group_content(&mut self.pool, header);
        // Group bookkeeping happens even when the contents are skipped, so
        // the record decodes to an empty shell closed by its CLOSE_GROUP.
        self.hash_stack.push(None);
        self.folder_level += 1;
        content.map_err(RootSignal::Skip)?;
        self.parse_properties()?;
        Ok(())
    }

    fn parse_graph(&mut self, start: u64, title: Arc<str>, nested: bool) -> RootStep {
        self.builder
            .start_graph(&mut self.pool, start, title, nested)
            .map_err(RootSignal::Skip)?;
        self.parse_properties()?;
        if !nested {
            self.source.start_digest();
        }
        self.parse_nodes()?;
        self.builder.make_graph_edges();
        self.parse_blocks()?;
        self.builder.make_block_edges();
        if !nested {
            let digest = self.source.finish_digest();
            let top = self.hash_stack.last_mut().expect("document digest slot");
            if *top == Some(digest) {
                self.builder.mark_graph_duplicate();
            } else {
                *top = Some(digest);
            }
        }
        self.builder.end_graph(&mut self.pool, self.source.mark());
        Ok(())
    }

    fn parse_properties(&mut self) -> RootStep {
        let count = self.source.read_ushort()?;
        for _ in 0..count {
            let key = self.read_pool_string()?;
            self.parse_property_value(key)?;
        }
        Ok(())
    }

    fn parse_property_value(&mut self, key: Arc<str>) -> RootStep {
        let offset = self.source.mark();
        let tag = self.source.read_byte()?;
        let value = match tag {
            wire::PROPERTY_INT => PropertyValue::Int(self.source.read_int()?),
            wire::PROPERTY_LONG => PropertyValue::Long(self.source.read_long()?),
            wire::PROPERTY_FLOAT => PropertyValue::Float(self.source.read_float()?),
            wire::PROPERTY_DOUBLE => PropertyValue::Double(self.source.read_double()?),
            wire::PROPERTY_TRUE => PropertyValue::Bool(true),
            wire::PROPERTY_FALSE => PropertyValue::Bool(false),
            wire::PROPERTY_POOL => match self.read_pool_object(PoolKind::Any)? {
                Some(PoolObject::Str(s)) => PropertyValue::Str(s),
                Some(object) => PropertyValue::Object(object),
                // A null value leaves the property unset.
                None => return Ok(()),
            },
            wire::PROPERTY_ARRAY => PropertyValue::Str(intern(&self.parse_array_body()?)),
            wire::PROPERTY_SUBGRAPH => {
                self.builder.start_nested_property(key);
                let start = self.source.mark();
                self.parse_graph(start, intern(""), true)?;
                return Ok(());
            }
            other => {
                return Err(ReadError::protocol(
                    offset,
                    format!("unknown property type {other:#04x}"),
                )
                .into());
            }
        };
        self.builder.property(key, value);
        Ok(())
    }

    fn parse_array_body(&mut self) -> Result<String, ReadError> {
        let offset = self.source.mark();
        let subtag = self.source.read_byte()?;
        match subtag {
            wire::PROPERTY_INT => self.source.read_ints_to_string(),
            wire::PROPERTY_DOUBLE => self.source.read_doubles_to_string(),
            wire::PROPERTY_POOL => {
                let len = self.source.read_int()?;
                if len < 0 {
                    return Err(ReadError::protocol(offset, "negative array length"));
                }
                let mut values = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    values.push(match self.read_pool_object(PoolKind::Any)? {
                        Some(object) => object.to_string(),
                        None => "null".to_string(),
                    });
                }
                Ok(format!("[{}]", values.iter().join(", ")))
            }
            other => Err(ReadError::protocol(
                offset,
                format!("unknown array element type {other:#04x}"),
            )),
        }
    }

    fn parse_nodes(&mut self) -> RootStep {
        let count = self.source.read_int()?;
        for _ in 0..count {
            let id = self.source.read_int()?;
            let offset = self.source.mark();
            let node_class = match self.read_pool_object(PoolKind::NodeClass)? {
                Some(PoolObject::NodeClass(nc)) => nc,
                _ => {
                    return Err(
                        ReadError::protocol(offset, "node without node class").into()
                    );
                }
            };
            let has_predecessor = self.source.read_byte()? != 0;
            self.builder.start_node(id, has_predecessor, node_class.clone());
            self.parse_properties()?;
            self.parse_input_edges(id, &node_class)?;
            self.parse_successor_edges(id, &node_class)?;
            self.builder.end_node(id);
        }
        Ok(())
    }

    fn parse_input_edges(&mut self, id: i32, node_class: &NodeClassData) -> RootStep {
        let mut slot: u16 = 0;
        for port in node_class.inputs.iter() {
            let edge_type = port
                .input_type
                .as_ref()
                .map(|value| intern(value.label()));
            if port.is_list {
                let size = self.source.read_ushort()?;
                for element in 0..size {
                    let peer = self.source.read_int()?;
                    if peer >= 0 {
                        self.builder.input_edge(RawEdge {
                            label: intern(&format!("{}[{element}]", port.name)),
                            from: peer,
                            to: id,
                            index: slot,
                            edge_type: edge_type.clone(),
                        });
                    }
                    slot += 1;
                }
            } else {
                let peer = self.source.read_int()?;
                if peer >= 0 {
                    self.builder.input_edge(RawEdge {
                        label: port.name.clone(),
                        from: peer,
                        to: id,
                        index: slot,
                        edge_type: edge_type.clone(),
                    });
                }
                slot += 1;
            }
        }
        Ok(())
    }

    fn parse_successor_edges(&mut self, id: i32, node_class: &NodeClassData) -> RootStep {
        let mut slot: u16 = 0;
        for port in node_class.successors.iter() {
            if port.is_list {
                let size = self.source.read_ushort()?;
                for element in 0..size {
                    let peer = self.source.read_int()?;
                    if peer >= 0 {
                        self.builder.successor_edge(RawEdge {
                            label: intern(&format!("{}[{element}]", port.name)),
                            from: id,
                            to: peer,
                            index: slot,
                            edge_type: None,
                        });
                    }
                    slot += 1;
                }
            } else {
                let peer = self.source.read_int()?;
                if peer >= 0 {
                    self.builder.successor_edge(RawEdge {
                        label: port.name.clone(),
                        from: id,
                        to: peer,
                        index: slot,
                        edge_type: None,
                    });
                }
                slot += 1;
            }
        }
        Ok(())
    }

    fn parse_blocks(&mut self) -> RootStep {
        let count = self.source.read_int()?;
        for _ in 0..count {
            let id = self.source.read_int()?;
            self.builder.start_block(id);
            let node_count = self.source.read_int()?;
            for _ in 0..node_count {
                let node = self.source.read_int()?;
                if node >= 0 {
                    self.builder.block_node(node);
                }
            }
            self.builder.end_block(id);
            let edge_count = self.source.read_int()?;
            for _ in 0..edge_count {
                let dest = self.source.read_int()?;
                self.builder.block_edge(id, dest);
            }
        }
        Ok(())
    }

    // Pool reference decoding.

    fn read_pool_string(&mut self) -> Result<Arc<str>, ReadError> {
        let offset = self.source.mark();
        match self.read_pool_object(PoolKind::String)? {
            Some(PoolObject::Str(s)) => Ok(s),
            _ => Err(ReadError::protocol(offset, "expected a string pool entry")),
        }
    }

    fn read_pool_string_opt(&mut self) -> Result<Option<Arc<str>>, ReadError> {
        let offset = self.source.mark();
        match self.read_pool_object(PoolKind::String)? {
            Some(PoolObject::Str(s)) => Ok(Some(s)),
            None => Ok(None),
            _ => Err(ReadError::protocol(offset, "expected a string pool entry")),
        }
    }

    fn read_pool_method_opt(&mut self) -> Result<Option<Arc<MethodData>>, ReadError> {
        let offset = self.source.mark();
        match self.read_pool_object(PoolKind::Method)? {
            Some(PoolObject::Method(m)) => Ok(Some(m)),
            None => Ok(None),
            _ => Err(ReadError::protocol(offset, "expected a method pool entry")),
        }
    }

    fn read_pool_klass(&mut self) -> Result<Arc<Klass>, ReadError> {
        let offset = self.source.mark();
        match self.read_pool_object(PoolKind::Klass)? {
            Some(PoolObject::Klass(k)) => Ok(k),
            // An enum class can legally appear where a plain class is
            // expected, e.g. as a method or field holder.
            Some(PoolObject::EnumKlass(ek)) => Ok(Arc::new(Klass::new(ek.name.clone()))),
            _ => Err(ReadError::protocol(offset, "expected a class pool entry")),
        }
    }

    /// Decodes one pool reference: null, a new definition installed at its
    /// index, or a lookup whose kind tag is asserted against `expected`.
    fn read_pool_object(&mut self, expected: PoolKind) -> Result<Option<PoolObject>, ReadError> {
        let offset = self.source.mark();
        let tag = self.source.read_byte()?;
        match tag {
            wire::POOL_NULL => Ok(None),
            wire::POOL_NEW => {
                let index = self.source.read_ushort()?;
                let type_tag = self.source.read_byte()?;
                let object = self.parse_pool_payload(type_tag)?;
                if !object.matches(expected) {
                    return Err(ReadError::protocol(
                        offset,
                        format!("pool entry is a {}, expected {expected}", object.kind()),
                    ));
                }
                Ok(Some(self.pool.add_pool_entry(index, object, offset)))
            }
            kind_tag => {
                let kind = pool_kind_for_tag(kind_tag).ok_or_else(|| {
                    ReadError::protocol(offset, format!("unknown pool kind {kind_tag:#04x}"))
                })?;
                if expected != PoolKind::Any && kind != expected {
                    return Err(ReadError::protocol(
                        offset,
                        format!("pool reference is a {kind}, expected {expected}"),
                    ));
                }
                let index = self.source.read_ushort()?;
                let object = self.pool.get(index, offset)?;
                if !object.matches(kind) {
                    return Err(ReadError::protocol(
                        offset,
                        format!(
                            "pool index {index} holds a {}, reference says {kind}",
                            object.kind()
                        ),
                    ));
                }
                Ok(Some(object))
            }
        }
    }

    fn parse_pool_payload(&mut self, type_tag: u8) -> Result<PoolObject, ReadError> {
        let offset = self.source.mark();
        match type_tag {
            wire::POOL_STRING => {
                let s = self.source.read_string()?;
                Ok(PoolObject::Str(intern(&s)))
            }
            wire::POOL_CLASS => {
                let name = self.source.read_string()?;
                let klass_type = self.source.read_byte()?;
                match klass_type {
                    wire::KLASS => Ok(PoolObject::Klass(Arc::new(Klass::new(name)))),
                    wire::ENUM_KLASS => {
                        let len = self.source.read_int()?;
                        if len < 0 {
                            return Err(ReadError::protocol(offset, "negative enum length"));
                        }
                        let mut values = Vec::with_capacity(len as usize);
                        for _ in 0..len {
                            values.push(self.read_pool_string()?);
                        }
                        Ok(PoolObject::EnumKlass(Arc::new(EnumKlass {
                            name: intern(&name),
                            values,
                        })))
                    }
                    other => Err(ReadError::protocol(
                        offset,
                        format!("unknown klass type {other:#04x}"),
                    )),
                }
            }
            wire::POOL_ENUM => {
                let klass = match self.read_pool_object(PoolKind::Klass)? {
                    Some(PoolObject::EnumKlass(ek)) => ek,
                    _ => {
                        return Err(ReadError::protocol(
                            offset,
                            "enum value requires an enum class",
                        ));
                    }
                };
                let ordinal = self.source.read_int()?;
                Ok(PoolObject::EnumValue(Arc::new(EnumValue { klass, ordinal })))
            }
            wire::POOL_METHOD => {
                let holder = self.read_pool_klass()?;
                let name = self.read_pool_string()?;
                let signature = match self.read_pool_object(PoolKind::Signature)? {
                    Some(PoolObject::Signature(s)) => s,
                    _ => {
                        return Err(ReadError::protocol(offset, "method without signature"));
                    }
                };
                let flags = self.source.read_int()?;
                let code = self.source.read_bytes()?;
                Ok(PoolObject::Method(Arc::new(MethodData {
                    holder,
                    name,
                    signature,
                    code,
                    flags,
                })))
            }
            wire::POOL_FIELD => {
                let holder = self.read_pool_klass()?;
                let name = self.read_pool_string()?;
                let field_type = self.read_pool_string()?;
                let flags = self.source.read_int()?;
                Ok(PoolObject::Field(Arc::new(FieldData {
                    holder,
                    name,
                    field_type,
                    flags,
                })))
            }
            wire::POOL_SIGNATURE => {
                let argc = self.source.read_ushort()?;
                let mut arg_types = Vec::with_capacity(argc as usize);
                for _ in 0..argc {
                    arg_types.push(self.read_pool_string()?);
                }
                let return_type = self.read_pool_string()?;
                Ok(PoolObject::Signature(Arc::new(SignatureData {
                    arg_types,
                    return_type,
                })))
            }
            wire::POOL_NODE_CLASS => {
                let class_name = self.source.read_string()?;
                let name_template = self.source.read_string()?;
                let input_count = self.source.read_ushort()?;
                let mut inputs = SmallVec::new();
                for _ in 0..input_count {
                    let is_list = self.source.read_byte()? != 0;
                    let name = self.read_pool_string()?;
                    let input_type = match self.read_pool_object(PoolKind::Enum)? {
                        Some(PoolObject::EnumValue(v)) => Some(v),
                        None => None,
                        _ => {
                            return Err(ReadError::protocol(
                                offset,
                                "input port type must be an enum value",
                            ));
                        }
                    };
                    inputs.push(InputPort {
                        name,
                        is_list,
                        input_type,
                    });
                }
                let sux_count = self.source.read_ushort()?;
                let mut successors = SmallVec::new();
                for _ in 0..sux_count {
                    let is_list = self.source.read_byte()? != 0;
                    let name = self.read_pool_string()?;
                    successors.push(Port { name, is_list });
                }
                Ok(PoolObject::NodeClass(Arc::new(NodeClassData {
                    class_name: intern(&class_name),
                    name_template: intern(&name_template),
                    inputs,
                    successors,
                })))
            }
            other => Err(ReadError::protocol(
                offset,
                format!("unknown pool type {other:#04x}"),
            )),
        }
    }
}
