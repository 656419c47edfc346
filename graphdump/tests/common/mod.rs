//! Standalone wire-format writer for the end-to-end scenarios.

#![allow(dead_code)]

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

pub const PROPERTY_POOL: u8 = 0x05;

/// Emits the dump wire format with explicit control over pool indices and
/// record boundaries.
#[derive(Default, Clone)]
pub struct DumpWriter {
    pub bytes: Vec<u8>,
}

impl DumpWriter {
    pub fn new() -> DumpWriter {
        DumpWriter::default()
    }

    /// Current length, i.e. the offset of whatever is written next.
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn header(&mut self) -> &mut Self {
        self.bytes.extend(b"BIGV");
        self.bytes.extend([1u8, 0u8]);
        self
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.bytes.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.bytes.extend(v.to_be_bytes());
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.bytes.extend(v.to_be_bytes());
        self
    }

    pub fn str_inline(&mut self, s: &str) -> &mut Self {
        self.bytes.extend((s.len() as i32).to_be_bytes());
        self.bytes.extend(s.as_bytes());
        self
    }

    pub fn pool_new_string(&mut self, index: u16, s: &str) -> &mut Self {
        self.u8(POOL_NEW).u16(index).u8(POOL_STRING).str_inline(s)
    }

    pub fn pool_ref(&mut self, kind: u8, index: u16) -> &mut Self {
        self.u8(kind).u16(index)
    }

    pub fn pool_null(&mut self) -> &mut Self {
        self.u8(POOL_NULL)
    }

    /// BEGIN_GROUP header with `props` pending property pairs to follow.
    pub fn group_open_with_props(&mut self, name_index: u16, name: &str, props: u16) -> &mut Self {
        self.u8(BEGIN_GROUP)
            .pool_new_string(name_index, name)
            .pool_null()
            .pool_null()
            .i32(0)
            .u16(props)
    }

    pub fn group_open(&mut self, name_index: u16, name: &str) -> &mut Self {
        self.group_open_with_props(name_index, name, 0)
    }

    pub fn close_group(&mut self) -> &mut Self {
        self.u8(CLOSE_GROUP)
    }

    /// A property whose value introduces a fresh pool string.
    pub fn string_prop(
        &mut self,
        key_index: u16,
        key: &str,
        value_index: u16,
        value: &str,
    ) -> &mut Self {
        self.pool_new_string(key_index, key)
            .u8(PROPERTY_POOL)
            .pool_new_string(value_index, value)
    }

    /// A property whose value references an existing pool string (a read).
    pub fn string_prop_ref(&mut self, key_index: u16, key: &str, value_index: u16) -> &mut Self {
        self.pool_new_string(key_index, key)
            .u8(PROPERTY_POOL)
            .pool_ref(POOL_STRING, value_index)
    }

    /// Installs a port-less node class `N` at `index`, usable as a
    /// property value.
    pub fn node_class_no_ports(&mut self, index: u16) -> &mut Self {
        self.u8(POOL_NEW)
            .u16(index)
            .u8(POOL_NODE_CLASS)
            .str_inline("N")
            .str_inline("")
            .u16(0)
            .u16(0)
    }

    /// A graph with one port-less node referencing the class at
    /// `class_index`, and no blocks.
    pub fn one_node_graph(
        &mut self,
        title_index: u16,
        title: &str,
        node_id: i32,
        class_index: u16,
    ) -> &mut Self {
        self.u8(BEGIN_GRAPH)
            .pool_new_string(title_index, title)
            .u16(0)
            .i32(1)
            .i32(node_id)
            .pool_ref(POOL_NODE_CLASS, class_index)
            .u8(0)
            .u16(0)
            .i32(0)
    }
}
