//! Wire-format byte writer shared by unit tests.

use crate::reader::wire;
use crate::source::{MAGIC, MAJOR_VERSION, MINOR_VERSION};

/// Chainable builder emitting the dump wire format, with explicit control
/// over pool indices.
#[derive(Default, Clone)]
pub(crate) struct Bytes(pub Vec<u8>);

impl Bytes {
    pub fn header(mut self) -> Self {
        self.0.extend(MAGIC);
        self.0.extend([MAJOR_VERSION, MINOR_VERSION]);
        self
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.0.push(v);
        self
    }

    pub fn u16(mut self, v: u16) -> Self {
        self.0.extend(v.to_be_bytes());
        self
    }

    pub fn i32(mut self, v: i32) -> Self {
        self.0.extend(v.to_be_bytes());
        self
    }

    pub fn str_inline(mut self, s: &str) -> Self {
        self.0.extend((s.len() as i32).to_be_bytes());
        self.0.extend(s.as_bytes());
        self
    }

    pub fn pool_new_string(self, index: u16, s: &str) -> Self {
        self.u8(wire::POOL_NEW)
            .u16(index)
            .u8(wire::POOL_STRING)
            .str_inline(s)
    }

    pub fn pool_ref(self, kind: u8, index: u16) -> Self {
        self.u8(kind).u16(index)
    }

    pub fn pool_null(self) -> Self {
        self.u8(wire::POOL_NULL)
    }

    pub fn no_props(self) -> Self {
        self.u16(0)
    }

    /// A property key followed by the POOL value tag; the pool reference
    /// bytes follow.
    pub fn pool_prop(self, key_index: u16, key: &str) -> Self {
        self.pool_new_string(key_index, key).u8(wire::PROPERTY_POOL)
    }

    /// BEGIN_GROUP with a fresh name at `name_index` and no properties.
    pub fn empty_group_open(self, name_index: u16, name: &str) -> Self {
        self.u8(wire::BEGIN_GROUP)
            .pool_new_string(name_index, name)
            .pool_null()
            .pool_null()
            .i32(0)
            .no_props()
    }

    pub fn close_group(self) -> Self {
        self.u8(wire::CLOSE_GROUP)
    }

    /// A node class with no ports: class `N`, empty template, installed at
    /// `index`.
    pub fn node_class_no_ports(self, index: u16) -> Self {
        self.u8(wire::POOL_NEW)
            .u16(index)
            .u8(wire::POOL_NODE_CLASS)
            .str_inline("N")
            .str_inline("")
            .u16(0)
            .u16(0)
    }

    /// BEGIN_GRAPH with a single node referencing the port-less node class
    /// at pool index `class_index`, and no blocks.
    pub fn one_node_graph(
        self,
        title_index: u16,
        title: &str,
        node_id: i32,
        class_index: u16,
    ) -> Self {
        self.u8(wire::BEGIN_GRAPH)
            .pool_new_string(title_index, title)
            .no_props()
            .i32(1)
            .i32(node_id)
            .pool_ref(wire::POOL_NODE_CLASS, class_index)
            .u8(0)
            .no_props()
            .i32(0)
    }
}
