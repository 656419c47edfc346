use crate::errors::ReadError;

use roaring::RoaringBitmap;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Requested length of a method name substituted into a node-name template.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NameLength {
    Short,
    Medium,
    Long,
}

/// A resolved class reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Klass {
    pub name: Arc<str>,
    pub simple_name: Arc<str>,
}

impl Klass {
    pub fn new(name: impl Into<Arc<str>>) -> Klass {
        let name = name.into();
        let simple = name.rsplit('.').next().unwrap_or(&name);
        let simple_name = Arc::from(simple);
        Klass { name, simple_name }
    }
}

/// A class known to be an enumeration, together with its constant names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnumKlass {
    pub name: Arc<str>,
    pub values: Vec<Arc<str>>,
}

/// A single enumeration constant, addressed by ordinal into its klass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnumValue {
    pub klass: Arc<EnumKlass>,
    pub ordinal: i32,
}

impl EnumValue {
    pub fn label(&self) -> &str {
        self.klass
            .values
            .get(self.ordinal as usize)
            .map(|v| v.as_ref())
            .unwrap_or("?")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureData {
    pub arg_types: Vec<Arc<str>>,
    pub return_type: Arc<str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodData {
    pub holder: Arc<Klass>,
    pub name: Arc<str>,
    pub signature: Arc<SignatureData>,
    pub code: Option<Vec<u8>>,
    pub flags: i32,
}

impl MethodData {
    /// Name form used by node-name templates: `/s` gives the bare method
    /// name, `/m` qualifies it with the simple holder name, `/l` the full
    /// signature.
    pub fn display_name(&self, length: NameLength) -> String {
        match length {
            NameLength::Short => self.name.to_string(),
            NameLength::Medium => format!("{}.{}", self.holder.simple_name, self.name),
            NameLength::Long => {
                let args = self
                    .signature
                    .arg_types
                    .iter()
                    .map(|t| t.as_ref())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "{} {}.{}({})",
                    self.signature.return_type, self.holder.name, self.name, args
                )
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldData {
    pub holder: Arc<Klass>,
    pub name: Arc<str>,
    pub field_type: Arc<str>,
    pub flags: i32,
}

/// One port of a node schema.  List ports carry a 16-bit element count on
/// the wire; scalar ports a single peer id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Port {
    pub name: Arc<str>,
    pub is_list: bool,
}

/// An input port, optionally tagged with the edge type enumeration value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputPort {
    pub name: Arc<str>,
    pub is_list: bool,
    pub input_type: Option<Arc<EnumValue>>,
}

/// Schema entry describing a node kind: its ports and name template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeClassData {
    pub class_name: Arc<str>,
    pub name_template: Arc<str>,
    pub inputs: SmallVec<[InputPort; 4]>,
    pub successors: SmallVec<[Port; 2]>,
}

impl NodeClassData {
    pub fn simple_name(&self) -> &str {
        self.class_name
            .rsplit('.')
            .next()
            .unwrap_or(&self.class_name)
    }
}

/// The kind tag of a pool reference, used for the run-time type assertion
/// when resolving an index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolKind {
    String,
    Enum,
    Klass,
    Method,
    NodeClass,
    Field,
    Signature,
    Any,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolKind::String => "string",
            PoolKind::Enum => "enum",
            PoolKind::Klass => "class",
            PoolKind::Method => "method",
            PoolKind::NodeClass => "node class",
            PoolKind::Field => "field",
            PoolKind::Signature => "signature",
            PoolKind::Any => "any",
        };
        f.write_str(name)
    }
}

/// A decoded constant-pool entry.  Payloads are `Arc`-backed so that pool
/// snapshots are plain vectors of cheap references.
#[derive(Clone, Debug, PartialEq)]
pub enum PoolObject {
    Str(Arc<str>),
    Klass(Arc<Klass>),
    EnumKlass(Arc<EnumKlass>),
    EnumValue(Arc<EnumValue>),
    Signature(Arc<SignatureData>),
    Method(Arc<MethodData>),
    Field(Arc<FieldData>),
    NodeClass(Arc<NodeClassData>),
}

impl PoolObject {
    pub fn kind(&self) -> PoolKind {
        match self {
            PoolObject::Str(_) => PoolKind::String,
            PoolObject::Klass(_) | PoolObject::EnumKlass(_) => PoolKind::Klass,
            PoolObject::EnumValue(_) => PoolKind::Enum,
            PoolObject::Signature(_) => PoolKind::Signature,
            PoolObject::Method(_) => PoolKind::Method,
            PoolObject::Field(_) => PoolKind::Field,
            PoolObject::NodeClass(_) => PoolKind::NodeClass,
        }
    }

    /// True when this entry satisfies a reference of kind `expected`.
    pub fn matches(&self, expected: PoolKind) -> bool {
        expected == PoolKind::Any || self.kind() == expected
    }
}

impl fmt::Display for PoolObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolObject::Str(s) => f.write_str(s),
            PoolObject::Klass(k) => f.write_str(&k.name),
            PoolObject::EnumKlass(k) => f.write_str(&k.name),
            PoolObject::EnumValue(v) => f.write_str(v.label()),
            PoolObject::Signature(s) => {
                let args = s
                    .arg_types
                    .iter()
                    .map(|t| t.as_ref())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "({}) {}", args, s.return_type)
            }
            PoolObject::Method(m) => write!(f, "{}.{}", m.holder.name, m.name),
            PoolObject::Field(fd) => write!(f, "{}.{}", fd.holder.name, fd.name),
            PoolObject::NodeClass(nc) => f.write_str(&nc.class_name),
        }
    }
}

/// Backing storage of a pool: a dense, index-addressable vector.
pub type PoolData = Vec<Option<PoolObject>>;

/// Indexed dictionary of decoded objects referenced by later records.
///
/// Entries may be overwritten; overwriting is how the stream's vocabulary
/// grows without its 16-bit index space growing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConstantPool {
    data: PoolData,
}

impl ConstantPool {
    pub fn new() -> ConstantPool {
        ConstantPool::default()
    }

    pub fn from_data(data: PoolData) -> ConstantPool {
        ConstantPool { data }
    }

    /// Stores `object` at `index`, growing the dense storage as needed.
    /// `where_` is the stream offset of the defining record, diagnostic
    /// only.  Returns the stored object.
    pub fn add_pool_entry(&mut self, index: u16, object: PoolObject, _where: u64) -> PoolObject {
        let index = index as usize;
        if index >= self.data.len() {
            self.data.resize(index + 1, None);
        }
        self.data[index] = Some(object.clone());
        object
    }

    pub fn get(&self, index: u16, where_: u64) -> Result<PoolObject, ReadError> {
        self.data
            .get(index as usize)
            .and_then(|slot| slot.clone())
            .ok_or(ReadError::PoolIndexOutOfRange {
                index,
                offset: where_,
            })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Clears to empty, keeping the instance.
    pub fn restart(&mut self) {
        self.data.clear();
    }

    /// A copy of the backing vector.
    pub fn snapshot(&self) -> PoolData {
        self.data.clone()
    }

    /// Replaces the backing vector, returning a pool wrapping the previous
    /// contents.
    pub fn swap(&mut self, new_data: PoolData) -> ConstantPool {
        ConstantPool {
            data: std::mem::replace(&mut self.data, new_data),
        }
    }
}

/// [`ConstantPool`] with copy-on-overwrite.
///
/// Reads mark their slot; an overwrite of a marked slot first snapshots the
/// whole backing vector.  [`StreamPool::fork_if_needed`] then splits the
/// history: the existing instance keeps the snapshot (the state every
/// earlier reader observed) while a successor pool carries the latest data
/// forward.  After a fork no overwrite in either pool alters the other's
/// observable state.
#[derive(Debug, Default)]
pub struct StreamPool {
    constants: ConstantPool,
    item_read: RoaringBitmap,
    snapshot: Option<PoolData>,
    generation: u64,
}

impl StreamPool {
    pub fn new() -> StreamPool {
        StreamPool::default()
    }

    /// A pool resuming from previously captured contents, e.g. a
    /// [`StreamEntry`](crate::StreamEntry) snapshot.
    pub fn resuming(constants: ConstantPool, generation: u64) -> StreamPool {
        StreamPool {
            constants,
            item_read: RoaringBitmap::new(),
            snapshot: None,
            generation,
        }
    }

    pub fn get(&mut self, index: u16, where_: u64) -> Result<PoolObject, ReadError> {
        let object = self.constants.get(index, where_)?;
        self.item_read.insert(index as u32);
        Ok(object)
    }

    pub fn add_pool_entry(&mut self, index: u16, object: PoolObject, where_: u64) -> PoolObject {
        if (index as usize) < self.constants.size()
            && self.item_read.contains(index as u32)
        {
            if self.snapshot.is_none() {
                self.snapshot = Some(self.constants.snapshot());
            }
            self.item_read.clear();
        }
        self.constants.add_pool_entry(index, object, where_)
    }

    /// Splits off the overwrite history when one exists: `self` is left
    /// holding the preserved snapshot and the returned pool carries the
    /// latest data with a bumped generation.  Returns `None` when no
    /// previously-read slot was overwritten since the last fork.
    pub fn fork_if_needed(&mut self) -> Option<StreamPool> {
        let snapshot = self.snapshot.take()?;
        let latest = self.constants.swap(snapshot);
        self.item_read.clear();
        Some(StreamPool {
            constants: latest,
            item_read: RoaringBitmap::new(),
            snapshot: None,
            generation: self.generation + 1,
        })
    }

    /// Clears to empty, keeping the instance.  Used at concatenated stream
    /// boundaries, where pool state must not leak.
    pub fn restart(&mut self) {
        self.constants.restart();
        self.item_read.clear();
        self.snapshot = None;
    }

    pub fn size(&self) -> usize {
        self.constants.size()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn constants(&self) -> &ConstantPool {
        &self.constants
    }

    /// A frozen copy of the current contents.
    pub fn to_constant_pool(&self) -> ConstantPool {
        self.constants.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(text: &str) -> PoolObject {
        PoolObject::Str(Arc::from(text))
    }

    #[test]
    fn add_get_and_grow() {
        let mut pool = ConstantPool::new();
        pool.add_pool_entry(5, s("five"), 0);
        assert_eq!(pool.size(), 6);
        assert_eq!(pool.get(5, 0).unwrap(), s("five"));
        assert!(matches!(
            pool.get(3, 7).unwrap_err(),
            ReadError::PoolIndexOutOfRange { index: 3, offset: 7 }
        ));
    }

    #[test]
    fn swap_returns_previous_contents() {
        let mut pool = ConstantPool::new();
        pool.add_pool_entry(0, s("old"), 0);
        let old = pool.swap(vec![Some(s("new"))]);
        assert_eq!(old.get(0, 0).unwrap(), s("old"));
        assert_eq!(pool.get(0, 0).unwrap(), s("new"));
    }

    #[test]
    fn overwrite_of_unread_slot_takes_no_snapshot() {
        let mut pool = StreamPool::new();
        pool.add_pool_entry(0, s("a"), 0);
        pool.add_pool_entry(0, s("b"), 1);
        assert!(pool.fork_if_needed().is_none());
        assert_eq!(pool.get(0, 2).unwrap(), s("b"));
    }

    #[test]
    fn overwrite_of_read_slot_preserves_old_state() {
        let mut pool = StreamPool::new();
        pool.add_pool_entry(0, s("alpha"), 0);
        pool.get(0, 1).unwrap();
        pool.add_pool_entry(0, s("beta"), 2);

        let latest = pool.fork_if_needed().expect("overwrite forces a fork");
        // The original instance keeps the pre-overwrite state; the
        // successor carries the latest data.
        assert_eq!(pool.constants().get(0, 3).unwrap(), s("alpha"));
        assert_eq!(latest.constants().get(0, 3).unwrap(), s("beta"));
        assert_eq!(latest.generation(), pool.generation() + 1);
    }

    #[test]
    fn snapshot_taken_once_between_forks() {
        let mut pool = StreamPool::new();
        pool.add_pool_entry(0, s("a"), 0);
        pool.get(0, 1).unwrap();
        pool.add_pool_entry(0, s("b"), 2);
        // Read again and overwrite again; the existing snapshot must win.
        pool.get(0, 3).unwrap();
        pool.add_pool_entry(0, s("c"), 4);

        let latest = pool.fork_if_needed().unwrap();
        assert_eq!(pool.constants().get(0, 5).unwrap(), s("a"));
        assert_eq!(latest.constants().get(0, 5).unwrap(), s("c"));
    }

    #[test]
    fn forked_pools_diverge_independently() {
        let mut pool = StreamPool::new();
        pool.add_pool_entry(0, s("a"), 0);
        pool.get(0, 1).unwrap();
        pool.add_pool_entry(0, s("b"), 2);
        let mut latest = pool.fork_if_needed().unwrap();

        latest.add_pool_entry(0, s("c"), 3);
        pool.add_pool_entry(1, s("extra"), 4);
        assert_eq!(pool.constants().get(0, 5).unwrap(), s("a"));
        assert_eq!(latest.constants().get(0, 5).unwrap(), s("c"));
        assert!(latest.constants().get(1, 6).is_err());
    }

    #[test]
    fn restart_clears_everything() {
        let mut pool = StreamPool::new();
        pool.add_pool_entry(0, s("a"), 0);
        pool.get(0, 1).unwrap();
        pool.add_pool_entry(0, s("b"), 2);
        pool.restart();
        assert_eq!(pool.size(), 0);
        assert!(pool.fork_if_needed().is_none());
    }

    #[test]
    fn method_display_name_lengths() {
        let holder = Arc::new(Klass::new("com.example.Outer"));
        let signature = Arc::new(SignatureData {
            arg_types: vec![Arc::from("int"), Arc::from("java.lang.String")],
            return_type: Arc::from("void"),
        });
        let method = MethodData {
            holder,
            name: Arc::from("run"),
            signature,
            code: None,
            flags: 0,
        };
        assert_eq!(method.display_name(NameLength::Short), "run");
        assert_eq!(method.display_name(NameLength::Medium), "Outer.run");
        assert_eq!(
            method.display_name(NameLength::Long),
            "void com.example.Outer.run(int, java.lang.String)"
        );
    }

    #[test]
    fn enum_value_label_resolves_ordinal() {
        let klass = Arc::new(EnumKlass {
            name: Arc::from("Condition"),
            values: vec![Arc::from("EQ"), Arc::from("NE")],
        });
        let value = EnumValue { klass, ordinal: 1 };
        assert_eq!(value.label(), "NE");
    }
}
