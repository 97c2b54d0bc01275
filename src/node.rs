use {
    super::{Compression, decode, encode, strip_magic},
    anyhow::Context,
    serde::{Deserialize, Serialize},
};

/// A typed value attached to a [`SceneNode`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum Property {
    Bool(bool),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    I32Array(Vec<i32>),
    I64Array(Vec<i64>),
    F32Array(Vec<f32>),
    F64Array(Vec<f64>),
}

impl Property {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Floating point arrays of either width.
    pub fn as_f32_array(&self) -> Option<Vec<f32>> {
        match self {
            Self::F32Array(vals) => Some(vals.clone()),
            Self::F64Array(vals) => Some(vals.iter().map(|val| *val as f32).collect()),
            _ => None,
        }
    }

    pub fn as_i32_array(&self) -> Option<&[i32]> {
        match self {
            Self::I32Array(vals) => Some(vals),
            _ => None,
        }
    }

    /// Integer scalars of either width.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I32(val) => Some(*val as _),
            Self::I64(val) => Some(*val),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(str) => Some(str),
            _ => None,
        }
    }
}

impl From<&str> for Property {
    fn from(val: &str) -> Self {
        Self::Str(val.to_owned())
    }
}

impl From<String> for Property {
    fn from(val: String) -> Self {
        Self::Str(val)
    }
}

impl From<i32> for Property {
    fn from(val: i32) -> Self {
        Self::I32(val)
    }
}

impl From<i64> for Property {
    fn from(val: i64) -> Self {
        Self::I64(val)
    }
}

impl From<Vec<u8>> for Property {
    fn from(val: Vec<u8>) -> Self {
        Self::Bytes(val)
    }
}

impl From<Vec<i32>> for Property {
    fn from(val: Vec<i32>) -> Self {
        Self::I32Array(val)
    }
}

impl From<Vec<f32>> for Property {
    fn from(val: Vec<f32>) -> Self {
        Self::F32Array(val)
    }
}

/// A tagged tree node: a name, an ordered list of properties and an ordered list of children.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SceneNode {
    pub name: String,
    pub properties: Vec<Property>,
    pub children: Vec<SceneNode>,
}

impl SceneNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: vec![],
            children: vec![],
        }
    }

    pub fn with_child(mut self, child: SceneNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_property(mut self, property: impl Into<Property>) -> Self {
        self.properties.push(property.into());
        self
    }

    /// The first direct child with the given name.
    pub fn child(&self, name: &str) -> Option<&SceneNode> {
        self.children.iter().find(|child| child.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut SceneNode> {
        self.children.iter_mut().find(|child| child.name == name)
    }

    /// All direct children with the given name, in order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a SceneNode> {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// The `idx`-th property of this node, if present.
    pub fn property(&self, idx: usize) -> Option<&Property> {
        self.properties.get(idx)
    }

    /// Shorthand for the first property of the named child, which is where leaf values live.
    pub fn value(&self, name: &str) -> Option<&Property> {
        self.child(name).and_then(|child| child.property(0))
    }

    /// Rebuilds the child list keeping only the children `f` accepts.
    ///
    /// The replacement list is built first and swapped in afterwards, so `f` never observes a
    /// partially edited list.
    pub fn retain_children(&mut self, mut f: impl FnMut(&SceneNode) -> bool) -> usize {
        let before = self.children.len();
        let children = std::mem::take(&mut self.children)
            .into_iter()
            .filter(|child| f(child))
            .collect::<Vec<_>>();
        self.children = children;

        before - self.children.len()
    }
}

/// Parser and serializer pair for one on-disk scene encoding.
pub trait SceneFormat: Send + Sync {
    /// File extension (without the dot) handled by this format.
    fn extension(&self) -> &str;

    fn parse(&self, buf: &[u8]) -> anyhow::Result<SceneNode>;

    fn serialize(&self, root: &SceneNode) -> anyhow::Result<Vec<u8>>;
}

/// The binary node tree encoding: a fixed header, a compression tag and the encoded tree.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeTreeFormat {
    compression: Option<Compression>,
}

impl NodeTreeFormat {
    pub const EXTENSION: &'static str = "tree";
    const MAGIC: &'static [u8; 20] = b"OVEN-NODE-TREE-V1.0 ";

    pub fn with_compression(mut self, compression: Option<Compression>) -> Self {
        self.compression = compression;
        self
    }
}

impl SceneFormat for NodeTreeFormat {
    fn extension(&self) -> &str {
        Self::EXTENSION
    }

    fn parse(&self, buf: &[u8]) -> anyhow::Result<SceneNode> {
        let body = Compression::unpack(strip_magic(buf, Self::MAGIC)?)?;

        decode(&body).context("Decoding node tree")
    }

    fn serialize(&self, root: &SceneNode) -> anyhow::Result<Vec<u8>> {
        let body = encode(root)?;
        let mut buf = Self::MAGIC.to_vec();
        Compression::pack(self.compression, &body, &mut buf).context("Compressing node tree")?;

        Ok(buf)
    }
}
