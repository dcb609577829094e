//! State tree data model
//!
//! A [`StateTree`] is a keyed, nested structure of scalars, dense arrays, and
//! lists. Its structure (without values) is described by [`Shape`], which is
//! what a restore uses as a template.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{Error, Result};

/// Separator used in field paths such as `params/dense/kernel`
pub const PATH_SEPARATOR: char = '/';

/// Element type of an array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    F16,
    BF16,
    I32,
    I64,
    U8,
    Bool,
}

impl DType {
    /// Size of one element in bytes
    pub fn size_of(&self) -> usize {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::U8 | DType::Bool => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
            DType::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dense array with shape and element type metadata
///
/// Elements are stored as raw little-endian bytes in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayValue {
    dtype: DType,
    dims: Vec<usize>,
    data: Vec<u8>,
}

macro_rules! typed_array {
    ($from:ident, $to:ident, $ty:ty, $dtype:expr) => {
        #[doc = concat!("Build a `", stringify!($ty), "` array from row-major elements")]
        pub fn $from(dims: Vec<usize>, values: &[$ty]) -> Result<Self> {
            let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            Self::new($dtype, dims, data)
        }

        #[doc = concat!("Decode the elements as `", stringify!($ty), "`")]
        pub fn $to(&self) -> Result<Vec<$ty>> {
            self.expect_dtype($dtype)?;
            Ok(self
                .data
                .chunks_exact(std::mem::size_of::<$ty>())
                .map(|chunk| {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(chunk);
                    <$ty>::from_le_bytes(buf)
                })
                .collect())
        }
    };
}

impl ArrayValue {
    /// Create an array from raw element bytes
    ///
    /// Fails if `data` does not hold exactly `numel(dims)` elements.
    pub fn new(dtype: DType, dims: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expected = numel(&dims)
            .checked_mul(dtype.size_of())
            .ok_or_else(|| Error::InvalidArray {
                message: format!("dims {:?} overflow", dims),
            })?;
        if data.len() != expected {
            return Err(Error::InvalidArray {
                message: format!(
                    "{}{:?} needs {} bytes, got {}",
                    dtype,
                    dims,
                    expected,
                    data.len()
                ),
            });
        }
        Ok(Self { dtype, dims, data })
    }

    /// Zero-filled array
    pub fn zeros(dtype: DType, dims: Vec<usize>) -> Self {
        let len = numel(&dims) * dtype.size_of();
        Self {
            dtype,
            dims,
            data: vec![0u8; len],
        }
    }

    typed_array!(from_f32, to_f32, f32, DType::F32);
    typed_array!(from_f64, to_f64, f64, DType::F64);
    typed_array!(from_i32, to_i32, i32, DType::I32);
    typed_array!(from_i64, to_i64, i64, DType::I64);
    typed_array!(from_u8, to_u8, u8, DType::U8);

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        numel(&self.dims)
    }

    /// Size of the element data in bytes
    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    pub fn into_parts(self) -> (DType, Vec<usize>, Vec<u8>) {
        (self.dtype, self.dims, self.data)
    }

    fn expect_dtype(&self, dtype: DType) -> Result<()> {
        if self.dtype != dtype {
            return Err(Error::InvalidArray {
                message: format!("expected {} elements, array holds {}", dtype, self.dtype),
            });
        }
        Ok(())
    }
}

fn numel(dims: &[usize]) -> usize {
    dims.iter().product()
}

/// Primitive leaf value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    pub fn kind(&self) -> ScalarKind {
        match self {
            Scalar::Bool(_) => ScalarKind::Bool,
            Scalar::Int(_) => ScalarKind::Int,
            Scalar::Float(_) => ScalarKind::Float,
            Scalar::Str(_) => ScalarKind::Str,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(v) => write!(f, "{}", v),
            Scalar::Int(v) => write!(f, "{}", v),
            Scalar::Float(v) => write!(f, "{}", v),
            Scalar::Str(v) => write!(f, "{:?}", v),
        }
    }
}

/// Kind of a primitive leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    Bool,
    Int,
    Float,
    Str,
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarKind::Bool => "bool",
            ScalarKind::Int => "int",
            ScalarKind::Float => "float",
            ScalarKind::Str => "str",
        };
        f.write_str(name)
    }
}

/// A value in a state tree
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Scalar(Scalar),
    Array(ArrayValue),
    List(Vec<Node>),
    Tree(StateTree),
}

impl Node {
    /// Structural description of this node
    pub fn shape(&self) -> Shape {
        match self {
            Node::Scalar(s) => Shape::Scalar(s.kind()),
            Node::Array(a) => Shape::Array {
                dtype: a.dtype(),
                dims: a.dims().to_vec(),
            },
            Node::List(items) => Shape::List(items.iter().map(Node::shape).collect()),
            Node::Tree(t) => t.shape(),
        }
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Node::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match self {
            Node::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Node]> {
        match self {
            Node::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_tree(&self) -> Option<&StateTree> {
        match self {
            Node::Tree(t) => Some(t),
            _ => None,
        }
    }

    fn child(&self, segment: &str) -> Option<&Node> {
        match self {
            Node::Tree(t) => t.get(segment),
            Node::List(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    }

    fn collect_leaves(&self, prefix: &str, out: &mut Vec<String>) {
        match self {
            Node::Scalar(_) | Node::Array(_) => out.push(prefix.to_string()),
            Node::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    item.collect_leaves(&join_path(prefix, &i.to_string()), out);
                }
            }
            Node::Tree(t) => {
                for (key, child) in t.iter() {
                    child.collect_leaves(&join_path(prefix, key), out);
                }
            }
        }
    }

    fn array_bytes(&self) -> usize {
        match self {
            Node::Scalar(_) => 0,
            Node::Array(a) => a.nbytes(),
            Node::List(items) => items.iter().map(Node::array_bytes).sum(),
            Node::Tree(t) => t.total_bytes(),
        }
    }
}

impl From<Scalar> for Node {
    fn from(s: Scalar) -> Self {
        Node::Scalar(s)
    }
}

impl From<bool> for Node {
    fn from(v: bool) -> Self {
        Node::Scalar(Scalar::Bool(v))
    }
}

impl From<i64> for Node {
    fn from(v: i64) -> Self {
        Node::Scalar(Scalar::Int(v))
    }
}

impl From<f64> for Node {
    fn from(v: f64) -> Self {
        Node::Scalar(Scalar::Float(v))
    }
}

impl From<&str> for Node {
    fn from(v: &str) -> Self {
        Node::Scalar(Scalar::Str(v.to_string()))
    }
}

impl From<String> for Node {
    fn from(v: String) -> Self {
        Node::Scalar(Scalar::Str(v))
    }
}

impl From<ArrayValue> for Node {
    fn from(a: ArrayValue) -> Self {
        Node::Array(a)
    }
}

impl From<Vec<Node>> for Node {
    fn from(items: Vec<Node>) -> Self {
        Node::List(items)
    }
}

impl From<StateTree> for Node {
    fn from(t: StateTree) -> Self {
        Node::Tree(t)
    }
}

/// Nested mapping from string keys to [`Node`]s
///
/// Keys are unique within a level and iterate in sorted order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateTree {
    entries: BTreeMap<String, Node>,
}

impl StateTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous value under `key`
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Node>) -> Option<Node> {
        self.entries.insert(key.into(), value.into())
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Node>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.entries.get(key)
    }

    /// Look up a nested value by `/`-separated path; list items are addressed
    /// by index (`layers/0/kernel`)
    pub fn get_path(&self, path: &str) -> Option<&Node> {
        let mut segments = path.split(PATH_SEPARATOR).filter(|s| !s.is_empty());
        let first = segments.next()?;
        segments.try_fold(self.get(first)?, |node, segment| node.child(segment))
    }

    pub fn remove(&mut self, key: &str) -> Option<Node> {
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Structural description usable as a restore template
    pub fn shape(&self) -> Shape {
        Shape::Tree(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.shape()))
                .collect(),
        )
    }

    /// Paths of every scalar and array leaf, in key order
    pub fn leaf_paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (key, node) in &self.entries {
            node.collect_leaves(key, &mut out);
        }
        out
    }

    pub fn num_leaves(&self) -> usize {
        self.leaf_paths().len()
    }

    /// Total size of array element data in bytes
    pub fn total_bytes(&self) -> usize {
        self.entries.values().map(Node::array_bytes).sum()
    }
}

impl<K: Into<String>, V: Into<Node>> FromIterator<(K, V)> for StateTree {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl IntoIterator for StateTree {
    type Item = (String, Node);
    type IntoIter = std::collections::btree_map::IntoIter<String, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Structure of a state tree without its values
///
/// Used as the template when restoring: decoding walks the template and the
/// stored tree side by side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Shape {
    Scalar(ScalarKind),
    Array { dtype: DType, dims: Vec<usize> },
    List(Vec<Shape>),
    Tree(BTreeMap<String, Shape>),
}

impl Shape {
    /// Number of scalar and array leaves described
    pub fn num_leaves(&self) -> usize {
        match self {
            Shape::Scalar(_) | Shape::Array { .. } => 1,
            Shape::List(items) => items.iter().map(Shape::num_leaves).sum(),
            Shape::Tree(fields) => fields.values().map(Shape::num_leaves).sum(),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Scalar(kind) => write!(f, "{}", kind),
            Shape::Array { dtype, dims } => write!(f, "{}{:?}", dtype, dims),
            Shape::List(items) => write!(f, "list[{}]", items.len()),
            Shape::Tree(fields) => write!(f, "tree{{{}}}", fields.len()),
        }
    }
}

/// Append a segment to a field path
pub fn join_path(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{}{}{}", prefix, PATH_SEPARATOR, segment)
    }
}
