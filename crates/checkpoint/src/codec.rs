//! State tree serializer
//!
//! Encodes a [`StateTree`] into a self-describing byte blob and decodes it
//! back, optionally guided by a [`Shape`] template.
//!
//! Blob layout (little endian):
//!
//! ```text
//! magic "STRE" | version u32 | payload_len u64 | bincode payload
//! ```
//!
//! The payload persists lists as mappings keyed `"0"`, `"1"`, ... . Decoding
//! with a template rebuilds the lists the template declares; decoding without
//! one yields those containers as [`Node::Tree`] with integer keys.

use std::borrow::Cow;
use std::collections::BTreeMap;

use bytes::Bytes;
use ckpt_core::tree::join_path;
use ckpt_core::{ArrayValue, Error, MismatchReason, Node, Result, Scalar, Shape, StateTree};
use serde::{Deserialize, Serialize};

/// Magic bytes for encoded state trees
pub const TREE_MAGIC: [u8; 4] = *b"STRE";

/// State tree format version
pub const TREE_FORMAT_VERSION: u32 = 1;

const PREAMBLE_LEN: usize = 4 + 4 + 8;

/// Borrowed view used for encoding so array data is not copied
#[derive(Serialize)]
enum StoredNodeRef<'a> {
    Scalar(&'a Scalar),
    Array(&'a ArrayValue),
    Map(Vec<(Cow<'a, str>, StoredNodeRef<'a>)>),
}

/// Owned form produced by decoding; must mirror `StoredNodeRef`
#[derive(Deserialize)]
enum StoredNode {
    Scalar(Scalar),
    Array(ArrayValue),
    Map(Vec<(String, StoredNode)>),
}

impl<'a> StoredNodeRef<'a> {
    fn from_tree(tree: &'a StateTree) -> Self {
        StoredNodeRef::Map(
            tree.iter()
                .map(|(key, node)| (Cow::Borrowed(key), Self::from_node(node)))
                .collect(),
        )
    }

    fn from_node(node: &'a Node) -> Self {
        match node {
            Node::Scalar(s) => StoredNodeRef::Scalar(s),
            Node::Array(a) => StoredNodeRef::Array(a),
            Node::List(items) => StoredNodeRef::Map(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| (Cow::Owned(i.to_string()), Self::from_node(item)))
                    .collect(),
            ),
            Node::Tree(t) => Self::from_tree(t),
        }
    }
}

impl StoredNode {
    fn describe(&self) -> String {
        match self {
            StoredNode::Scalar(s) => s.kind().to_string(),
            StoredNode::Array(a) => format!("{}{:?}", a.dtype(), a.dims()),
            StoredNode::Map(fields) => format!("mapping{{{}}}", fields.len()),
        }
    }
}

/// Encode a state tree
pub fn encode(tree: &StateTree) -> Result<Bytes> {
    encode_stored(&StoredNodeRef::from_tree(tree))
}

fn encode_stored(root: &StoredNodeRef<'_>) -> Result<Bytes> {
    let payload = bincode::serialize(root)?;

    let mut buf = Vec::with_capacity(PREAMBLE_LEN + payload.len());
    buf.extend_from_slice(&TREE_MAGIC);
    buf.extend_from_slice(&TREE_FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buf.extend_from_slice(&payload);

    Ok(Bytes::from(buf))
}

/// Decode a state tree
///
/// With a template the result has exactly the template's keys, nesting, and
/// array shapes, and any disagreement fails with `SchemaMismatch` naming the
/// offending field path. Without a template, lists come back as trees keyed
/// by their integer indices.
pub fn decode(bytes: &[u8], template: Option<&Shape>) -> Result<StateTree> {
    let payload = split_preamble(bytes)?;
    let stored: StoredNode = bincode::deserialize(payload)
        .map_err(|e| malformed(format!("payload does not decode: {}", e)))?;

    let StoredNode::Map(fields) = stored else {
        return Err(malformed("root is not a mapping"));
    };

    match template {
        None => generic_fields(fields, ""),
        Some(Shape::Tree(shape)) => restore_fields(fields, shape, ""),
        Some(other) => Err(Error::SchemaMismatch {
            path: String::new(),
            reason: MismatchReason::Incompatible {
                expected: other.to_string(),
                found: "tree".to_string(),
            },
        }),
    }
}

/// Decode without a template and report the stored structure
pub fn inspect(bytes: &[u8]) -> Result<Shape> {
    decode(bytes, None).map(|tree| tree.shape())
}

fn split_preamble(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < PREAMBLE_LEN {
        return Err(malformed(format!("{} bytes is shorter than the preamble", bytes.len())));
    }
    if bytes[0..4] != TREE_MAGIC {
        return Err(malformed("invalid magic"));
    }

    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != TREE_FORMAT_VERSION {
        return Err(malformed(format!("unsupported format version {}", version)));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[8..16]);
    let payload_len = u64::from_le_bytes(len_bytes);

    let payload = &bytes[PREAMBLE_LEN..];
    if payload.len() as u64 != payload_len {
        return Err(malformed(format!(
            "payload length {} does not match header {}",
            payload.len(),
            payload_len
        )));
    }
    Ok(payload)
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::Serialization(format!("malformed state tree: {}", reason.into()))
}

fn mismatch(path: &str, reason: MismatchReason) -> Error {
    Error::SchemaMismatch {
        path: path.to_string(),
        reason,
    }
}

fn checked_array(array: ArrayValue, path: &str) -> Result<ArrayValue> {
    let (dtype, dims, data) = array.into_parts();
    ArrayValue::new(dtype, dims, data).map_err(|e| malformed(format!("`{}`: {}", path, e)))
}

fn generic_fields(fields: Vec<(String, StoredNode)>, path: &str) -> Result<StateTree> {
    let mut tree = StateTree::new();
    for (key, stored) in fields {
        let child_path = join_path(path, &key);
        let node = generic_node(stored, &child_path)?;
        if tree.insert(key, node).is_some() {
            return Err(malformed(format!("duplicate key `{}`", child_path)));
        }
    }
    Ok(tree)
}

fn generic_node(stored: StoredNode, path: &str) -> Result<Node> {
    Ok(match stored {
        StoredNode::Scalar(s) => Node::Scalar(s),
        StoredNode::Array(a) => Node::Array(checked_array(a, path)?),
        StoredNode::Map(fields) => Node::Tree(generic_fields(fields, path)?),
    })
}

fn restore_fields(
    fields: Vec<(String, StoredNode)>,
    shape: &BTreeMap<String, Shape>,
    path: &str,
) -> Result<StateTree> {
    let mut stored: BTreeMap<String, StoredNode> = BTreeMap::new();
    for (key, node) in fields {
        if stored.contains_key(&key) {
            return Err(malformed(format!("duplicate key `{}`", join_path(path, &key))));
        }
        stored.insert(key, node);
    }

    let mut tree = StateTree::new();
    for (key, field_shape) in shape {
        let child_path = join_path(path, key);
        let node = stored
            .remove(key)
            .ok_or_else(|| mismatch(&child_path, MismatchReason::Missing))?;
        tree.insert(key.clone(), restore_node(node, field_shape, &child_path)?);
    }

    if let Some(extra) = stored.keys().next() {
        return Err(mismatch(&join_path(path, extra), MismatchReason::Unexpected));
    }
    Ok(tree)
}

/// Index of a list slot; only the canonical decimal form written by `encode`
fn list_index(key: &str) -> Option<usize> {
    let index = key.parse::<usize>().ok()?;
    (index.to_string() == key).then_some(index)
}

fn restore_list(fields: Vec<(String, StoredNode)>, items: &[Shape], path: &str) -> Result<Node> {
    let mut slots: Vec<Option<StoredNode>> = Vec::new();
    slots.resize_with(items.len(), || None);

    for (key, node) in fields {
        let slot = list_index(&key)
            .and_then(|i| slots.get_mut(i))
            .ok_or_else(|| mismatch(&join_path(path, &key), MismatchReason::Unexpected))?;
        if slot.is_some() {
            return Err(malformed(format!("duplicate key `{}`", join_path(path, &key))));
        }
        *slot = Some(node);
    }

    let mut nodes = Vec::with_capacity(items.len());
    for (i, (slot, item_shape)) in slots.into_iter().zip(items).enumerate() {
        let item_path = join_path(path, &i.to_string());
        let stored = slot.ok_or_else(|| mismatch(&item_path, MismatchReason::Missing))?;
        nodes.push(restore_node(stored, item_shape, &item_path)?);
    }
    Ok(Node::List(nodes))
}

fn restore_node(stored: StoredNode, shape: &Shape, path: &str) -> Result<Node> {
    match (shape, stored) {
        (Shape::Scalar(kind), StoredNode::Scalar(s)) => {
            if s.kind() != *kind {
                return Err(mismatch(
                    path,
                    MismatchReason::Incompatible {
                        expected: kind.to_string(),
                        found: s.kind().to_string(),
                    },
                ));
            }
            Ok(Node::Scalar(s))
        }
        (Shape::Array { dtype, dims }, StoredNode::Array(a)) => {
            let array = checked_array(a, path)?;
            if array.dtype() != *dtype || array.dims() != dims.as_slice() {
                return Err(mismatch(
                    path,
                    MismatchReason::Incompatible {
                        expected: shape.to_string(),
                        found: format!("{}{:?}", array.dtype(), array.dims()),
                    },
                ));
            }
            Ok(Node::Array(array))
        }
        (Shape::List(items), StoredNode::Map(fields)) => restore_list(fields, items, path),
        (Shape::Tree(fields_shape), StoredNode::Map(fields)) => {
            Ok(Node::Tree(restore_fields(fields, fields_shape, path)?))
        }
        (shape, stored) => Err(mismatch(
            path,
            MismatchReason::Incompatible {
                expected: shape.to_string(),
                found: stored.describe(),
            },
        )),
    }
}
