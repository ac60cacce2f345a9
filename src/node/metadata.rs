//! Node metadata serialization: the packed value stored per node key in the
//! versioned metadata store.
//!
//! Layout (big-endian, `u16`-length-prefixed byte strings):
//!
//! ```text
//! user:u32 group:u32 mode:u32 time_unix_nanos:u64
//! content_key: bytes
//! n_xattrs:u16 then n_xattrs × { name: bytes, value: bytes }
//! until end: { child_name: bytes, child_key: bytes (20) }
//! ```
//!
//! There is no framing byte: the total length is the versioned-store value
//! length. Child entries only exist for directories; trailing bytes on a
//! non-directory mean the value is corrupt.

use std::collections::HashMap;

use bytes::{Buf, BytesMut};

use crate::codec::bits;
use crate::node::node::NodeState;
use crate::node::{NodeKey, NODE_KEY_LEN};
use crate::store::StoreError;

/// A node's metadata as read back from the store, before it is folded into
/// an in-memory node.
pub struct DecodedMetadata {
    pub user: u32,
    pub group: u32,
    pub mode: u32,
    pub time_nanos: u64,
    pub content_key: Vec<u8>,
    pub xattrs: HashMap<String, Vec<u8>>,
    pub children: Vec<(String, NodeKey)>,
}

impl DecodedMetadata {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFDIR as u32 != 0
    }
}

/// Serialize a node's persistent fields. Cached content and dirty flags are
/// deliberately not part of the value: the serialized metadata fully
/// determines the node except for content, which lives in the blob store.
pub fn serialize_node(state: &NodeState) -> Vec<u8> {
    let mut size = 24 + state.content_key.len();
    for (name, value) in &state.xattrs {
        size += 4 + name.len() + value.len();
    }
    for name in state.children.keys() {
        size += 4 + NODE_KEY_LEN + name.len();
    }

    let mut buf = BytesMut::with_capacity(size);
    bits::put_u32(&mut buf, state.user);
    bits::put_u32(&mut buf, state.group);
    bits::put_u32(&mut buf, state.mode);
    bits::put_u64(&mut buf, state.time_nanos);
    bits::put_bytes(&mut buf, &state.content_key);
    bits::put_u16(&mut buf, state.xattrs.len() as u16);
    for (name, value) in &state.xattrs {
        bits::put_bytes(&mut buf, name.as_bytes());
        bits::put_bytes(&mut buf, value);
    }
    for (name, entry) in &state.children {
        bits::put_bytes(&mut buf, name.as_bytes());
        bits::put_bytes(&mut buf, &entry.key);
    }
    buf.to_vec()
}

pub fn deserialize_node(raw: &[u8]) -> Result<DecodedMetadata, StoreError> {
    let mut buf = raw;
    let user = bits::get_u32(&mut buf)?;
    let group = bits::get_u32(&mut buf)?;
    let mode = bits::get_u32(&mut buf)?;
    let time_nanos = bits::get_u64(&mut buf)?;
    let content_key = bits::get_bytes(&mut buf)?;

    let n_xattrs = bits::get_u16(&mut buf)?;
    let mut xattrs = HashMap::with_capacity(n_xattrs as usize);
    for _ in 0..n_xattrs {
        let name = bits::get_bytes(&mut buf)?;
        let value = bits::get_bytes(&mut buf)?;
        xattrs.insert(String::from_utf8_lossy(&name).into_owned(), value);
    }

    let mut decoded = DecodedMetadata {
        user,
        group,
        mode,
        time_nanos,
        content_key,
        xattrs,
        children: Vec::new(),
    };

    if decoded.is_dir() {
        while buf.has_remaining() {
            let name = bits::get_bytes(&mut buf)?;
            let raw_key = bits::get_bytes(&mut buf)?;
            let key: NodeKey = raw_key
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::BadMessage("child key has wrong length".into()))?;
            decoded
                .children
                .push((String::from_utf8_lossy(&name).into_owned(), key));
        }
    } else if buf.has_remaining() {
        return Err(StoreError::BadMessage(
            "trailing child bytes on a non-directory node".into(),
        ));
    }

    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::node::ChildEntry;
    use crate::node::node::Node;
    use crate::node::NodeKey;
    use rand::{Rng, RngCore};

    fn random_key(rng: &mut impl RngCore) -> NodeKey {
        let mut key = NodeKey::default();
        rng.fill_bytes(&mut key);
        key
    }

    fn random_state(rng: &mut impl rand::Rng, dir: bool) -> NodeState {
        let mut state = NodeState::not_loaded("t", random_key(rng));
        state.user = rng.random();
        state.group = rng.random();
        state.mode = if dir {
            libc::S_IFDIR as u32 | (rng.random::<u32>() & 0o777)
        } else {
            libc::S_IFREG as u32 | (rng.random::<u32>() & 0o777)
        };
        state.time_nanos = rng.random();
        let key_len = rng.random_range(0..10);
        let mut content_key = vec![0u8; key_len];
        rng.fill_bytes(&mut content_key);
        state.content_key = content_key;
        for _ in 0..rng.random_range(0..4) {
            let name = format!("user.attr{}", rng.random::<u16>());
            let mut value = vec![0u8; rng.random_range(0..32)];
            rng.fill_bytes(&mut value);
            state.xattrs.insert(name, value);
        }
        if dir {
            for i in 0..rng.random_range(0..5) {
                let key = random_key(rng);
                state.children.insert(
                    format!("child{i}"),
                    ChildEntry {
                        key,
                        node: Node::new(0, NodeState::not_loaded("", key)),
                    },
                );
            }
        }
        state
    }

    #[test]
    fn round_trip_preserves_every_defined_field() {
        let mut rng = rand::rng();
        for _ in 0..100 {
            let dir = rng.random();
            let state = random_state(&mut rng, dir);
            let decoded = deserialize_node(&serialize_node(&state)).unwrap();

            assert_eq!(decoded.user, state.user);
            assert_eq!(decoded.group, state.group);
            assert_eq!(decoded.mode, state.mode);
            assert_eq!(decoded.time_nanos, state.time_nanos);
            assert_eq!(decoded.content_key, state.content_key);
            assert_eq!(decoded.xattrs, state.xattrs);

            let mut want: Vec<(String, NodeKey)> = state
                .children
                .iter()
                .map(|(name, entry)| (name.clone(), entry.key))
                .collect();
            let mut got = decoded.children.clone();
            want.sort();
            got.sort();
            assert_eq!(got, want);
        }
    }

    #[test]
    fn non_directory_with_trailing_bytes_is_corrupt() {
        let mut rng = rand::rng();
        let state = random_state(&mut rng, false);
        let mut raw = serialize_node(&state);
        // Tack a child entry onto a regular file.
        raw.extend_from_slice(&[0, 1, b'x', 0, 20]);
        raw.extend_from_slice(&[7u8; 20]);
        assert!(matches!(
            deserialize_node(&raw),
            Err(StoreError::BadMessage(_))
        ));
    }

    #[test]
    fn truncated_value_underflows() {
        let mut rng = rand::rng();
        let state = random_state(&mut rng, true);
        let raw = serialize_node(&state);
        assert!(matches!(
            deserialize_node(&raw[..10]),
            Err(StoreError::Underflow)
        ));
    }
}
