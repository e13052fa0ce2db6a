//! Node payload codec.
//!
//! ```text
//! payload := tag(u8) | flags(u8) | count(u32) | item*
//! leaf item     := key | value_len(u32) | value
//! internal item := [fence] | agg_len(u32) | agg | count(u64) | offset(u64) | len(u32)
//!
//! key (NODE_RECT_KEYS)  := 16 raw bytes (four u32 coordinates)
//! key (NODE_PREFIXED)   := shared(u32) | suffix_len(u32) | suffix
//! key (otherwise)       := len(u32) | bytes
//! ```
//!
//! Prefix encoding is relative to the previous key of the same node. Nodes
//! with rectangle keys store no fences; spatial subtrees are navigated by
//! their aggregates alone.

use byteorder::{LittleEndian, WriteBytesExt};

use crate::format::DecodeError;
use crate::Rect;

const TAG_LEAF: u8 = 0;
const TAG_INTERNAL: u8 = 1;

const NODE_PREFIXED: u8 = 0b0000_0001;
const NODE_RECT_KEYS: u8 = 0b0000_0010;

/// Location of a node frame inside its segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    pub offset: u64,
    pub len: u32,
}

impl NodeHandle {
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.len)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Pointer from an internal node to one child subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRef {
    /// Largest order key in the subtree; empty for spatial segments.
    pub fence: Vec<u8>,
    /// Reducer output over every key in the subtree.
    pub aggregate: Vec<u8>,
    /// Number of entries in the subtree.
    pub count: u64,
    pub handle: NodeHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf(Vec<Entry>),
    Internal(Vec<ChildRef>),
}

impl Node {
    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(entries) => entries.len(),
            Node::Internal(children) => children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialises the node. `rect_keys` is honoured only when every key in
    /// the node is an encoded [`Rect`].
    pub fn encode(&self, prefix_encoding: bool, rect_keys: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Node::Leaf(entries) => {
                let rect = rect_keys && entries.iter().all(|e| e.key.len() == Rect::ENCODED_LEN);
                let flags = key_flags(prefix_encoding, rect);
                buf.push(TAG_LEAF);
                buf.push(flags);
                put_u32(&mut buf, entries.len() as u32);
                let mut prev: &[u8] = &[];
                for e in entries {
                    put_key(&mut buf, flags, prev, &e.key);
                    prev = &e.key;
                    put_bytes(&mut buf, &e.value);
                }
            }
            Node::Internal(children) => {
                let flags = key_flags(prefix_encoding, rect_keys);
                buf.push(TAG_INTERNAL);
                buf.push(flags);
                put_u32(&mut buf, children.len() as u32);
                let mut prev: &[u8] = &[];
                for c in children {
                    if flags & NODE_RECT_KEYS == 0 {
                        put_key(&mut buf, flags, prev, &c.fence);
                        prev = &c.fence;
                    }
                    put_bytes(&mut buf, &c.aggregate);
                    put_u64(&mut buf, c.count);
                    put_u64(&mut buf, c.handle.offset);
                    put_u32(&mut buf, c.handle.len);
                }
            }
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Node, DecodeError> {
        let mut rd = Cursor { buf: payload };
        let tag = rd.u8()?;
        let flags = rd.u8()?;
        let count = rd.u32()? as usize;
        // every item needs at least four bytes, which bounds a bogus count
        if count > rd.buf.len() / 4 + 1 {
            return Err(DecodeError::new(format!("implausible item count {count}")));
        }

        let node = match tag {
            TAG_LEAF => {
                let mut entries: Vec<Entry> = Vec::with_capacity(count);
                for _ in 0..count {
                    let prev = entries.last().map(|e| e.key.as_slice()).unwrap_or(&[]);
                    let key = rd.key(flags, prev)?;
                    let value = rd.bytes()?.to_vec();
                    entries.push(Entry { key, value });
                }
                Node::Leaf(entries)
            }
            TAG_INTERNAL => {
                let mut children: Vec<ChildRef> = Vec::with_capacity(count);
                for _ in 0..count {
                    let fence = if flags & NODE_RECT_KEYS != 0 {
                        Vec::new()
                    } else {
                        let prev = children.last().map(|c| c.fence.as_slice()).unwrap_or(&[]);
                        rd.key(flags, prev)?
                    };
                    let aggregate = rd.bytes()?.to_vec();
                    let count = rd.u64()?;
                    let offset = rd.u64()?;
                    let len = rd.u32()?;
                    children.push(ChildRef {
                        fence,
                        aggregate,
                        count,
                        handle: NodeHandle { offset, len },
                    });
                }
                Node::Internal(children)
            }
            other => return Err(DecodeError::new(format!("unknown node tag {other}"))),
        };

        if !rd.buf.is_empty() {
            return Err(DecodeError::new("trailing bytes after node"));
        }
        Ok(node)
    }
}

fn key_flags(prefix_encoding: bool, rect: bool) -> u8 {
    if rect {
        NODE_RECT_KEYS
    } else if prefix_encoding {
        NODE_PREFIXED
    } else {
        0
    }
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    // writes into a Vec cannot fail
    let _ = buf.write_u32::<LittleEndian>(v);
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    let _ = buf.write_u64::<LittleEndian>(v);
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

fn put_key(buf: &mut Vec<u8>, flags: u8, prev: &[u8], key: &[u8]) {
    if flags & NODE_RECT_KEYS != 0 {
        buf.extend_from_slice(key);
    } else if flags & NODE_PREFIXED != 0 {
        let shared = prev.iter().zip(key).take_while(|(a, b)| a == b).count();
        put_u32(buf, shared as u32);
        put_bytes(buf, &key[shared..]);
    } else {
        put_bytes(buf, key);
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::new("node payload truncated"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let raw = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(raw);
        Ok(u64::from_le_bytes(arr))
    }

    fn bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn key(&mut self, flags: u8, prev: &[u8]) -> Result<Vec<u8>, DecodeError> {
        if flags & NODE_RECT_KEYS != 0 {
            return Ok(self.take(Rect::ENCODED_LEN)?.to_vec());
        }
        if flags & NODE_PREFIXED != 0 {
            let shared = self.u32()? as usize;
            if shared > prev.len() {
                return Err(DecodeError::new("shared prefix longer than previous key"));
            }
            let suffix = self.bytes()?;
            let mut key = Vec::with_capacity(shared + suffix.len());
            key.extend_from_slice(&prev[..shared]);
            key.extend_from_slice(suffix);
            return Ok(key);
        }
        Ok(self.bytes()?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;

    fn entry(k: &[u8], v: &[u8]) -> Entry {
        Entry {
            key: k.to_vec(),
            value: v.to_vec(),
        }
    }

    #[test]
    fn prefix_encoding_shrinks_shared_keys() {
        let node = Node::Leaf(
            (0..16)
                .map(|i| entry(format!("user:0000{i:02}").as_bytes(), b"v"))
                .collect(),
        );
        let plain = node.encode(false, false);
        let prefixed = node.encode(true, false);
        assert!(prefixed.len() < plain.len());
        assert_eq!(Node::decode(&plain).unwrap(), node);
        assert_eq!(Node::decode(&prefixed).unwrap(), node);
    }

    #[test]
    fn rect_keys_store_raw_coordinates() {
        let rects = [Rect::new(0, 0, 1, 1), Rect::new(4, 4, 9, 9)];
        let node = Node::Leaf(rects.iter().map(|r| entry(&r.to_bytes(), b"x")).collect());
        let encoded = node.encode(true, true);
        // tag + flags + count, then per entry 16 key bytes + 4 len + 1 value byte
        assert_eq!(encoded.len(), 6 + 2 * (16 + 4 + 1));
        assert_eq!(Node::decode(&encoded).unwrap(), node);
    }

    #[test]
    fn rect_flag_falls_back_for_non_rect_keys() {
        let node = Node::Leaf(vec![entry(b"short", b"v")]);
        assert_eq!(Node::decode(&node.encode(true, true)).unwrap(), node);
    }

    #[test]
    fn internal_node_roundtrip() {
        let node = Node::Internal(vec![
            ChildRef {
                fence: b"key_3".to_vec(),
                aggregate: b"key_1".to_vec(),
                count: 3,
                handle: NodeHandle { offset: 0, len: 40 },
            },
            ChildRef {
                fence: b"key_6".to_vec(),
                aggregate: b"key_4".to_vec(),
                count: 3,
                handle: NodeHandle { offset: 40, len: 41 },
            },
        ]);
        assert_eq!(Node::decode(&node.encode(true, false)).unwrap(), node);
    }

    #[test]
    fn spatial_internal_nodes_drop_fences() {
        let node = Node::Internal(vec![ChildRef {
            fence: Vec::new(),
            aggregate: Rect::new(0, 0, 3, 3).to_bytes().to_vec(),
            count: 7,
            handle: NodeHandle { offset: 12, len: 99 },
        }]);
        assert_eq!(Node::decode(&node.encode(true, true)).unwrap(), node);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Node::decode(&[]).is_err());
        assert!(Node::decode(&[9, 0, 0, 0, 0, 0]).is_err());
        let mut bytes = Node::Leaf(vec![entry(b"k", b"v")]).encode(false, false);
        bytes.push(0);
        assert!(Node::decode(&bytes).is_err());
        bytes.truncate(bytes.len() - 3);
        assert!(Node::decode(&bytes).is_err());
    }

    proptest! {
        #[test]
        fn leaf_codec_preserves_entries(
            mut keys in vec(vec(any::<u8>(), 0..24), 0..40),
            prefix in any::<bool>(),
        ) {
            keys.sort();
            let node = Node::Leaf(keys.iter().map(|k| entry(k, k)).collect());
            prop_assert_eq!(Node::decode(&node.encode(prefix, false)).unwrap(), node);
        }
    }
}
