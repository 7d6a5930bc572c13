//! Transactional node backing over an opaque ordered byte map.
//!
//! The host supplies the map through [`KvStore`]; nested transactions,
//! durability and locking stay on its side of the trait. This layer batches
//! every node mutation into a dirty overlay and writes nothing until
//! [`BTreePersist::commit`]. Dropping the handle without committing discards
//! the batch, and concurrent readers of the underlying map keep seeing the
//! previous snapshot.
//!
//! Keys are `tree_id || node_id`, both big-endian, so independent trees
//! share one key space and a tree's nodes stay clustered. Node id 0 holds
//! the tree metadata `(root_node_id, next_node_id)` instead of a node.

use hashbrown::{HashMap, HashSet};

use crate::storage::btree::{Key, Node, NodeBacking, Tree, MAX_ITEMS};
use crate::storage::Storage;
use crate::types::{Accumulator, Bound, Fingerprint, Id, Item, ID_SIZE};
use crate::{Error, Result};

/// Minimal view of the host's ordered key-value engine.
pub trait KvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&mut self, key: &[u8]) -> Result<()>;
}

/// Ordered-map stand-in for tests and in-process use.
#[derive(Debug, Default, Clone)]
pub struct MemKv {
    map: std::collections::BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.map.remove(key);
        Ok(())
    }
}

const KEY_BYTES: usize = 8 + ID_SIZE + 8;
const NODE_HEADER_BYTES: usize = 4 * 8 + ID_SIZE;
const NODE_BYTES: usize = NODE_HEADER_BYTES + KEY_BYTES * (MAX_ITEMS + 1);
const META_BYTES: usize = 16;

fn node_key(tree_id: u64, node_id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&tree_id.to_be_bytes());
    key[8..].copy_from_slice(&node_id.to_be_bytes());
    key
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut chunk = [0u8; 8];
    chunk.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(chunk)
}

/// Fixed-size little-endian page image of a node.
fn encode_node(node: &Node) -> Vec<u8> {
    let mut out = Vec::with_capacity(NODE_BYTES);
    out.extend_from_slice(&(node.num_items as u64).to_le_bytes());
    out.extend_from_slice(&node.accum_count.to_le_bytes());
    out.extend_from_slice(&node.next_leaf.to_le_bytes());
    out.extend_from_slice(&node.prev_leaf.to_le_bytes());
    out.extend_from_slice(node.accum.bytes());

    for key in &node.items {
        out.extend_from_slice(&key.item.timestamp.to_le_bytes());
        out.extend_from_slice(key.item.id.bytes());
        out.extend_from_slice(&key.node_id.to_le_bytes());
    }
    out
}

fn decode_node(bytes: &[u8]) -> Result<Node> {
    if bytes.len() != NODE_BYTES {
        return Err(Error::TreeCorrupt("bad node image size"));
    }

    let num_items = read_u64(bytes, 0) as usize;
    if num_items > MAX_ITEMS + 1 {
        return Err(Error::TreeCorrupt("node image item count"));
    }

    let mut accum_bytes = [0u8; ID_SIZE];
    accum_bytes.copy_from_slice(&bytes[32..32 + ID_SIZE]);

    let mut node = Node::empty();
    node.num_items = num_items;
    node.accum_count = read_u64(bytes, 8);
    node.next_leaf = read_u64(bytes, 16);
    node.prev_leaf = read_u64(bytes, 24);
    node.accum = Accumulator::from_bytes(accum_bytes);

    let mut offset = NODE_HEADER_BYTES;
    for key in node.items.iter_mut() {
        let timestamp = read_u64(bytes, offset);
        let mut id = [0u8; ID_SIZE];
        id.copy_from_slice(&bytes[offset + 8..offset + 8 + ID_SIZE]);
        let node_id = read_u64(bytes, offset + 8 + ID_SIZE);
        *key = Key {
            item: Item::new(timestamp, Id::new(id)),
            node_id,
        };
        offset += KEY_BYTES;
    }

    Ok(node)
}

struct Meta {
    root_node_id: u64,
    next_node_id: u64,
}

impl Meta {
    fn decode(value: Option<Vec<u8>>) -> Result<Self> {
        match value {
            None => Ok(Meta {
                root_node_id: 0,
                next_node_id: 1,
            }),
            Some(bytes) => {
                if bytes.len() != META_BYTES {
                    return Err(Error::TreeCorrupt("bad metadata size"));
                }
                Ok(Meta {
                    root_node_id: read_u64(&bytes, 0),
                    next_node_id: read_u64(&bytes, 8),
                })
            }
        }
    }

    fn encode(&self) -> [u8; META_BYTES] {
        let mut out = [0u8; META_BYTES];
        out[..8].copy_from_slice(&self.root_node_id.to_le_bytes());
        out[8..].copy_from_slice(&self.next_node_id.to_le_bytes());
        out
    }
}

pub(crate) struct TxnNodes<'a, K: KvStore> {
    kv: &'a mut K,
    tree_id: u64,
    dirty: HashMap<u64, Node>,
    deleted: HashSet<u64>,
    meta: Meta,
    meta_dirty: bool,
}

impl<K: KvStore> NodeBacking for TxnNodes<'_, K> {
    fn root_id(&self) -> u64 {
        self.meta.root_node_id
    }

    fn set_root_id(&mut self, node_id: u64) {
        self.meta.root_node_id = node_id;
        self.meta_dirty = true;
    }

    fn load(&self, node_id: u64) -> Result<Node> {
        if self.deleted.contains(&node_id) {
            return Err(Error::MissingNode(node_id));
        }
        if let Some(node) = self.dirty.get(&node_id) {
            return Ok(node.clone());
        }
        match self.kv.get(&node_key(self.tree_id, node_id))? {
            Some(bytes) => decode_node(&bytes),
            None => Err(Error::MissingNode(node_id)),
        }
    }

    fn store(&mut self, node_id: u64, node: &Node) -> Result<()> {
        self.deleted.remove(&node_id);
        self.dirty.insert(node_id, node.clone());
        Ok(())
    }

    fn allocate(&mut self) -> Result<u64> {
        let node_id = self.meta.next_node_id;
        self.meta.next_node_id += 1;
        self.meta_dirty = true;
        self.dirty.insert(node_id, Node::empty());
        Ok(node_id)
    }

    fn release(&mut self, node_id: u64) {
        self.dirty.remove(&node_id);
        self.deleted.insert(node_id);
    }
}

/// A B+ tree whose nodes live in a host-provided ordered map.
///
/// One handle is one write batch: reads see the overlay, mutations stay in
/// memory until [`commit`](Self::commit). Several trees can share a map by
/// opening them with distinct `tree_id`s.
pub struct BTreePersist<'a, K: KvStore> {
    tree: Tree<TxnNodes<'a, K>>,
}

impl<'a, K: KvStore> BTreePersist<'a, K> {
    pub fn open(kv: &'a mut K, tree_id: u64) -> Result<Self> {
        let meta = Meta::decode(kv.get(&node_key(tree_id, 0))?)?;
        let backing = TxnNodes {
            kv,
            tree_id,
            dirty: HashMap::new(),
            deleted: HashSet::new(),
            meta,
            meta_dirty: false,
        };
        Ok(BTreePersist {
            tree: Tree::open(backing)?,
        })
    }

    /// Returns false if the item was already present.
    pub fn insert(&mut self, timestamp: u64, id: Id) -> Result<bool> {
        self.tree.insert(Item::new(timestamp, id))
    }

    /// Returns false if no such item was present.
    pub fn erase(&mut self, timestamp: u64, id: Id) -> Result<bool> {
        self.tree.erase(&Item::new(timestamp, id))
    }

    /// Re-derive every structural invariant; for tests and debugging.
    pub fn check_invariants(&self) -> Result<()> {
        self.tree.check_invariants()
    }

    /// Write the whole batch, then the metadata if it changed.
    pub fn commit(self) -> Result<()> {
        let TxnNodes {
            kv,
            tree_id,
            dirty,
            deleted,
            meta,
            meta_dirty,
        } = self.tree.into_backing();

        let mut dirty_ids: Vec<u64> = dirty.keys().copied().collect();
        dirty_ids.sort_unstable();
        for node_id in dirty_ids {
            kv.put(&node_key(tree_id, node_id), &encode_node(&dirty[&node_id]))?;
        }

        let mut deleted_ids: Vec<u64> = deleted.iter().copied().collect();
        deleted_ids.sort_unstable();
        for node_id in deleted_ids {
            kv.delete(&node_key(tree_id, node_id))?;
        }

        if meta_dirty {
            kv.put(&node_key(tree_id, 0), &meta.encode())?;
        }
        Ok(())
    }

    /// Discard the batch. Equivalent to dropping the handle.
    pub fn abort(self) {}
}

impl<K: KvStore> Storage for BTreePersist<'_, K> {
    fn size(&self) -> usize {
        self.tree.len()
    }

    fn get_item(&self, index: usize) -> Result<Item> {
        self.tree.get_item(index)
    }

    fn iterate<F>(&self, begin: usize, end: usize, f: F) -> Result<()>
    where
        F: FnMut(&Item, usize) -> bool,
    {
        self.tree.iterate(begin, end, f)
    }

    fn find_lower_bound(&self, begin: usize, bound: &Bound) -> Result<usize> {
        self.tree.find_lower_bound(begin, bound)
    }

    fn fingerprint(&self, begin: usize, end: usize) -> Result<Fingerprint> {
        self.tree.fingerprint(begin, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ID_SIZE;

    fn id(n: u8) -> Id {
        Id::new([n; ID_SIZE])
    }

    #[test]
    fn test_node_image_roundtrip() {
        let mut node = Node::empty();
        node.num_items = 2;
        node.accum_count = 7;
        node.next_leaf = 11;
        node.prev_leaf = 3;
        node.accum.add_id(&id(0xab));
        node.items[0] = Key {
            item: Item::new(42, id(1)),
            node_id: 0,
        };
        node.items[1] = Key {
            item: Item::new(43, id(2)),
            node_id: 9,
        };

        let bytes = encode_node(&node);
        assert_eq!(bytes.len(), NODE_BYTES);

        let decoded = decode_node(&bytes).unwrap();
        assert_eq!(decoded.num_items, 2);
        assert_eq!(decoded.accum_count, 7);
        assert_eq!(decoded.next_leaf, 11);
        assert_eq!(decoded.prev_leaf, 3);
        assert_eq!(decoded.accum, node.accum);
        assert_eq!(decoded.items[0], node.items[0]);
        assert_eq!(decoded.items[1], node.items[1]);
    }

    #[test]
    fn test_decode_rejects_bad_sizes() {
        assert!(matches!(
            decode_node(&[0u8; 3]),
            Err(Error::TreeCorrupt("bad node image size"))
        ));
    }

    #[test]
    fn test_commit_then_reopen() {
        let mut kv = MemKv::new();

        {
            let mut tree = BTreePersist::open(&mut kv, 1).unwrap();
            for n in 0..40 {
                assert!(tree.insert(100 + u64::from(n), id(n)).unwrap());
            }
            tree.commit().unwrap();
        }

        let mut tree = BTreePersist::open(&mut kv, 1).unwrap();
        assert_eq!(tree.size(), 40);
        tree.check_invariants().unwrap();
        assert_eq!(tree.get_item(0).unwrap(), Item::new(100, id(0)));

        assert!(tree.erase(100, id(0)).unwrap());
        tree.commit().unwrap();

        let tree = BTreePersist::open(&mut kv, 1).unwrap();
        assert_eq!(tree.size(), 39);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_abort_discards_batch() {
        let mut kv = MemKv::new();

        {
            let mut tree = BTreePersist::open(&mut kv, 1).unwrap();
            tree.insert(1, id(1)).unwrap();
            tree.commit().unwrap();
        }

        {
            let mut tree = BTreePersist::open(&mut kv, 1).unwrap();
            tree.insert(2, id(2)).unwrap();
            tree.abort();
        }

        let tree = BTreePersist::open(&mut kv, 1).unwrap();
        assert_eq!(tree.size(), 1);
    }

    #[test]
    fn test_independent_trees_share_a_key_space() {
        let mut kv = MemKv::new();

        {
            let mut a = BTreePersist::open(&mut kv, 1).unwrap();
            a.insert(1, id(1)).unwrap();
            a.insert(2, id(2)).unwrap();
            a.commit().unwrap();
        }
        {
            let mut b = BTreePersist::open(&mut kv, 2).unwrap();
            b.insert(9, id(9)).unwrap();
            b.commit().unwrap();
        }

        let a = BTreePersist::open(&mut kv, 1).unwrap();
        assert_eq!(a.size(), 2);
        drop(a);
        let b = BTreePersist::open(&mut kv, 2).unwrap();
        assert_eq!(b.size(), 1);
        assert_eq!(b.get_item(0).unwrap(), Item::new(9, id(9)));
    }
}
