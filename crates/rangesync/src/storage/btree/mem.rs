//! In-memory node backing.

use hashbrown::HashMap;

use crate::storage::btree::{Node, NodeBacking, Tree};
use crate::storage::Storage;
use crate::types::{Bound, Fingerprint, Id, Item};
use crate::{Error, Result};

pub(crate) struct MemNodes {
    nodes: HashMap<u64, Node>,
    root_id: u64,
    next_node_id: u64,
}

impl Default for MemNodes {
    fn default() -> Self {
        MemNodes {
            nodes: HashMap::new(),
            root_id: 0,
            next_node_id: 1,
        }
    }
}

impl NodeBacking for MemNodes {
    fn root_id(&self) -> u64 {
        self.root_id
    }

    fn set_root_id(&mut self, node_id: u64) {
        self.root_id = node_id;
    }

    fn load(&self, node_id: u64) -> Result<Node> {
        self.nodes
            .get(&node_id)
            .cloned()
            .ok_or(Error::MissingNode(node_id))
    }

    fn store(&mut self, node_id: u64, node: &Node) -> Result<()> {
        self.nodes.insert(node_id, node.clone());
        Ok(())
    }

    fn allocate(&mut self) -> Result<u64> {
        let node_id = self.next_node_id;
        self.next_node_id += 1;
        self.nodes.insert(node_id, Node::empty());
        Ok(node_id)
    }

    fn release(&mut self, node_id: u64) {
        self.nodes.remove(&node_id);
    }
}

/// Mutable ordered storage backed by an in-memory B+ tree.
///
/// Unlike [`VectorStorage`](crate::VectorStorage) there is no seal step;
/// items go in and out through `insert`/`erase` and the storage is readable
/// at any point in between.
pub struct BTreeMem {
    tree: Tree<MemNodes>,
}

impl BTreeMem {
    pub fn new() -> Self {
        BTreeMem {
            tree: Tree::new(MemNodes::default()),
        }
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
}

impl Default for BTreeMem {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for BTreeMem {
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
    fn test_insert_erase_roundtrip() {
        let mut storage = BTreeMem::new();
        assert!(storage.insert(10, id(1)).unwrap());
        assert!(storage.insert(20, id(2)).unwrap());
        assert!(!storage.insert(10, id(1)).unwrap());
        assert_eq!(storage.size(), 2);

        assert!(storage.erase(10, id(1)).unwrap());
        assert!(!storage.erase(10, id(1)).unwrap());
        assert_eq!(storage.size(), 1);
        assert_eq!(storage.get_item(0).unwrap(), Item::new(20, id(2)));
    }

    #[test]
    fn test_readable_between_mutations() {
        let mut storage = BTreeMem::new();
        for n in 0..20 {
            storage.insert(u64::from(n), id(n)).unwrap();
            assert_eq!(storage.size(), usize::from(n) + 1);
            storage
                .fingerprint(0, storage.size())
                .unwrap();
        }
        storage.check_invariants().unwrap();
    }
}
