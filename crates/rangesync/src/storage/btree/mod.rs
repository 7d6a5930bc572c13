//! Order-augmented B+ tree storage.
//!
//! Every node carries the accumulator and item count of its whole subtree,
//! which is what buys O(log n) subrange fingerprints: walking from the root
//! to an offset sums the summaries of the subtrees passed over, and a
//! subrange accumulator is the difference of two such prefix sums.
//!
//! Nodes reference each other by stable `u64` ids, never by pointer; a
//! [`NodeBacking`] resolves ids to node data. [`mem`] keeps nodes in a hash
//! map, [`persist`] overlays a dirty-node cache on an opaque ordered map.
//!
//! Structural rules:
//! - interior keys carry the minimum item of their subtree;
//! - all leaves sit at the same depth and form a doubly linked list;
//! - node id 0 means "no node" and doubles as the leaf marker on keys.

pub(crate) mod mem;
pub(crate) mod persist;

use crate::types::{Accumulator, Bound, Fingerprint, Id, Item};
use crate::{storage::check_range, Error, Result};

// Production occupancy bounds. Unit tests compile with tiny nodes instead so
// a few dozen items already exercise splits, merges and rebalancing.
pub(crate) const MIN_ITEMS: usize = if cfg!(test) { 2 } else { 30 };
pub(crate) const MAX_ITEMS: usize = if cfg!(test) { 4 } else { 80 };

// Underflow repair: siblings totalling at most MAX_JOIN merge into one node,
// anything larger is redistributed. 2*MIN keeps both outcomes legal: a merge
// fits below MAX_ITEMS and a redistribution leaves both halves >= MIN_ITEMS.
pub(crate) const MAX_JOIN: usize = 2 * MIN_ITEMS;

/// One slot in a node: an item plus the child owning it. `node_id == 0`
/// marks a leaf slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Key {
    pub item: Item,
    pub node_id: u64,
}

impl Key {
    pub const EMPTY: Key = Key {
        item: Item {
            timestamp: 0,
            id: Id::new([0u8; 32]),
        },
        node_id: 0,
    };
}

#[derive(Clone)]
pub(crate) struct Node {
    pub num_items: usize,
    pub accum_count: u64,
    pub next_leaf: u64,
    pub prev_leaf: u64,
    pub accum: Accumulator,
    pub items: [Key; MAX_ITEMS + 1],
}

impl Node {
    pub fn empty() -> Self {
        Node {
            num_items: 0,
            accum_count: 0,
            next_leaf: 0,
            prev_leaf: 0,
            accum: Accumulator::new(),
            items: [Key::EMPTY; MAX_ITEMS + 1],
        }
    }

    fn is_leaf(&self) -> bool {
        self.items[0].node_id == 0
    }
}

/// Resolves node ids to node data and tracks the root.
pub(crate) trait NodeBacking {
    fn root_id(&self) -> u64;
    fn set_root_id(&mut self, node_id: u64);
    fn load(&self, node_id: u64) -> Result<Node>;
    fn store(&mut self, node_id: u64, node: &Node) -> Result<()>;
    /// Register an empty node and return its id.
    fn allocate(&mut self) -> Result<u64>;
    fn release(&mut self, node_id: u64);
}

struct Breadcrumb {
    index: usize,
    node_id: u64,
}

/// The tree algorithms, generic over where nodes live.
pub(crate) struct Tree<B: NodeBacking> {
    backing: B,
    len: usize,
}

impl<B: NodeBacking> Tree<B> {
    pub fn new(backing: B) -> Self {
        Tree { backing, len: 0 }
    }

    /// Attach to an existing tree, deriving the size from the root summary.
    pub fn open(backing: B) -> Result<Self> {
        let root_id = backing.root_id();
        let len = if root_id == 0 {
            0
        } else {
            backing.load(root_id)?.accum_count as usize
        };
        Ok(Tree { backing, len })
    }

    pub fn into_backing(self) -> B {
        self.backing
    }

    pub fn len(&self) -> usize {
        self.len
    }

    //// Mutation

    pub fn insert(&mut self, item: Item) -> Result<bool> {
        let root_id = self.backing.root_id();

        if root_id == 0 {
            let node_id = self.backing.allocate()?;
            let mut node = Node::empty();
            node.items[0] = Key { item, node_id: 0 };
            node.num_items = 1;
            node.accum.add_id(&item.id);
            node.accum_count = 1;
            self.backing.store(node_id, &node)?;
            self.backing.set_root_id(node_id);
            self.len = 1;
            return Ok(true);
        }

        // Descend to the target leaf, leaving breadcrumbs along the way

        let mut breadcrumbs: Vec<Breadcrumb> = Vec::new();
        let mut curr_id = root_id;

        while curr_id != 0 {
            let node = self.backing.load(curr_id)?;
            if node.num_items == 0 {
                return Err(Error::TreeCorrupt("empty node on insert path"));
            }

            let mut index = node.num_items - 1;
            for i in 1..node.num_items {
                if item < node.items[i].item {
                    index = i - 1;
                    break;
                }
            }

            if node.items[index].item == item {
                return Ok(false);
            }

            breadcrumbs.push(Breadcrumb {
                index,
                node_id: curr_id,
            });
            curr_id = node.items[index].node_id;
        }

        // Follow breadcrumbs back to the root

        let mut new_key = Key { item, node_id: 0 };
        let mut needs_insert = true;

        while let Some(crumb) = breadcrumbs.pop() {
            let mut node = self.backing.load(crumb.node_id)?;

            if !needs_insert {
                node.accum.add_id(&item.id);
                node.accum_count += 1;
            } else if node.num_items < MAX_ITEMS {
                // node has room
                insert_key_sorted(&mut node, new_key);
                node.accum.add_id(&item.id);
                node.accum_count += 1;
                needs_insert = false;
            } else {
                // node is full: split in two
                insert_key_sorted(&mut node, new_key);

                let right_id = self.backing.allocate()?;
                let mut right = Node::empty();

                node.num_items = MAX_ITEMS / 2 + 1;
                right.num_items = MAX_ITEMS / 2;
                for i in 0..right.num_items {
                    right.items[i] = node.items[node.num_items + i];
                    node.items[node.num_items + i] = Key::EMPTY;
                }

                self.recompute_summary(&mut node)?;
                self.recompute_summary(&mut right)?;

                if node.is_leaf() {
                    right.next_leaf = node.next_leaf;
                    right.prev_leaf = crumb.node_id;
                    node.next_leaf = right_id;
                    if right.next_leaf != 0 {
                        let mut after = self.backing.load(right.next_leaf)?;
                        after.prev_leaf = right_id;
                        self.backing.store(right.next_leaf, &after)?;
                    }
                }

                self.backing.store(right_id, &right)?;
                new_key = Key {
                    item: right.items[0].item,
                    node_id: right_id,
                };
            }

            // refresh the left-most key in case the item landed at the front
            if !node.is_leaf() {
                let child = self.backing.load(node.items[0].node_id)?;
                node.items[0].item = child.items[0].item;
            }

            self.backing.store(crumb.node_id, &node)?;
        }

        // Out of breadcrumbs but still splitting: grow a new root

        if needs_insert {
            let left = self.backing.load(root_id)?;
            let right = self.backing.load(new_key.node_id)?;

            let new_root_id = self.backing.allocate()?;
            let mut root = Node::empty();
            root.num_items = 2;
            root.accum = left.accum;
            root.accum.add(&right.accum);
            root.accum_count = left.accum_count + right.accum_count;
            root.items[0] = Key {
                item: left.items[0].item,
                node_id: root_id,
            };
            root.items[1] = Key {
                item: right.items[0].item,
                node_id: new_key.node_id,
            };
            self.backing.store(new_root_id, &root)?;
            self.backing.set_root_id(new_root_id);
        }

        self.len += 1;
        Ok(true)
    }

    pub fn erase(&mut self, item: &Item) -> Result<bool> {
        let root_id = self.backing.root_id();
        if root_id == 0 {
            return Ok(false);
        }

        let mut breadcrumbs: Vec<Breadcrumb> = Vec::new();
        let mut curr_id = root_id;

        while curr_id != 0 {
            let node = self.backing.load(curr_id)?;
            if node.num_items == 0 {
                return Err(Error::TreeCorrupt("empty node on erase path"));
            }

            let mut index = node.num_items - 1;
            for i in 1..node.num_items {
                if *item < node.items[i].item {
                    index = i - 1;
                    break;
                }
            }

            breadcrumbs.push(Breadcrumb {
                index,
                node_id: curr_id,
            });
            curr_id = node.items[index].node_id;
        }

        let leaf_crumb = match breadcrumbs.pop() {
            Some(crumb) => crumb,
            None => return Ok(false),
        };

        let mut leaf = self.backing.load(leaf_crumb.node_id)?;
        if leaf.items[leaf_crumb.index].item != *item {
            return Ok(false);
        }

        remove_key_at(&mut leaf, leaf_crumb.index);
        leaf.accum.sub_id(&item.id);
        leaf.accum_count -= 1;
        self.backing.store(leaf_crumb.node_id, &leaf)?;

        // Walk back up: fix summaries, repair underflowing children,
        // refresh stale minimum keys

        while let Some(crumb) = breadcrumbs.pop() {
            let mut node = self.backing.load(crumb.node_id)?;
            node.accum.sub_id(&item.id);
            node.accum_count -= 1;

            let mut child_idx = crumb.index;
            let child = self.backing.load(node.items[child_idx].node_id)?;

            if child.num_items < MIN_ITEMS && node.num_items >= 2 {
                let (left_idx, right_idx) = if child_idx + 1 < node.num_items {
                    (child_idx, child_idx + 1)
                } else {
                    (child_idx - 1, child_idx)
                };

                let merged = self.fix_underflow(&mut node, left_idx, right_idx)?;
                if merged && child_idx == right_idx {
                    child_idx = left_idx;
                }
            }

            let descended = self.backing.load(node.items[child_idx].node_id)?;
            node.items[child_idx].item = descended.items[0].item;

            self.backing.store(crumb.node_id, &node)?;
        }

        // Shrink the tree when the root degrades

        let mut root_id = self.backing.root_id();
        loop {
            let root = self.backing.load(root_id)?;
            if root.num_items == 0 {
                self.backing.release(root_id);
                self.backing.set_root_id(0);
                break;
            }
            if root.num_items == 1 && !root.is_leaf() {
                let child_id = root.items[0].node_id;
                self.backing.release(root_id);
                self.backing.set_root_id(child_id);
                root_id = child_id;
                continue;
            }
            break;
        }

        self.len -= 1;
        Ok(true)
    }

    /// Merge or rebalance the sibling pair at `left_idx`/`right_idx` of
    /// `parent`. Returns true when the right sibling was merged away.
    fn fix_underflow(
        &mut self,
        parent: &mut Node,
        left_idx: usize,
        right_idx: usize,
    ) -> Result<bool> {
        let left_id = parent.items[left_idx].node_id;
        let right_id = parent.items[right_idx].node_id;
        let mut left = self.backing.load(left_id)?;
        let mut right = self.backing.load(right_id)?;
        let total = left.num_items + right.num_items;

        if total <= MAX_JOIN {
            // merge right into left
            for i in 0..right.num_items {
                left.items[left.num_items + i] = right.items[i];
            }
            left.num_items = total;
            left.accum.add(&right.accum);
            left.accum_count += right.accum_count;

            if left.is_leaf() {
                left.next_leaf = right.next_leaf;
                if right.next_leaf != 0 {
                    let mut after = self.backing.load(right.next_leaf)?;
                    after.prev_leaf = left_id;
                    self.backing.store(right.next_leaf, &after)?;
                }
            }

            self.backing.store(left_id, &left)?;
            self.backing.release(right_id);
            remove_key_at(parent, right_idx);
            return Ok(true);
        }

        // redistribute so both siblings satisfy the minimum
        let left_target = if left.num_items < MIN_ITEMS {
            MIN_ITEMS
        } else {
            total - MIN_ITEMS
        };

        let mut all: Vec<Key> = Vec::with_capacity(total);
        all.extend_from_slice(&left.items[..left.num_items]);
        all.extend_from_slice(&right.items[..right.num_items]);

        left.num_items = left_target;
        left.items[..left_target].copy_from_slice(&all[..left_target]);
        right.num_items = total - left_target;
        right.items[..right.num_items].copy_from_slice(&all[left_target..]);

        self.recompute_summary(&mut left)?;
        self.recompute_summary(&mut right)?;

        parent.items[left_idx].item = left.items[0].item;
        parent.items[right_idx].item = right.items[0].item;

        self.backing.store(left_id, &left)?;
        self.backing.store(right_id, &right)?;
        Ok(false)
    }

    /// Re-derive a node's accumulator and count from its keys.
    fn recompute_summary(&self, node: &mut Node) -> Result<()> {
        let mut accum = Accumulator::new();
        let mut count = 0u64;
        for i in 0..node.num_items {
            let key = node.items[i];
            if key.node_id == 0 {
                accum.add_id(&key.item.id);
                count += 1;
            } else {
                let child = self.backing.load(key.node_id)?;
                accum.add(&child.accum);
                count += child.accum_count;
            }
        }
        node.accum = accum;
        node.accum_count = count;
        Ok(())
    }

    //// Reads

    /// Descend to the leaf holding sorted offset `index`, feeding every
    /// subtree passed over on the left to `on_skipped`. Returns the leaf and
    /// the in-leaf slot, or None when the offset is the total size.
    fn leaf_for_offset<F>(&self, mut index: usize, mut on_skipped: F) -> Result<Option<(Node, usize)>>
    where
        F: FnMut(&Node),
    {
        let root_id = self.backing.root_id();
        if root_id == 0 {
            return Ok(None);
        }

        let mut node = self.backing.load(root_id)?;
        if index > node.accum_count as usize {
            return Err(Error::OutOfRange);
        }

        'descend: loop {
            if node.is_leaf() {
                return Ok(Some((node, index)));
            }

            for i in 0..node.num_items {
                let child = self.backing.load(node.items[i].node_id)?;
                if index < child.accum_count as usize {
                    node = child;
                    continue 'descend;
                }
                index -= child.accum_count as usize;
                on_skipped(&child);
            }

            // offset equals the subtree total: fell off the right edge
            return Ok(None);
        }
    }

    pub fn get_item(&self, index: usize) -> Result<Item> {
        if index >= self.len {
            return Err(Error::OutOfRange);
        }
        match self.leaf_for_offset(index, |_| {})? {
            Some((leaf, slot)) => Ok(leaf.items[slot].item),
            None => Err(Error::OutOfRange),
        }
    }

    pub fn iterate<F>(&self, begin: usize, end: usize, mut f: F) -> Result<()>
    where
        F: FnMut(&Item, usize) -> bool,
    {
        check_range(begin, end, self.len)?;
        let num = end - begin;
        if num == 0 {
            return Ok(());
        }

        let (mut leaf, mut slot) = match self.leaf_for_offset(begin, |_| {})? {
            Some(found) => found,
            None => return Ok(()),
        };

        for i in 0..num {
            if !f(&leaf.items[slot].item, begin + i) {
                return Ok(());
            }
            slot += 1;
            if slot >= leaf.num_items && i + 1 < num {
                leaf = self.backing.load(leaf.next_leaf)?;
                slot = 0;
            }
        }
        Ok(())
    }

    pub fn find_lower_bound(&self, begin: usize, bound: &Bound) -> Result<usize> {
        if begin > self.len {
            return Err(Error::BadRange);
        }

        let root_id = self.backing.root_id();
        if root_id == 0 {
            return Ok(0);
        }

        let root = self.backing.load(root_id)?;
        let target = bound.as_item();
        if *target <= root.items[0].item {
            return Ok(begin);
        }

        let mut node = root;
        let mut num_to_left = 0usize;

        'descend: loop {
            if node.num_items == 0 {
                return Err(Error::TreeCorrupt("empty node on search path"));
            }

            if node.is_leaf() {
                for i in 1..node.num_items {
                    if *target <= node.items[i].item {
                        return Ok((num_to_left + i).max(begin));
                    }
                }
                return Ok((num_to_left + node.num_items).max(begin));
            }

            for i in 1..node.num_items {
                if *target <= node.items[i].item {
                    node = self.backing.load(node.items[i - 1].node_id)?;
                    continue 'descend;
                }
                num_to_left += self.backing.load(node.items[i - 1].node_id)?.accum_count as usize;
            }

            let last = node.items[node.num_items - 1].node_id;
            node = self.backing.load(last)?;
        }
    }

    pub fn fingerprint(&self, begin: usize, end: usize) -> Result<Fingerprint> {
        check_range(begin, end, self.len)?;

        let mut accum = self.accum_left_of(end)?;
        let mut low = self.accum_left_of(begin)?;
        low.negate();
        accum.add(&low);

        Ok(accum.fingerprint((end - begin) as u64))
    }

    /// Sum of the accumulators of all items with sorted offset < `index`,
    /// in O(log n) node visits.
    fn accum_left_of(&self, index: usize) -> Result<Accumulator> {
        let mut accum = Accumulator::new();
        if let Some((leaf, slot)) = self.leaf_for_offset(index, |skipped| accum.add(&skipped.accum))? {
            for i in 0..slot {
                accum.add_id(&leaf.items[i].item.id);
            }
        }
        Ok(accum)
    }

    //// Integrity checking

    /// Re-derive every structural invariant; for tests and debugging.
    pub fn check_invariants(&self) -> Result<()> {
        let root_id = self.backing.root_id();
        if root_id == 0 {
            if self.len != 0 {
                return Err(Error::TreeCorrupt("no root but nonzero size"));
            }
            return Ok(());
        }

        let mut ctx = VerifyContext::default();
        let (_, count) = self.verify_node(root_id, 0, true, &mut ctx)?;
        if count as usize != self.len {
            return Err(Error::TreeCorrupt("cached size mismatch"));
        }

        // leaf chain must visit every leaf in order, doubly linked
        let first = match ctx.leaf_ids.first() {
            Some(first) => *first,
            None => return Err(Error::TreeCorrupt("tree with no leaves")),
        };

        let mut node_id = first;
        let mut prev_id = 0u64;
        let mut pos = 0usize;
        let mut total = 0u64;
        let mut prev_item: Option<Item> = None;

        while node_id != 0 {
            if pos >= ctx.leaf_ids.len() || ctx.leaf_ids[pos] != node_id {
                return Err(Error::TreeCorrupt("leaf chain out of order"));
            }
            let node = self.backing.load(node_id)?;
            if node.prev_leaf != prev_id {
                return Err(Error::TreeCorrupt("leaf back-link mismatch"));
            }
            for i in 0..node.num_items {
                if let Some(prev) = prev_item {
                    if prev >= node.items[i].item {
                        return Err(Error::TreeCorrupt("leaf items out of order"));
                    }
                }
                prev_item = Some(node.items[i].item);
                total += 1;
            }
            prev_id = node_id;
            node_id = node.next_leaf;
            pos += 1;
        }

        if pos != ctx.leaf_ids.len() {
            return Err(Error::TreeCorrupt("leaf chain too short"));
        }
        if total != count {
            return Err(Error::TreeCorrupt("leaf chain count mismatch"));
        }
        Ok(())
    }

    fn verify_node(
        &self,
        node_id: u64,
        depth: usize,
        is_root: bool,
        ctx: &mut VerifyContext,
    ) -> Result<(Accumulator, u64)> {
        let node = self.backing.load(node_id)?;

        if node.num_items == 0 {
            return Err(Error::TreeCorrupt("empty node"));
        }
        if node.num_items > MAX_ITEMS {
            return Err(Error::TreeCorrupt("too many items"));
        }
        if !is_root && node.num_items < MIN_ITEMS {
            return Err(Error::TreeCorrupt("too few items"));
        }

        let is_leaf = node.is_leaf();
        if is_leaf {
            match ctx.leaf_depth {
                Some(leaf_depth) if leaf_depth != depth => {
                    return Err(Error::TreeCorrupt("leaf depth mismatch"));
                }
                None => ctx.leaf_depth = Some(depth),
                _ => {}
            }
            ctx.leaf_ids.push(node_id);
        }

        let mut accum = Accumulator::new();
        let mut count = 0u64;

        for i in 0..node.num_items {
            let key = node.items[i];
            if (key.node_id == 0) != is_leaf {
                return Err(Error::TreeCorrupt("mixed leaf and child keys"));
            }

            if key.node_id == 0 {
                accum.add_id(&key.item.id);
                count += 1;
            } else {
                let child = self.backing.load(key.node_id)?;
                if child.num_items == 0 || child.items[0].item != key.item {
                    return Err(Error::TreeCorrupt("key does not match child minimum"));
                }
                let (child_accum, child_count) =
                    self.verify_node(key.node_id, depth + 1, false, ctx)?;
                accum.add(&child_accum);
                count += child_count;
            }

            if i + 1 < node.num_items && node.items[i].item >= node.items[i + 1].item {
                return Err(Error::TreeCorrupt("items out of order"));
            }
        }

        if accum != node.accum {
            return Err(Error::TreeCorrupt("accumulator mismatch"));
        }
        if count != node.accum_count {
            return Err(Error::TreeCorrupt("count mismatch"));
        }

        Ok((accum, count))
    }
}

#[derive(Default)]
struct VerifyContext {
    leaf_depth: Option<usize>,
    leaf_ids: Vec<u64>,
}

/// Insert into a node's sorted key array; the caller guarantees room.
fn insert_key_sorted(node: &mut Node, key: Key) {
    let pos = node.items[..node.num_items].partition_point(|k| k.item < key.item);
    let mut i = node.num_items;
    while i > pos {
        node.items[i] = node.items[i - 1];
        i -= 1;
    }
    node.items[pos] = key;
    node.num_items += 1;
}

fn remove_key_at(node: &mut Node, index: usize) {
    for i in index + 1..node.num_items {
        node.items[i - 1] = node.items[i];
    }
    node.num_items -= 1;
    node.items[node.num_items] = Key::EMPTY;
}
