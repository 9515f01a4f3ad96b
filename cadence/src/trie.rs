//! Persistent hash trie backing the `Map` value type.
//!
//! Each level consumes four bits of a 32-bit key hash, top bits first. Eight
//! levels exhaust a hash; the next eight use a fresh hash of the same key
//! seeded with the epoch number, so keys whose hashes collide at one epoch
//! separate at the next. Past [`MAX_DEPTH`] keys share a collision bucket
//! searched linearly.
//!
//! Nodes are immutable and shared through `Rc`. A mutator rebuilds only the
//! nodes on the path to the change; every other subtree is shared with the
//! original map.

use std::rc::Rc;

use crate::{DataCell, Heap};

const BITS_PER_LEVEL: u32 = 4;
const FANOUT: usize = 1 << BITS_PER_LEVEL;
const LEVELS_PER_EPOCH: u32 = 32 / BITS_PER_LEVEL;
pub const MAX_DEPTH: u32 = 4 * LEVELS_PER_EPOCH;

/// Key hashing and equality as the guest language defines them.
pub trait KeyContext {
    fn key_hash(&self, key: &DataCell, epoch: u32) -> u32;
    fn key_equals(&self, a: &DataCell, b: &DataCell) -> bool;
}

#[derive(Debug)]
pub enum TrieNode {
    /// `hash` is the key hash for the epoch of the depth the node sits at.
    Value {
        key: DataCell,
        value: DataCell,
        hash: u32,
    },
    Index {
        children: [Option<Rc<TrieNode>>; FANOUT],
    },
    Collision {
        entries: Vec<(DataCell, DataCell)>,
    },
}

const fn epoch(depth: u32) -> u32 {
    depth / LEVELS_PER_EPOCH
}

const fn slot(hash: u32, depth: u32) -> usize {
    let shift = 32 - BITS_PER_LEVEL * (depth % LEVELS_PER_EPOCH + 1);
    ((hash >> shift) as usize) & (FANOUT - 1)
}

/// Hash of `key` for `depth`, reusing `hash` while the epoch is unchanged.
fn hash_for(ctx: &dyn KeyContext, key: &DataCell, hash: u32, depth: u32) -> u32 {
    if depth % LEVELS_PER_EPOCH == 0 {
        ctx.key_hash(key, epoch(depth))
    } else {
        hash
    }
}

/// Move a value node one level down. The node is shared unless the move
/// crosses into a new epoch, where its hash must be recomputed.
fn rehome(ctx: &dyn KeyContext, node: Rc<TrieNode>, depth: u32) -> Rc<TrieNode> {
    match &*node {
        TrieNode::Value { key, value, .. } if depth % LEVELS_PER_EPOCH == 0 => {
            Rc::new(TrieNode::Value {
                key: *key,
                value: *value,
                hash: ctx.key_hash(key, epoch(depth)),
            })
        }
        _ => node,
    }
}

fn value_hash(node: &TrieNode) -> u32 {
    match node {
        TrieNode::Value { hash, .. } => *hash,
        _ => 0,
    }
}

fn entry_of(node: &TrieNode) -> Option<(DataCell, DataCell)> {
    match node {
        TrieNode::Value { key, value, .. } => Some((*key, *value)),
        _ => None,
    }
}

/// Split two value nodes that landed on the same slot at `depth` into a new
/// index node.
fn merge(ctx: &dyn KeyContext, a: Rc<TrieNode>, b: Rc<TrieNode>, depth: u32) -> Rc<TrieNode> {
    if depth >= MAX_DEPTH {
        let entries = [&a, &b].into_iter().filter_map(|n| entry_of(n)).collect();
        return Rc::new(TrieNode::Collision { entries });
    }
    let (sa, sb) = (slot(value_hash(&a), depth), slot(value_hash(&b), depth));
    let a = rehome(ctx, a, depth + 1);
    let b = rehome(ctx, b, depth + 1);
    let mut children: [Option<Rc<TrieNode>>; FANOUT] = Default::default();
    if sa != sb {
        children[sa] = Some(a);
        children[sb] = Some(b);
    } else {
        children[sa] = Some(merge(ctx, a, b, depth + 1));
    }
    Rc::new(TrieNode::Index { children })
}

/// Insert or replace below `node`. Returns the new node and whether the
/// entry count grew.
fn insert(
    ctx: &dyn KeyContext,
    node: &Rc<TrieNode>,
    depth: u32,
    hash: u32,
    key: DataCell,
    value: DataCell,
) -> (Rc<TrieNode>, bool) {
    match &**node {
        TrieNode::Value { key: existing, .. } if ctx.key_equals(existing, &key) => {
            let replaced = TrieNode::Value {
                key: *existing,
                value,
                hash,
            };
            (Rc::new(replaced), false)
        }
        TrieNode::Value { .. } => {
            let incoming = Rc::new(TrieNode::Value { key, value, hash });
            (merge(ctx, node.clone(), incoming, depth), true)
        }
        TrieNode::Index { children } => {
            let i = slot(hash, depth);
            let child_hash = hash_for(ctx, &key, hash, depth + 1);
            let mut children = children.clone();
            let grew = match &children[i] {
                None => {
                    children[i] = Some(Rc::new(TrieNode::Value {
                        key,
                        value,
                        hash: child_hash,
                    }));
                    true
                }
                Some(child) => {
                    let (child, grew) = insert(ctx, child, depth + 1, child_hash, key, value);
                    children[i] = Some(child);
                    grew
                }
            };
            (Rc::new(TrieNode::Index { children }), grew)
        }
        TrieNode::Collision { entries } => {
            let mut entries = entries.clone();
            let grew = match entries.iter_mut().find(|(k, _)| ctx.key_equals(k, &key)) {
                Some(entry) => {
                    entry.1 = value;
                    false
                }
                None => {
                    entries.push((key, value));
                    true
                }
            };
            (Rc::new(TrieNode::Collision { entries }), grew)
        }
    }
}

enum Removal {
    Absent,
    /// The replacement subtree; `None` when nothing is left.
    Removed(Option<Rc<TrieNode>>),
}

fn remove(ctx: &dyn KeyContext, node: &TrieNode, depth: u32, hash: u32, key: &DataCell) -> Removal {
    match node {
        TrieNode::Value { key: existing, .. } => {
            if ctx.key_equals(existing, key) {
                Removal::Removed(None)
            } else {
                Removal::Absent
            }
        }
        TrieNode::Index { children } => {
            let i = slot(hash, depth);
            let Some(child) = &children[i] else {
                return Removal::Absent;
            };
            let child_hash = hash_for(ctx, key, hash, depth + 1);
            match remove(ctx, child, depth + 1, child_hash, key) {
                Removal::Absent => Removal::Absent,
                Removal::Removed(replacement) => {
                    let mut children = children.clone();
                    children[i] = replacement;
                    if children.iter().all(Option::is_none) {
                        Removal::Removed(None)
                    } else {
                        Removal::Removed(Some(Rc::new(TrieNode::Index { children })))
                    }
                }
            }
        }
        TrieNode::Collision { entries } => {
            let Some(pos) = entries.iter().position(|(k, _)| ctx.key_equals(k, key)) else {
                return Removal::Absent;
            };
            let mut entries = entries.clone();
            entries.remove(pos);
            if entries.is_empty() {
                Removal::Removed(None)
            } else {
                Removal::Removed(Some(Rc::new(TrieNode::Collision { entries })))
            }
        }
    }
}

/// A persistent map value: cloning it is cheap and never copies nodes.
#[derive(Debug, Clone, Default)]
pub struct PersistentMap {
    root: Option<Rc<TrieNode>>,
    len: usize,
}

impl PersistentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn root(&self) -> Option<&Rc<TrieNode>> {
        self.root.as_ref()
    }

    pub fn get(&self, ctx: &dyn KeyContext, key: &DataCell) -> Option<DataCell> {
        let mut node = self.root.as_deref()?;
        let mut depth = 0;
        let mut hash = ctx.key_hash(key, 0);
        loop {
            match node {
                TrieNode::Value { key: k, value, .. } => {
                    return ctx.key_equals(k, key).then_some(*value);
                }
                TrieNode::Index { children } => {
                    node = children[slot(hash, depth)].as_deref()?;
                    depth += 1;
                    hash = hash_for(ctx, key, hash, depth);
                }
                TrieNode::Collision { entries } => {
                    return entries
                        .iter()
                        .find(|(k, _)| ctx.key_equals(k, key))
                        .map(|(_, v)| *v);
                }
            }
        }
    }

    pub fn contains(&self, ctx: &dyn KeyContext, key: &DataCell) -> bool {
        self.get(ctx, key).is_some()
    }

    pub fn update(&self, ctx: &dyn KeyContext, key: DataCell, value: DataCell) -> PersistentMap {
        let hash = ctx.key_hash(&key, 0);
        match &self.root {
            None => PersistentMap {
                root: Some(Rc::new(TrieNode::Value { key, value, hash })),
                len: 1,
            },
            Some(root) => {
                let (root, grew) = insert(ctx, root, 0, hash, key, value);
                PersistentMap {
                    root: Some(root),
                    len: self.len + grew as usize,
                }
            }
        }
    }

    /// Map without `key`, or `None` when the key is absent so the caller can
    /// keep the original.
    pub fn remove(&self, ctx: &dyn KeyContext, key: &DataCell) -> Option<PersistentMap> {
        let root = self.root.as_deref()?;
        match remove(ctx, root, 0, ctx.key_hash(key, 0), key) {
            Removal::Absent => None,
            Removal::Removed(root) => Some(PersistentMap {
                root,
                len: self.len - 1,
            }),
        }
    }

    pub fn iter(&self) -> TrieCursor {
        TrieCursor::new(self.root.clone())
    }

    /// Visit every key and value without building a cursor.
    pub fn for_each_cell(&self, f: &mut dyn FnMut(&DataCell)) {
        fn walk(node: &TrieNode, f: &mut dyn FnMut(&DataCell)) {
            match node {
                TrieNode::Value { key, value, .. } => {
                    f(key);
                    f(value);
                }
                TrieNode::Index { children } => {
                    for child in children.iter().flatten() {
                        walk(child, f);
                    }
                }
                TrieNode::Collision { entries } => {
                    for (key, value) in entries {
                        f(key);
                        f(value);
                    }
                }
            }
        }
        if let Some(root) = &self.root {
            walk(root, f);
        }
    }
}

/// Owning depth-first cursor over the entries of a map snapshot.
#[derive(Debug, Clone)]
pub struct TrieCursor {
    stack: Vec<Rc<TrieNode>>,
    positions: Vec<usize>,
}

impl TrieCursor {
    fn new(root: Option<Rc<TrieNode>>) -> Self {
        let mut cursor = Self {
            stack: Vec::new(),
            positions: Vec::new(),
        };
        if let Some(root) = root {
            cursor.stack.push(root);
            cursor.positions.push(0);
        }
        cursor
    }

    pub fn is_done(&self) -> bool {
        self.clone().next().is_none()
    }
}

impl Iterator for TrieCursor {
    type Item = (DataCell, DataCell);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = self.stack.last()?.clone();
            let pos = self.positions.last_mut()?;
            match &*node {
                TrieNode::Value { key, value, .. } => {
                    self.stack.pop();
                    self.positions.pop();
                    return Some((*key, *value));
                }
                TrieNode::Index { children } => {
                    let Some(i) = (*pos..FANOUT).find(|i| children[*i].is_some()) else {
                        self.stack.pop();
                        self.positions.pop();
                        continue;
                    };
                    *pos = i + 1;
                    if let Some(child) = &children[i] {
                        self.stack.push(child.clone());
                        self.positions.push(0);
                    }
                }
                TrieNode::Collision { entries } => {
                    if let Some(entry) = entries.get(*pos) {
                        *pos += 1;
                        return Some(*entry);
                    }
                    self.stack.pop();
                    self.positions.pop();
                }
            }
        }
    }
}

const HASH_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// Seeded hash of a hashable value for one rehash epoch.
pub fn seeded_hash(value: impl std::hash::Hash, epoch: u32) -> u32 {
    let state = ahash::RandomState::with_seeds(
        HASH_SEEDS[0] ^ epoch as u64,
        HASH_SEEDS[1],
        HASH_SEEDS[2],
        HASH_SEEDS[3],
    );
    let h = state.hash_one(value);
    (h ^ (h >> 32)) as u32
}

/// Reference keys with a structural hash compare by kind, vtable and
/// `equals`; every other key compares by bits.
impl KeyContext for Heap {
    fn key_hash(&self, key: &DataCell, epoch: u32) -> u32 {
        if let DataCell::Ref(r) = key {
            if let Ok(object) = self.get(*r) {
                if let Some(h) = object.hash_value() {
                    return seeded_hash((object.kind(), h), epoch);
                }
            }
        }
        seeded_hash(key.raw_bits(), epoch)
    }

    fn key_equals(&self, a: &DataCell, b: &DataCell) -> bool {
        if a.bit_eq(b) {
            return true;
        }
        let (DataCell::Ref(ra), DataCell::Ref(rb)) = (a, b) else {
            return false;
        };
        let (Ok(oa), Ok(ob)) = (self.get(*ra), self.get(*rb)) else {
            return false;
        };
        oa.hash_value().is_some()
            && oa.kind() == ob.kind()
            && crate::vtable::same_vtable(oa.vtable(), ob.vtable())
            && oa.equals(ob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::StringObject;

    struct Bits;

    impl KeyContext for Bits {
        fn key_hash(&self, key: &DataCell, epoch: u32) -> u32 {
            seeded_hash(key.raw_bits(), epoch)
        }

        fn key_equals(&self, a: &DataCell, b: &DataCell) -> bool {
            a.bit_eq(b)
        }
    }

    /// Every key hashes the same at every epoch.
    struct Colliding;

    impl KeyContext for Colliding {
        fn key_hash(&self, _key: &DataCell, _epoch: u32) -> u32 {
            0xdead_beef
        }

        fn key_equals(&self, a: &DataCell, b: &DataCell) -> bool {
            a.bit_eq(b)
        }
    }

    /// Every key hashes the same in the first epoch and apart afterwards.
    struct FirstEpochColliding;

    impl KeyContext for FirstEpochColliding {
        fn key_hash(&self, key: &DataCell, epoch: u32) -> u32 {
            if epoch == 0 {
                0x0bad_f00d
            } else {
                seeded_hash(key.raw_bits(), epoch)
            }
        }

        fn key_equals(&self, a: &DataCell, b: &DataCell) -> bool {
            a.bit_eq(b)
        }
    }

    /// Deepest level holding a value, and the number of collision buckets.
    fn shape(node: &TrieNode, depth: u32) -> (u32, usize) {
        match node {
            TrieNode::Value { .. } => (depth, 0),
            TrieNode::Collision { .. } => (depth, 1),
            TrieNode::Index { children } => children
                .iter()
                .flatten()
                .map(|child| shape(child, depth + 1))
                .fold((depth, 0), |(d, c), (cd, cc)| (d.max(cd), c + cc)),
        }
    }

    fn build(ctx: &dyn KeyContext, n: i64) -> PersistentMap {
        (0..n).fold(PersistentMap::new(), |m, k| {
            m.update(ctx, DataCell::I64(k), DataCell::I64(k * 100))
        })
    }

    #[test]
    fn twenty_keys_then_remove_one() {
        let m = build(&Bits, 20);
        assert_eq!(m.len(), 20);
        for k in 0..20 {
            assert_eq!(m.get(&Bits, &DataCell::I64(k)), Some(DataCell::I64(k * 100)));
        }
        let removed = m.remove(&Bits, &DataCell::I64(10)).unwrap();
        assert_eq!(removed.len(), 19);
        assert_eq!(removed.get(&Bits, &DataCell::I64(10)), None);
        assert!(m.contains(&Bits, &DataCell::I64(10)));
    }

    #[test]
    fn update_leaves_original_untouched() {
        let m = build(&Bits, 50);
        let m2 = m.update(&Bits, DataCell::I64(7), DataCell::Bool(true));
        assert_eq!(m.get(&Bits, &DataCell::I64(7)), Some(DataCell::I64(700)));
        assert_eq!(m2.get(&Bits, &DataCell::I64(7)), Some(DataCell::Bool(true)));
        assert_eq!(m2.len(), 50);
    }

    #[test]
    fn removing_absent_key_keeps_the_map() {
        let m = build(&Bits, 5);
        assert!(m.remove(&Bits, &DataCell::I64(99)).is_none());
        assert!(PersistentMap::new().remove(&Bits, &DataCell::Nil).is_none());
    }

    #[test]
    fn removing_the_only_entry_empties_the_map() {
        let m = PersistentMap::new().update(&Bits, DataCell::Nil, DataCell::I64(1));
        let empty = m.remove(&Bits, &DataCell::Nil).unwrap();
        assert!(empty.is_empty());
        assert!(empty.root().is_none());
    }

    #[test]
    fn untouched_subtrees_are_shared() {
        let m = build(&Bits, 200);
        let m2 = m.update(&Bits, DataCell::I64(3), DataCell::Nil);
        let (Some(TrieNode::Index { children: a }), Some(TrieNode::Index { children: b })) =
            (m.root().map(|r| &**r), m2.root().map(|r| &**r))
        else {
            panic!("expected index roots");
        };
        let changed = slot(Bits.key_hash(&DataCell::I64(3), 0), 0);
        for i in 0..FANOUT {
            match (&a[i], &b[i]) {
                (Some(x), Some(y)) if i != changed => assert!(Rc::ptr_eq(x, y)),
                (Some(x), Some(y)) => assert!(!Rc::ptr_eq(x, y)),
                (None, None) => {}
                _ => panic!("slot {i} changed shape"),
            }
        }
    }

    #[test]
    fn fully_colliding_keys_land_in_a_bucket() {
        let m = build(&Colliding, 4);
        assert_eq!(m.len(), 4);
        for k in 0..4 {
            assert_eq!(m.get(&Colliding, &DataCell::I64(k)), Some(DataCell::I64(k * 100)));
        }
        let m = m.remove(&Colliding, &DataCell::I64(2)).unwrap();
        assert_eq!(m.len(), 3);
        assert!(!m.contains(&Colliding, &DataCell::I64(2)));
        assert_eq!(m.iter().count(), 3);
    }

    #[test]
    fn keys_colliding_in_one_epoch_separate_in_the_next() {
        let ctx = FirstEpochColliding;
        let m = build(&ctx, 64);
        assert_eq!(m.len(), 64);
        for k in 0..64 {
            assert_eq!(m.get(&ctx, &DataCell::I64(k)), Some(DataCell::I64(k * 100)));
        }
        let (depth, buckets) = shape(m.root().unwrap(), 0);
        assert!(depth > LEVELS_PER_EPOCH, "values stopped at depth {depth}");
        assert_eq!(buckets, 0);

        let m = (0..64)
            .step_by(2)
            .fold(m, |m, k| m.remove(&ctx, &DataCell::I64(k)).unwrap());
        assert_eq!(m.len(), 32);
        assert!(!m.contains(&ctx, &DataCell::I64(10)));
        assert_eq!(m.get(&ctx, &DataCell::I64(11)), Some(DataCell::I64(1100)));
        let mut keys: Vec<i64> = m.iter().filter_map(|(k, _)| k.as_i64()).collect();
        keys.sort();
        assert_eq!(keys, (1..64).step_by(2).collect::<Vec<_>>());
        assert_eq!(shape(m.root().unwrap(), 0).1, 0);
    }

    #[test]
    fn cursor_visits_every_entry_once() {
        let m = build(&Bits, 64);
        let mut keys: Vec<i64> = m.iter().filter_map(|(k, _)| k.as_i64()).collect();
        keys.sort();
        assert_eq!(keys, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn string_keys_compare_by_content() {
        let mut heap = Heap::default();
        let a = heap.allocate(StringObject::new("key"));
        let b = heap.allocate(StringObject::new("key"));
        let m = PersistentMap::new().update(&heap, a.into(), DataCell::I64(1));
        assert_eq!(m.get(&heap, &b.into()), Some(DataCell::I64(1)));
        let m = m.update(&heap, b.into(), DataCell::I64(2));
        assert_eq!(m.len(), 1);
    }
}
