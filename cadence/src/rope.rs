//! Persistent rope backing the `Seq` value type.
//!
//! Concat nodes are kept height-balanced: the heights of two siblings never
//! differ by more than one, so a rope over `n` leaves is at most about
//! `1.44 * log2(n)` levels deep no matter how it was built.

use std::rc::Rc;

use crate::DataCell;

#[derive(Debug)]
pub enum RopeNode {
    Leaf(Vec<DataCell>),
    Concat {
        left: Rc<RopeNode>,
        right: Rc<RopeNode>,
        count: usize,
        height: usize,
    },
}

impl RopeNode {
    pub fn count(&self) -> usize {
        match self {
            RopeNode::Leaf(values) => values.len(),
            RopeNode::Concat { count, .. } => *count,
        }
    }

    pub fn height(&self) -> usize {
        match self {
            RopeNode::Leaf(_) => 1,
            RopeNode::Concat { height, .. } => *height,
        }
    }

    fn children(&self) -> Option<(&Rc<RopeNode>, &Rc<RopeNode>)> {
        match self {
            RopeNode::Leaf(_) => None,
            RopeNode::Concat { left, right, .. } => Some((left, right)),
        }
    }

    fn node(left: Rc<RopeNode>, right: Rc<RopeNode>) -> Rc<RopeNode> {
        let count = left.count() + right.count();
        let height = left.height().max(right.height()) + 1;
        Rc::new(RopeNode::Concat {
            left,
            right,
            count,
            height,
        })
    }

    /// Join two siblings whose heights differ by at most two, rotating once
    /// or twice so the result is balanced again.
    fn balance(left: Rc<RopeNode>, right: Rc<RopeNode>) -> Rc<RopeNode> {
        if left.height() > right.height() + 1 {
            if let Some((outer, inner)) = left.children() {
                if outer.height() >= inner.height() {
                    return Self::node(outer.clone(), Self::node(inner.clone(), right));
                }
                if let Some((a, b)) = inner.children() {
                    return Self::node(
                        Self::node(outer.clone(), a.clone()),
                        Self::node(b.clone(), right),
                    );
                }
            }
        } else if right.height() > left.height() + 1 {
            if let Some((inner, outer)) = right.children() {
                if outer.height() >= inner.height() {
                    return Self::node(Self::node(left, inner.clone()), outer.clone());
                }
                if let Some((a, b)) = inner.children() {
                    return Self::node(
                        Self::node(left, a.clone()),
                        Self::node(b.clone(), outer.clone()),
                    );
                }
            }
        }
        Self::node(left, right)
    }

    /// Concatenate two ropes. When their heights are close this is a single
    /// new Concat over both roots; otherwise the shorter rope is joined into
    /// the facing spine of the taller one, copying only that path.
    fn concat(left: Rc<RopeNode>, right: Rc<RopeNode>) -> Rc<RopeNode> {
        let (hl, hr) = (left.height(), right.height());
        if hl > hr + 1 {
            if let Some((outer, inner)) = left.children() {
                let joined = Self::concat(inner.clone(), right);
                return Self::balance(outer.clone(), joined);
            }
        } else if hr > hl + 1 {
            if let Some((inner, outer)) = right.children() {
                let joined = Self::concat(left, inner.clone());
                return Self::balance(joined, outer.clone());
            }
        }
        Self::node(left, right)
    }
}

/// Copy `length` elements starting at `start` out of `node`, sharing every
/// leaf the range covers exactly.
fn slice(node: &Rc<RopeNode>, start: usize, length: usize) -> Rc<RopeNode> {
    match &**node {
        RopeNode::Leaf(values) => {
            if start == 0 && length == values.len() {
                node.clone()
            } else {
                Rc::new(RopeNode::Leaf(values[start..start + length].to_vec()))
            }
        }
        RopeNode::Concat { left, right, .. } => {
            let split = left.count();
            if start + length <= split {
                slice(left, start, length)
            } else if split <= start {
                slice(right, start - split, length)
            } else {
                let head = slice(left, start, split - start);
                let tail = slice(right, 0, length - (split - start));
                RopeNode::concat(head, tail)
            }
        }
    }
}

/// A persistent sequence value: cloning it is cheap and never copies nodes.
#[derive(Debug, Clone, Default)]
pub struct PersistentSeq {
    root: Option<Rc<RopeNode>>,
}

impl PersistentSeq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: Vec<DataCell>) -> Self {
        if values.is_empty() {
            return Self::new();
        }
        Self {
            root: Some(Rc::new(RopeNode::Leaf(values))),
        }
    }

    pub fn root(&self) -> Option<&Rc<RopeNode>> {
        self.root.as_ref()
    }

    pub fn len(&self) -> usize {
        self.root.as_ref().map_or(0, |r| r.count())
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Element at `index`; a negative index counts from the end.
    pub fn get(&self, index: i64) -> Option<DataCell> {
        let mut node = self.root.as_deref()?;
        let count = node.count() as i64;
        let index = if index < 0 { count + index } else { index };
        if index < 0 || index >= count {
            return None;
        }
        let mut i = index as usize;
        loop {
            match node {
                RopeNode::Leaf(values) => return values.get(i).copied(),
                RopeNode::Concat { left, right, .. } => {
                    if i < left.count() {
                        node = &**left;
                    } else {
                        i -= left.count();
                        node = &**right;
                    }
                }
            }
        }
    }

    /// Subsequence of `length` elements from `start`.
    ///
    /// A negative `start` takes the last `length` elements (the whole
    /// sequence when it is no longer than `length`). A start at or past the
    /// end yields an empty sequence; an overrunning length is clamped.
    pub fn slice(&self, start: i64, length: i64) -> PersistentSeq {
        let Some(root) = &self.root else {
            return Self::new();
        };
        let count = root.count() as i64;
        let length = length.max(0);
        let (start, length) = if start < 0 {
            if count <= length {
                return self.clone();
            }
            (count - length, length)
        } else {
            if count <= start {
                return Self::new();
            }
            (start, length.min(count - start))
        };
        if length == 0 {
            return Self::new();
        }
        Self {
            root: Some(slice(root, start as usize, length as usize)),
        }
    }

    /// Sequence with `values` added at the end as one new leaf.
    pub fn append(&self, values: Vec<DataCell>) -> PersistentSeq {
        let tail = PersistentSeq::from_values(values);
        self.extend(&tail)
    }

    pub fn extend(&self, other: &PersistentSeq) -> PersistentSeq {
        match (&self.root, &other.root) {
            (Some(left), Some(right)) => Self {
                root: Some(RopeNode::concat(left.clone(), right.clone())),
            },
            (Some(_), None) => self.clone(),
            (None, _) => other.clone(),
        }
    }

    /// Visit every element in order.
    pub fn for_each_cell(&self, f: &mut dyn FnMut(&DataCell)) {
        let mut pending: Vec<&RopeNode> = self.root.as_deref().into_iter().collect();
        while let Some(node) = pending.pop() {
            match node {
                RopeNode::Leaf(values) => values.iter().for_each(|v| f(v)),
                RopeNode::Concat { left, right, .. } => {
                    pending.push(right);
                    pending.push(left);
                }
            }
        }
    }

    pub fn to_vec(&self) -> Vec<DataCell> {
        let mut out = Vec::with_capacity(self.len());
        self.for_each_cell(&mut |c| out.push(*c));
        out
    }
}
