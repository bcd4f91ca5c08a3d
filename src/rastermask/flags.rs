use std::io::{Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};

use crate::error::{Result, TileStoreError};

const TAG_EMPTY: u8 = 0;
const TAG_FULL: u8 = 1;
const TAG_MIXED: u8 = 2;

/// One node of the flag quad-tree. A uniform node covers its whole square
/// with a single byte value; zero means "no tile".
#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Uniform(u8),
    Mixed(Box<[Node; 4]>),
}

impl Node {
    fn get(&self, level: u8, x: u32, y: u32) -> u8 {
        match self {
            Node::Uniform(v) => *v,
            Node::Mixed(children) => {
                let child = quadrant(level, x, y);
                children[child].get(level - 1, x, y)
            }
        }
    }

    fn update(&mut self, level: u8, x: u32, y: u32, op: &impl Fn(u8) -> u8) {
        if level == 0 {
            if let Node::Uniform(v) = self {
                *v = op(*v);
            }
            return;
        }
        if let Node::Uniform(v) = *self {
            if op(v) == v {
                return;
            }
            *self = Node::Mixed(Box::new([
                Node::Uniform(v),
                Node::Uniform(v),
                Node::Uniform(v),
                Node::Uniform(v),
            ]));
        }
        if let Node::Mixed(children) = self {
            let child = quadrant(level, x, y);
            children[child].update(level - 1, x, y, op);
        }
        self.collapse();
    }

    fn collapse(&mut self) {
        if let Node::Mixed(children) = self {
            if let Node::Uniform(first) = children[0] {
                if children[1..]
                    .iter()
                    .all(|c| matches!(c, Node::Uniform(v) if *v == first))
                {
                    *self = Node::Uniform(first);
                }
            }
        }
    }

    fn count_matching(&self, level: u8, mask: u8) -> u64 {
        match self {
            Node::Uniform(v) => {
                if *v & mask != 0 {
                    1u64 << (2 * level as u64)
                } else {
                    0
                }
            }
            Node::Mixed(children) => children
                .iter()
                .map(|c| c.count_matching(level - 1, mask))
                .sum(),
        }
    }

    fn for_each_quad(&self, level: u8, x: u32, y: u32, op: &mut impl FnMut(u32, u32, u32, u8)) {
        match self {
            Node::Uniform(0) => {}
            Node::Uniform(v) => op(x, y, 1 << level, *v),
            Node::Mixed(children) => {
                let half = 1u32 << (level - 1);
                children[0].for_each_quad(level - 1, x, y, op);
                children[1].for_each_quad(level - 1, x + half, y, op);
                children[2].for_each_quad(level - 1, x, y + half, op);
                children[3].for_each_quad(level - 1, x + half, y + half, op);
            }
        }
    }

    fn combine(&mut self, other: &Node, op: &impl Fn(u8, u8) -> u8) {
        match (&mut *self, other) {
            (Node::Uniform(a), Node::Uniform(b)) => *a = op(*a, *b),
            (Node::Mixed(a), Node::Mixed(b)) => {
                for (ac, bc) in a.iter_mut().zip(b.iter()) {
                    ac.combine(bc, op);
                }
                self.collapse();
            }
            (Node::Uniform(a), Node::Mixed(b)) => {
                let mut children = Box::new([
                    Node::Uniform(*a),
                    Node::Uniform(*a),
                    Node::Uniform(*a),
                    Node::Uniform(*a),
                ]);
                for (ac, bc) in children.iter_mut().zip(b.iter()) {
                    ac.combine(bc, op);
                }
                *self = Node::Mixed(children);
                self.collapse();
            }
            (Node::Mixed(a), Node::Uniform(b)) => {
                let b_node = Node::Uniform(*b);
                for ac in a.iter_mut() {
                    ac.combine(&b_node, op);
                }
                self.collapse();
            }
        }
    }

    fn write(&self, out: &mut impl Write) -> Result<()> {
        match self {
            Node::Uniform(0) => out.write_u8(TAG_EMPTY)?,
            Node::Uniform(v) => {
                out.write_u8(TAG_FULL)?;
                out.write_u8(*v)?;
            }
            Node::Mixed(children) => {
                out.write_u8(TAG_MIXED)?;
                for child in children.iter() {
                    child.write(out)?;
                }
            }
        }
        Ok(())
    }

    fn read(input: &mut impl Read, level: u8) -> Result<Node> {
        Ok(match input.read_u8()? {
            TAG_EMPTY => Node::Uniform(0),
            TAG_FULL => Node::Uniform(input.read_u8()?),
            TAG_MIXED if level > 0 => {
                let mut children = Box::new([
                    Node::Uniform(0),
                    Node::Uniform(0),
                    Node::Uniform(0),
                    Node::Uniform(0),
                ]);
                for child in children.iter_mut() {
                    *child = Node::read(input, level - 1)?;
                }
                Node::Mixed(children)
            }
            tag => {
                return Err(TileStoreError::Format(format!(
                    "invalid flag mask node tag {tag}"
                )))
            }
        })
    }
}

fn quadrant(level: u8, x: u32, y: u32) -> usize {
    (((x >> (level - 1)) & 1) + (((y >> (level - 1)) & 1) << 1)) as usize
}

/// Byte-per-cell quad-tree over a `2^order` square.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagMask {
    order: u8,
    root: Node,
}

impl FlagMask {
    pub fn empty(order: u8) -> Self {
        FlagMask {
            order,
            root: Node::Uniform(0),
        }
    }

    /// Uniform mask with every cell set to `value`.
    pub fn filled(order: u8, value: u8) -> Self {
        FlagMask {
            order,
            root: Node::Uniform(value),
        }
    }

    pub fn order(&self) -> u8 {
        self.order
    }

    pub fn dims(&self) -> u32 {
        1 << self.order
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.root, Node::Uniform(0))
    }

    pub fn get(&self, x: u32, y: u32) -> u8 {
        if x >= self.dims() || y >= self.dims() {
            return 0;
        }
        self.root.get(self.order, x, y)
    }

    pub fn set(&mut self, x: u32, y: u32, value: u8) {
        self.update(x, y, |_| value);
    }

    /// Apply `op` to the cell value at `(x, y)`.
    pub fn update(&mut self, x: u32, y: u32, op: impl Fn(u8) -> u8) {
        if x >= self.dims() || y >= self.dims() {
            return;
        }
        self.root.update(self.order, x, y, &op);
    }

    /// Count cells whose value intersects `mask`.
    pub fn count_matching(&self, mask: u8) -> u64 {
        self.root.count_matching(self.order, mask)
    }

    /// Visit every maximal nonzero quad as `(x, y, size, value)`.
    pub fn for_each_quad(&self, mut op: impl FnMut(u32, u32, u32, u8)) {
        self.root.for_each_quad(self.order, 0, 0, &mut op);
    }

    /// Visit every nonzero cell as `(x, y, value)`.
    pub fn for_each(&self, mut op: impl FnMut(u32, u32, u8)) {
        self.for_each_quad(|x, y, size, value| {
            for j in y..y + size {
                for i in x..x + size {
                    op(i, j, value);
                }
            }
        });
    }

    /// Combine cell-wise with another mask of the same order.
    pub fn combine(&mut self, other: &FlagMask, op: impl Fn(u8, u8) -> u8) {
        debug_assert_eq!(self.order, other.order);
        self.root.combine(&other.root, &op);
    }

    /// Half-resolution mask; parent value is the bitwise OR of children.
    pub fn coarsened(&self) -> FlagMask {
        if self.order == 0 {
            return self.clone();
        }
        let mut out = FlagMask::empty(self.order - 1);
        self.for_each(|x, y, v| out.update(x / 2, y / 2, |old| old | v));
        out
    }

    /// Double-resolution mask; each cell value spreads to its four children.
    pub fn refined(&self) -> FlagMask {
        let mut out = FlagMask::empty(self.order + 1);
        self.for_each_quad(|x, y, size, v| {
            for j in (2 * y)..(2 * (y + size)) {
                for i in (2 * x)..(2 * (x + size)) {
                    out.set(i, j, v);
                }
            }
        });
        out
    }

    pub fn write(&self, out: &mut impl Write) -> Result<()> {
        out.write_u8(self.order)?;
        self.root.write(out)
    }

    pub fn read(input: &mut impl Read) -> Result<FlagMask> {
        let order = input.read_u8()?;
        let root = Node::read(input, order)?;
        Ok(FlagMask { order, root })
    }
}
