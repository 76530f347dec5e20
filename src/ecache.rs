//! Directory lookup cache.
//!
//! A red-black tree keyed by the name hash of a directory's entries, stored in
//! an arena. Index 0 is the black sentinel leaf; children and parents are arena
//! indices. Freed nodes are recycled through a free list.
//!
//! Each node keeps the full name. When two names of one directory share a
//! hash the node is marked collided and stops answering lookups, so callers
//! fall back to scanning the directory.

use bitflags::bitflags;

use crate::config::NAME_LEN;
use crate::structs::name_hash;

const NIL: usize = 0;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct NodeFlags: u8 {
        const BLACK = 1;
        const FILE = 2;
        const DIR = 4;
        const COLLIDED = 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    fn flags(self) -> NodeFlags {
        match self {
            EntryKind::File => NodeFlags::FILE,
            EntryKind::Directory => NodeFlags::DIR,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Node {
    hash: u32,
    name: [u8; NAME_LEN],
    cluster: u32,
    flags: NodeFlags,
    parent: usize,
    left: usize,
    right: usize,
}

impl Node {
    const SENTINEL: Self = Self {
        hash: 0,
        name: [0; NAME_LEN],
        cluster: 0,
        flags: NodeFlags::BLACK,
        parent: NIL,
        left: NIL,
        right: NIL,
    };
}

#[derive(Debug, Clone)]
pub struct Ecache {
    nodes: Vec<Node>,
    free: Vec<usize>,
    root: usize,
    len: usize,
}

impl Default for Ecache {
    fn default() -> Self {
        Self::new()
    }
}

impl Ecache {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::SENTINEL],
            free: Vec::new(),
            root: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.nodes.truncate(1);
        self.nodes[NIL] = Node::SENTINEL;
        self.free.clear();
        self.root = NIL;
        self.len = 0;
    }

    pub fn find(&self, name: &[u8; NAME_LEN]) -> Option<(u32, EntryKind)> {
        let x = self.find_node(name_hash(name));
        if x == NIL {
            return None;
        }
        let node = &self.nodes[x];
        if node.flags.contains(NodeFlags::COLLIDED) || node.name != *name {
            return None;
        }
        let kind = if node.flags.contains(NodeFlags::DIR) { EntryKind::Directory } else { EntryKind::File };
        Some((node.cluster, kind))
    }

    /// Inserts or updates the node for `name`.
    pub fn insert(&mut self, name: &[u8; NAME_LEN], cluster: u32, kind: EntryKind) {
        let hash = name_hash(name);
        let mut parent = NIL;
        let mut x = self.root;
        while x != NIL {
            parent = x;
            let node = &mut self.nodes[x];
            if hash == node.hash {
                if node.name == *name {
                    node.cluster = cluster;
                    node.flags = (node.flags & (NodeFlags::BLACK | NodeFlags::COLLIDED)) | kind.flags();
                } else {
                    node.flags.insert(NodeFlags::COLLIDED);
                }
                return;
            }
            x = if hash < node.hash { node.left } else { node.right };
        }

        let z = self.alloc(Node {
            hash,
            name: *name,
            cluster,
            flags: kind.flags(),
            parent,
            left: NIL,
            right: NIL,
        });
        if parent == NIL {
            self.root = z;
        } else if hash < self.nodes[parent].hash {
            self.nodes[parent].left = z;
        } else {
            self.nodes[parent].right = z;
        }
        self.len += 1;
        self.insert_fixup(z);
    }

    /// Removes the node for `name`. Returns whether it was present.
    /// A collided node stays, since the other name may still be live.
    pub fn delete(&mut self, name: &[u8; NAME_LEN]) -> bool {
        let z = self.find_node(name_hash(name));
        if z == NIL {
            return false;
        }
        let node = &self.nodes[z];
        if node.flags.contains(NodeFlags::COLLIDED) || node.name != *name {
            return false;
        }

        let mut y = z;
        let mut y_black = self.is_black(y);
        let x;
        if self.left(z) == NIL {
            x = self.right(z);
            self.transplant(z, x);
        } else if self.right(z) == NIL {
            x = self.left(z);
            self.transplant(z, x);
        } else {
            y = self.minimum(self.right(z));
            y_black = self.is_black(y);
            x = self.right(y);
            if self.parent(y) == z {
                self.nodes[x].parent = y;
            } else {
                self.transplant(y, x);
                self.nodes[y].right = self.right(z);
                let r = self.right(y);
                self.nodes[r].parent = y;
            }
            self.transplant(z, y);
            self.nodes[y].left = self.left(z);
            let l = self.left(y);
            self.nodes[l].parent = y;
            self.set_black(y, self.is_black(z));
        }
        if y_black {
            self.delete_fixup(x);
        }

        self.nodes[NIL] = Node::SENTINEL;
        self.free.push(z);
        self.len -= 1;
        true
    }

    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(i) => {
                self.nodes[i] = node;
                i
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn find_node(&self, hash: u32) -> usize {
        let mut x = self.root;
        while x != NIL {
            let node = &self.nodes[x];
            if hash == node.hash {
                return x;
            }
            x = if hash < node.hash { node.left } else { node.right };
        }
        NIL
    }

    fn left(&self, x: usize) -> usize {
        self.nodes[x].left
    }

    fn right(&self, x: usize) -> usize {
        self.nodes[x].right
    }

    fn parent(&self, x: usize) -> usize {
        self.nodes[x].parent
    }

    fn is_black(&self, x: usize) -> bool {
        self.nodes[x].flags.contains(NodeFlags::BLACK)
    }

    fn set_black(&mut self, x: usize, black: bool) {
        self.nodes[x].flags.set(NodeFlags::BLACK, black);
    }

    fn minimum(&self, mut x: usize) -> usize {
        while self.left(x) != NIL {
            x = self.left(x);
        }
        x
    }

    fn transplant(&mut self, u: usize, v: usize) {
        let p = self.parent(u);
        if p == NIL {
            self.root = v;
        } else if u == self.left(p) {
            self.nodes[p].left = v;
        } else {
            self.nodes[p].right = v;
        }
        self.nodes[v].parent = p;
    }

    fn rotate_left(&mut self, x: usize) {
        let y = self.right(x);
        let yl = self.left(y);
        self.nodes[x].right = yl;
        if yl != NIL {
            self.nodes[yl].parent = x;
        }
        self.transplant(x, y);
        self.nodes[y].left = x;
        self.nodes[x].parent = y;
    }

    fn rotate_right(&mut self, x: usize) {
        let y = self.left(x);
        let yr = self.right(y);
        self.nodes[x].left = yr;
        if yr != NIL {
            self.nodes[yr].parent = x;
        }
        self.transplant(x, y);
        self.nodes[y].right = x;
        self.nodes[x].parent = y;
    }

    fn insert_fixup(&mut self, mut z: usize) {
        while !self.is_black(self.parent(z)) {
            let p = self.parent(z);
            let g = self.parent(p);
            if p == self.left(g) {
                let u = self.right(g);
                if !self.is_black(u) {
                    self.set_black(p, true);
                    self.set_black(u, true);
                    self.set_black(g, false);
                    z = g;
                } else {
                    if z == self.right(p) {
                        z = p;
                        self.rotate_left(z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.set_black(p, true);
                    self.set_black(g, false);
                    self.rotate_right(g);
                }
            } else {
                let u = self.left(g);
                if !self.is_black(u) {
                    self.set_black(p, true);
                    self.set_black(u, true);
                    self.set_black(g, false);
                    z = g;
                } else {
                    if z == self.left(p) {
                        z = p;
                        self.rotate_right(z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.set_black(p, true);
                    self.set_black(g, false);
                    self.rotate_left(g);
                }
            }
        }
        let root = self.root;
        self.set_black(root, true);
    }

    fn delete_fixup(&mut self, mut x: usize) {
        while x != self.root && self.is_black(x) {
            let p = self.parent(x);
            if x == self.left(p) {
                let mut w = self.right(p);
                if !self.is_black(w) {
                    self.set_black(w, true);
                    self.set_black(p, false);
                    self.rotate_left(p);
                    w = self.right(self.parent(x));
                }
                if self.is_black(self.left(w)) && self.is_black(self.right(w)) {
                    self.set_black(w, false);
                    x = self.parent(x);
                } else {
                    if self.is_black(self.right(w)) {
                        let wl = self.left(w);
                        self.set_black(wl, true);
                        self.set_black(w, false);
                        self.rotate_right(w);
                        w = self.right(self.parent(x));
                    }
                    let p = self.parent(x);
                    self.set_black(w, self.is_black(p));
                    self.set_black(p, true);
                    let wr = self.right(w);
                    self.set_black(wr, true);
                    self.rotate_left(p);
                    x = self.root;
                }
            } else {
                let mut w = self.left(p);
                if !self.is_black(w) {
                    self.set_black(w, true);
                    self.set_black(p, false);
                    self.rotate_right(p);
                    w = self.left(self.parent(x));
                }
                if self.is_black(self.left(w)) && self.is_black(self.right(w)) {
                    self.set_black(w, false);
                    x = self.parent(x);
                } else {
                    if self.is_black(self.left(w)) {
                        let wr = self.right(w);
                        self.set_black(wr, true);
                        self.set_black(w, false);
                        self.rotate_left(w);
                        w = self.left(self.parent(x));
                    }
                    let p = self.parent(x);
                    self.set_black(w, self.is_black(p));
                    self.set_black(p, true);
                    let wl = self.left(w);
                    self.set_black(wl, true);
                    self.rotate_right(p);
                    x = self.root;
                }
            }
        }
        self.set_black(x, true);
    }

    /// Black height of the tree, or `None` if a red-black property is broken.
    #[cfg(test)]
    fn black_height(&self, x: usize) -> Option<usize> {
        if x == NIL {
            return Some(1);
        }
        let (l, r) = (self.left(x), self.right(x));
        if !self.is_black(x) && (!self.is_black(l) || !self.is_black(r)) {
            return None;
        }
        if (l != NIL && (self.parent(l) != x || self.nodes[l].hash >= self.nodes[x].hash))
            || (r != NIL && (self.parent(r) != x || self.nodes[r].hash <= self.nodes[x].hash))
        {
            return None;
        }
        let lh = self.black_height(l)?;
        let rh = self.black_height(r)?;
        (lh == rh).then_some(lh + self.is_black(x) as usize)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(n: u32) -> [u8; NAME_LEN] {
        let mut name = [b' '; NAME_LEN];
        name[..8].copy_from_slice(format!("{:08}", n).as_bytes());
        name
    }

    fn check(tree: &Ecache) {
        assert!(tree.is_black(tree.root));
        assert!(tree.is_black(NIL));
        assert!(tree.black_height(tree.root).is_some());
    }

    #[test]
    fn test_insert_find_update() {
        let mut tree = Ecache::new();
        for n in [50u32, 20, 80, 10, 30, 70, 90, 25] {
            tree.insert(&key(n), n + 1000, EntryKind::File);
            check(&tree);
        }
        assert_eq!(tree.len(), 8);
        assert_eq!(tree.find(&key(25)), Some((1025, EntryKind::File)));
        assert_eq!(tree.find(&key(26)), None);
        tree.insert(&key(25), 7, EntryKind::Directory);
        assert_eq!(tree.len(), 8);
        assert_eq!(tree.find(&key(25)), Some((7, EntryKind::Directory)));
    }

    #[test]
    fn test_random_insert_delete_stays_balanced() {
        let mut tree = Ecache::new();
        let mut present = std::collections::BTreeSet::new();
        let mut seed = 0x2545_F491u32;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };
        for _ in 0..2000 {
            let n = next() % 256;
            if next() % 3 == 0 {
                assert_eq!(tree.delete(&key(n)), present.remove(&n));
            } else {
                tree.insert(&key(n), n, EntryKind::File);
                present.insert(n);
            }
            check(&tree);
            assert_eq!(tree.len(), present.len());
        }
        for n in 0..256 {
            assert_eq!(tree.find(&key(n)).is_some(), present.contains(&n));
        }
    }

    #[test]
    fn test_clear_recycles() {
        let mut tree = Ecache::new();
        for n in 0..32 {
            tree.insert(&key(n), n, EntryKind::Directory);
        }
        for n in 0..16 {
            assert!(tree.delete(&key(n)));
        }
        let arena = tree.nodes.len();
        for n in 100..116 {
            tree.insert(&key(n), n, EntryKind::File);
        }
        assert_eq!(tree.nodes.len(), arena);
        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.find(&key(100)), None);
    }

    #[test]
    fn test_colliding_names_stop_answering() {
        let a = *b"DWJP4RMV   ";
        let b = *b"V0C8NO67   ";
        assert_eq!(name_hash(&a), name_hash(&b));

        let mut tree = Ecache::new();
        tree.insert(&a, 10, EntryKind::Directory);
        assert_eq!(tree.find(&b), None);
        assert!(!tree.delete(&b));
        assert_eq!(tree.find(&a), Some((10, EntryKind::Directory)));

        tree.insert(&b, 20, EntryKind::Directory);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.find(&a), None);
        assert_eq!(tree.find(&b), None);
        assert!(!tree.delete(&a));
        assert_eq!(tree.len(), 1);
        check(&tree);
    }
}
