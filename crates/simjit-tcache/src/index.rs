//! Ordered index of translation blocks.
//!
//! A right-threaded AVL tree stored inside the [`BlockPool`] arena. Each node keeps its left
//! child, and either its right child or (when `rthread` is set) its in-order successor. A
//! successor of `None` stands for the header sentinel, i.e. the end of an ascending walk. With
//! the threads in place an ascending walk needs neither parent pointers nor a stack, which is
//! what lets the sweeper keep a single persistent cursor between calls.
//!
//! Mutations descend with a bounded path stack and rebalance bottom-up along it. Nodes are
//! relinked rather than having their payload copied around, so a [`BlockId`] keeps naming the
//! same block for its whole life.

use std::cmp::Ordering;

use crate::block::{BlockId, TranslationBlock};
use crate::error::{CacheError, Result};
use crate::pool::BlockPool;
use crate::GuestAddr;

/// Deepest descent tolerated before the tree is declared corrupt. An AVL tree this tall would
/// need more than 3.5 million nodes.
pub const MAX_TREE_HEIGHT: usize = 32;

/// Tree linkage of a pool slot.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Links {
    left: Option<BlockId>,
    /// Right child, or the in-order successor when `rthread` is set.
    right: Option<BlockId>,
    rthread: bool,
    height: u8,
}

impl Links {
    fn leaf(successor: Option<BlockId>) -> Self {
        Self {
            left: None,
            right: successor,
            rthread: true,
            height: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Left,
    Right,
}

/// Search path: node ids together with the direction taken out of each.
struct Path {
    ids: [BlockId; MAX_TREE_HEIGHT],
    dirs: [Dir; MAX_TREE_HEIGHT],
    len: usize,
}

impl Path {
    fn new() -> Self {
        Self {
            ids: [BlockId(0); MAX_TREE_HEIGHT],
            dirs: [Dir::Left; MAX_TREE_HEIGHT],
            len: 0,
        }
    }

    fn push(&mut self, id: BlockId, dir: Dir, key: GuestAddr) -> Result<()> {
        if self.len >= MAX_TREE_HEIGHT {
            tracing::error!(key, depth = self.len, "translation index too deep");
            return Err(CacheError::IndexTooDeep {
                key,
                depth: MAX_TREE_HEIGHT,
            });
        }
        self.ids[self.len] = id;
        self.dirs[self.len] = dir;
        self.len += 1;
        Ok(())
    }

    fn last(&self) -> Option<(BlockId, Dir)> {
        self.len
            .checked_sub(1)
            .map(|i| (self.ids[i], self.dirs[i]))
    }
}

/// Maximum height of an AVL tree holding `n` nodes.
///
/// Derived from the minimum node count `N(h) = N(h-1) + N(h-2) + 1` of an AVL tree of height
/// `h`, which is the tight version of the classic `1.4405 * log2(n + 2) - 0.3277` bound.
pub fn max_avl_height(n: usize) -> usize {
    let (mut prev, mut cur) = (0usize, 1usize);
    let mut h = 0;
    while cur <= n {
        h += 1;
        let next = cur.saturating_add(prev).saturating_add(1);
        prev = cur;
        cur = next;
    }
    h
}

#[derive(Debug)]
pub struct Index {
    pool: BlockPool,
    root: Option<BlockId>,
    /// Sweeper position; `None` is the header sentinel.
    cursor: Option<BlockId>,
    max_depth: usize,
}

impl Index {
    pub fn new(capacity: usize) -> Self {
        Self {
            pool: BlockPool::new(capacity),
            root: None,
            cursor: None,
            max_depth: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pool.live_count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    #[inline]
    pub fn root(&self) -> Option<BlockId> {
        self.root
    }

    /// Height of the tree (0 when empty).
    #[inline]
    pub fn height(&self) -> usize {
        self.h(self.root)
    }

    /// Deepest search path seen since the last reset.
    #[inline]
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> Option<&TranslationBlock> {
        self.pool.block(id)
    }

    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut TranslationBlock> {
        self.pool.block_mut(id)
    }

    #[inline]
    pub(crate) fn pool(&self) -> &BlockPool {
        &self.pool
    }

    #[inline]
    pub(crate) fn key_of(&self, id: BlockId) -> GuestAddr {
        self.pool.node(id).block.key
    }

    #[inline]
    pub fn cursor(&self) -> Option<BlockId> {
        self.cursor
    }

    #[inline]
    pub fn set_cursor(&mut self, cursor: Option<BlockId>) {
        self.cursor = cursor;
    }

    /// Drop every block and return all slots to the pool.
    pub fn reset(&mut self) {
        self.pool.reset();
        self.root = None;
        self.cursor = None;
        self.max_depth = 0;
    }

    // ---- link helpers ------------------------------------------------------

    #[inline]
    fn links(&self, id: BlockId) -> Links {
        self.pool.node(id).links
    }

    #[inline]
    fn links_mut(&mut self, id: BlockId) -> &mut Links {
        &mut self.pool.node_mut(id).links
    }

    #[inline]
    fn left(&self, id: BlockId) -> Option<BlockId> {
        self.links(id).left
    }

    #[inline]
    fn right_child(&self, id: BlockId) -> Option<BlockId> {
        let links = self.links(id);
        if links.rthread {
            None
        } else {
            links.right
        }
    }

    #[inline]
    fn h(&self, id: Option<BlockId>) -> usize {
        id.map_or(0, |id| usize::from(self.links(id).height))
    }

    fn update_height(&mut self, id: BlockId) {
        let hl = self.h(self.left(id));
        let hr = self.h(self.right_child(id));
        self.links_mut(id).height = (hl.max(hr) + 1) as u8;
    }

    fn leftmost(&self, mut id: BlockId) -> BlockId {
        while let Some(l) = self.left(id) {
            id = l;
        }
        id
    }

    fn rightmost(&self, mut id: BlockId) -> BlockId {
        while let Some(r) = self.right_child(id) {
            id = r;
        }
        id
    }

    /// In-order successor of a node; `None` past the largest key.
    pub fn successor(&self, id: BlockId) -> Option<BlockId> {
        let links = self.links(id);
        if links.rthread {
            links.right
        } else {
            links.right.map(|r| self.leftmost(r))
        }
    }

    /// Next node in ascending key order after `from` (`None` = start from the header).
    ///
    /// Returns `None` once the walk wraps back to the header.
    pub fn walk_from(&self, from: Option<BlockId>) -> Option<BlockId> {
        match from {
            None => self.root.map(|root| self.leftmost(root)),
            Some(id) => self.successor(id),
        }
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            index: self,
            next: self.walk_from(None),
        }
    }

    // ---- rotations ---------------------------------------------------------

    fn rotate_right(&mut self, s: BlockId) -> BlockId {
        let Some(l) = self.left(s) else {
            return s;
        };
        // When `l` has no right child its thread points at `s`, which becomes its child now.
        let inner = self.right_child(l);
        self.links_mut(s).left = inner;
        let ll = self.links_mut(l);
        ll.right = Some(s);
        ll.rthread = false;
        self.update_height(s);
        self.update_height(l);
        l
    }

    fn rotate_left(&mut self, s: BlockId) -> BlockId {
        let Some(r) = self.right_child(s) else {
            return s;
        };
        let inner = self.left(r);
        let sl = self.links_mut(s);
        match inner {
            // `r` was the leftmost node of s's right subtree, hence s's successor.
            None => {
                sl.right = Some(r);
                sl.rthread = true;
            }
            Some(x) => {
                sl.right = Some(x);
                sl.rthread = false;
            }
        }
        self.links_mut(r).left = Some(s);
        self.update_height(s);
        self.update_height(r);
        r
    }

    /// Restore the AVL balance at `n`, returning the root of the (possibly rotated) subtree.
    fn rebalance(&mut self, n: BlockId) -> BlockId {
        let left = self.left(n);
        let right = self.right_child(n);
        let hl = self.h(left);
        let hr = self.h(right);

        if hl > hr + 1 {
            if let Some(l) = left {
                if self.h(self.left(l)) < self.h(self.right_child(l)) {
                    let nl = self.rotate_left(l);
                    self.links_mut(n).left = Some(nl);
                }
            }
            return self.rotate_right(n);
        }
        if hr > hl + 1 {
            if let Some(r) = right {
                if self.h(self.left(r)) > self.h(self.right_child(r)) {
                    let nr = self.rotate_right(r);
                    let nlinks = self.links_mut(n);
                    nlinks.right = Some(nr);
                    nlinks.rthread = false;
                }
            }
            return self.rotate_left(n);
        }
        self.update_height(n);
        n
    }

    /// Point the child slot at `path[at]` (or the root when `at == 0`) to `child`.
    fn replace_child(&mut self, path: &Path, at: usize, child: BlockId) {
        if at == 0 {
            self.root = Some(child);
            return;
        }
        let parent = path.ids[at - 1];
        let links = self.links_mut(parent);
        match path.dirs[at - 1] {
            Dir::Left => links.left = Some(child),
            Dir::Right => {
                links.right = Some(child);
                links.rthread = false;
            }
        }
    }

    fn rebalance_path(&mut self, path: &Path) {
        for i in (0..path.len).rev() {
            let id = path.ids[i];
            let sub = self.rebalance(id);
            if sub != id {
                self.replace_child(path, i, sub);
            }
        }
    }

    // ---- search ------------------------------------------------------------

    pub fn find(&self, key: GuestAddr) -> Option<BlockId> {
        let mut p = self.root;
        while let Some(id) = p {
            p = match key.cmp(&self.key_of(id)) {
                Ordering::Equal => return Some(id),
                Ordering::Less => self.left(id),
                Ordering::Greater => self.right_child(id),
            };
        }
        None
    }

    /// Node with the greatest key `<= key`, or the smallest node when every key is larger.
    ///
    /// `None` only for an empty tree.
    pub fn find_at_or_before(&self, key: GuestAddr) -> Option<BlockId> {
        let mut best = None;
        let mut p = self.root;
        while let Some(id) = p {
            if self.key_of(id) <= key {
                best = Some(id);
                p = self.right_child(id);
            } else {
                p = self.left(id);
            }
        }
        best.or_else(|| self.root.map(|root| self.leftmost(root)))
    }

    // ---- mutation ----------------------------------------------------------

    /// Find the block for `key`, inserting a fresh one if there is none.
    ///
    /// Returns `(id, true)` for an existing block. A new block has only its key set; the caller
    /// fills in the rest. Fails without modifying the tree when the pool is exhausted.
    pub fn probe(&mut self, key: GuestAddr) -> Result<(BlockId, bool)> {
        let Some(mut p) = self.root else {
            let id = self.pool.allocate()?;
            let node = self.pool.node_mut(id);
            node.links = Links::leaf(None);
            node.block.key = key;
            self.root = Some(id);
            self.max_depth = self.max_depth.max(1);
            return Ok((id, false));
        };

        let mut path = Path::new();
        loop {
            match key.cmp(&self.key_of(p)) {
                Ordering::Equal => return Ok((p, true)),
                Ordering::Less => {
                    path.push(p, Dir::Left, key)?;
                    match self.left(p) {
                        Some(l) => p = l,
                        None => break,
                    }
                }
                Ordering::Greater => {
                    path.push(p, Dir::Right, key)?;
                    match self.right_child(p) {
                        Some(r) => p = r,
                        None => break,
                    }
                }
            }
        }
        self.max_depth = self.max_depth.max(path.len + 1);

        let q = self.pool.allocate()?;
        let Some((parent, dir)) = path.last() else {
            unreachable!("non-empty tree descent records at least the root");
        };
        match dir {
            Dir::Left => {
                self.pool.node_mut(q).links = Links::leaf(Some(parent));
                self.links_mut(parent).left = Some(q);
            }
            Dir::Right => {
                let successor = self.links(parent).right;
                self.pool.node_mut(q).links = Links::leaf(successor);
                let pl = self.links_mut(parent);
                pl.right = Some(q);
                pl.rthread = false;
            }
        }
        self.pool.node_mut(q).block.key = key;

        self.rebalance_path(&path);
        Ok((q, false))
    }

    /// Remove the block for `key` from the tree and release its slot.
    ///
    /// A sweeper cursor sitting on the removed node moves to its successor. Returns `false` if
    /// no block has that key.
    pub fn delete(&mut self, key: GuestAddr) -> Result<bool> {
        let mut path = Path::new();
        let mut p = match self.root {
            Some(root) => root,
            None => return Ok(false),
        };
        loop {
            match key.cmp(&self.key_of(p)) {
                Ordering::Equal => break,
                Ordering::Less => {
                    let Some(l) = self.left(p) else {
                        return Ok(false);
                    };
                    path.push(p, Dir::Left, key)?;
                    p = l;
                }
                Ordering::Greater => {
                    let Some(r) = self.right_child(p) else {
                        return Ok(false);
                    };
                    path.push(p, Dir::Right, key)?;
                    p = r;
                }
            }
        }

        if self.cursor == Some(p) {
            self.cursor = self.successor(p);
        }

        let pl = self.links(p);
        let at = path.len;
        match self.right_child(p) {
            None => {
                if let Some(x) = pl.left {
                    // The largest node under `x` threads to `p`; hand it p's successor.
                    let m = self.rightmost(x);
                    self.links_mut(m).right = pl.right;
                    self.replace_child(&path, at, x);
                } else if let Some((parent, dir)) = path.last() {
                    let links = self.links_mut(parent);
                    match dir {
                        Dir::Left => links.left = None,
                        Dir::Right => {
                            links.right = pl.right;
                            links.rthread = true;
                        }
                    }
                } else {
                    self.root = None;
                }
            }
            Some(r) if self.left(r).is_none() => {
                // `r` is p's successor: it takes p's place and adopts p's left subtree.
                self.links_mut(r).left = pl.left;
                if let Some(x) = pl.left {
                    let m = self.rightmost(x);
                    self.links_mut(m).right = Some(r);
                }
                self.replace_child(&path, at, r);
                path.push(r, Dir::Right, key)?;
            }
            Some(r) => {
                // Splice out the successor `s` (leftmost under r) and move it into p's place.
                path.push(p, Dir::Right, key)?;
                path.push(r, Dir::Left, key)?;
                let mut s = self.left(r).unwrap_or(r);
                while let Some(l) = self.left(s) {
                    path.push(s, Dir::Left, key)?;
                    s = l;
                }
                let Some((q, _)) = path.last() else {
                    unreachable!("successor descent pushed at least r");
                };
                self.links_mut(q).left = self.right_child(s);

                let sl = self.links_mut(s);
                sl.left = pl.left;
                sl.right = pl.right;
                sl.rthread = false;
                if let Some(x) = pl.left {
                    let m = self.rightmost(x);
                    self.links_mut(m).right = Some(s);
                }
                path.ids[at] = s;
                self.replace_child(&path, at, s);
            }
        }

        self.pool.release(p);
        self.rebalance_path(&path);
        Ok(true)
    }

    // ---- validation --------------------------------------------------------

    /// Check ordering, stored heights, AVL balance and every thread link.
    ///
    /// Intended for tests and debug dumps; walks the whole tree.
    pub fn check(&self) -> std::result::Result<(), String> {
        let mut inorder = Vec::with_capacity(self.len());
        if let Some(root) = self.root {
            self.check_subtree(root, None, None, &mut inorder)?;
        }
        if inorder.len() != self.len() {
            return Err(format!(
                "tree holds {} nodes but pool has {} live slots",
                inorder.len(),
                self.len()
            ));
        }
        let height = self.height();
        if height > max_avl_height(inorder.len()) {
            return Err(format!(
                "height {height} exceeds AVL bound for {} nodes",
                inorder.len()
            ));
        }
        for (i, &id) in inorder.iter().enumerate() {
            let expected = inorder.get(i + 1).copied();
            if self.successor(id) != expected {
                return Err(format!(
                    "successor of {:#010x} is {:?}, expected {:?}",
                    self.key_of(id),
                    self.successor(id).map(|s| self.key_of(s)),
                    expected.map(|s| self.key_of(s))
                ));
            }
            let links = self.links(id);
            if links.rthread && links.right != expected {
                return Err(format!("bad thread at {:#010x}", self.key_of(id)));
            }
        }
        let walked: Vec<BlockId> = self.iter().map(|(id, _)| id).collect();
        if walked != inorder {
            return Err("threaded walk disagrees with in-order traversal".to_string());
        }
        Ok(())
    }

    fn check_subtree(
        &self,
        id: BlockId,
        lo: Option<GuestAddr>,
        hi: Option<GuestAddr>,
        out: &mut Vec<BlockId>,
    ) -> std::result::Result<usize, String> {
        let key = self.key_of(id);
        if lo.is_some_and(|lo| key <= lo) || hi.is_some_and(|hi| key >= hi) {
            return Err(format!("key {key:#010x} out of order"));
        }
        let hl = match self.left(id) {
            Some(l) => self.check_subtree(l, lo, Some(key), out)?,
            None => 0,
        };
        out.push(id);
        let hr = match self.right_child(id) {
            Some(r) => self.check_subtree(r, Some(key), hi, out)?,
            None => 0,
        };
        if hl.abs_diff(hr) > 1 {
            return Err(format!("node {key:#010x} unbalanced ({hl} vs {hr})"));
        }
        let height = hl.max(hr) + 1;
        if usize::from(self.links(id).height) != height {
            return Err(format!("node {key:#010x} has stale height"));
        }
        Ok(height)
    }
}

/// Ascending iterator over `(id, block)` pairs.
pub struct Iter<'a> {
    index: &'a Index,
    next: Option<BlockId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (BlockId, &'a TranslationBlock);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        self.next = self.index.successor(id);
        Some((id, &self.index.pool.node(id).block))
    }
}
