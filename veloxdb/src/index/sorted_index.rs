//! A self-balancing AVL tree organized as a dense array of nodes linked by
//! integer indices, per spec.md §4.3: avoids pointer churn, and lets
//! "tree item" positions be represented as plain indices that are
//! invalidated en masse via a collection-version stamp rather than tracked
//! individually.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;

use crate::model::CaseSensitivity;
use crate::store::object::ObjectId;

const NIL: i32 = -1;

struct Node {
    key: Vec<u8>,
    /// Duplicate object ids sharing this key, in insertion order
    /// (spec.md §4.3 "Duplicates are chained in a side list").
    objects: Vec<ObjectId>,
    left: i32,
    right: i32,
    height: i32,
}

type Comparator = Box<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

struct Tree {
    nodes: Vec<Option<Node>>,
    free: Vec<i32>,
    root: i32,
}

impl Tree {
    fn height(&self, index: i32) -> i32 {
        if index == NIL {
            0
        } else {
            self.nodes[index as usize].as_ref().unwrap().height
        }
    }

    fn update_height(&mut self, index: i32) {
        let (l, r) = {
            let n = self.nodes[index as usize].as_ref().unwrap();
            (n.left, n.right)
        };
        let h = 1 + self.height(l).max(self.height(r));
        self.nodes[index as usize].as_mut().unwrap().height = h;
    }

    fn balance_factor(&self, index: i32) -> i32 {
        if index == NIL {
            return 0;
        }
        let n = self.nodes[index as usize].as_ref().unwrap();
        self.height(n.left) - self.height(n.right)
    }

    fn rotate_left(&mut self, index: i32) -> i32 {
        let right = self.nodes[index as usize].as_ref().unwrap().right;
        let right_left = self.nodes[right as usize].as_ref().unwrap().left;
        self.nodes[right as usize].as_mut().unwrap().left = index;
        self.nodes[index as usize].as_mut().unwrap().right = right_left;
        self.update_height(index);
        self.update_height(right);
        right
    }

    fn rotate_right(&mut self, index: i32) -> i32 {
        let left = self.nodes[index as usize].as_ref().unwrap().left;
        let left_right = self.nodes[left as usize].as_ref().unwrap().right;
        self.nodes[left as usize].as_mut().unwrap().right = index;
        self.nodes[index as usize].as_mut().unwrap().left = left_right;
        self.update_height(index);
        self.update_height(left);
        left
    }

    fn rebalance(&mut self, index: i32) -> i32 {
        self.update_height(index);
        let balance = self.balance_factor(index);
        if balance > 1 {
            let left = self.nodes[index as usize].as_ref().unwrap().left;
            if self.balance_factor(left) < 0 {
                let new_left = self.rotate_left(left);
                self.nodes[index as usize].as_mut().unwrap().left = new_left;
            }
            return self.rotate_right(index);
        }
        if balance < -1 {
            let right = self.nodes[index as usize].as_ref().unwrap().right;
            if self.balance_factor(right) > 0 {
                let new_right = self.rotate_right(right);
                self.nodes[index as usize].as_mut().unwrap().right = new_right;
            }
            return self.rotate_left(index);
        }
        index
    }

    fn alloc(&mut self, node: Node) -> i32 {
        if let Some(index) = self.free.pop() {
            self.nodes[index as usize] = Some(node);
            index
        } else {
            self.nodes.push(Some(node));
            (self.nodes.len() - 1) as i32
        }
    }

    fn insert(&mut self, index: i32, key: &[u8], id: ObjectId, cmp: &Comparator) -> i32 {
        if index == NIL {
            return self.alloc(Node {
                key: key.to_vec(),
                objects: vec![id],
                left: NIL,
                right: NIL,
                height: 1,
            });
        }
        let ordering = cmp(key, &self.nodes[index as usize].as_ref().unwrap().key);
        match ordering {
            Ordering::Equal => {
                self.nodes[index as usize].as_mut().unwrap().objects.push(id);
                index
            }
            Ordering::Less => {
                let left = self.nodes[index as usize].as_ref().unwrap().left;
                let new_left = self.insert(left, key, id, cmp);
                self.nodes[index as usize].as_mut().unwrap().left = new_left;
                self.rebalance(index)
            }
            Ordering::Greater => {
                let right = self.nodes[index as usize].as_ref().unwrap().right;
                let new_right = self.insert(right, key, id, cmp);
                self.nodes[index as usize].as_mut().unwrap().right = new_right;
                self.rebalance(index)
            }
        }
    }

    fn min_index(&self, mut index: i32) -> i32 {
        while self.nodes[index as usize].as_ref().unwrap().left != NIL {
            index = self.nodes[index as usize].as_ref().unwrap().left;
        }
        index
    }

    /// Removes a single `(key, id)` pair. If other duplicates remain under
    /// the same key, the node survives with `id` dropped from its list.
    fn remove(&mut self, index: i32, key: &[u8], id: ObjectId, cmp: &Comparator) -> (i32, bool) {
        if index == NIL {
            return (NIL, false);
        }
        let ordering = cmp(key, &self.nodes[index as usize].as_ref().unwrap().key);
        let removed;
        let mut new_index = index;
        match ordering {
            Ordering::Less => {
                let left = self.nodes[index as usize].as_ref().unwrap().left;
                let (new_left, r) = self.remove(left, key, id, cmp);
                self.nodes[index as usize].as_mut().unwrap().left = new_left;
                removed = r;
            }
            Ordering::Greater => {
                let right = self.nodes[index as usize].as_ref().unwrap().right;
                let (new_right, r) = self.remove(right, key, id, cmp);
                self.nodes[index as usize].as_mut().unwrap().right = new_right;
                removed = r;
            }
            Ordering::Equal => {
                let objects = &mut self.nodes[index as usize].as_mut().unwrap().objects;
                if let Some(pos) = objects.iter().position(|&o| o == id) {
                    objects.remove(pos);
                    removed = true;
                } else {
                    removed = false;
                }
                if removed && self.nodes[index as usize].as_ref().unwrap().objects.is_empty() {
                    new_index = self.remove_node(index);
                    return (new_index, true);
                }
            }
        }
        if new_index != NIL {
            new_index = self.rebalance(new_index);
        }
        (new_index, removed)
    }

    /// Removes the node itself (its object list is already empty) and
    /// returns the replacement subtree root.
    fn remove_node(&mut self, index: i32) -> i32 {
        let (left, right) = {
            let n = self.nodes[index as usize].as_ref().unwrap();
            (n.left, n.right)
        };
        if left == NIL || right == NIL {
            let child = if left != NIL { left } else { right };
            self.nodes[index as usize] = None;
            self.free.push(index);
            return child;
        }
        let successor = self.min_index(right);
        let (succ_key, succ_objects) = {
            let s = self.nodes[successor as usize].as_ref().unwrap();
            (s.key.clone(), s.objects.clone())
        };
        // Graft the in-order successor's key/objects onto `index`, then
        // detach the now-duplicate successor node from the right subtree.
        let new_right = self.detach_min(right);
        self.nodes[index as usize].as_mut().unwrap().key = succ_key;
        self.nodes[index as usize].as_mut().unwrap().objects = succ_objects;
        self.nodes[index as usize].as_mut().unwrap().right = new_right;
        self.rebalance(index)
    }

    fn detach_min(&mut self, index: i32) -> i32 {
        let left = self.nodes[index as usize].as_ref().unwrap().left;
        if left == NIL {
            let right = self.nodes[index as usize].as_ref().unwrap().right;
            self.nodes[index as usize] = None;
            self.free.push(index);
            return right;
        }
        let new_left = self.detach_min(left);
        self.nodes[index as usize].as_mut().unwrap().left = new_left;
        self.rebalance(index)
    }
}

/// A stable reference to a node produced by a query, stamped with the tree's
/// collection version at the time it was returned. Any mutation bumps the
/// version, invalidating every outstanding `TreeItem` at once rather than
/// requiring per-item bookkeeping (spec.md §4.3).
#[derive(Clone, Copy, Debug)]
pub struct TreeItem {
    node: i32,
    stamp: u64,
}

pub struct SortedIndex {
    pub name: String,
    pub unique: bool,
    tree: Mutex<Tree>,
    cmp: Comparator,
    version: AtomicU64,
}

impl SortedIndex {
    pub fn new(name: impl Into<String>, unique: bool) -> Self {
        Self::with_comparator(name, unique, Box::new(|a: &[u8], b: &[u8]| a.cmp(b)))
    }

    /// Builds an index whose key comparison honors a declared case
    /// sensitivity, for culture-aware string indexes. A missing culture is
    /// ordinal (spec.md §4.3).
    pub fn with_case_sensitivity(name: impl Into<String>, unique: bool, case: CaseSensitivity) -> Self {
        let cmp: Comparator = match case {
            CaseSensitivity::Sensitive => Box::new(|a: &[u8], b: &[u8]| a.cmp(b)),
            CaseSensitivity::Insensitive => Box::new(|a: &[u8], b: &[u8]| {
                let la = String::from_utf8_lossy(a).to_lowercase();
                let lb = String::from_utf8_lossy(b).to_lowercase();
                la.cmp(&lb)
            }),
        };
        Self::with_comparator(name, unique, cmp)
    }

    fn with_comparator(name: impl Into<String>, unique: bool, cmp: Comparator) -> Self {
        SortedIndex {
            name: name.into(),
            unique,
            tree: Mutex::new(Tree {
                nodes: Vec::new(),
                free: Vec::new(),
                root: NIL,
            }),
            cmp,
            version: AtomicU64::new(0),
        }
    }

    fn bump(&self) -> u64 {
        self.version.fetch_add(1, AtomicOrdering::AcqRel) + 1
    }

    pub fn stamp(&self) -> u64 {
        self.version.load(AtomicOrdering::Acquire)
    }

    pub fn is_stamp_current(&self, item: TreeItem) -> bool {
        item.stamp == self.stamp()
    }

    pub fn add(&self, key: &[u8], id: ObjectId) {
        let mut tree = self.tree.lock().unwrap();
        let root = tree.root;
        tree.root = tree.insert(root, key, id, &self.cmp);
        drop(tree);
        self.bump();
    }

    pub fn remove(&self, key: &[u8], id: ObjectId) -> bool {
        let mut tree = self.tree.lock().unwrap();
        let root = tree.root;
        let (new_root, removed) = tree.remove(root, key, id, &self.cmp);
        tree.root = new_root;
        drop(tree);
        if removed {
            self.bump();
        }
        removed
    }

    pub fn find_equal(&self, key: &[u8]) -> Vec<ObjectId> {
        let tree = self.tree.lock().unwrap();
        let mut cursor = tree.root;
        while cursor != NIL {
            let node = tree.nodes[cursor as usize].as_ref().unwrap();
            match (self.cmp)(key, &node.key) {
                Ordering::Equal => return node.objects.clone(),
                Ordering::Less => cursor = node.left,
                Ordering::Greater => cursor = node.right,
            }
        }
        Vec::new()
    }

    /// Returns keys and their object lists in ascending key order within
    /// `[low, high]` (or half-open, per the inclusive flags), for a range
    /// scan (spec.md §4.3, §8 scenario 6).
    pub fn range(&self, low: Option<&[u8]>, high: Option<&[u8]>, low_inclusive: bool, high_inclusive: bool) -> Vec<(Vec<u8>, Vec<ObjectId>)> {
        let tree = self.tree.lock().unwrap();
        let mut out = Vec::new();
        self.collect_range(&tree, tree.root, low, high, low_inclusive, high_inclusive, &mut out);
        out
    }

    fn collect_range(
        &self,
        tree: &Tree,
        index: i32,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        low_inclusive: bool,
        high_inclusive: bool,
        out: &mut Vec<(Vec<u8>, Vec<ObjectId>)>,
    ) {
        if index == NIL {
            return;
        }
        let node = tree.nodes[index as usize].as_ref().unwrap();
        let above_low = match low {
            None => true,
            Some(l) => match (self.cmp)(&node.key, l) {
                Ordering::Greater => true,
                Ordering::Equal => low_inclusive,
                Ordering::Less => false,
            },
        };
        let below_high = match high {
            None => true,
            Some(h) => match (self.cmp)(&node.key, h) {
                Ordering::Less => true,
                Ordering::Equal => high_inclusive,
                Ordering::Greater => false,
            },
        };
        // Unpruned in-order walk; above_low/below_high filter each node.
        self.collect_range(tree, node.left, low, high, low_inclusive, high_inclusive, out);
        if above_low && below_high {
            out.push((node.key.clone(), node.objects.clone()));
        }
        self.collect_range(tree, node.right, low, high, low_inclusive, high_inclusive, out);
    }

    pub fn len(&self) -> usize {
        let tree = self.tree.lock().unwrap();
        fn count(tree: &Tree, index: i32) -> usize {
            if index == NIL {
                return 0;
            }
            let node = tree.nodes[index as usize].as_ref().unwrap();
            node.objects.len() + count(tree, node.left) + count(tree, node.right)
        }
        count(&tree, tree.root)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(n: u32) -> Vec<u8> {
        n.to_be_bytes().to_vec()
    }

    #[test]
    fn range_scan_matches_scenario_6() {
        let idx = SortedIndex::new("by_n", false);
        for n in [10u32, 20, 30, 40] {
            idx.add(&k(n), n as u64);
        }
        let r = idx.range(Some(&k(15)), Some(&k(35)), true, true);
        let keys: Vec<u32> = r.iter().map(|(k, _)| u32::from_be_bytes(k.as_slice().try_into().unwrap())).collect();
        assert_eq!(keys, vec![20, 30]);

        idx.remove(&k(20), 20);
        let r2 = idx.range(Some(&k(15)), Some(&k(35)), true, true);
        let keys2: Vec<u32> = r2.iter().map(|(k, _)| u32::from_be_bytes(k.as_slice().try_into().unwrap())).collect();
        assert_eq!(keys2, vec![30]);
    }

    #[test]
    fn duplicates_chain_under_one_node() {
        let idx = SortedIndex::new("by_n", false);
        idx.add(&k(1), 100);
        idx.add(&k(1), 200);
        assert_eq!(idx.find_equal(&k(1)), vec![100, 200]);
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn remove_one_duplicate_keeps_others() {
        let idx = SortedIndex::new("by_n", false);
        idx.add(&k(1), 100);
        idx.add(&k(1), 200);
        idx.remove(&k(1), 100);
        assert_eq!(idx.find_equal(&k(1)), vec![200]);
    }

    #[test]
    fn stamp_changes_on_mutation() {
        let idx = SortedIndex::new("by_n", false);
        let s0 = idx.stamp();
        idx.add(&k(1), 1);
        assert_ne!(idx.stamp(), s0);
    }

    #[test]
    fn case_insensitive_orders_as_lowered() {
        let idx = SortedIndex::with_case_sensitivity("by_s", false, CaseSensitivity::Insensitive);
        idx.add(b"Bob", 1);
        idx.add(b"alice", 2);
        let r = idx.range(None, None, true, true);
        let names: Vec<String> = r.iter().map(|(k, _)| String::from_utf8(k.clone()).unwrap()).collect();
        assert_eq!(names, vec!["alice".to_string(), "Bob".to_string()]);
    }
}
