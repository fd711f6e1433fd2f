use crate::config::{HEADER, MAX_KEY_LEN, MAX_VALUE_LEN, PAGE_SIZE, Ptr};
use crate::node::{
    leaf_delete, leaf_insert, leaf_update, merge, split3, Node, BNODE_LEAF, BNODE_NODE,
};

// Page management capabilities the tree needs from the pager. The tree
// never mutates a page in place: a copy-on-write step dereferences old
// pages, deallocates them, and allocates fresh images for the results.
pub trait PageStore {
    // dereference a pointer
    fn page_get(&self, ptr: Ptr) -> Node;
    // allocate a page for a new node image
    fn page_new(&mut self, node: Node) -> Ptr;
    // deallocate a page
    fn page_del(&mut self, ptr: Ptr);
}

#[derive(Default)]
pub struct BTree {
    // pointer to the root page (0 for an empty tree)
    pub root: Ptr,
}

impl BTree {
    pub fn get<S: PageStore>(&self, store: &S, key: &[u8]) -> Option<Vec<u8>> {
        if self.root == 0 {
            return None;
        }
        let mut node = store.page_get(self.root);
        loop {
            let idx = node.lookup_le(key);
            match node.btype() {
                BNODE_LEAF => {
                    if node.get_key(idx) == key {
                        return Some(node.get_val(idx).to_vec());
                    }
                    return None;
                }
                BNODE_NODE => node = store.page_get(node.get_ptr(idx)),
                _ => panic!("bad node!"),
            }
        }
    }

    pub fn insert<S: PageStore>(&mut self, store: &mut S, key: &[u8], value: &[u8]) {
        assert!(!key.is_empty() && key.len() <= MAX_KEY_LEN, "bad key!");
        assert!(value.len() <= MAX_VALUE_LEN, "bad value!");

        if self.root == 0 {
            // Create the first node. The dummy empty key makes the tree
            // cover the whole key space, so a lookup can always find a
            // containing node.
            let mut root = Node::new(PAGE_SIZE);
            root.set_header(BNODE_LEAF, 2);
            root.append_kv(0, 0, b"", b"");
            root.append_kv(1, 0, key, value);
            self.root = store.page_new(root);
            return;
        }

        let node = store.page_get(self.root);
        store.page_del(self.root);

        let node = tree_insert(store, node, key, value);
        let mut split = split3(node);
        if split.len() > 1 {
            // the root was split, add a new level
            let mut root = Node::new(PAGE_SIZE);
            root.set_header(BNODE_NODE, split.len());
            for (i, knode) in split.into_iter().enumerate() {
                let first = knode.get_key(0).to_vec();
                let ptr = store.page_new(knode);
                root.append_kv(i, ptr, &first, b"");
            }
            self.root = store.page_new(root);
        } else {
            self.root = store.page_new(split.pop().unwrap());
        }
    }

    // Remove a key, returning whether it was present.
    pub fn delete<S: PageStore>(&mut self, store: &mut S, key: &[u8]) -> bool {
        assert!(!key.is_empty() && key.len() <= MAX_KEY_LEN, "bad key!");

        if self.root == 0 {
            return false;
        }
        let root = store.page_get(self.root);
        let Some(updated) = tree_delete(store, root, key) else {
            return false; // not found
        };

        store.page_del(self.root);
        if updated.btype() == BNODE_NODE && updated.nkeys() == 1 {
            // remove a level
            self.root = updated.get_ptr(0);
        } else {
            self.root = store.page_new(updated);
        }
        true
    }
}

// Insert an entry into a node; the result may be oversized and is split
// by the caller, who also deallocated the input node.
fn tree_insert<S: PageStore>(store: &mut S, node: Node, key: &[u8], val: &[u8]) -> Node {
    // the result is allowed to be bigger than one page
    let mut new = Node::new(2 * PAGE_SIZE);

    let idx = node.lookup_le(key);
    match node.btype() {
        BNODE_LEAF => {
            if node.get_key(idx) == key {
                // found the key, update it
                leaf_update(&mut new, &node, idx, key, val);
            } else {
                // insert after the containing entry
                leaf_insert(&mut new, &node, idx + 1, key, val);
            }
        }
        BNODE_NODE => node_insert(store, &mut new, &node, idx, key, val),
        _ => panic!("bad node!"),
    }
    new
}

// recursive insertion into a kid node
fn node_insert<S: PageStore>(
    store: &mut S,
    new: &mut Node,
    node: &Node,
    idx: usize,
    key: &[u8],
    val: &[u8],
) {
    let kptr = node.get_ptr(idx);
    let knode = store.page_get(kptr);
    store.page_del(kptr);

    let knode = tree_insert(store, knode, key, val);
    let split = split3(knode);
    node_replace_kid_n(store, new, node, idx, split);
}

// replace one link with one or more links
fn node_replace_kid_n<S: PageStore>(
    store: &mut S,
    new: &mut Node,
    old: &Node,
    idx: usize,
    kids: Vec<Node>,
) {
    let inc = kids.len();
    new.set_header(BNODE_NODE, old.nkeys() + inc - 1);
    new.append_range(old, 0, 0, idx);
    for (i, node) in kids.into_iter().enumerate() {
        let first = node.get_key(0).to_vec();
        let ptr = store.page_new(node);
        new.append_kv(idx + i, ptr, &first, b"");
    }
    new.append_range(old, idx + inc, idx + 1, old.nkeys() - (idx + 1));
}

// Delete a key from the subtree. Returns None when the key is absent;
// the caller deallocates the input node only on an actual deletion.
fn tree_delete<S: PageStore>(store: &mut S, node: Node, key: &[u8]) -> Option<Node> {
    let idx = node.lookup_le(key);
    match node.btype() {
        BNODE_LEAF => {
            if node.get_key(idx) != key {
                return None; // not found
            }
            let mut new = Node::new(PAGE_SIZE);
            leaf_delete(&mut new, &node, idx);
            Some(new)
        }
        BNODE_NODE => node_delete(store, node, idx, key),
        _ => panic!("bad node!"),
    }
}

fn node_delete<S: PageStore>(store: &mut S, node: Node, idx: usize, key: &[u8]) -> Option<Node> {
    // recurse into the kid
    let kptr = node.get_ptr(idx);
    let knode = store.page_get(kptr);
    let updated = tree_delete(store, knode, key)?;
    store.page_del(kptr);

    let mut new = Node::new(PAGE_SIZE);
    match should_merge(store, &node, idx, &updated) {
        Merge::Left(sibling) => {
            let mut merged = Node::new(PAGE_SIZE);
            merge(&mut merged, &sibling, &updated);
            store.page_del(node.get_ptr(idx - 1));
            let first = merged.get_key(0).to_vec();
            let ptr = store.page_new(merged);
            node_replace_kid_2(&mut new, &node, idx - 1, ptr, &first);
        }
        Merge::Right(sibling) => {
            let mut merged = Node::new(PAGE_SIZE);
            merge(&mut merged, &updated, &sibling);
            store.page_del(node.get_ptr(idx + 1));
            let first = merged.get_key(0).to_vec();
            let ptr = store.page_new(merged);
            node_replace_kid_2(&mut new, &node, idx, ptr, &first);
        }
        Merge::None => {
            if updated.nkeys() == 0 {
                // The kid is empty after deletion and has no sibling to
                // merge with, so its parent must have this single kid.
                // Propagate an empty node; it is eliminated before the root.
                new.set_header(BNODE_NODE, 0);
            } else {
                node_replace_kid_n(store, &mut new, &node, idx, vec![updated]);
            }
        }
    }
    Some(new)
}

enum Merge {
    None,
    Left(Node),
    Right(Node),
}

// A small node is merged into an adjacent sibling when the result still
// fits in a page. The left sibling is preferred.
fn should_merge<S: PageStore>(store: &S, node: &Node, idx: usize, updated: &Node) -> Merge {
    if updated.nbytes() > PAGE_SIZE / 4 {
        return Merge::None;
    }

    if idx > 0 {
        let sibling = store.page_get(node.get_ptr(idx - 1));
        if sibling.nbytes() + updated.nbytes() - HEADER <= PAGE_SIZE {
            return Merge::Left(sibling);
        }
    }
    if idx + 1 < node.nkeys() {
        let sibling = store.page_get(node.get_ptr(idx + 1));
        if sibling.nbytes() + updated.nbytes() - HEADER <= PAGE_SIZE {
            return Merge::Right(sibling);
        }
    }
    Merge::None
}

// replace an adjacent pair of links with the merged node
fn node_replace_kid_2(new: &mut Node, old: &Node, idx: usize, merged: Ptr, key: &[u8]) {
    new.set_header(BNODE_NODE, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, merged, key, b"");
    new.append_range(old, idx + 1, idx + 2, old.nkeys() - (idx + 2));
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::{BTreeMap, HashMap};

    const RAND_SEED: u64 = 2024;

    struct MemStore {
        pages: HashMap<Ptr, Vec<u8>>,
        next: Ptr,
    }

    impl MemStore {
        fn new() -> MemStore {
            MemStore {
                pages: HashMap::new(),
                next: 1,
            }
        }
    }

    impl PageStore for MemStore {
        fn page_get(&self, ptr: Ptr) -> Node {
            Node::from_bytes(self.pages[&ptr].clone())
        }

        fn page_new(&mut self, node: Node) -> Ptr {
            assert!(node.data().len() <= PAGE_SIZE, "bad node!");
            let ptr = self.next;
            self.next += 1;
            self.pages.insert(ptr, node.into_data());
            ptr
        }

        fn page_del(&mut self, ptr: Ptr) {
            assert!(self.pages.remove(&ptr).is_some());
        }
    }

    struct C {
        tree: BTree,
        store: MemStore,
        refs: BTreeMap<Vec<u8>, Vec<u8>>,
    }

    impl C {
        fn new() -> C {
            C {
                tree: BTree::default(),
                store: MemStore::new(),
                refs: BTreeMap::new(),
            }
        }

        fn add(&mut self, key: &[u8], val: &[u8]) {
            self.tree.insert(&mut self.store, key, val);
            self.refs.insert(key.to_vec(), val.to_vec());
        }

        fn del(&mut self, key: &[u8]) -> bool {
            self.refs.remove(key);
            self.tree.delete(&mut self.store, key)
        }

        // Walk the tree checking structural invariants and collect the
        // user entries in order.
        fn walk(&self, ptr: Ptr, out: &mut Vec<(Vec<u8>, Vec<u8>)>) {
            let node = self.store.page_get(ptr);
            assert!(node.nbytes() <= PAGE_SIZE);
            match node.btype() {
                BNODE_LEAF => {
                    for i in 0..node.nkeys() {
                        if node.get_key(i).is_empty() {
                            continue; // the seeded dummy entry
                        }
                        out.push((node.get_key(i).to_vec(), node.get_val(i).to_vec()));
                    }
                }
                BNODE_NODE => {
                    assert!(node.nkeys() >= 1);
                    for i in 0..node.nkeys() {
                        let kid = self.store.page_get(node.get_ptr(i));
                        // each router key equals the first key of its kid
                        assert_eq!(node.get_key(i), kid.get_key(0));
                        self.walk(node.get_ptr(i), out);
                    }
                }
                _ => panic!("bad node!"),
            }
        }

        fn verify(&self) {
            let mut entries = Vec::new();
            if self.tree.root != 0 {
                self.walk(self.tree.root, &mut entries);
            }
            assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
            let want: Vec<_> = self
                .refs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            assert_eq!(entries, want);
        }
    }

    #[test]
    fn insert_lookup_overwrite() {
        let mut c = C::new();
        c.add(b"a", b"1111");
        assert_eq!(c.tree.get(&c.store, b"a").unwrap(), b"1111");
        assert_eq!(c.tree.get(&c.store, b"z"), None);

        c.add(b"b", b"2222");
        c.add(b"b", b"3333");
        c.add(b"a", b"4444");
        assert_eq!(c.tree.get(&c.store, b"a").unwrap(), b"4444");
        assert_eq!(c.tree.get(&c.store, b"b").unwrap(), b"3333");
        c.verify();

        // the dummy entry makes a lookup of the empty key succeed
        assert_eq!(c.tree.get(&c.store, b"").unwrap(), b"");
    }

    #[test]
    fn delete_returns_existence() {
        let mut c = C::new();
        c.add(b"a", b"1111");
        c.add(b"b", b"2222");
        assert!(!c.del(b"c"));
        assert!(c.del(b"b"));
        assert_eq!(c.tree.get(&c.store, b"b"), None);
        assert!(c.del(b"a"));
        assert_eq!(c.tree.get(&c.store, b"a"), None);
        c.verify();
    }

    #[test]
    fn grows_and_shrinks_levels() {
        let mut c = C::new();
        for i in 0..300 {
            let key = format!("key-{i:04}");
            let val = vec![b'x'; 100];
            c.add(key.as_bytes(), &val);
        }
        c.verify();
        let root = c.store.page_get(c.tree.root);
        assert_eq!(root.btype(), BNODE_NODE);

        for i in (0..300).rev() {
            let key = format!("key-{i:04}");
            assert!(c.del(key.as_bytes()));
        }
        c.verify();

        // only the dummy entry remains
        let root = c.store.page_get(c.tree.root);
        assert_eq!(root.btype(), BNODE_LEAF);
        assert_eq!(root.nkeys(), 1);
        assert_eq!(root.get_key(0), b"");
    }

    #[test]
    fn max_sized_entries_split() {
        let mut c = C::new();
        for i in 0..8u8 {
            let mut key = vec![i + 1; MAX_KEY_LEN];
            key[MAX_KEY_LEN - 1] = i;
            c.add(&key, &vec![0xaa; MAX_VALUE_LEN]);
        }
        c.verify();
        for i in 0..8u8 {
            let mut key = vec![i + 1; MAX_KEY_LEN];
            key[MAX_KEY_LEN - 1] = i;
            assert_eq!(c.tree.get(&c.store, &key).unwrap(), vec![0xaa; MAX_VALUE_LEN]);
        }
    }

    #[test]
    fn randomized_against_model() {
        let mut rng = StdRng::seed_from_u64(RAND_SEED);
        let mut c = C::new();
        let mut keys: Vec<Vec<u8>> = Vec::new();

        for _ in 0..800 {
            if keys.is_empty() || rng.gen_bool(0.7) {
                let len = rng.gen_range(1..=32);
                let key: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                let val: Vec<u8> = (0..rng.gen_range(0..=200)).map(|_| rng.gen()).collect();
                c.add(&key, &val);
                keys.push(key);
            } else {
                let idx = rng.gen_range(0..keys.len());
                let key = keys.swap_remove(idx);
                let want = c.refs.contains_key(&key);
                assert_eq!(c.del(&key), want);
            }
        }
        c.verify();
        for key in &keys {
            assert_eq!(c.tree.get(&c.store, key), c.refs.get(key).cloned());
        }
    }
}
