//! Rule storage for the resource tree.
//!
//! Acquisition rules are registered on nodes and inherited downward, so the
//! tree keeps them in a trie keyed by the registering node's path and reads
//! every list on the way from the root to the node being resolved.

use crate::Path;
use std::collections::BTreeMap;

/// A prefix trie keyed by path components.
///
/// Values sit on nodes; a path can hold a value without any of its
/// ancestors holding one.
///
/// # Example
///
/// ```rust
/// use kvtree_core_store::{PathTrie, path};
///
/// let mut trie: PathTrie<i32> = PathTrie::new();
/// trie.insert(&path!("a"), 1);
/// trie.insert(&path!("a/b/c"), 2);
///
/// assert_eq!(trie.get(&path!("a")), Some(&1));
///
/// // along returns every value on the way down, root first
/// let found: Vec<i32> = trie.along(&path!("a/b/c/d")).into_iter().copied().collect();
/// assert_eq!(found, vec![1, 2]);
/// ```
#[derive(Debug, Clone)]
pub struct PathTrie<T> {
    value: Option<T>,
    children: BTreeMap<String, PathTrie<T>>,
}

impl<T> Default for PathTrie<T> {
    fn default() -> Self {
        Self {
            value: None,
            children: BTreeMap::new(),
        }
    }
}

impl<T> PathTrie<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn descend_or_create(&mut self, path: &Path) -> &mut PathTrie<T> {
        path.iter().fold(self, |node, component| {
            node.children.entry(component.to_string()).or_default()
        })
    }

    fn descend(&self, path: &Path) -> Option<&PathTrie<T>> {
        path.iter()
            .try_fold(self, |node, component| node.children.get(component))
    }

    /// Store `value` at `path`, handing back whatever was there.
    pub fn insert(&mut self, path: &Path, value: T) -> Option<T> {
        self.descend_or_create(path).value.replace(value)
    }

    /// The value stored exactly at `path`.
    pub fn get(&self, path: &Path) -> Option<&T> {
        self.descend(path).and_then(|node| node.value.as_ref())
    }

    /// The value at `path`, inserting one built by `default` if absent.
    pub fn get_or_insert_with(&mut self, path: &Path, default: impl FnOnce() -> T) -> &mut T {
        self.descend_or_create(path).value.get_or_insert_with(default)
    }

    /// Every value between the root and `path` inclusive, root first.
    pub fn along(&self, path: &Path) -> Vec<&T> {
        let mut found: Vec<&T> = self.value.iter().collect();
        let mut node = self;
        for component in path.iter() {
            let Some(child) = node.children.get(component) else {
                break;
            };
            found.extend(child.value.iter());
            node = child;
        }
        found
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        usize::from(self.value.is_some())
            + self.children.values().map(PathTrie::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
