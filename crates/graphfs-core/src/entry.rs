//! Cache entry tree: cached name → identity bindings per partition.
//!
//! Each [`CacheEntry`] caches one path component. A positive entry is bound
//! to an INode; a negative entry records that the backing store confirmed
//! the name does not exist, so repeated resolution never hits the store
//! again until the binding is invalidated.
//!
//! Parents own their children (`Arc`); children point back with a `Weak`.
//! Open handles pin an entry through an [`EntryRef`], which keeps a
//! per-entry handle count that pruning respects.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::trace;

use crate::error::{GraphError, GraphResult};
use crate::inode::INode;
use crate::path::{Path, PathElement};
use crate::superblock::SuperBlock;

#[derive(Default)]
struct EntryState {
    inode: Option<Arc<INode>>,
    children: HashMap<PathElement, Arc<CacheEntry>>,
}

pub struct CacheEntry {
    root: Path,
    name: Option<PathElement>,
    parent: Option<Weak<CacheEntry>>,
    state: RwLock<EntryState>,
    handles: AtomicUsize,
}

impl CacheEntry {
    /// The root entry of `partition`, bound to its root INode.
    pub fn new_root(partition: &str, inode: Arc<INode>) -> GraphResult<Arc<Self>> {
        Ok(Arc::new(Self {
            root: Path::root(partition)?,
            name: None,
            parent: None,
            state: RwLock::new(EntryState {
                inode: Some(inode),
                children: HashMap::new(),
            }),
            handles: AtomicUsize::new(0),
        }))
    }

    fn new_child(parent: &Arc<CacheEntry>, name: PathElement, inode: Option<Arc<INode>>) -> Arc<Self> {
        Arc::new(Self {
            root: parent.root.clone(),
            name: Some(name),
            parent: Some(Arc::downgrade(parent)),
            state: RwLock::new(EntryState {
                inode,
                children: HashMap::new(),
            }),
            handles: AtomicUsize::new(0),
        })
    }

    pub fn partition(&self) -> &str {
        self.root.partition()
    }

    /// Component name; None for the partition root.
    pub fn name(&self) -> Option<&PathElement> {
        self.name.as_ref()
    }

    pub fn parent(&self) -> Option<Arc<CacheEntry>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Full path of this entry, rebuilt from the parent chain.
    pub fn path(&self) -> Path {
        let mut names = Vec::new();
        if let Some(name) = &self.name {
            names.push(name.clone());
        }
        let mut cursor = self.parent();
        while let Some(entry) = cursor {
            if let Some(name) = &entry.name {
                names.push(name.clone());
            }
            cursor = entry.parent();
        }

        let mut path = self.root.clone();
        for name in names.into_iter().rev() {
            path = path.child(name);
        }
        path
    }

    pub fn inode(&self) -> Option<Arc<INode>> {
        self.state.read().inode.clone()
    }

    pub fn is_negative(&self) -> bool {
        self.state.read().inode.is_none()
    }

    /// Bind a negative entry to `inode`. Binding a positive entry again to
    /// the same id is a no-op; rebinding to another id replaces it.
    pub fn instantiate(&self, inode: Arc<INode>) {
        let mut state = self.state.write();
        if state.inode.as_ref().map_or(false, |existing| existing.id() == inode.id()) {
            return;
        }
        state.inode = Some(inode);
    }

    /// Cached child binding, without consulting the backing store.
    pub fn cached_child(&self, name: &PathElement) -> Option<Arc<CacheEntry>> {
        self.state.read().children.get(name).cloned()
    }

    /// Child entry for `name`, asking `sb` once and caching the answer
    /// (including a negative one).
    pub fn lookup_child(self: &Arc<Self>, sb: &dyn SuperBlock, name: &PathElement) -> GraphResult<Arc<CacheEntry>> {
        if let Some(child) = self.cached_child(name) {
            return Ok(child);
        }

        let mut state = self.state.write();
        if let Some(child) = state.children.get(name) {
            return Ok(Arc::clone(child));
        }
        let Some(parent_inode) = state.inode.clone() else {
            return Err(GraphError::NotFound(self.path().child(name.clone()).to_string()));
        };

        let inode = sb.lookup(&parent_inode, name)?;
        trace!(
            partition = %self.root,
            parent = parent_inode.id(),
            name = %name,
            found = inode.is_some(),
            "cache entry lookup"
        );
        let child = Self::new_child(self, name.clone(), inode);
        state.children.insert(name.clone(), Arc::clone(&child));
        Ok(child)
    }

    /// Forget the cached binding for `name` so the next resolution asks the
    /// backing store again. Handles holding the old entry keep it alive.
    pub fn invalidate_child(&self, name: &PathElement) -> bool {
        let removed = self.state.write().children.remove(name);
        removed.is_some()
    }

    /// Evict unreferenced descendants; returns how many entries were dropped.
    pub fn prune(&self) -> usize {
        let children: Vec<(PathElement, Arc<CacheEntry>)> = self
            .state
            .read()
            .children
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut evicted = 0;
        let mut dead = Vec::new();
        for (name, child) in children {
            evicted += child.prune();
            if child.handle_count() == 0 && child.state.read().children.is_empty() {
                dead.push((name, child));
            }
        }

        if !dead.is_empty() {
            let mut state = self.state.write();
            for (name, child) in dead {
                // One reference in the map plus our local clone.
                if Arc::strong_count(&child) == 2 && child.handle_count() == 0 {
                    state.children.remove(&name);
                    evicted += 1;
                }
            }
        }
        evicted
    }

    /// Number of cached children (positive and negative).
    pub fn child_count(&self) -> usize {
        self.state.read().children.len()
    }

    /// Pin this entry for the lifetime of a handle.
    pub fn acquire(self: &Arc<Self>) -> EntryRef {
        self.handles.fetch_add(1, Ordering::AcqRel);
        EntryRef { entry: Arc::clone(self) }
    }

    pub fn handle_count(&self) -> usize {
        self.handles.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("path", &self.path().to_string())
            .field("inode", &self.inode().map(|i| i.id()))
            .field("handles", &self.handle_count())
            .finish()
    }
}

/// A counted reference to a cache entry held by an open handle.
pub struct EntryRef {
    entry: Arc<CacheEntry>,
}

impl EntryRef {
    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }
}

impl std::ops::Deref for EntryRef {
    type Target = CacheEntry;

    fn deref(&self) -> &CacheEntry {
        &self.entry
    }
}

impl Drop for EntryRef {
    fn drop(&mut self) {
        let previous = self.entry.handles.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "cache entry released more times than acquired");
    }
}

/// Walk `path` from `root`, resolving each component through `sb`.
///
/// Returns the final entry, which may be negative. A negative ancestor
/// stops the walk with NotFound.
pub fn resolve(sb: &dyn SuperBlock, root: &Arc<CacheEntry>, path: &Path) -> GraphResult<Arc<CacheEntry>> {
    let mut current = Arc::clone(root);
    for (depth, element) in path.elements().iter().enumerate() {
        if current.is_negative() {
            let mut missing = Path::root(path.partition())?;
            for e in &path.elements()[..depth] {
                missing = missing.child(e.clone());
            }
            return Err(GraphError::NotFound(missing.to_string()));
        }
        current = current.lookup_child(sb, element)?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::KvSuperBlock;
    use crate::superblock::OpenOptions;

    #[test]
    fn test_resolve_caches_positive_and_negative() {
        let sb = KvSuperBlock::in_memory("R");
        let root = sb.root().unwrap();
        let a = root.lookup_child(sb.as_ref(), &PathElement::new("a").unwrap()).unwrap();
        sb.create(&a, &OpenOptions::create_if_missing()).unwrap();

        let path = Path::parse("R/a").unwrap();
        let missing = Path::parse("R/zzz").unwrap();

        let first = resolve(sb.as_ref(), &root, &path).unwrap();
        let neg = resolve(sb.as_ref(), &root, &missing).unwrap();
        assert!(neg.is_negative());

        let lookups = sb.lookup_count();
        let second = resolve(sb.as_ref(), &root, &path).unwrap();
        let neg_again = resolve(sb.as_ref(), &root, &missing).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&neg, &neg_again));
        assert_eq!(sb.lookup_count(), lookups);
    }

    #[test]
    fn test_negative_ancestor_short_circuits() {
        let sb = KvSuperBlock::in_memory("R");
        let root = sb.root().unwrap();
        let err = resolve(sb.as_ref(), &root, &Path::parse("R/x/y/z").unwrap()).unwrap_err();
        assert!(matches!(err, GraphError::NotFound(ref p) if p == "R/x"));
        assert_eq!(sb.lookup_count(), 1);
    }

    #[test]
    fn test_entry_path_and_parent() {
        let sb = KvSuperBlock::in_memory("R");
        let root = sb.root().unwrap();
        let a = root.lookup_child(sb.as_ref(), &PathElement::new("a").unwrap()).unwrap();
        assert_eq!(a.path().to_string(), "R/a");
        assert!(Arc::ptr_eq(&a.parent().unwrap(), &root));
        assert_eq!(root.path().to_string(), "R");
    }

    #[test]
    fn test_invalidate_child_forces_new_lookup() {
        let sb = KvSuperBlock::in_memory("R");
        let root = sb.root().unwrap();
        let name = PathElement::new("later").unwrap();

        let neg = root.lookup_child(sb.as_ref(), &name).unwrap();
        assert!(neg.is_negative());
        assert!(root.invalidate_child(&name));
        assert!(!root.invalidate_child(&name));

        let again = root.lookup_child(sb.as_ref(), &name).unwrap();
        assert!(!Arc::ptr_eq(&neg, &again));
    }

    #[test]
    fn test_prune_respects_handles() {
        let sb = KvSuperBlock::in_memory("R");
        let root = sb.root().unwrap();
        let kept = root.lookup_child(sb.as_ref(), &PathElement::new("kept").unwrap()).unwrap();
        let pinned = kept.acquire();
        drop(kept);
        root.lookup_child(sb.as_ref(), &PathElement::new("gone").unwrap()).unwrap();

        assert_eq!(root.prune(), 1);
        assert_eq!(root.child_count(), 1);
        assert_eq!(pinned.handle_count(), 1);

        drop(pinned);
        assert_eq!(root.prune(), 1);
        assert_eq!(root.child_count(), 0);
    }
}
