//! The node table: a reverse-mapped tree of kernel-visible node ids.
//!
//! Every object the kernel has looked up is tracked here as a node carrying
//! its parent id and basename, so an id can be turned back into an absolute
//! path at dispatch time. Nodes are kept alive by two counts: `nlookup`
//! (outstanding kernel references, released by FORGET) and `refctr` (one for
//! the node itself plus one per child naming it as parent). A node survives
//! detachment while either an open handle or a lookup reference remains.
//!
//! All methods are short critical sections; the table is wrapped in a mutex
//! by the dispatcher and never locked across a user callback.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

use rustc_hash::FxHashMap;
use tracing::{trace, warn};

use crate::error::Errno;
use crate::proto::ROOT_ID;

pub type NodeId = u64;

/// Longest path the table will reconstruct.
pub const MAX_PATH: usize = 4096;

#[derive(Debug)]
struct Node {
    id: NodeId,
    generation: u64,
    /// Containing directory; 0 when detached.
    parent: NodeId,
    /// Basename under `parent`; `None` when detached.
    name: Option<OsString>,
    /// Children naming this node as parent, plus one for the node itself.
    refctr: u32,
    /// Outstanding kernel lookups.
    nlookup: u64,
    open_count: u32,
    /// Renamed to a shadow name, pending unlink on last release.
    is_hidden: bool,
    /// Request id of the last successful lookup, for the legacy forget path.
    version: u64,
}

/// The id ↔ (parent, name) bindings for every live node.
pub struct NodeTable {
    by_id: FxHashMap<NodeId, Node>,
    by_name: FxHashMap<(NodeId, OsString), NodeId>,
    ctr: NodeId,
    generation: u64,
    hidectr: u32,
}

impl NodeTable {
    #[must_use]
    pub fn new() -> Self {
        let mut by_id = FxHashMap::default();
        by_id.insert(
            ROOT_ID,
            Node {
                id: ROOT_ID,
                generation: 0,
                parent: 0,
                name: Some(OsString::from("/")),
                refctr: 1,
                nlookup: 1,
                open_count: 0,
                is_hidden: false,
                version: 0,
            },
        );
        Self {
            by_id,
            by_name: FxHashMap::default(),
            ctr: ROOT_ID,
            generation: 0,
            hidectr: 0,
        }
    }

    fn node(&self, id: NodeId) -> &Node {
        self.by_id
            .get(&id)
            .unwrap_or_else(|| unreachable!("node {id} not in table"))
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.by_id
            .get_mut(&id)
            .unwrap_or_else(|| unreachable!("node {id} not in table"))
    }

    /// Resolves a child binding. Allocation of the probe key mirrors the
    /// (parent, name)-tuple index this table is built around.
    #[must_use]
    pub fn lookup_id(&self, parent: NodeId, name: &OsStr) -> Option<NodeId> {
        self.by_name.get(&(parent, name.to_os_string())).copied()
    }

    fn next_id(&mut self) -> NodeId {
        loop {
            self.ctr = self.ctr.wrapping_add(1);
            if self.ctr == 0 {
                // Wrapped: new epoch so the kernel can tell a reused id
                // from its earlier incarnation.
                self.generation += 1;
                continue;
            }
            if !self.by_id.contains_key(&self.ctr) {
                return self.ctr;
            }
        }
    }

    fn hash_name(&mut self, id: NodeId, parent: NodeId, name: &OsStr) {
        self.node_mut(parent).refctr += 1;
        let node = self.node_mut(id);
        node.parent = parent;
        node.name = Some(name.to_os_string());
        self.by_name.insert((parent, name.to_os_string()), id);
    }

    fn unhash_name(&mut self, id: NodeId) {
        let node = self.node_mut(id);
        if let Some(name) = node.name.take() {
            let parent = node.parent;
            node.parent = 0;
            self.by_name.remove(&(parent, name));
            self.unref(parent);
        }
    }

    fn unref(&mut self, id: NodeId) {
        let node = self.node_mut(id);
        debug_assert!(node.refctr > 0);
        node.refctr -= 1;
        if node.refctr == 0 {
            debug_assert!(node.name.is_none());
            self.by_id.remove(&id);
            trace!(id, "node deleted");
        }
    }

    /// Returns the node bound at `(parent, name)`, creating it if absent,
    /// and takes one kernel lookup reference either way. `version` is the
    /// request id that produced the binding.
    pub fn lookup_or_insert(
        &mut self,
        parent: NodeId,
        name: &OsStr,
        version: u64,
    ) -> (NodeId, u64) {
        if let Some(id) = self.lookup_id(parent, name) {
            let node = self.node_mut(id);
            node.nlookup += 1;
            node.version = version;
            return (id, node.generation);
        }

        let id = self.next_id();
        let generation = self.generation;
        self.by_id.insert(
            id,
            Node {
                id,
                generation,
                parent: 0,
                name: None,
                refctr: 1,
                nlookup: 1,
                open_count: 0,
                is_hidden: false,
                version,
            },
        );
        self.hash_name(id, parent, name);
        trace!(id, parent, ?name, "node created");
        (id, generation)
    }

    /// Reconstructs the absolute path of `id`, optionally extended by a
    /// trailing `name` (for operations whose target does not exist yet).
    ///
    /// Fails with `ENOENT` when a link on the chain has been detached or
    /// the path would exceed [`MAX_PATH`].
    pub fn path_of(&self, id: NodeId, name: Option<&OsStr>) -> Result<PathBuf, Errno> {
        let mut segments: Vec<&OsStr> = Vec::new();
        let mut len = 0usize;

        if let Some(name) = name {
            len += name.len() + 1;
            segments.push(name);
        }

        let mut node = self.node(id);
        while node.id != ROOT_ID {
            let Some(name) = node.name.as_deref() else {
                return Err(Errno::NOENT);
            };
            len += name.len() + 1;
            if len > MAX_PATH {
                warn!(id, "path too long");
                return Err(Errno::NOENT);
            }
            segments.push(name);
            node = self.node(node.parent);
        }

        if segments.is_empty() {
            return Ok(PathBuf::from("/"));
        }
        let mut buf = Vec::with_capacity(len);
        for seg in segments.iter().rev() {
            buf.push(b'/');
            buf.extend_from_slice(seg.as_bytes());
        }
        Ok(PathBuf::from(OsString::from_vec(buf)))
    }

    /// Releases `nlookup` kernel references; detaches at zero and frees the
    /// node once nothing else holds it. Forgetting the root is a no-op.
    pub fn forget(&mut self, id: NodeId, nlookup: u64) {
        if id == ROOT_ID {
            return;
        }
        let node = self.node_mut(id);
        debug_assert!(node.nlookup >= nlookup);
        node.nlookup = node.nlookup.saturating_sub(nlookup);
        if node.nlookup == 0 {
            self.unhash_name(id);
            self.unref(id);
        }
    }

    /// Legacy forget: drops the binding only if `version` still matches the
    /// node's last lookup, so a racing later lookup wins.
    pub fn forget_by_version(&mut self, id: NodeId, version: u64) {
        if id == ROOT_ID {
            return;
        }
        let Some(node) = self.by_id.get_mut(&id) else {
            return;
        };
        if node.version != version {
            return;
        }
        node.version = 0;
        self.unhash_name(id);
        self.unref(id);
    }

    /// Detaches the `(parent, name)` binding without freeing: the node
    /// stays as long as lookups or opens reference it.
    pub fn remove(&mut self, parent: NodeId, name: &OsStr) {
        if let Some(id) = self.lookup_id(parent, name) {
            self.unhash_name(id);
        }
    }

    /// Rebinds `(old_parent, old_name)` to `(new_parent, new_name)`. An
    /// existing node at the destination is detached first, unless this is a
    /// hide rename, where a destination collision means the shadow name was
    /// taken underneath us.
    pub fn rename(
        &mut self,
        old_parent: NodeId,
        old_name: &OsStr,
        new_parent: NodeId,
        new_name: &OsStr,
        hide: bool,
    ) -> Result<(), Errno> {
        let Some(id) = self.lookup_id(old_parent, old_name) else {
            return Ok(());
        };

        if let Some(existing) = self.lookup_id(new_parent, new_name) {
            if hide {
                warn!(?new_name, "hidden name appeared during hiding");
                return Err(Errno::BUSY);
            }
            self.unhash_name(existing);
        }

        self.unhash_name(id);
        self.hash_name(id, new_parent, new_name);
        if hide {
            self.node_mut(id).is_hidden = true;
        }
        Ok(())
    }

    /// True iff `(parent, name)` resolves to a node with open handles.
    #[must_use]
    pub fn is_open(&self, parent: NodeId, name: &OsStr) -> bool {
        self.lookup_id(parent, name)
            .is_some_and(|id| self.node(id).open_count > 0)
    }

    pub fn inc_open(&mut self, id: NodeId) {
        self.node_mut(id).open_count += 1;
    }

    /// Drops one open handle. Returns true when this was the last handle of
    /// a hidden node, i.e. the backing file must now really be unlinked.
    pub fn dec_open(&mut self, id: NodeId) -> bool {
        let node = self.node_mut(id);
        debug_assert!(node.open_count > 0);
        node.open_count = node.open_count.saturating_sub(1);
        node.is_hidden && node.open_count == 0
    }

    /// Synthesizes a shadow basename for hiding `(dir, name)`, unique among
    /// the in-memory siblings. Returns `None` if the binding is gone.
    /// On-disk collisions are the caller's problem (it probes `getattr`).
    pub fn hidden_name(&mut self, dir: NodeId, name: &OsStr) -> Option<OsString> {
        let id = self.lookup_id(dir, name)?;
        loop {
            self.hidectr = self.hidectr.wrapping_add(1);
            let candidate = format!(".fuse_hidden{:08x}{:08x}", id as u32, self.hidectr);
            if self.lookup_id(dir, OsStr::new(&candidate)).is_none() {
                return Some(candidate.into());
            }
        }
    }

    /// Ids of nodes still hidden at teardown, whose shadow files must be
    /// unlinked before the session goes away.
    #[must_use]
    pub fn hidden_nodes(&self) -> Vec<NodeId> {
        self.by_id
            .values()
            .filter(|n| n.is_hidden)
            .map(|n| n.id)
            .collect()
    }

    /// Number of live nodes, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn nlookup_of(&self, id: NodeId) -> u64 {
        self.node(id).nlookup
    }

    #[cfg(test)]
    pub(crate) fn open_count_of(&self, id: NodeId) -> u32 {
        self.node(id).open_count
    }

    /// Plants the id counter, to exercise wraparound without 2^64 inserts.
    #[cfg(test)]
    pub(crate) fn set_id_counter(&mut self, ctr: NodeId) {
        self.ctr = ctr;
    }
}

impl Default for NodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> &OsStr {
        OsStr::new(s)
    }

    #[test]
    fn root_reconstructs_as_slash() {
        let table = NodeTable::new();
        assert_eq!(table.path_of(ROOT_ID, None).unwrap(), PathBuf::from("/"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn trailing_name_is_appended() {
        let table = NodeTable::new();
        let path = table.path_of(ROOT_ID, Some(name("new"))).unwrap();
        assert_eq!(path, PathBuf::from("/new"));
    }

    #[test]
    fn lookup_or_insert_is_idempotent() {
        let mut table = NodeTable::new();
        let (a, _) = table.lookup_or_insert(ROOT_ID, name("a"), 1);
        let (b, _) = table.lookup_or_insert(ROOT_ID, name("a"), 2);
        assert_eq!(a, b);
        assert_eq!(table.nlookup_of(a), 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn nested_paths_have_single_separators() {
        let mut table = NodeTable::new();
        let (dir, _) = table.lookup_or_insert(ROOT_ID, name("dir"), 1);
        let (sub, _) = table.lookup_or_insert(dir, name("sub"), 2);
        let path = table.path_of(sub, Some(name("leaf"))).unwrap();
        assert_eq!(path, PathBuf::from("/dir/sub/leaf"));
        assert!(!path.as_os_str().as_bytes().windows(2).any(|w| w == b"//"));
    }

    #[test]
    fn detached_node_path_is_enoent() {
        let mut table = NodeTable::new();
        let (id, _) = table.lookup_or_insert(ROOT_ID, name("f"), 1);
        table.remove(ROOT_ID, name("f"));
        assert_eq!(table.path_of(id, None), Err(Errno::NOENT));
    }

    #[test]
    fn overlong_path_is_enoent() {
        let mut table = NodeTable::new();
        let long = "x".repeat(300);
        let mut dir = ROOT_ID;
        for i in 0..20 {
            let (next, _) = table.lookup_or_insert(dir, name(&format!("{long}{i}")), 1);
            dir = next;
        }
        assert_eq!(table.path_of(dir, None), Err(Errno::NOENT));
    }

    #[test]
    fn forget_frees_leaf_and_returns_to_root_only() {
        let mut table = NodeTable::new();
        let (id, _) = table.lookup_or_insert(ROOT_ID, name("a"), 1);
        table.forget(id, 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup_id(ROOT_ID, name("a")), None);
    }

    #[test]
    fn forget_root_is_a_noop() {
        let mut table = NodeTable::new();
        table.forget(ROOT_ID, u64::MAX);
        assert_eq!(table.len(), 1);
        assert!(table.path_of(ROOT_ID, None).is_ok());
    }

    #[test]
    fn parent_lives_while_children_reference_it() {
        let mut table = NodeTable::new();
        let (dir, _) = table.lookup_or_insert(ROOT_ID, name("dir"), 1);
        let (child, _) = table.lookup_or_insert(dir, name("c"), 2);
        // Forgetting the parent detaches it, but the child keeps it alive
        // for path walks until the child itself goes.
        table.forget(dir, 1);
        assert_eq!(table.len(), 3);
        assert_eq!(table.path_of(child, None), Err(Errno::NOENT));
        table.forget(child, 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn rename_preserves_the_node_id() {
        let mut table = NodeTable::new();
        let (id, _) = table.lookup_or_insert(ROOT_ID, name("x"), 1);
        table
            .rename(ROOT_ID, name("x"), ROOT_ID, name("y"), false)
            .unwrap();
        assert_eq!(table.lookup_id(ROOT_ID, name("y")), Some(id));
        assert_eq!(table.lookup_id(ROOT_ID, name("x")), None);
        assert_eq!(table.path_of(id, None).unwrap(), PathBuf::from("/y"));
    }

    #[test]
    fn rename_detaches_an_overwritten_target() {
        let mut table = NodeTable::new();
        let (_src, _) = table.lookup_or_insert(ROOT_ID, name("src"), 1);
        let (dst, _) = table.lookup_or_insert(ROOT_ID, name("dst"), 2);
        table
            .rename(ROOT_ID, name("src"), ROOT_ID, name("dst"), false)
            .unwrap();
        // Old destination node is detached but still referenced by its
        // outstanding lookup.
        assert_eq!(table.path_of(dst, None), Err(Errno::NOENT));
        table.forget(dst, 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn hide_rename_collision_is_ebusy() {
        let mut table = NodeTable::new();
        table.lookup_or_insert(ROOT_ID, name("f"), 1);
        table.lookup_or_insert(ROOT_ID, name(".shadow"), 2);
        let err = table
            .rename(ROOT_ID, name("f"), ROOT_ID, name(".shadow"), true)
            .unwrap_err();
        assert_eq!(err, Errno::BUSY);
    }

    #[test]
    fn rename_of_unknown_source_is_ok() {
        let mut table = NodeTable::new();
        assert!(
            table
                .rename(ROOT_ID, name("ghost"), ROOT_ID, name("y"), false)
                .is_ok()
        );
    }

    #[test]
    fn is_open_follows_the_open_count() {
        let mut table = NodeTable::new();
        let (id, _) = table.lookup_or_insert(ROOT_ID, name("f"), 1);
        assert!(!table.is_open(ROOT_ID, name("f")));
        table.inc_open(id);
        assert!(table.is_open(ROOT_ID, name("f")));
        assert!(!table.dec_open(id));
        assert!(!table.is_open(ROOT_ID, name("f")));
    }

    #[test]
    fn last_release_of_hidden_node_requests_unlink() {
        let mut table = NodeTable::new();
        let (id, _) = table.lookup_or_insert(ROOT_ID, name("f"), 1);
        table.inc_open(id);
        table.inc_open(id);
        table
            .rename(ROOT_ID, name("f"), ROOT_ID, name(".fuse_hidden0"), true)
            .unwrap();
        assert!(!table.dec_open(id));
        assert!(table.dec_open(id));
        assert_eq!(table.hidden_nodes(), vec![id]);
    }

    #[test]
    fn counter_wrap_bumps_generation_and_skips_live_ids() {
        let mut table = NodeTable::new();
        let (a, gen_a) = table.lookup_or_insert(ROOT_ID, name("a"), 1);
        assert_eq!(gen_a, 0);

        table.set_id_counter(u64::MAX);
        let (b, gen_b) = table.lookup_or_insert(ROOT_ID, name("b"), 2);
        // Zero is skipped, the root id and `a` are still live, so the
        // counter lands past them in a fresh epoch.
        assert_eq!(gen_b, 1);
        assert_ne!(b, 0);
        assert_ne!(b, ROOT_ID);
        assert_ne!(b, a);
    }

    #[test]
    fn hidden_name_avoids_existing_siblings() {
        let mut table = NodeTable::new();
        let (id, _) = table.lookup_or_insert(ROOT_ID, name("f"), 1);
        let first = table.hidden_name(ROOT_ID, name("f")).unwrap();
        assert!(first.to_str().unwrap().starts_with(".fuse_hidden"));
        // Occupy the synthesized name; the next attempt must differ.
        table.lookup_or_insert(ROOT_ID, &first, 2);
        let second = table.hidden_name(ROOT_ID, name("f")).unwrap();
        assert_ne!(first, second);
        let _ = id;
    }

    #[test]
    fn hidden_name_for_unknown_binding_is_none() {
        let mut table = NodeTable::new();
        assert_eq!(table.hidden_name(ROOT_ID, name("ghost")), None);
    }

    #[test]
    fn forget_by_version_only_matches_the_last_lookup() {
        let mut table = NodeTable::new();
        let (id, _) = table.lookup_or_insert(ROOT_ID, name("f"), 41);
        // A later lookup has superseded version 41: stale forget is ignored.
        table.lookup_or_insert(ROOT_ID, name("f"), 42);
        table.forget_by_version(id, 41);
        assert_eq!(table.lookup_id(ROOT_ID, name("f")), Some(id));
        table.forget_by_version(id, 42);
        assert_eq!(table.lookup_id(ROOT_ID, name("f")), None);
    }
}
