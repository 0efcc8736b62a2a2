//! Relational snapshots of an observer tree.
//!
//! A [`RelationalTable`] walks the tree below a root observer: every object
//! reached through the subjects of a context is recorded once, together with
//! its parent and child relations. Objects hosting a context are descended
//! into. While the table is alive each visited object carries a visitor id
//! in [`names::VISITOR_ID`], keyed by the table's session id; an object that
//! is already tagged is not walked again, which keeps cyclic trees finite.
//! Dropping the table removes every tag it added.
//!
//! Two tables built from the same unmodified tree [`compare`](RelationalTable::compare)
//! equal, which makes tables a cheap way to detect structural changes.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

use horizon_observer_core::{
    ContextId, ObjectDebug, ObjectId, SharedObjectRegistry, Variant, names, store,
};

use crate::error::{ObserverError, Result};
use crate::manager::ObjectManager;
use crate::observer::{Observer, specific_owner};

const TARGET: &str = "horizon_observer::relational";

/// One object of a [`RelationalTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationalEntry {
    /// Visit order of the object, starting at `0` for the root host.
    pub visitor_id: u64,
    pub object: ObjectId,
    pub name: String,
    /// Visitor ids of the contexts' hosts this object is a subject of.
    pub parents: Vec<u64>,
    /// Visitor ids of the subjects of the context this object hosts.
    pub children: Vec<u64>,
    /// Visitor id of the host of the context owning this object, if it is in the table.
    pub owner: Option<u64>,
}

enum DumpStep {
    Enter { visitor_id: u64, depth: usize, is_last: bool },
    Leave,
}

/// A snapshot of the object graph below a root observer.
pub struct RelationalTable {
    manager: ObjectManager,
    registry: Arc<SharedObjectRegistry>,
    root: ContextId,
    session: ContextId,
    entries: Vec<RelationalEntry>,
    index: HashMap<ObjectId, u64>,
}

impl RelationalTable {
    /// Build a table rooted at `root`.
    pub fn new(root: &Observer) -> Result<Self> {
        let manager = root.manager().ok_or(ObserverError::ManagerDropped)?;
        let session = manager.allocate_table_session();
        let mut table = Self {
            registry: manager.registry().clone(),
            manager,
            root: root.context_id(),
            session,
            entries: Vec::new(),
            index: HashMap::new(),
        };
        table.build(root.host_object());
        Ok(table)
    }

    /// Rebuild the table from the current state of the tree.
    pub fn refresh(&mut self) {
        self.clear_tags();
        self.entries.clear();
        self.index.clear();
        match self.manager.observer_reference(self.root) {
            Some(root) => self.build(root.host_object()),
            None => {
                tracing::debug!(target: TARGET, root = %self.root, "root observer is gone, table is empty");
            }
        }
    }

    /// Context the table is rooted at.
    pub fn root(&self) -> ContextId {
        self.root
    }

    /// Key of this table's visitor ids in [`names::VISITOR_ID`].
    pub fn session_id(&self) -> ContextId {
        self.session
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[RelationalEntry] {
        &self.entries
    }

    pub fn entry(&self, visitor_id: u64) -> Option<&RelationalEntry> {
        usize::try_from(visitor_id)
            .ok()
            .and_then(|i| self.entries.get(i))
    }

    pub fn entry_for_object(&self, obj: ObjectId) -> Option<&RelationalEntry> {
        self.visitor_id(obj).and_then(|id| self.entry(id))
    }

    /// The visitor id this table gave `obj`.
    pub fn visitor_id(&self, obj: ObjectId) -> Option<u64> {
        self.index.get(&obj).copied()
    }

    /// Whether both tables hold the same objects with the same relations.
    ///
    /// Visitor ids are not compared, only the objects they stand for.
    pub fn compare(&self, other: &RelationalTable) -> bool {
        self.objects() == other.objects() && self.relations() == other.relations()
    }

    fn objects(&self) -> BTreeSet<ObjectId> {
        self.entries.iter().map(|e| e.object).collect()
    }

    fn relations(&self) -> BTreeSet<(ObjectId, ObjectId)> {
        self.entries
            .iter()
            .flat_map(|parent| {
                parent
                    .children
                    .iter()
                    .filter_map(|child| self.entry(*child))
                    .map(move |child| (parent.object, child.object))
            })
            .collect()
    }

    /// Render the table as an indented tree.
    pub fn dump(&self) -> String {
        let debug = ObjectDebug::new();
        let mut out = String::new();
        let _ = writeln!(out, "Relational table (root context {}, {} objects)", self.root, self.count());
        if self.entries.is_empty() {
            return out;
        }

        let mut path: Vec<u64> = Vec::new();
        let mut pending = vec![DumpStep::Enter { visitor_id: 0, depth: 0, is_last: true }];
        while let Some(step) = pending.pop() {
            let DumpStep::Enter { visitor_id, depth, is_last } = step else {
                path.pop();
                continue;
            };
            let Some(entry) = self.entry(visitor_id) else {
                continue;
            };
            let repeated = path.contains(&visitor_id);
            let _ = writeln!(
                out,
                "{}{} [{}]{}",
                debug.tree_prefix(depth, is_last),
                entry.name,
                entry.visitor_id,
                if repeated { " (cycle)" } else { "" }
            );
            if repeated {
                continue;
            }
            path.push(visitor_id);
            pending.push(DumpStep::Leave);
            let last = entry.children.len().saturating_sub(1);
            for (i, child) in entry.children.iter().enumerate().rev() {
                pending.push(DumpStep::Enter { visitor_id: *child, depth: depth + 1, is_last: i == last });
            }
        }
        out
    }

    fn build(&mut self, root_host: ObjectId) {
        self.visit(root_host);
        self.resolve_owners();
        tracing::trace!(target: TARGET, root = %self.root, session = %self.session, count = self.entries.len(), "built relational table");
    }

    fn is_tagged(&self, obj: ObjectId) -> bool {
        store::multi_context_value(&self.registry, obj, names::VISITOR_ID, self.session).is_valid()
    }

    /// Depth-first walk in subject order. Children are pushed in reverse so
    /// visitor ids follow the same preorder as a recursive walk.
    fn visit(&mut self, root_host: ObjectId) {
        let mut pending: Vec<(ObjectId, Option<u64>)> = vec![(root_host, None)];
        while let Some((obj, parent)) = pending.pop() {
            if self.is_tagged(obj) {
                // Seen before: record the extra relation and stop here.
                if let (Some(parent), Some(id)) = (parent, self.visitor_id(obj)) {
                    self.link(parent, id);
                }
                continue;
            }
            if !self.registry.contains(obj) {
                continue;
            }

            let id = self.entries.len() as u64;
            store::set_multi_context_value(
                &self.registry,
                obj,
                names::VISITOR_ID,
                self.session,
                Variant::UInt(id),
                false,
            );
            self.index.insert(obj, id);
            self.entries.push(RelationalEntry {
                visitor_id: id,
                object: obj,
                name: self.registry.object_name(obj).unwrap_or_default(),
                parents: Vec::new(),
                children: Vec::new(),
                owner: None,
            });
            if let Some(parent) = parent {
                self.link(parent, id);
            }

            if let Some(observer) = self.manager.hosted_observer(obj) {
                pending.extend(observer.subjects().into_iter().rev().map(|subject| (subject, Some(id))));
            }
        }
    }

    fn link(&mut self, parent: u64, child: u64) {
        if let Some(entry) = self.entries.get_mut(parent as usize) {
            if !entry.children.contains(&child) {
                entry.children.push(child);
            }
        }
        if let Some(entry) = self.entries.get_mut(child as usize) {
            if !entry.parents.contains(&parent) {
                entry.parents.push(parent);
            }
        }
    }

    fn resolve_owners(&mut self) {
        for i in 0..self.entries.len() {
            let owner = specific_owner(&self.registry, self.entries[i].object)
                .and_then(|ctx| self.manager.observer_reference(ctx))
                .and_then(|observer| self.visitor_id(observer.host_object()));
            self.entries[i].owner = owner;
        }
    }

    fn clear_tags(&self) {
        for entry in &self.entries {
            store::remove_multi_context_value(
                &self.registry,
                entry.object,
                names::VISITOR_ID,
                self.session,
            );
        }
    }
}

impl Drop for RelationalTable {
    fn drop(&mut self) {
        self.clear_tags();
    }
}

impl std::fmt::Debug for RelationalTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationalTable")
            .field("root", &self.root)
            .field("session", &self.session)
            .field("entries", &self.entries)
            .finish()
    }
}
