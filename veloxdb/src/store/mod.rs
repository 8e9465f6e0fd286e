//! The object store: per-class slab pools, version chains, side stores, and
//! the inverse-reference graph. See spec.md §3 and §4.2.

pub mod arena;
pub mod class_store;
pub mod object;

use std::collections::HashMap;

use crate::error::{CResult, Error};
use crate::model::{ClassDescriptor, ClassId, DeleteAction};
use crate::store::arena::Handle;
use crate::store::class_store::ClassStore;
use crate::store::object::{InverseRefEntry, ObjectId};

/// All classes' storage, keyed by class id.
pub struct ObjectStore {
    classes: HashMap<ClassId, ClassStore>,
}

impl ObjectStore {
    pub fn new() -> Self {
        ObjectStore {
            classes: HashMap::new(),
        }
    }

    pub fn register_class(&mut self, descriptor: ClassDescriptor) -> CResult<()> {
        descriptor.validate()?;
        if descriptor.abstract_class {
            // Abstract classes are present in the schema but hold no
            // objects; still register so property lookups succeed.
        }
        self.classes.insert(descriptor.id, ClassStore::new(descriptor));
        Ok(())
    }

    pub fn class(&self, id: ClassId) -> CResult<&ClassStore> {
        self.classes
            .get(&id)
            .ok_or_else(|| Error::SchemaMismatch(format!("unknown class id {id}")))
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassStore> {
        self.classes.values()
    }

    /// Appends an inverse-reference entry to `target`'s list, per spec.md
    /// §3 "Inverse-reference entity".
    pub fn add_inverse_ref(
        &self,
        target_class: ClassId,
        target_id: ObjectId,
        source_class: ClassId,
        source_id: ObjectId,
        source_property: crate::model::PropertyId,
    ) -> CResult<()> {
        let store = self.class(target_class)?;
        let head = store.head(target_id);
        let existing_head = head.and_then(|h| store.node(h)).and_then(|n| n.inverse_refs_head);
        let handle = store.inverse_refs().insert(InverseRefEntry {
            source_class,
            source_id,
            source_property,
            next: existing_head,
        });
        if let Some(h) = head {
            store.with_node_mut(h, |n| n.inverse_refs_head = Some(handle));
        }
        Ok(())
    }

    /// Removes the first inverse-ref entry matching the given source edge.
    /// O(list length); inverse-ref lists are expected to stay short in
    /// practice (bounded by fan-in on a single object).
    pub fn remove_inverse_ref(
        &self,
        target_class: ClassId,
        target_id: ObjectId,
        source_class: ClassId,
        source_id: ObjectId,
        source_property: crate::model::PropertyId,
    ) -> CResult<()> {
        let store = self.class(target_class)?;
        let Some(head) = store.head(target_id) else {
            return Ok(());
        };
        let Some(node) = store.node(head) else {
            return Ok(());
        };
        let mut prev: Option<Handle> = None;
        let mut cursor = node.inverse_refs_head;
        while let Some(h) = cursor {
            let entry = store.inverse_refs().with(h, |e| e.clone());
            let Some(entry) = entry else { break };
            if entry.source_class == source_class
                && entry.source_id == source_id
                && entry.source_property == source_property
            {
                let next = entry.next;
                match prev {
                    Some(p) => {
                        store.inverse_refs().with_mut(p, |e| e.next = next);
                    }
                    None => {
                        store.with_node_mut(head, |n| n.inverse_refs_head = next);
                    }
                }
                store.inverse_refs().remove(h);
                return Ok(());
            }
            prev = Some(h);
            cursor = entry.next;
        }
        Ok(())
    }

    /// Collects every inverse-ref entry for `target_id`, used to enforce
    /// delete actions and for inverse navigation.
    pub fn inverse_refs(&self, target_class: ClassId, target_id: ObjectId) -> CResult<Vec<InverseRefEntry>> {
        let store = self.class(target_class)?;
        let Some(head) = store.head(target_id) else {
            return Ok(Vec::new());
        };
        let Some(node) = store.node(head) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        let mut cursor = node.inverse_refs_head;
        while let Some(h) = cursor {
            let Some(entry) = store.inverse_refs().with(h, |e| e.clone()) else {
                break;
            };
            cursor = entry.next;
            out.push(entry);
        }
        Ok(out)
    }

    /// Resolves what should happen to referencing objects when `target_id`
    /// is deleted, per the declaring property's `delete_action`. Returns
    /// `Err(ReferentialIntegrity)` if any PreventDelete edge still exists.
    /// Fetches live inverse-ref state; callers that must also account for a
    /// not-yet-committed transaction's own staged changes to that state use
    /// `resolve_delete_actions` directly with a merged ref list instead.
    pub fn check_delete_actions(
        &self,
        target_class: ClassId,
        target_id: ObjectId,
    ) -> CResult<Vec<InverseRefEntry>> {
        let refs = self.inverse_refs(target_class, target_id)?;
        self.resolve_delete_actions(target_class, target_id, refs)
    }

    /// Classifies an already-fetched set of inverse-ref entries for
    /// `target_id` by their declaring property's `delete_action`, same rule
    /// `check_delete_actions` applies to a live fetch.
    pub fn resolve_delete_actions(
        &self,
        target_class: ClassId,
        target_id: ObjectId,
        refs: Vec<InverseRefEntry>,
    ) -> CResult<Vec<InverseRefEntry>> {
        let mut cascades = Vec::new();
        for entry in refs {
            let source_store = self.class(entry.source_class)?;
            let action = source_store
                .descriptor
                .property(entry.source_property)
                .and_then(|p| p.delete_action)
                .unwrap_or(DeleteAction::SetToNull);
            match action {
                DeleteAction::PreventDelete => {
                    return Err(Error::ReferentialIntegrity(format!(
                        "object {target_id} in class {target_class} is referenced by {}:{} via property {}",
                        entry.source_class, entry.source_id, entry.source_property
                    )));
                }
                DeleteAction::CascadeDelete | DeleteAction::SetToNull => cascades.push(entry),
            }
        }
        Ok(cascades)
    }

    /// Applies one staged inverse-ref change for real, under the target
    /// class's per-class lock (spec.md §4.2: applied atomically against the
    /// target objects' inverse-ref lists at commit, not when the change was
    /// first staged).
    pub fn apply_inverse_ref_change(&self, change: &crate::txn::transaction::InverseRefChange) -> CResult<()> {
        self.class(change.target_class)?.with_inverse_ref_lock(|| -> CResult<()> {
            if let Some(old_id) = change.old_target {
                self.remove_inverse_ref(change.target_class, old_id, change.source_class, change.source_id, change.source_property)?;
            }
            if let Some(new_id) = change.new_target {
                self.add_inverse_ref(change.target_class, new_id, change.source_class, change.source_id, change.source_property)?;
            }
            Ok(())
        })
    }
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}
