//! Transactional sparse-set entity store and its device mirror.

pub mod mirror;
pub(crate) mod storage;
mod transaction;

pub use mirror::{DeviceMirror, Region};
pub use storage::ComponentValue;

use crate::store::storage::{AnyStorage, SparseSet};
use crate::store::transaction::{Transaction, TxOp};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use wgcloth_core::{ClothError, ClothResult};

/// A 32-bit entity identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Entity(u32);

impl Entity {
    /// The invalid entity, used as a "none" marker in configuration components.
    pub const INVALID: Entity = Entity(u32::MAX);

    /// The raw identifier.
    pub fn id(self) -> u32 {
        self.0
    }

    /// Returns `true` unless this is [`Entity::INVALID`].
    pub fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }

    /// Builds an entity from a raw identifier.
    pub fn from_raw(id: u32) -> Self {
        Entity(id)
    }
}

/// The host-side simulation database.
///
/// Holds one dense sparse-set storage per component type and one array
/// storage per array-component type, plus the transaction log driving
/// undo/redo. Mutations performed while a transaction is active are recorded
/// and become reversible; mutations outside a transaction apply immediately
/// and are not undoable.
#[derive(Default)]
pub struct EntityStore {
    alive: Vec<bool>,
    free: Vec<u32>,
    components: HashMap<TypeId, Box<dyn AnyStorage>>,
    arrays: HashMap<TypeId, Box<dyn AnyStorage>>,
    active: Option<Transaction>,
    undo: Vec<Transaction>,
    redo: Vec<Transaction>,
}

impl EntityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new entity, reusing destroyed identifiers when available.
    pub fn create_entity(&mut self) -> Entity {
        let id = if let Some(id) = self.free.pop() {
            self.alive[id as usize] = true;
            id
        } else {
            self.alive.push(true);
            (self.alive.len() - 1) as u32
        };
        let entity = Entity(id);
        self.record(TxOp::CreateEntity { entity });
        entity
    }

    /// Destroys an entity, removing it from every storage.
    pub fn destroy_entity(&mut self, entity: Entity) -> ClothResult<()> {
        self.check_alive(entity)?;

        // Record (and perform) the removal of every component the entity
        // still carries, then the destruction itself, so that reverting in
        // reverse order recreates the entity before re-adding components.
        let mut ops = Vec::new();
        for (&type_id, storage) in self.components.iter_mut() {
            if let Some(value) = storage.remove_erased(entity) {
                ops.push(TxOp::RemoveComponent {
                    entity,
                    type_id,
                    value,
                });
            }
        }
        for (&type_id, storage) in self.arrays.iter_mut() {
            if let Some(value) = storage.remove_erased(entity) {
                ops.push(TxOp::RemoveArray {
                    entity,
                    type_id,
                    value,
                });
            }
        }

        self.alive[entity.id() as usize] = false;
        self.free.push(entity.id());

        if let Some(tx) = &mut self.active {
            tx.ops.extend(ops);
            tx.ops.push(TxOp::DestroyEntity { entity });
        }
        Ok(())
    }

    /// Returns `true` if `entity` is currently alive.
    pub fn is_alive(&self, entity: Entity) -> bool {
        entity.is_valid()
            && (entity.id() as usize) < self.alive.len()
            && self.alive[entity.id() as usize]
    }

    /// Adds a component to an entity.
    ///
    /// Fails with a duplicate error if the entity already carries a `T`.
    pub fn add_component<T: ComponentValue>(&mut self, entity: Entity, value: T) -> ClothResult<()> {
        self.check_alive(entity)?;
        let storage = typed_storage_mut::<T>(&mut self.components);
        if !storage.insert(entity, value.clone()) {
            return Err(ClothError::Duplicate(format!(
                "entity {} already has a {}",
                entity.id(),
                std::any::type_name::<T>()
            )));
        }
        self.record(TxOp::AddComponent {
            entity,
            type_id: TypeId::of::<T>(),
            value: Box::new(value),
        });
        Ok(())
    }

    /// Overwrites an existing component in place.
    ///
    /// Fails with a not-found error if the entity does not carry a `T`.
    pub fn set_component<T: ComponentValue>(&mut self, entity: Entity, value: T) -> ClothResult<()> {
        self.check_alive(entity)?;
        let storage = typed_storage_mut::<T>(&mut self.components);
        let Some(old) = storage.set(entity, value.clone()) else {
            return Err(not_found::<T>(entity));
        };
        self.record(TxOp::SetComponent {
            entity,
            type_id: TypeId::of::<T>(),
            old: Box::new(old),
            new: Box::new(value),
        });
        Ok(())
    }

    /// Removes a component from an entity.
    pub fn remove_component<T: ComponentValue>(&mut self, entity: Entity) -> ClothResult<()> {
        self.check_alive(entity)?;
        let storage = typed_storage_mut::<T>(&mut self.components);
        let Some(old) = storage.remove(entity) else {
            return Err(not_found::<T>(entity));
        };
        self.record(TxOp::RemoveComponent {
            entity,
            type_id: TypeId::of::<T>(),
            value: Box::new(old),
        });
        Ok(())
    }

    /// Reads a component.
    pub fn get_component<T: ComponentValue>(&self, entity: Entity) -> Option<&T> {
        self.component_storage::<T>()?.get(entity)
    }

    /// Returns `true` if the entity carries a `T`.
    pub fn has_component<T: ComponentValue>(&self, entity: Entity) -> bool {
        self.component_storage::<T>()
            .is_some_and(|s| s.contains(entity))
    }

    /// Adds an array component to an entity.
    ///
    /// Fails with a duplicate error if the entity already carries a `T` array.
    pub fn add_array<T: ComponentValue>(&mut self, entity: Entity, values: Vec<T>) -> ClothResult<()> {
        self.check_alive(entity)?;
        let storage = typed_storage_mut::<Vec<T>>(&mut self.arrays);
        if !storage.insert(entity, values.clone()) {
            return Err(ClothError::Duplicate(format!(
                "entity {} already has a {} array",
                entity.id(),
                std::any::type_name::<T>()
            )));
        }
        self.record(TxOp::AddArray {
            entity,
            type_id: TypeId::of::<Vec<T>>(),
            value: Box::new(values),
        });
        Ok(())
    }

    /// Overwrites an existing array component.
    ///
    /// Fails with a not-found error if the entity does not carry a `T` array.
    pub fn set_array<T: ComponentValue>(&mut self, entity: Entity, values: Vec<T>) -> ClothResult<()> {
        self.check_alive(entity)?;
        let storage = typed_storage_mut::<Vec<T>>(&mut self.arrays);
        let Some(old) = storage.set(entity, values.clone()) else {
            return Err(not_found::<T>(entity));
        };
        self.record(TxOp::SetArray {
            entity,
            type_id: TypeId::of::<Vec<T>>(),
            old: Box::new(old),
            new: Box::new(values),
        });
        Ok(())
    }

    /// Removes an array component from an entity.
    pub fn remove_array<T: ComponentValue>(&mut self, entity: Entity) -> ClothResult<()> {
        self.check_alive(entity)?;
        let storage = typed_storage_mut::<Vec<T>>(&mut self.arrays);
        let Some(old) = storage.remove(entity) else {
            return Err(not_found::<T>(entity));
        };
        self.record(TxOp::RemoveArray {
            entity,
            type_id: TypeId::of::<Vec<T>>(),
            value: Box::new(old),
        });
        Ok(())
    }

    /// Reads an array component.
    pub fn get_array<T: ComponentValue>(&self, entity: Entity) -> Option<&[T]> {
        self.array_storage::<T>()?.get(entity).map(|v| v.as_slice())
    }

    /// Returns `true` if the entity carries a `T` array.
    pub fn has_array<T: ComponentValue>(&self, entity: Entity) -> bool {
        self.array_storage::<T>()
            .is_some_and(|s| s.contains(entity))
    }

    /// Entities carrying a `T` component, sorted by identifier.
    pub fn entities_with<T: ComponentValue>(&self) -> Vec<Entity> {
        let mut entities = self
            .component_storage::<T>()
            .map(|s| s.entities().to_vec())
            .unwrap_or_default();
        entities.sort();
        entities
    }

    /// Entities carrying a `T` array, sorted by identifier.
    pub fn entities_with_array<T: ComponentValue>(&self) -> Vec<Entity> {
        let mut entities = self
            .array_storage::<T>()
            .map(|s| s.entities().to_vec())
            .unwrap_or_default();
        entities.sort();
        entities
    }

    // --- Transactions -----------------------------------------------------

    /// Runs `f` inside a scoped transaction.
    ///
    /// Commits when `f` returns `Ok`; rolls every mutation back and
    /// propagates the failure when `f` returns `Err` or panics.
    pub fn transact<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> ClothResult<R>,
    ) -> ClothResult<R> {
        self.begin()?;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(self)));
        match result {
            Ok(Ok(value)) => {
                self.commit();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.rollback();
                Err(err)
            }
            Err(panic) => {
                self.rollback();
                std::panic::resume_unwind(panic);
            }
        }
    }

    /// Returns `true` while a transaction is active.
    pub fn in_transaction(&self) -> bool {
        self.active.is_some()
    }

    /// Returns `true` if there is a committed transaction to undo.
    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    /// Returns `true` if there is an undone transaction to redo.
    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    /// Reverts the most recently committed transaction.
    ///
    /// Returns `false` when the undo stack is empty.
    pub fn undo(&mut self) -> ClothResult<bool> {
        if self.active.is_some() {
            return Err(ClothError::Concurrency(
                "a transaction is already active".to_string(),
            ));
        }
        let Some(tx) = self.undo.pop() else {
            return Ok(false);
        };
        tx.revert_all(self);
        self.redo.push(tx);
        Ok(true)
    }

    /// Re-applies the most recently undone transaction.
    ///
    /// Returns `false` when the redo stack is empty.
    pub fn redo(&mut self) -> ClothResult<bool> {
        if self.active.is_some() {
            return Err(ClothError::Concurrency(
                "a transaction is already active".to_string(),
            ));
        }
        let Some(tx) = self.redo.pop() else {
            return Ok(false);
        };
        tx.apply_all(self);
        self.undo.push(tx);
        Ok(true)
    }

    fn begin(&mut self) -> ClothResult<()> {
        if self.active.is_some() {
            return Err(ClothError::Concurrency(
                "a transaction is already active".to_string(),
            ));
        }
        self.active = Some(Transaction::default());
        Ok(())
    }

    fn commit(&mut self) {
        if let Some(tx) = self.active.take() {
            self.undo.push(tx);
            self.redo.clear();
        }
    }

    fn rollback(&mut self) {
        if let Some(tx) = self.active.take() {
            tx.revert_all(self);
        }
    }

    fn record(&mut self, op: TxOp) {
        if let Some(tx) = &mut self.active {
            tx.ops.push(op);
        }
    }

    fn check_alive(&self, entity: Entity) -> ClothResult<()> {
        if !self.is_alive(entity) {
            return Err(ClothError::NotFound(format!(
                "entity {} does not exist",
                entity.id()
            )));
        }
        Ok(())
    }

    // --- Direct (replay) path ---------------------------------------------
    //
    // Used by undo/redo to re-apply recorded operations without recording
    // them again. Storages referenced here are guaranteed to exist because
    // the original typed operation created them.

    pub(crate) fn create_direct(&mut self, entity: Entity) {
        let id = entity.id() as usize;
        if id >= self.alive.len() {
            self.alive.resize(id + 1, false);
        }
        self.alive[id] = true;
        self.free.retain(|&f| f != entity.id());
    }

    pub(crate) fn destroy_direct(&mut self, entity: Entity) {
        self.alive[entity.id() as usize] = false;
        self.free.push(entity.id());
    }

    pub(crate) fn component_insert_direct(&mut self, type_id: TypeId, entity: Entity, value: &dyn Any) {
        self.replay_storage(&StorageKind::Component, type_id)
            .insert_erased(entity, value);
    }

    pub(crate) fn component_set_direct(&mut self, type_id: TypeId, entity: Entity, value: &dyn Any) {
        self.replay_storage(&StorageKind::Component, type_id)
            .set_erased(entity, value);
    }

    pub(crate) fn component_remove_direct(&mut self, type_id: TypeId, entity: Entity) {
        self.replay_storage(&StorageKind::Component, type_id)
            .remove_erased(entity);
    }

    pub(crate) fn array_insert_direct(&mut self, type_id: TypeId, entity: Entity, value: &dyn Any) {
        self.replay_storage(&StorageKind::Array, type_id)
            .insert_erased(entity, value);
    }

    pub(crate) fn array_set_direct(&mut self, type_id: TypeId, entity: Entity, value: &dyn Any) {
        self.replay_storage(&StorageKind::Array, type_id)
            .set_erased(entity, value);
    }

    pub(crate) fn array_remove_direct(&mut self, type_id: TypeId, entity: Entity) {
        self.replay_storage(&StorageKind::Array, type_id)
            .remove_erased(entity);
    }

    fn replay_storage(&mut self, kind: &StorageKind, type_id: TypeId) -> &mut dyn AnyStorage {
        let map = match kind {
            StorageKind::Component => &mut self.components,
            StorageKind::Array => &mut self.arrays,
        };
        map.get_mut(&type_id)
            .expect("storage for a replayed operation must exist")
            .as_mut()
    }

    // --- Typed storage access (device mirror) ------------------------------

    pub(crate) fn component_storage<T: ComponentValue>(&self) -> Option<&SparseSet<T>> {
        self.components
            .get(&TypeId::of::<T>())
            .and_then(|s| s.as_any().downcast_ref())
    }

    pub(crate) fn array_storage<T: ComponentValue>(&self) -> Option<&SparseSet<Vec<T>>> {
        self.arrays
            .get(&TypeId::of::<Vec<T>>())
            .and_then(|s| s.as_any().downcast_ref())
    }

    pub(crate) fn component_dirty<T: ComponentValue>(&self) -> bool {
        self.components
            .get(&TypeId::of::<T>())
            .is_some_and(|s| s.is_dirty())
    }

    pub(crate) fn array_dirty<T: ComponentValue>(&self) -> bool {
        self.arrays
            .get(&TypeId::of::<Vec<T>>())
            .is_some_and(|s| s.is_dirty())
    }

    pub(crate) fn clear_component_dirty<T: ComponentValue>(&mut self) {
        if let Some(s) = self.components.get_mut(&TypeId::of::<T>()) {
            s.clear_dirty();
        }
    }

    pub(crate) fn clear_array_dirty<T: ComponentValue>(&mut self) {
        if let Some(s) = self.arrays.get_mut(&TypeId::of::<Vec<T>>()) {
            s.clear_dirty();
        }
    }
}

fn not_found<T>(entity: Entity) -> ClothError {
    ClothError::NotFound(format!(
        "entity {} has no {}",
        entity.id(),
        std::any::type_name::<T>()
    ))
}

enum StorageKind {
    Component,
    Array,
}

fn typed_storage_mut<T: ComponentValue>(
    map: &mut HashMap<TypeId, Box<dyn AnyStorage>>,
) -> &mut SparseSet<T> {
    map.entry(TypeId::of::<T>())
        .or_insert_with(|| Box::new(SparseSet::<T>::default()))
        .as_any_mut()
        .downcast_mut()
        .expect("storage type keyed by TypeId cannot mismatch")
}

#[cfg(test)]
mod test {
    use super::{Entity, EntityStore};
    use wgcloth_core::ClothError;

    #[derive(Clone, Debug, PartialEq)]
    struct Health(i32);

    #[derive(Clone, Debug, PartialEq)]
    struct Label(&'static str);

    #[test]
    fn component_lifecycle() {
        let mut store = EntityStore::new();
        let e = store.create_entity();

        store.add_component(e, Health(10)).unwrap();
        assert!(matches!(
            store.add_component(e, Health(11)),
            Err(ClothError::Duplicate(_))
        ));
        assert_eq!(store.get_component::<Health>(e), Some(&Health(10)));

        store.set_component(e, Health(20)).unwrap();
        assert_eq!(store.get_component::<Health>(e), Some(&Health(20)));

        store.remove_component::<Health>(e).unwrap();
        assert!(!store.has_component::<Health>(e));
        assert!(matches!(
            store.set_component(e, Health(1)),
            Err(ClothError::NotFound(_))
        ));
    }

    #[test]
    fn destroyed_ids_are_recycled() {
        let mut store = EntityStore::new();
        let a = store.create_entity();
        let b = store.create_entity();
        store.add_component(a, Health(1)).unwrap();
        store.add_component(b, Label("b")).unwrap();

        store.destroy_entity(a).unwrap();
        assert!(!store.is_alive(a));
        assert!(!store.has_component::<Health>(a));

        let c = store.create_entity();
        assert_eq!(c.id(), a.id());
        assert!(!store.has_component::<Health>(c));
    }

    #[test]
    fn transact_commits_on_ok() {
        let mut store = EntityStore::new();
        let e = store
            .transact(|store| {
                let e = store.create_entity();
                store.add_component(e, Health(5))?;
                Ok(e)
            })
            .unwrap();
        assert!(store.is_alive(e));
        assert!(store.can_undo());
        assert!(!store.can_redo());
    }

    #[test]
    fn transact_rolls_back_on_error() {
        let mut store = EntityStore::new();
        let e = store.create_entity();
        store.add_component(e, Health(5)).unwrap();

        let result: Result<(), _> = store.transact(|store| {
            store.set_component(e, Health(99))?;
            store.add_component(e, Health(1))?; // duplicate, fails
            Ok(())
        });
        assert!(matches!(result, Err(ClothError::Duplicate(_))));
        assert_eq!(store.get_component::<Health>(e), Some(&Health(5)));
        assert!(!store.can_undo());
    }

    #[test]
    fn transact_rolls_back_on_panic() {
        let mut store = EntityStore::new();
        let e = store.create_entity();
        store.add_component(e, Health(5)).unwrap();

        let panic = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<(), _> = store.transact(|store| {
                store.set_component(e, Health(42)).unwrap();
                panic!("boom");
            });
        }));
        assert!(panic.is_err());
        assert_eq!(store.get_component::<Health>(e), Some(&Health(5)));
        assert!(!store.in_transaction());
    }

    #[test]
    fn nested_transactions_are_rejected() {
        let mut store = EntityStore::new();
        let result = store.transact(|store| store.transact(|_| Ok(())));
        assert!(matches!(result, Err(ClothError::Concurrency(_))));
    }

    #[test]
    fn undo_redo_roundtrip() {
        let mut store = EntityStore::new();
        let e = store
            .transact(|store| {
                let e = store.create_entity();
                store.add_component(e, Health(1))?;
                store.add_array(e, vec![1u32, 2, 3])?;
                Ok(e)
            })
            .unwrap();

        store
            .transact(|store| {
                store.set_component(e, Health(2))?;
                store.set_array(e, vec![9u32])?;
                Ok(())
            })
            .unwrap();

        assert_eq!(store.get_component::<Health>(e), Some(&Health(2)));
        assert_eq!(store.get_array::<u32>(e), Some(&[9u32][..]));

        assert!(store.undo().unwrap());
        assert_eq!(store.get_component::<Health>(e), Some(&Health(1)));
        assert_eq!(store.get_array::<u32>(e), Some(&[1u32, 2, 3][..]));

        assert!(store.redo().unwrap());
        assert_eq!(store.get_component::<Health>(e), Some(&Health(2)));
        assert_eq!(store.get_array::<u32>(e), Some(&[9u32][..]));

        // Undoing both transactions removes the entity entirely.
        assert!(store.undo().unwrap());
        assert!(store.undo().unwrap());
        assert!(!store.is_alive(e));
        assert!(!store.undo().unwrap());

        // And redo restores it, component included.
        assert!(store.redo().unwrap());
        assert!(store.is_alive(e));
        assert_eq!(store.get_component::<Health>(e), Some(&Health(1)));
    }

    #[test]
    fn commit_clears_the_redo_stack() {
        let mut store = EntityStore::new();
        let e = store
            .transact(|store| {
                let e = store.create_entity();
                store.add_component(e, Health(1))?;
                Ok(e)
            })
            .unwrap();

        store.transact(|s| s.set_component(e, Health(2))).unwrap();
        store.undo().unwrap();
        assert!(store.can_redo());

        store.transact(|s| s.set_component(e, Health(3))).unwrap();
        assert!(!store.can_redo());
        assert_eq!(store.get_component::<Health>(e), Some(&Health(3)));
    }

    #[test]
    fn undo_restores_destroyed_entities() {
        let mut store = EntityStore::new();
        let e = store.create_entity();
        store.add_component(e, Health(7)).unwrap();
        store.add_array(e, vec![4u32, 5]).unwrap();

        store.transact(|s| s.destroy_entity(e)).unwrap();
        assert!(!store.is_alive(e));

        store.undo().unwrap();
        assert!(store.is_alive(e));
        assert_eq!(store.get_component::<Health>(e), Some(&Health(7)));
        assert_eq!(store.get_array::<u32>(e), Some(&[4u32, 5][..]));
    }

    #[test]
    fn entities_with_is_sorted_by_id() {
        let mut store = EntityStore::new();
        let a = store.create_entity();
        let b = store.create_entity();
        let c = store.create_entity();
        store.add_component(c, Health(3)).unwrap();
        store.add_component(a, Health(1)).unwrap();
        store.add_component(b, Health(2)).unwrap();
        assert_eq!(store.entities_with::<Health>(), vec![a, b, c]);
    }
}
