//! Reversible operations and the transaction log.

use crate::store::storage::ErasedValue;
use crate::store::{Entity, EntityStore};
use std::any::TypeId;

/// One reversible mutation of the entity store.
///
/// Operations carry enough state to be applied and reverted any number of
/// times; undo and redo replay them through the store's direct path, which
/// does not re-record them.
pub(crate) enum TxOp {
    CreateEntity {
        entity: Entity,
    },
    DestroyEntity {
        entity: Entity,
    },
    AddComponent {
        entity: Entity,
        type_id: TypeId,
        value: Box<dyn ErasedValue>,
    },
    RemoveComponent {
        entity: Entity,
        type_id: TypeId,
        value: Box<dyn ErasedValue>,
    },
    SetComponent {
        entity: Entity,
        type_id: TypeId,
        old: Box<dyn ErasedValue>,
        new: Box<dyn ErasedValue>,
    },
    AddArray {
        entity: Entity,
        type_id: TypeId,
        value: Box<dyn ErasedValue>,
    },
    SetArray {
        entity: Entity,
        type_id: TypeId,
        old: Box<dyn ErasedValue>,
        new: Box<dyn ErasedValue>,
    },
    RemoveArray {
        entity: Entity,
        type_id: TypeId,
        value: Box<dyn ErasedValue>,
    },
}

impl TxOp {
    /// Re-applies the forward direction of this operation.
    pub fn apply(&self, store: &mut EntityStore) {
        match self {
            TxOp::CreateEntity { entity } => store.create_direct(*entity),
            TxOp::DestroyEntity { entity } => store.destroy_direct(*entity),
            TxOp::AddComponent {
                entity,
                type_id,
                value,
            } => store.component_insert_direct(*type_id, *entity, (**value).as_any()),
            TxOp::RemoveComponent {
                entity, type_id, ..
            } => store.component_remove_direct(*type_id, *entity),
            TxOp::SetComponent {
                entity,
                type_id,
                new,
                ..
            } => store.component_set_direct(*type_id, *entity, (**new).as_any()),
            TxOp::AddArray {
                entity,
                type_id,
                value,
            } => store.array_insert_direct(*type_id, *entity, (**value).as_any()),
            TxOp::SetArray {
                entity,
                type_id,
                new,
                ..
            } => store.array_set_direct(*type_id, *entity, (**new).as_any()),
            TxOp::RemoveArray {
                entity, type_id, ..
            } => store.array_remove_direct(*type_id, *entity),
        }
    }

    /// Applies the inverse of this operation.
    pub fn revert(&self, store: &mut EntityStore) {
        match self {
            TxOp::CreateEntity { entity } => store.destroy_direct(*entity),
            TxOp::DestroyEntity { entity } => store.create_direct(*entity),
            TxOp::AddComponent {
                entity, type_id, ..
            } => store.component_remove_direct(*type_id, *entity),
            TxOp::RemoveComponent {
                entity,
                type_id,
                value,
            } => store.component_insert_direct(*type_id, *entity, (**value).as_any()),
            TxOp::SetComponent {
                entity,
                type_id,
                old,
                ..
            } => store.component_set_direct(*type_id, *entity, (**old).as_any()),
            TxOp::AddArray {
                entity, type_id, ..
            } => store.array_remove_direct(*type_id, *entity),
            TxOp::SetArray {
                entity,
                type_id,
                old,
                ..
            } => store.array_set_direct(*type_id, *entity, (**old).as_any()),
            TxOp::RemoveArray {
                entity,
                type_id,
                value,
            } => store.array_insert_direct(*type_id, *entity, (**value).as_any()),
        }
    }
}

/// An ordered sequence of reversible operations.
///
/// Committed transactions move to the undo stack; undone transactions move to
/// the redo stack.
#[derive(Default)]
pub(crate) struct Transaction {
    pub ops: Vec<TxOp>,
}

impl Transaction {
    pub fn apply_all(&self, store: &mut EntityStore) {
        for op in &self.ops {
            op.apply(store);
        }
    }

    pub fn revert_all(&self, store: &mut EntityStore) {
        for op in self.ops.iter().rev() {
            op.revert(store);
        }
    }
}
