//! Pinning and unpinning of mesh vertices.
//!
//! Pinning records each vertex's original mass in a [`FixedVertex`] array on
//! the mesh entity, then gives it an effectively infinite mass and a zero
//! inverse mass. Both operations must run inside a transaction so they are
//! undoable together with the rest of the mutation they belong to.

use crate::dynamics::components::{FixedVertex, SimMass};
use crate::store::{Entity, EntityStore};
use wgcloth_core::{ClothError, ClothResult};

/// The mass assigned to pinned vertices.
pub const PINNED_MASS: f32 = 9_999_999.0;

/// Pins the given vertices of a mesh entity.
///
/// Already-pinned vertices are left untouched.
pub fn pin(store: &mut EntityStore, mesh: Entity, indices: &[u32]) -> ClothResult<()> {
    check_transaction(store, "pin")?;
    let mut masses = masses_of(store, mesh)?;
    let mut fixed = store
        .get_array::<FixedVertex>(mesh)
        .map(<[FixedVertex]>::to_vec)
        .unwrap_or_default();

    for &index in indices {
        let mass = masses.get_mut(index as usize).ok_or_else(|| {
            ClothError::NotFound(format!("vertex {index} is out of bounds"))
        })?;
        if fixed.iter().any(|f| f.vertex == index) {
            continue;
        }
        fixed.push(FixedVertex {
            vertex: index,
            mass: mass.mass,
            inv_mass: mass.inv_mass,
            _pad: 0,
        });
        mass.mass = PINNED_MASS;
        mass.inv_mass = 0.0;
    }

    store.set_array(mesh, masses)?;
    if store.has_array::<FixedVertex>(mesh) {
        store.set_array(mesh, fixed)?;
    } else {
        store.add_array(mesh, fixed)?;
    }
    Ok(())
}

/// Unpins the given vertices, restoring their recorded masses.
///
/// Vertices without a pinning record are left untouched.
pub fn unpin(store: &mut EntityStore, mesh: Entity, indices: &[u32]) -> ClothResult<()> {
    check_transaction(store, "unpin")?;
    let mut masses = masses_of(store, mesh)?;
    let mut fixed = store
        .get_array::<FixedVertex>(mesh)
        .map(<[FixedVertex]>::to_vec)
        .unwrap_or_default();

    for &index in indices {
        let Some(at) = fixed.iter().position(|f| f.vertex == index) else {
            continue;
        };
        let record = fixed.swap_remove(at);
        if let Some(mass) = masses.get_mut(index as usize) {
            mass.mass = record.mass;
            mass.inv_mass = record.inv_mass;
        }
    }

    store.set_array(mesh, masses)?;
    if store.has_array::<FixedVertex>(mesh) {
        store.set_array(mesh, fixed)?;
    } else {
        store.add_array(mesh, fixed)?;
    }
    Ok(())
}

fn check_transaction(store: &EntityStore, what: &str) -> ClothResult<()> {
    if !store.in_transaction() {
        return Err(ClothError::Concurrency(format!(
            "{what}() must run inside a transaction"
        )));
    }
    Ok(())
}

fn masses_of(store: &EntityStore, mesh: Entity) -> ClothResult<Vec<SimMass>> {
    store
        .get_array::<SimMass>(mesh)
        .map(<[SimMass]>::to_vec)
        .ok_or_else(|| {
            ClothError::NotFound(format!(
                "entity {} has no mass array to pin",
                mesh.id()
            ))
        })
}
