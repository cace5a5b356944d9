//! Pluggable dynamics terms and the providers that instantiate them.
//!
//! A term participates in four phases: it declares its sparsity footprint,
//! initializes its GPU resources against the shared [`SolverContext`],
//! records its assembly dispatches, and releases everything on drop.
//!
//! Providers discover constraint entities in the store, gather their
//! topology — scoped to one mesh entity, or merged globally with per-entity
//! position offsets applied — and instantiate terms with a flat topology.

mod area;
mod gravity;
mod inertia;
mod spring;

pub use area::{AreaTerm, WgArea};
pub use gravity::{GravityTerm, WgGravity};
pub use inertia::{InertiaTerm, WgInertia};
pub use spring::{SpringTerm, WgSpring};

use crate::dynamics::components::{
    AreaConstraint, AreaTriangle, GravityConstraint, SimPosition, SpringConstraint, SpringEdge,
};
use crate::dynamics::sparsity::SparsityBuilder;
use crate::dynamics::SolverContext;
use crate::store::{DeviceMirror, Entity, EntityStore};
use wgcloth_core::{ClothError, ClothResult, ShaderLoader};
use wgpu::{ComputePass, Device};

/// A contributor to the per-timestep linear system.
///
/// Registration order is the dispatch order and is stable. GPU resources
/// acquired in [`DynamicsTerm::init`] are released when the term drops,
/// including on early-exit paths of a failed solver initialization.
pub trait DynamicsTerm {
    /// A short, stable name used in logs.
    fn name(&self) -> &'static str;

    /// Declares every non-diagonal `(i, j)` entry this term writes.
    fn declare_sparsity(&self, builder: &mut SparsityBuilder) -> ClothResult<()>;

    /// Precomputes per-element CSR block indices, uploads the term's buffers
    /// and parameter uniform, compiles its kernel, and caches bind groups
    /// against the shared buffers in `ctx`.
    fn init(
        &mut self,
        device: &Device,
        shaders: &ShaderLoader,
        sparsity: &SparsityBuilder,
        ctx: &SolverContext,
    ) -> ClothResult<()>;

    /// Records the Newton assembly dispatch: scatter force and Hessian
    /// contributions into the shared buffers.
    fn assemble(&self, device: &Device, pass: &mut ComputePass);

    /// Records this term's contribution to the constant projective-dynamics
    /// system matrix. Terms without a quadratic constraint part are no-ops.
    fn assemble_lhs(&self, device: &Device, pass: &mut ComputePass) {
        let _ = (device, pass);
    }

    /// Records the fused local-projection + right-hand-side scatter of the
    /// projective-dynamics global step. Terms without a projection are no-ops.
    fn project_rhs(&self, device: &Device, pass: &mut ComputePass) {
        let _ = (device, pass);
    }
}

/// Where a provider gathers topology from.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum TopologyScope {
    /// Merge topology arrays from every entity, rewriting node indices with
    /// each owner's offset in the global position buffer.
    Global,
    /// Use the topology of this mesh entity (or of the constraint entity
    /// itself), with indices kept local to the mesh's buffer slice.
    Local(Entity),
}

/// Instantiates the terms configured by `constraint_entities`.
///
/// A constraint entity carrying its own topology array scopes its term to
/// exactly that topology; otherwise the topology is merged across every
/// entity carrying a matching array, with position offsets applied.
pub fn gather_terms(
    store: &EntityStore,
    mirror: &DeviceMirror,
    constraint_entities: impl Iterator<Item = Entity>,
    scope: TopologyScope,
) -> ClothResult<Vec<Box<dyn DynamicsTerm>>> {
    let mut terms: Vec<Box<dyn DynamicsTerm>> = Vec::new();
    for entity in constraint_entities {
        if !store.is_alive(entity) {
            return Err(ClothError::NotFound(format!(
                "constraint entity {} does not exist",
                entity.id()
            )));
        }
        if let Some(cfg) = store.get_component::<SpringConstraint>(entity) {
            let edges = gather_topology::<SpringEdge>(store, mirror, entity, scope);
            terms.push(Box::new(SpringTerm::new(cfg.stiffness, edges)));
        }
        if let Some(cfg) = store.get_component::<AreaConstraint>(entity) {
            let triangles = gather_topology::<AreaTriangle>(store, mirror, entity, scope);
            terms.push(Box::new(AreaTerm::new(
                cfg.stiffness,
                cfg.effective_shear(),
                triangles,
            )));
        }
        if let Some(cfg) = store.get_component::<GravityConstraint>(entity) {
            terms.push(Box::new(GravityTerm::new(cfg.gravity)));
        }
    }
    Ok(terms)
}

/// An element that can have a position offset folded into its node indices.
pub trait OffsetTopology: Copy {
    /// Adds `offset` to every node index of the element.
    fn apply_offset(&mut self, offset: u32);
}

impl OffsetTopology for SpringEdge {
    fn apply_offset(&mut self, offset: u32) {
        for n in &mut self.nodes {
            *n += offset;
        }
    }
}

impl OffsetTopology for AreaTriangle {
    fn apply_offset(&mut self, offset: u32) {
        for n in &mut self.nodes {
            *n += offset;
        }
    }
}

fn gather_topology<T>(
    store: &EntityStore,
    mirror: &DeviceMirror,
    constraint: Entity,
    scope: TopologyScope,
) -> Vec<T>
where
    T: OffsetTopology + crate::store::ComponentValue,
{
    match scope {
        TopologyScope::Local(mesh) => {
            // Indices stay local to the scoped mesh's buffer slice.
            if let Some(own) = store.get_array::<T>(constraint) {
                own.to_vec()
            } else {
                store.get_array::<T>(mesh).map(<[T]>::to_vec).unwrap_or_default()
            }
        }
        TopologyScope::Global => {
            if let Some(own) = store.get_array::<T>(constraint) {
                // A constraint entity carrying topology produces only that
                // scoped subset.
                let offset = mirror
                    .entity_offset::<SimPosition>(constraint)
                    .unwrap_or(0);
                let mut elems = own.to_vec();
                for e in &mut elems {
                    e.apply_offset(offset);
                }
                elems
            } else {
                let mut merged = Vec::new();
                for owner in store.entities_with_array::<T>() {
                    let offset = mirror.entity_offset::<SimPosition>(owner).unwrap_or(0);
                    let Some(elems) = store.get_array::<T>(owner) else {
                        continue;
                    };
                    for &elem in elems {
                        let mut elem = elem;
                        elem.apply_offset(offset);
                        merged.push(elem);
                    }
                }
                merged
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{gather_topology, TopologyScope};
    use crate::dynamics::components::{SimPosition, SpringEdge};
    use crate::store::{DeviceMirror, EntityStore};

    fn edge(a: u32, b: u32) -> SpringEdge {
        SpringEdge {
            nodes: [a, b],
            rest_length: 1.0,
            _pad: 0,
        }
    }

    #[test]
    fn constraint_topology_wins_over_global_merge() {
        let mut store = EntityStore::new();
        let mesh = store.create_entity();
        let constraint = store.create_entity();
        store.add_array(mesh, vec![edge(0, 1), edge(1, 2)]).unwrap();
        store.add_array(constraint, vec![edge(5, 6)]).unwrap();

        let mirror = DeviceMirror::new();
        let gathered = gather_topology::<SpringEdge>(
            &store,
            &mirror,
            constraint,
            TopologyScope::Global,
        );
        assert_eq!(gathered.len(), 1);
        assert_eq!(gathered[0].nodes, [5, 6]);
    }

    #[test]
    fn local_scope_prefers_the_mesh_array() {
        let mut store = EntityStore::new();
        let mesh = store.create_entity();
        let constraint = store.create_entity();
        store.add_array(mesh, vec![edge(0, 1)]).unwrap();
        store
            .add_array(mesh, vec![SimPosition::new(0.0, 0.0, 0.0)])
            .unwrap();

        let mirror = DeviceMirror::new();
        let gathered = gather_topology::<SpringEdge>(
            &store,
            &mirror,
            constraint,
            TopologyScope::Local(mesh),
        );
        assert_eq!(gathered.len(), 1);
        assert_eq!(gathered[0].nodes, [0, 1]);
    }
}
