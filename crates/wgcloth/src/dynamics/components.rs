//! Simulation component types and their GPU representations.
//!
//! Array components (`SimPosition`, `SimVelocity`, `SimMass`, and the
//! topology arrays) are plain-old-data with explicit padding so they can be
//! mirrored byte-for-byte into storage buffers: fixed size, trivially
//! copyable, 16-byte element stride for vector-like types.
//!
//! Configuration components live on constraint/config entities and stay on
//! the host.

use crate::store::Entity;
use bytemuck::{Pod, Zeroable};
use nalgebra::Vector3;

/// A node position, one array element per mesh vertex.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct SimPosition {
    /// X coordinate.
    pub x: f32,
    /// Y coordinate.
    pub y: f32,
    /// Z coordinate.
    pub z: f32,
    /// Homogeneous/padding component, kept at 1.
    pub w: f32,
}

impl SimPosition {
    /// Builds a position from its three coordinates, with `w = 1`.
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z, w: 1.0 }
    }

    /// The spatial part of this position.
    pub fn xyz(&self) -> Vector3<f32> {
        Vector3::new(self.x, self.y, self.z)
    }
}

/// A node velocity, one array element per mesh vertex.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct SimVelocity {
    /// X component.
    pub x: f32,
    /// Y component.
    pub y: f32,
    /// Z component.
    pub z: f32,
    /// Padding component, kept at 0.
    pub w: f32,
}

/// A node mass. `inv_mass == 0` marks a pinned node.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct SimMass {
    /// The node mass.
    pub mass: f32,
    /// The inverse mass; zero for pinned nodes.
    pub inv_mass: f32,
    /// Padding to a 16-byte element stride.
    pub _pad: [f32; 2],
}

impl SimMass {
    /// Builds a mass component, deriving the inverse.
    pub fn new(mass: f32) -> Self {
        Self {
            mass,
            inv_mass: if mass > 0.0 { 1.0 / mass } else { 0.0 },
            _pad: [0.0; 2],
        }
    }

    /// Returns `true` if this node is pinned.
    pub fn is_pinned(&self) -> bool {
        self.inv_mass == 0.0
    }
}

/// A triangle of the render/normal topology. Indices are local to the owning
/// mesh entity; the device mirror rewrites them to global indices on upload.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct MeshFace {
    /// The three vertex indices.
    pub nodes: [u32; 3],
    /// Padding to a 16-byte element stride.
    pub _pad: u32,
}

impl MeshFace {
    /// Builds a face from three vertex indices.
    pub fn new(n0: u32, n1: u32, n2: u32) -> Self {
        Self {
            nodes: [n0, n1, n2],
            _pad: 0,
        }
    }
}

/// One structural spring between two nodes.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct SpringEdge {
    /// The two endpoint indices.
    pub nodes: [u32; 2],
    /// The length at which the spring is unstressed.
    pub rest_length: f32,
    /// Padding to a 16-byte element stride.
    pub _pad: u32,
}

impl SpringEdge {
    /// Builds an edge between two nodes with the given rest length.
    pub fn new(a: u32, b: u32, rest_length: f32) -> Self {
        Self {
            nodes: [a, b],
            rest_length,
            _pad: 0,
        }
    }
}

/// One area-preservation triangle with its precomputed material frame.
///
/// `dm_inv` stores the inverse 2×2 material-space edge matrix as
/// `[m00, m01, m10, m11]`.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct AreaTriangle {
    /// The three vertex indices.
    pub nodes: [u32; 3],
    /// Padding for the 16-byte alignment of `dm_inv`.
    pub _pad: u32,
    /// Inverse material-space edge matrix, row-major.
    pub dm_inv: [f32; 4],
    /// The triangle's undeformed area.
    pub rest_area: f32,
    /// Padding to a 48-byte element stride.
    pub _pad2: [f32; 3],
}

/// Bookkeeping for a pinned vertex: the mass it carried before pinning.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct FixedVertex {
    /// Index of the pinned vertex in the owning mesh.
    pub vertex: u32,
    /// The mass the vertex carried before pinning.
    pub mass: f32,
    /// The inverse mass the vertex carried before pinning.
    pub inv_mass: f32,
    /// Padding to a 16-byte element stride.
    pub _pad: u32,
}

// --- Configuration components -------------------------------------------

/// Spring constraint configuration, one per constraint entity.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SpringConstraint {
    /// Spring stiffness shared by every edge of the term.
    pub stiffness: f32,
}

impl Default for SpringConstraint {
    fn default() -> Self {
        Self { stiffness: 500.0 }
    }
}

/// Area-preservation constraint configuration.
///
/// A `shear_stiffness` of zero selects the default of half the bulk
/// stiffness.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AreaConstraint {
    /// Bulk (area) stiffness.
    pub stiffness: f32,
    /// Shear stiffness; zero selects half the bulk stiffness.
    pub shear_stiffness: f32,
}

impl AreaConstraint {
    /// The effective shear stiffness.
    pub fn effective_shear(&self) -> f32 {
        if self.shear_stiffness > 0.0 {
            self.shear_stiffness
        } else {
            self.stiffness * 0.5
        }
    }
}

impl Default for AreaConstraint {
    fn default() -> Self {
        Self {
            stiffness: 1.0,
            shear_stiffness: 0.0,
        }
    }
}

/// Gravity configuration.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GravityConstraint {
    /// Gravitational acceleration.
    pub gravity: Vector3<f32>,
}

impl Default for GravityConstraint {
    fn default() -> Self {
        Self {
            gravity: Vector3::new(0.0, -9.81, 0.0),
        }
    }
}

/// Configuration of the Newton-MPCG system, one entity per simulation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct NewtonConfig {
    /// Outer Newton iterations per step.
    pub newton_iterations: u32,
    /// Inner conjugate-gradient iterations per Newton iteration.
    pub cg_iterations: u32,
    /// Velocity damping applied after the solve.
    pub damping: f32,
    /// Residual tolerance carried in the configuration.
    ///
    /// The fixed-length CG recording performs no early exit, so this value is
    /// currently unused; it is kept for a future readback-driven exit.
    pub cg_tolerance: f32,
    /// Constraint entities contributing terms, [`Entity::INVALID`]-padded.
    pub constraints: [Entity; 8],
}

impl Default for NewtonConfig {
    fn default() -> Self {
        Self {
            newton_iterations: 1,
            cg_iterations: 30,
            damping: 0.999,
            cg_tolerance: 1.0e-6,
            constraints: [Entity::INVALID; 8],
        }
    }
}

impl NewtonConfig {
    /// The valid constraint entities.
    pub fn constraint_entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.constraints.iter().copied().filter(|e| e.is_valid())
    }

    /// Sets the constraint entity list from a slice (at most 8 entries).
    pub fn with_constraints(mut self, entities: &[Entity]) -> Self {
        for (slot, e) in self.constraints.iter_mut().zip(entities.iter()) {
            *slot = *e;
        }
        self
    }
}

/// Configuration of the projective-dynamics system, one entity per simulation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PdConfig {
    /// Jacobi iterations per step.
    pub iterations: u32,
    /// Chebyshev spectral-radius estimate. Zero requests automatic
    /// calibration on the first step.
    pub rho: f32,
    /// Constraint entities contributing terms, [`Entity::INVALID`]-padded.
    pub constraints: [Entity; 8],
    /// When valid, the solver operates on a local copy of this mesh entity's
    /// slice of the global buffers.
    pub mesh: Entity,
}

impl Default for PdConfig {
    fn default() -> Self {
        Self {
            iterations: 20,
            rho: 0.0,
            constraints: [Entity::INVALID; 8],
            mesh: Entity::INVALID,
        }
    }
}

impl PdConfig {
    /// The valid constraint entities.
    pub fn constraint_entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.constraints.iter().copied().filter(|e| e.is_valid())
    }

    /// Sets the constraint entity list from a slice (at most 8 entries).
    pub fn with_constraints(mut self, entities: &[Entity]) -> Self {
        for (slot, e) in self.constraints.iter_mut().zip(entities.iter()) {
            *slot = *e;
        }
        self
    }
}

/// Global physics parameters, carried by a singleton entity.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PhysicsParams {
    /// The timestep length.
    pub dt: f32,
    /// Gravitational acceleration used for inertial prediction.
    pub gravity: Vector3<f32>,
    /// Velocity damping in `[0, 1]`.
    pub damping: f32,
}

impl Default for PhysicsParams {
    fn default() -> Self {
        Self {
            dt: 1.0 / 60.0,
            gravity: Vector3::new(0.0, -9.81, 0.0),
            damping: 0.999,
        }
    }
}

impl PhysicsParams {
    /// The GPU uniform materialized from this singleton on every sync.
    pub fn to_gpu(&self) -> GpuPhysicsParams {
        GpuPhysicsParams {
            gravity: [self.gravity.x, self.gravity.y, self.gravity.z, 0.0],
            dt: self.dt,
            inv_dt: 1.0 / self.dt,
            dt2: self.dt * self.dt,
            inv_dt2: 1.0 / (self.dt * self.dt),
            damping: self.damping,
            _pad: [0.0; 3],
        }
    }
}

/// Uniform mirror of [`PhysicsParams`], with the derived timestep powers
/// precomputed on the host.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct GpuPhysicsParams {
    /// Gravitational acceleration, `w` unused.
    pub gravity: [f32; 4],
    /// Timestep length.
    pub dt: f32,
    /// `1 / dt`.
    pub inv_dt: f32,
    /// `dt²`.
    pub dt2: f32,
    /// `1 / dt²`.
    pub inv_dt2: f32,
    /// Velocity damping.
    pub damping: f32,
    /// Padding to a 16-byte multiple.
    pub _pad: [f32; 3],
}
