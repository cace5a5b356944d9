//! Solver architecture: sparsity, dynamics terms, and the two GPU solvers.
//!
//! # Assembly pipeline
//!
//! Every solver follows the same two-phase protocol. During initialization,
//! each registered term declares its sparsity footprint into a shared
//! [`SparsityBuilder`](sparsity::SparsityBuilder); the resulting CSR pattern
//! sizes the shared system buffers and gives each term its precomputed block
//! indices. Per step, terms scatter force and Hessian contributions into the
//! shared right-hand-side, diagonal, and CSR-values buffers with atomic
//! bit-pattern accumulation.
//!
//! # Solvers
//!
//! - [`newton`]: Newton-Raphson outer loop with a mass-preconditioned
//!   conjugate-gradient inner solve, recorded as one fixed-length command
//!   stream per step.
//! - [`pd`]: projective dynamics with a constant global matrix, solved by
//!   Chebyshev-accelerated Jacobi iteration with adaptive spectral-radius
//!   calibration.

pub mod components;
pub mod newton;
pub mod normals;
pub mod pd;
pub(crate) mod reduce;
pub mod sparsity;
pub mod terms;

use crate::dynamics::sparsity::SparsityBuilder;
use wgcloth_core::tensor::GpuVector;
use wgpu::{Buffer, BufferUsages, Device};

/// Shared GPU state one solver instance owns and every term binds against.
///
/// The `positions` binding is whatever per-node vector the terms should read
/// during assembly: the predicted positions for the Newton solver, the
/// current global-step iterate for projective dynamics.
pub struct SolverContext {
    /// Number of simulated nodes.
    pub node_count: u32,
    /// Number of off-diagonal CSR entries.
    pub nnz: u32,
    /// Uniform buffer holding the mirrored global physics parameters.
    pub params: Buffer,
    /// Per-node positions (or position iterate) read by term kernels.
    pub positions: Buffer,
    /// Per-node velocities.
    pub velocities: Buffer,
    /// Per-node `{mass, inv_mass}` pairs.
    pub masses: Buffer,
    /// Atomically accumulated right-hand side, 4 words per node.
    pub rhs: GpuVector<u32>,
    /// 3×3 diagonal blocks, 9 floats per node.
    pub diag: GpuVector<f32>,
    /// 3×3 off-diagonal blocks, 9 floats per CSR entry.
    pub csr_values: GpuVector<f32>,
    /// CSR row pointers, `node_count + 1` entries.
    pub row_ptr: GpuVector<u32>,
    /// CSR column indices, one per entry.
    pub col_idx: GpuVector<u32>,
}

impl SolverContext {
    /// Allocates the shared system buffers for a built sparsity pattern.
    pub fn new(
        device: &Device,
        params: Buffer,
        positions: Buffer,
        velocities: Buffer,
        masses: Buffer,
        sparsity: &SparsityBuilder,
    ) -> Self {
        let node_count = sparsity.node_count() as u32;
        let nnz = sparsity.nnz();
        let storage = BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC;
        Self {
            node_count,
            nnz,
            params,
            positions,
            velocities,
            masses,
            rhs: GpuVector::uninit(device, node_count * 4, storage),
            diag: GpuVector::uninit(device, node_count * 9, storage),
            csr_values: GpuVector::uninit(device, nnz * 9, storage),
            row_ptr: GpuVector::init(device, sparsity.row_ptr(), BufferUsages::STORAGE),
            col_idx: GpuVector::init(device, sparsity.col_idx(), BufferUsages::STORAGE),
        }
    }
}
