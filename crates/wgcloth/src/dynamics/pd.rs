//! Projective-dynamics solver with Chebyshev-accelerated Jacobi iteration.
//!
//! Solves `(M/dt² + Σ w·SᵀS) q = (M/dt²)·s + Σ w·Sᵀp` where `s` is the
//! inertial prediction and `p` each constraint's local projection. The
//! left-hand side is constant per topology and assembled once; every
//! timestep only rebuilds the right-hand side and sweeps the Jacobi
//! iteration, blending iterates with a Chebyshev weight schedule derived
//! from the system's spectral radius.
//!
//! The spectral radius is calibrated adaptively: the first step after
//! initialization runs a pure-Jacobi solve, samples the residual energy
//! every few iterations, and fits a geometric decay rate. A positive
//! `rho` in the configuration skips calibration.

use crate::dynamics::components::PdConfig;
use crate::dynamics::reduce::{GpuReduceParams, WgReduce};
use crate::dynamics::sparsity::SparsityBuilder;
use crate::dynamics::terms::DynamicsTerm;
use crate::dynamics::SolverContext;
use bytemuck::{Pod, Zeroable};
use wgcloth_core::gpu::GpuInstance;
use wgcloth_core::kernel::{CommandEncoderExt, KernelDispatch};
use wgcloth_core::tensor::{GpuScalar, GpuVector};
use wgcloth_core::{ClothResult, ShaderLoader, WORKGROUP_SIZE};
use wgpu::{Buffer, BufferUsages, CommandEncoder, ComputePipeline, Device};

const SAMPLE_EVERY: u32 = 4;
const DEFAULT_RHO: f32 = 0.9;

/// Compute pipelines of the projective-dynamics solver.
pub struct WgPd {
    pd_init: ComputePipeline,
    mass_rhs: ComputePipeline,
    inertia_diag: ComputePipeline,
    invert_diag: ComputePipeline,
    jacobi_step: ComputePipeline,
    update_velocity: ComputePipeline,
    update_position: ComputePipeline,
}

impl WgPd {
    /// Compiles the projective-dynamics kernels.
    pub fn from_device(device: &Device, shaders: &ShaderLoader) -> ClothResult<Self> {
        let module = shaders.load(device, "pd.wgsl")?;
        Ok(Self {
            pd_init: module.compute_pipeline(device, "pd_init")?,
            mass_rhs: module.compute_pipeline(device, "mass_rhs")?,
            inertia_diag: module.compute_pipeline(device, "inertia_diag")?,
            invert_diag: module.compute_pipeline(device, "invert_diag")?,
            jacobi_step: module.compute_pipeline(device, "jacobi_step")?,
            update_velocity: module.compute_pipeline(device, "pd_update_velocity")?,
            update_position: module.compute_pipeline(device, "pd_update_position")?,
        })
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct GpuJacobiParams {
    omega: f32,
    is_first_step: u32,
    _pad: [u32; 2],
}

/// The Chebyshev weight schedule for a given spectral radius.
///
/// `ω₀ = 1`, `ω₁ = 2/(2−ρ²)`, `ωᵢ = 4/(4 − ρ²·ωᵢ₋₁)`.
pub fn chebyshev_omegas(rho: f32, iterations: u32) -> Vec<f32> {
    let r2 = rho * rho;
    let mut omegas = Vec::with_capacity(iterations as usize);
    let mut prev = 1.0f32;
    for i in 0..iterations {
        let omega = match i {
            0 => 1.0,
            1 => 2.0 / (2.0 - r2),
            _ => 4.0 / (4.0 - r2 * prev),
        };
        omegas.push(omega);
        prev = omega;
    }
    omegas
}

struct ScopedBuffers {
    global_positions: Buffer,
    global_velocities: Buffer,
    global_masses: Buffer,
    offset_bytes: u64,
    size_bytes: u64,
    mass_copied: bool,
}

/// One projective-dynamics system over a fixed topology.
pub struct PdSolver {
    config: PdConfig,
    ctx: SolverContext,
    terms: Vec<Box<dyn DynamicsTerm>>,
    wg: WgPd,
    reduce: WgReduce,
    positions: Buffer,
    velocities: Buffer,
    // Kept alive when running in scoped mode: the context only holds clones
    // of the local buffers.
    _local_state: Vec<GpuVector<[f32; 4]>>,
    x_old: GpuVector<[f32; 4]>,
    s: GpuVector<[f32; 4]>,
    q_curr: GpuVector<[f32; 4]>,
    q_prev: GpuVector<[f32; 4]>,
    q_new: GpuVector<[f32; 4]>,
    d_inv: GpuVector<f32>,
    scalars: GpuVector<f32>,
    scalars_staging: GpuVector<f32>,
    partial: GpuVector<f32>,
    jacobi_uniforms: Vec<GpuScalar<GpuJacobiParams>>,
    calib_uniform: GpuScalar<GpuJacobiParams>,
    samplers: Vec<(u32, u32, GpuScalar<GpuReduceParams>)>,
    rho: f32,
    calibrated: bool,
    lhs_ready: bool,
    scoped: Option<ScopedBuffers>,
}

impl PdSolver {
    /// Builds the solver over the given state buffers.
    ///
    /// When `scope_offset` is set, the solver allocates local copies of the
    /// position/velocity/mass slice starting at that element offset and
    /// brackets each step with copy-in / copy-out against the global buffers.
    /// Mass is copied exactly once.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &Device,
        shaders: &ShaderLoader,
        config: PdConfig,
        params: Buffer,
        positions: Buffer,
        velocities: Buffer,
        masses: Buffer,
        node_count: u32,
        scope_offset: Option<u32>,
        mut terms: Vec<Box<dyn DynamicsTerm>>,
    ) -> ClothResult<Self> {
        let mut builder = SparsityBuilder::new(node_count as usize);
        for term in &terms {
            term.declare_sparsity(&mut builder)?;
        }
        builder.build();

        let storage = BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC;
        let scratch = |len: u32| GpuVector::<[f32; 4]>::uninit(device, len, storage);

        let mut local_state = Vec::new();
        let mut scoped = None;
        let (sim_positions, sim_velocities, sim_masses) = if let Some(offset) = scope_offset {
            let local_positions = scratch(node_count);
            let local_velocities = scratch(node_count);
            let local_masses = scratch(node_count);
            let handles = (
                local_positions.buffer().clone(),
                local_velocities.buffer().clone(),
                local_masses.buffer().clone(),
            );
            local_state.extend([local_positions, local_velocities, local_masses]);
            scoped = Some(ScopedBuffers {
                global_positions: positions,
                global_velocities: velocities,
                global_masses: masses,
                offset_bytes: offset as u64 * 16,
                size_bytes: node_count as u64 * 16,
                mass_copied: false,
            });
            handles
        } else {
            (positions, velocities, masses)
        };

        let x_old = scratch(node_count);
        let s = scratch(node_count);
        let q_curr = scratch(node_count);
        let q_prev = scratch(node_count);
        let q_new = scratch(node_count);

        // Terms read the current global-step iterate wherever the Newton
        // solver would read predicted positions.
        let ctx = SolverContext::new(
            device,
            params,
            q_curr.buffer().clone(),
            sim_velocities.clone(),
            sim_masses.clone(),
            &builder,
        );
        for term in &mut terms {
            term.init(device, shaders, &builder, &ctx)?;
        }

        let groups = node_count.div_ceil(WORKGROUP_SIZE).max(1);
        let mut samplers = Vec::new();
        for i in 0..config.iterations {
            if i % SAMPLE_EVERY == 0 || i + 1 == config.iterations {
                let slot = samplers.len() as u32;
                samplers.push((
                    i,
                    slot,
                    GpuScalar::init(
                        device,
                        GpuReduceParams::new(groups, slot),
                        BufferUsages::UNIFORM,
                    ),
                ));
            }
        }
        let scalars_len = (samplers.len() as u32).max(8);

        let rho = if config.rho > 0.0 {
            config.rho
        } else {
            DEFAULT_RHO
        };
        let calibrated = config.rho > 0.0;
        let jacobi_uniforms = build_jacobi_uniforms(device, rho, config.iterations);

        Ok(Self {
            wg: WgPd::from_device(device, shaders)?,
            reduce: WgReduce::from_device(device, shaders)?,
            positions: sim_positions,
            velocities: sim_velocities,
            _local_state: local_state,
            x_old,
            s,
            q_curr,
            q_prev,
            q_new,
            d_inv: GpuVector::uninit(device, node_count * 9, storage),
            scalars: GpuVector::uninit(device, scalars_len, storage),
            scalars_staging: GpuVector::uninit(
                device,
                scalars_len,
                BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            ),
            partial: GpuVector::uninit(device, groups, storage),
            jacobi_uniforms,
            calib_uniform: GpuScalar::init(
                device,
                GpuJacobiParams {
                    omega: 1.0,
                    is_first_step: 1,
                    _pad: [0; 2],
                },
                BufferUsages::UNIFORM,
            ),
            samplers,
            rho,
            calibrated,
            lhs_ready: false,
            scoped,
            config,
            ctx,
            terms,
        })
    }

    /// The shared solver context.
    pub fn context(&self) -> &SolverContext {
        &self.ctx
    }

    /// The solver configuration.
    pub fn config(&self) -> &PdConfig {
        &self.config
    }

    /// The current spectral-radius estimate.
    pub fn rho(&self) -> f32 {
        self.rho
    }

    /// Returns `true` once the Chebyshev schedule is calibrated.
    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    /// Records one timestep into `encoder`.
    ///
    /// Returns `true` when this is the calibration step: the caller must
    /// submit the encoder and then complete calibration with
    /// [`PdSolver::finish_calibration`] before recording the next step.
    pub fn record(&mut self, device: &Device, encoder: &mut CommandEncoder) -> bool {
        let calibrating = !self.calibrated;
        let groups = self.ctx.node_count.div_ceil(WORKGROUP_SIZE);
        let q_bytes = self.ctx.node_count as u64 * 16;

        if let Some(scoped) = &mut self.scoped {
            if !scoped.mass_copied {
                encoder.copy_buffer_to_buffer(
                    &scoped.global_masses,
                    scoped.offset_bytes,
                    &self.ctx.masses,
                    0,
                    scoped.size_bytes,
                );
                scoped.mass_copied = true;
            }
            encoder.copy_buffer_to_buffer(
                &scoped.global_positions,
                scoped.offset_bytes,
                &self.positions,
                0,
                scoped.size_bytes,
            );
            encoder.copy_buffer_to_buffer(
                &scoped.global_velocities,
                scoped.offset_bytes,
                &self.velocities,
                0,
                scoped.size_bytes,
            );
        }

        if !self.lhs_ready {
            self.record_lhs(device, encoder);
            self.lhs_ready = true;
        }

        {
            let mut pass = encoder.compute_pass("pd_init");
            KernelDispatch::new(device, &mut pass, &self.wg.pd_init)
                .bind_at(
                    0,
                    [
                        (&self.ctx.params, 0),
                        (&self.positions, 1),
                        (&self.velocities, 2),
                        (&self.ctx.masses, 3),
                        (self.x_old.buffer(), 4),
                        (self.s.buffer(), 5),
                        (self.q_curr.buffer(), 6),
                        (self.q_prev.buffer(), 7),
                    ],
                )
                .dispatch(groups);
        }

        for i in 0..self.config.iterations {
            encoder.clear_buffer(self.ctx.rhs.buffer(), 0, None);

            let mut pass = encoder.compute_pass("pd_iteration");
            KernelDispatch::new(device, &mut pass, &self.wg.mass_rhs)
                .bind_at(
                    0,
                    [
                        (&self.ctx.params, 0),
                        (&self.ctx.masses, 3),
                        (self.s.buffer(), 5),
                    ],
                )
                .bind_at(1, [(self.ctx.rhs.buffer(), 0)])
                .dispatch(groups);

            for term in &self.terms {
                term.project_rhs(device, &mut pass);
            }

            let jacobi_uniform = if calibrating {
                &self.calib_uniform
            } else {
                &self.jacobi_uniforms[i as usize]
            };
            KernelDispatch::new(device, &mut pass, &self.wg.jacobi_step)
                .bind_at(
                    0,
                    [
                        (&self.ctx.masses, 3),
                        (self.q_curr.buffer(), 6),
                        (self.q_prev.buffer(), 7),
                        (self.q_new.buffer(), 8),
                    ],
                )
                .bind_at(
                    1,
                    [
                        (self.ctx.rhs.buffer(), 1),
                        (self.d_inv.buffer(), 4),
                        (self.ctx.csr_values.buffer(), 5),
                        (self.ctx.row_ptr.buffer(), 6),
                        (self.ctx.col_idx.buffer(), 7),
                    ],
                )
                .bind_at(2, [(jacobi_uniform.buffer(), 0)])
                .dispatch(groups);

            if calibrating {
                if let Some((_, _, reducer)) =
                    self.samplers.iter().find(|(iter, _, _)| *iter == i)
                {
                    self.reduce.dispatch_diff(
                        device,
                        &mut pass,
                        self.q_new.buffer(),
                        self.q_curr.buffer(),
                        self.partial.buffer(),
                        self.scalars.buffer(),
                        reducer.buffer(),
                        self.ctx.node_count,
                    );
                }
            }
            drop(pass);

            encoder.copy_buffer_to_buffer(self.q_curr.buffer(), 0, self.q_prev.buffer(), 0, q_bytes);
            encoder.copy_buffer_to_buffer(self.q_new.buffer(), 0, self.q_curr.buffer(), 0, q_bytes);
        }

        {
            let mut pass = encoder.compute_pass("pd_integrate");
            KernelDispatch::new(device, &mut pass, &self.wg.update_velocity)
                .bind_at(
                    0,
                    [
                        (&self.ctx.params, 0),
                        (&self.velocities, 2),
                        (self.x_old.buffer(), 4),
                        (self.q_curr.buffer(), 6),
                    ],
                )
                .dispatch(groups);
            KernelDispatch::new(device, &mut pass, &self.wg.update_position)
                .bind_at(
                    0,
                    [
                        (&self.ctx.params, 0),
                        (&self.positions, 1),
                        (&self.velocities, 2),
                        (self.x_old.buffer(), 4),
                    ],
                )
                .dispatch(groups);
        }

        if let Some(scoped) = &self.scoped {
            encoder.copy_buffer_to_buffer(
                &self.positions,
                0,
                &scoped.global_positions,
                scoped.offset_bytes,
                scoped.size_bytes,
            );
            encoder.copy_buffer_to_buffer(
                &self.velocities,
                0,
                &scoped.global_velocities,
                scoped.offset_bytes,
                scoped.size_bytes,
            );
        }

        if calibrating {
            self.scalars_staging.copy_from(encoder, &self.scalars);
        }
        calibrating
    }

    /// Completes spectral-radius calibration after the calibration step's
    /// submission: waits for the gpu, reads the residual samples back, and
    /// rebuilds the Chebyshev weight schedule.
    pub async fn finish_calibration(&mut self, gpu: &GpuInstance) -> ClothResult<()> {
        gpu.device()
            .poll(wgpu::PollType::Wait)
            .map_err(|e| wgcloth_core::ClothError::Device(format!("{e:?}")))?;
        let samples = self.scalars_staging.read(gpu.device()).await?;
        self.calibrate(gpu.device(), &samples);
        Ok(())
    }

    /// Assembles the constant system matrix and inverts its diagonal blocks.
    fn record_lhs(&self, device: &Device, encoder: &mut CommandEncoder) {
        let groups = self.ctx.node_count.div_ceil(WORKGROUP_SIZE);
        encoder.clear_buffer(self.ctx.diag.buffer(), 0, None);
        encoder.clear_buffer(self.ctx.csr_values.buffer(), 0, None);

        let mut pass = encoder.compute_pass("pd_lhs");
        KernelDispatch::new(device, &mut pass, &self.wg.inertia_diag)
            .bind_at(0, [(&self.ctx.params, 0), (&self.ctx.masses, 3)])
            .bind_at(1, [(self.ctx.diag.buffer(), 2)])
            .dispatch(groups);
        for term in &self.terms {
            term.assemble_lhs(device, &mut pass);
        }
        KernelDispatch::new(device, &mut pass, &self.wg.invert_diag)
            .bind_at(0, [(&self.ctx.masses, 3)])
            .bind_at(
                1,
                [(self.ctx.diag.buffer(), 3), (self.d_inv.buffer(), 4)],
            )
            .dispatch(groups);
    }

    /// Fits the spectral radius from the sampled residual decay and rebuilds
    /// the Chebyshev weight schedule.
    fn calibrate(&mut self, device: &Device, samples: &[f32]) {
        let norms: Vec<(u32, f32)> = self
            .samplers
            .iter()
            .filter_map(|(iter, slot, _)| {
                let energy = *samples.get(*slot as usize)?;
                (energy > 1.0e-30).then(|| (*iter, energy.sqrt()))
            })
            .collect();

        let half = self.config.iterations / 2;
        let base = norms.iter().find(|(iter, _)| *iter >= half);
        let last = norms.last();
        self.rho = match (base, last) {
            (Some(&(k0, e0)), Some(&(k1, e1))) if k1 > k0 && e0 > 0.0 => {
                let rho = (e1 / e0).powf(1.0 / (k1 - k0) as f32);
                rho.clamp(0.1, 0.999)
            }
            _ => {
                log::warn!(
                    "pd solver: residual samples too degenerate for calibration, \
                     falling back to rho = {DEFAULT_RHO}"
                );
                DEFAULT_RHO
            }
        };
        log::info!("pd solver: calibrated chebyshev rho = {}", self.rho);
        self.jacobi_uniforms = build_jacobi_uniforms(device, self.rho, self.config.iterations);
        self.calibrated = true;
    }
}

fn build_jacobi_uniforms(
    device: &Device,
    rho: f32,
    iterations: u32,
) -> Vec<GpuScalar<GpuJacobiParams>> {
    chebyshev_omegas(rho, iterations)
        .into_iter()
        .enumerate()
        .map(|(i, omega)| {
            GpuScalar::init(
                device,
                GpuJacobiParams {
                    omega,
                    is_first_step: (i == 0) as u32,
                    _pad: [0; 2],
                },
                BufferUsages::UNIFORM,
            )
        })
        .collect()
}

wgcloth_core::test_shader_compilation!(WgPd, crate::bundled_shaders());

#[cfg(test)]
mod test {
    use super::chebyshev_omegas;
    use approx::assert_relative_eq;

    #[test]
    fn omega_schedule_matches_the_recurrence() {
        let rho = 0.95f32;
        let omegas = chebyshev_omegas(rho, 6);
        assert_eq!(omegas[0], 1.0);
        assert_relative_eq!(omegas[1], 2.0 / (2.0 - rho * rho));
        for i in 2..6 {
            assert_relative_eq!(omegas[i], 4.0 / (4.0 - rho * rho * omegas[i - 1]));
        }
    }

    #[test]
    fn omega_schedule_converges_to_the_fixed_point() {
        let rho = 0.9f32;
        let omegas = chebyshev_omegas(rho, 64);
        // The recurrence converges to 2/(1 + sqrt(1 - rho^2)).
        let fixed_point = 2.0 / (1.0 + (1.0 - rho * rho).sqrt());
        assert_relative_eq!(*omegas.last().unwrap(), fixed_point, epsilon = 1.0e-4);
        for w in &omegas {
            assert!(*w >= 1.0 && *w < 2.0);
        }
    }

    #[test]
    fn zero_rho_disables_acceleration() {
        let omegas = chebyshev_omegas(0.0, 8);
        assert!(omegas.iter().all(|w| *w == 1.0));
    }
}
