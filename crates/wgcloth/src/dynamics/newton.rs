//! Newton-Raphson solver with a mass-preconditioned conjugate-gradient
//! inner loop.
//!
//! One implicit-Euler step solves `M(v⁺ − v)/dt = f(x + dt·v⁺)` by Newton
//! iteration. Each linearization assembles `A = M + dt²·K` and a matching
//! right-hand side in velocity form, then runs a fixed-count CG recording:
//! the whole step is a single continuous command stream with no host
//! round-trips. Intermediate inner products are reduced on the GPU into a
//! small scalars buffer that also holds α and β.

use crate::dynamics::components::NewtonConfig;
use crate::dynamics::reduce::{GpuReduceParams, WgReduce};
use crate::dynamics::sparsity::SparsityBuilder;
use crate::dynamics::terms::DynamicsTerm;
use crate::dynamics::SolverContext;
use bytemuck::{Pod, Zeroable};
use wgcloth_core::kernel::{CommandEncoderExt, KernelDispatch};
use wgcloth_core::tensor::{GpuScalar, GpuVector};
use wgcloth_core::{ClothResult, ShaderLoader, WORKGROUP_SIZE};
use wgpu::{Buffer, BufferUsages, CommandEncoder, ComputePass, ComputePipeline, Device};

// Slots of the CG scalars buffer; alpha and beta occupy slots 0 and 1 on the
// shader side.
const RR_SLOT: u32 = 2;
const RR_NEW_SLOT: u32 = 3;
const PAP_SLOT: u32 = 4;
const SCALARS_LEN: u32 = 8;

/// Compute pipelines of the Newton outer loop.
pub struct WgNewton {
    newton_init: ComputePipeline,
    predict_pos: ComputePipeline,
    assemble_rhs: ComputePipeline,
    accumulate_dv: ComputePipeline,
    update_velocity: ComputePipeline,
    update_position: ComputePipeline,
}

impl WgNewton {
    /// Compiles the outer-loop kernels.
    pub fn from_device(device: &Device, shaders: &ShaderLoader) -> ClothResult<Self> {
        let module = shaders.load(device, "newton.wgsl")?;
        Ok(Self {
            newton_init: module.compute_pipeline(device, "newton_init")?,
            predict_pos: module.compute_pipeline(device, "predict_pos")?,
            assemble_rhs: module.compute_pipeline(device, "assemble_rhs")?,
            accumulate_dv: module.compute_pipeline(device, "accumulate_dv")?,
            update_velocity: module.compute_pipeline(device, "update_velocity")?,
            update_position: module.compute_pipeline(device, "update_position")?,
        })
    }
}

/// Compute pipelines of the inner conjugate-gradient loop.
pub struct WgCg {
    cg_init: ComputePipeline,
    spmv: ComputePipeline,
    compute_scalars: ComputePipeline,
    update_xr: ComputePipeline,
    update_p: ComputePipeline,
}

impl WgCg {
    /// Compiles the CG kernels.
    pub fn from_device(device: &Device, shaders: &ShaderLoader) -> ClothResult<Self> {
        let module = shaders.load(device, "cg.wgsl")?;
        Ok(Self {
            cg_init: module.compute_pipeline(device, "cg_init")?,
            spmv: module.compute_pipeline(device, "spmv")?,
            compute_scalars: module.compute_pipeline(device, "compute_scalars")?,
            update_xr: module.compute_pipeline(device, "update_xr")?,
            update_p: module.compute_pipeline(device, "update_p")?,
        })
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct GpuScalarMode {
    mode: u32,
    _pad: [u32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct GpuNewtonParams {
    damping: f32,
    _pad: [f32; 3],
}

/// One Newton-MPCG system over a fixed topology.
pub struct NewtonSolver {
    config: NewtonConfig,
    ctx: SolverContext,
    terms: Vec<Box<dyn DynamicsTerm>>,
    wg: WgNewton,
    cg: WgCg,
    reduce: WgReduce,
    solver_params: GpuScalar<GpuNewtonParams>,
    x_old: GpuVector<[f32; 4]>,
    dv_total: GpuVector<[f32; 4]>,
    b: GpuVector<[f32; 4]>,
    delta: GpuVector<[f32; 4]>,
    r: GpuVector<[f32; 4]>,
    p: GpuVector<[f32; 4]>,
    ap: GpuVector<[f32; 4]>,
    scalars: GpuVector<f32>,
    partial: GpuVector<f32>,
    mode_alpha: GpuScalar<GpuScalarMode>,
    mode_beta: GpuScalar<GpuScalarMode>,
    red_rr_init: GpuScalar<GpuReduceParams>,
    red_rr_new: GpuScalar<GpuReduceParams>,
    red_pap: GpuScalar<GpuReduceParams>,
}

impl NewtonSolver {
    /// Builds the solver: declares sparsity across all terms, allocates the
    /// shared system buffers, and initializes every term.
    ///
    /// Resources acquired before a failing term initialization are dropped on
    /// the early-exit path.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &Device,
        shaders: &ShaderLoader,
        config: NewtonConfig,
        params: Buffer,
        positions: Buffer,
        velocities: Buffer,
        masses: Buffer,
        node_count: u32,
        mut terms: Vec<Box<dyn DynamicsTerm>>,
    ) -> ClothResult<Self> {
        let mut builder = SparsityBuilder::new(node_count as usize);
        for term in &terms {
            term.declare_sparsity(&mut builder)?;
        }
        builder.build();

        let ctx = SolverContext::new(device, params, positions, velocities, masses, &builder);
        for term in &mut terms {
            term.init(device, shaders, &builder, &ctx)?;
        }

        let groups = node_count.div_ceil(WORKGROUP_SIZE).max(1);
        let storage = BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC;
        let scratch = |len: u32| GpuVector::<[f32; 4]>::uninit(device, len, storage);

        Ok(Self {
            wg: WgNewton::from_device(device, shaders)?,
            cg: WgCg::from_device(device, shaders)?,
            reduce: WgReduce::from_device(device, shaders)?,
            solver_params: GpuScalar::init(
                device,
                GpuNewtonParams {
                    damping: config.damping,
                    _pad: [0.0; 3],
                },
                BufferUsages::UNIFORM,
            ),
            x_old: scratch(node_count),
            dv_total: scratch(node_count),
            b: scratch(node_count),
            delta: scratch(node_count),
            r: scratch(node_count),
            p: scratch(node_count),
            ap: scratch(node_count),
            scalars: GpuVector::uninit(device, SCALARS_LEN, storage),
            partial: GpuVector::uninit(device, groups, storage),
            mode_alpha: GpuScalar::init(
                device,
                GpuScalarMode {
                    mode: 0,
                    _pad: [0; 3],
                },
                BufferUsages::UNIFORM,
            ),
            mode_beta: GpuScalar::init(
                device,
                GpuScalarMode {
                    mode: 1,
                    _pad: [0; 3],
                },
                BufferUsages::UNIFORM,
            ),
            red_rr_init: GpuScalar::init(
                device,
                GpuReduceParams::new(groups, RR_SLOT),
                BufferUsages::UNIFORM,
            ),
            red_rr_new: GpuScalar::init(
                device,
                GpuReduceParams::new(groups, RR_NEW_SLOT),
                BufferUsages::UNIFORM,
            ),
            red_pap: GpuScalar::init(
                device,
                GpuReduceParams::new(groups, PAP_SLOT),
                BufferUsages::UNIFORM,
            ),
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
    pub fn config(&self) -> &NewtonConfig {
        &self.config
    }

    /// Records one full implicit-Euler step into `encoder`.
    ///
    /// With an empty sparsity pattern there is no system to solve; the step
    /// logs a warning and records nothing.
    pub fn step(&self, device: &Device, encoder: &mut CommandEncoder) {
        if self.ctx.nnz == 0 {
            log::warn!("newton solver: no term declared any sparsity, skipping step");
            return;
        }
        let groups = self.ctx.node_count.div_ceil(WORKGROUP_SIZE);

        {
            let mut pass = encoder.compute_pass("newton_init");
            KernelDispatch::new(device, &mut pass, &self.wg.newton_init)
                .bind_at(
                    0,
                    [
                        (&self.ctx.positions, 1),
                        (self.x_old.buffer(), 4),
                        (self.dv_total.buffer(), 5),
                    ],
                )
                .dispatch(groups);
        }

        for _ in 0..self.config.newton_iterations {
            {
                let mut pass = encoder.compute_pass("predict_pos");
                KernelDispatch::new(device, &mut pass, &self.wg.predict_pos)
                    .bind_at(
                        0,
                        [
                            (&self.ctx.params, 0),
                            (&self.ctx.positions, 1),
                            (&self.ctx.velocities, 2),
                            (self.x_old.buffer(), 4),
                            (self.dv_total.buffer(), 5),
                        ],
                    )
                    .dispatch(groups);
            }

            encoder.clear_buffer(self.ctx.rhs.buffer(), 0, None);
            encoder.clear_buffer(self.ctx.diag.buffer(), 0, None);
            encoder.clear_buffer(self.ctx.csr_values.buffer(), 0, None);

            let mut pass = encoder.compute_pass("assemble_and_solve");
            for term in &self.terms {
                term.assemble(device, &mut pass);
            }

            KernelDispatch::new(device, &mut pass, &self.wg.assemble_rhs)
                .bind_at(0, [(&self.ctx.masses, 3), (self.dv_total.buffer(), 5)])
                .bind_at(
                    1,
                    [
                        (self.ctx.rhs.buffer(), 2),
                        (self.b.buffer(), 3),
                        (self.ctx.diag.buffer(), 4),
                        (self.ctx.csr_values.buffer(), 5),
                        (self.ctx.row_ptr.buffer(), 6),
                        (self.ctx.col_idx.buffer(), 7),
                    ],
                )
                .dispatch(groups);

            self.record_cg(device, &mut pass);

            KernelDispatch::new(device, &mut pass, &self.wg.accumulate_dv)
                .bind_at(0, [(self.dv_total.buffer(), 5)])
                .bind_at(1, [(self.delta.buffer(), 0)])
                .dispatch(groups);
            drop(pass);
        }

        let mut pass = encoder.compute_pass("integrate");
        KernelDispatch::new(device, &mut pass, &self.wg.update_velocity)
            .bind_at(0, [(&self.ctx.velocities, 2), (self.dv_total.buffer(), 5)])
            .bind_at(1, [(self.solver_params.buffer(), 1)])
            .dispatch(groups);
        KernelDispatch::new(device, &mut pass, &self.wg.update_position)
            .bind_at(
                0,
                [
                    (&self.ctx.params, 0),
                    (&self.ctx.positions, 1),
                    (&self.ctx.velocities, 2),
                    (self.x_old.buffer(), 4),
                ],
            )
            .dispatch(groups);
    }

    /// Records the fixed-count preconditioned conjugate-gradient loop.
    fn record_cg(&self, device: &Device, pass: &mut ComputePass) {
        let n = self.ctx.node_count;
        let groups = n.div_ceil(WORKGROUP_SIZE);

        KernelDispatch::new(device, pass, &self.cg.cg_init)
            .bind_at(
                0,
                [
                    (self.b.buffer(), 0),
                    (self.delta.buffer(), 1),
                    (self.r.buffer(), 2),
                    (self.p.buffer(), 3),
                    (&self.ctx.masses, 5),
                ],
            )
            .dispatch(groups);
        self.reduce.dispatch_dot(
            device,
            pass,
            self.r.buffer(),
            self.r.buffer(),
            self.partial.buffer(),
            self.scalars.buffer(),
            self.red_rr_init.buffer(),
            n,
        );

        for _ in 0..self.config.cg_iterations {
            KernelDispatch::new(device, pass, &self.cg.spmv)
                .bind_at(0, [(self.p.buffer(), 3), (self.ap.buffer(), 4)])
                .bind_at(
                    1,
                    [
                        (self.ctx.diag.buffer(), 0),
                        (self.ctx.csr_values.buffer(), 1),
                        (self.ctx.row_ptr.buffer(), 2),
                        (self.ctx.col_idx.buffer(), 3),
                    ],
                )
                .dispatch(groups);

            self.reduce.dispatch_dot(
                device,
                pass,
                self.p.buffer(),
                self.ap.buffer(),
                self.partial.buffer(),
                self.scalars.buffer(),
                self.red_pap.buffer(),
                n,
            );
            KernelDispatch::new(device, pass, &self.cg.compute_scalars)
                .bind_empty(0)
                .bind_empty(1)
                .bind_at(
                    2,
                    [
                        (self.scalars.buffer(), 0),
                        (self.mode_alpha.buffer(), 1),
                    ],
                )
                .dispatch(1);

            KernelDispatch::new(device, pass, &self.cg.update_xr)
                .bind_at(
                    0,
                    [
                        (self.delta.buffer(), 1),
                        (self.r.buffer(), 2),
                        (self.p.buffer(), 3),
                        (self.ap.buffer(), 4),
                        (&self.ctx.masses, 5),
                    ],
                )
                .bind_empty(1)
                .bind_at(2, [(self.scalars.buffer(), 0)])
                .dispatch(groups);

            self.reduce.dispatch_dot(
                device,
                pass,
                self.r.buffer(),
                self.r.buffer(),
                self.partial.buffer(),
                self.scalars.buffer(),
                self.red_rr_new.buffer(),
                n,
            );
            KernelDispatch::new(device, pass, &self.cg.compute_scalars)
                .bind_empty(0)
                .bind_empty(1)
                .bind_at(
                    2,
                    [
                        (self.scalars.buffer(), 0),
                        (self.mode_beta.buffer(), 1),
                    ],
                )
                .dispatch(1);

            KernelDispatch::new(device, pass, &self.cg.update_p)
                .bind_at(
                    0,
                    [
                        (self.r.buffer(), 2),
                        (self.p.buffer(), 3),
                        (&self.ctx.masses, 5),
                    ],
                )
                .bind_empty(1)
                .bind_at(2, [(self.scalars.buffer(), 0)])
                .dispatch(groups);
        }
    }
}

wgcloth_core::test_shader_compilation!(WgNewton, crate::bundled_shaders());

#[cfg(test)]
mod test {
    use super::WgCg;
    use crate::dynamics::sparsity::SparsityBuilder;
    use nalgebra::Vector3;
    use wgcloth_core::gpu::GpuInstance;
    use wgcloth_core::kernel::{CommandEncoderExt, KernelDispatch};
    use wgcloth_core::tensor::GpuVector;
    use wgcloth_core::WORKGROUP_SIZE;
    use wgpu::BufferUsages;

    #[futures_test::test]
    #[serial_test::serial]
    async fn spmv_matches_the_cpu_reference() {
        let Ok(gpu) = GpuInstance::new().await else {
            return;
        };
        let cg = WgCg::from_device(gpu.device(), &crate::bundled_shaders()).unwrap();

        const N: usize = 67;
        let mut builder = SparsityBuilder::new(N);
        for i in 0..N as u32 - 1 {
            builder.add_edge(i, i + 1).unwrap();
        }
        builder.add_edge(0, N as u32 - 1).unwrap();
        builder.build();

        // Deterministic pseudo-random fill.
        let fill = |i: usize| ((i * 37 + 11) % 19) as f32 * 0.25 - 2.0;
        let diag: Vec<f32> = (0..N * 9).map(fill).collect();
        let values: Vec<f32> = (0..builder.nnz() as usize * 9).map(|i| fill(i + 3)).collect();
        let p: Vec<Vector3<f32>> = (0..N)
            .map(|i| Vector3::new(fill(i), fill(i + 1), fill(i + 2)))
            .collect();

        let expected = builder.spmv_cpu(&diag, &values, &p);

        let storage = BufferUsages::STORAGE | BufferUsages::COPY_SRC;
        let p_gpu: Vec<[f32; 4]> = p.iter().map(|v| [v.x, v.y, v.z, 0.0]).collect();
        let diag_gpu = GpuVector::init(gpu.device(), &diag, storage);
        let values_gpu = GpuVector::init(gpu.device(), &values, storage);
        let row_ptr = GpuVector::init(gpu.device(), builder.row_ptr(), storage);
        let col_idx = GpuVector::init(gpu.device(), builder.col_idx(), storage);
        let p_buf = GpuVector::init(gpu.device(), &p_gpu, storage);
        let ap = GpuVector::<[f32; 4]>::uninit(gpu.device(), N as u32, storage);

        let mut encoder = gpu.device().create_command_encoder(&Default::default());
        let mut pass = encoder.compute_pass("spmv_test");
        KernelDispatch::new(gpu.device(), &mut pass, &cg.spmv)
            .bind_at(0, [(p_buf.buffer(), 3), (ap.buffer(), 4)])
            .bind_at(
                1,
                [
                    (diag_gpu.buffer(), 0),
                    (values_gpu.buffer(), 1),
                    (row_ptr.buffer(), 2),
                    (col_idx.buffer(), 3),
                ],
            )
            .dispatch((N as u32).div_ceil(WORKGROUP_SIZE));
        drop(pass);
        gpu.submit_and_wait(encoder).unwrap();

        let result = ap.slow_read(&gpu).await.unwrap();
        for (i, (gpu_row, cpu_row)) in result.iter().zip(expected.iter()).enumerate() {
            let gpu_row = Vector3::new(gpu_row[0], gpu_row[1], gpu_row[2]);
            assert!(
                (gpu_row - cpu_row).norm() <= 1.0e-4 * (1.0 + cpu_row.norm()),
                "row {i}: gpu {gpu_row:?} vs cpu {cpu_row:?}"
            );
        }
    }
}
