//! The gravity term.

use crate::dynamics::sparsity::SparsityBuilder;
use crate::dynamics::terms::DynamicsTerm;
use crate::dynamics::SolverContext;
use bytemuck::{Pod, Zeroable};
use nalgebra::Vector3;
use wgcloth_core::kernel::{bind_group, bind_group_at, KernelDispatch};
use wgcloth_core::tensor::GpuScalar;
use wgcloth_core::{ClothResult, ShaderLoader, WORKGROUP_SIZE};
use wgpu::{BindGroup, BufferUsages, ComputePass, ComputePipeline, Device};

/// Compute pipeline of the gravity kernel.
pub struct WgGravity {
    /// Adds `M_i · g` to the right-hand side.
    pub assemble: ComputePipeline,
}

impl WgGravity {
    /// Compiles the gravity kernel.
    pub fn from_device(device: &Device, shaders: &ShaderLoader) -> ClothResult<Self> {
        let module = shaders.load(device, "gravity.wgsl")?;
        Ok(Self {
            assemble: module.compute_pipeline(device, "assemble")?,
        })
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct GpuGravityParams {
    gravity: [f32; 4],
}

struct GravityGpu {
    wg: WgGravity,
    _params: GpuScalar<GpuGravityParams>,
    bind_groups: [BindGroup; 2],
    ngroups: u32,
}

/// External acceleration applied through the right-hand side.
///
/// In the projective-dynamics formulation gravity enters through the
/// inertial prediction instead, so the LHS and projection phases are no-ops.
pub struct GravityTerm {
    gravity: Vector3<f32>,
    gpu: Option<GravityGpu>,
}

impl GravityTerm {
    /// Creates the term from an acceleration vector.
    pub fn new(gravity: Vector3<f32>) -> Self {
        Self { gravity, gpu: None }
    }
}

impl DynamicsTerm for GravityTerm {
    fn name(&self) -> &'static str {
        "gravity"
    }

    fn declare_sparsity(&self, _builder: &mut SparsityBuilder) -> ClothResult<()> {
        Ok(())
    }

    fn init(
        &mut self,
        device: &Device,
        shaders: &ShaderLoader,
        _sparsity: &SparsityBuilder,
        ctx: &SolverContext,
    ) -> ClothResult<()> {
        let wg = WgGravity::from_device(device, shaders)?;
        let params = GpuScalar::init(
            device,
            GpuGravityParams {
                gravity: [self.gravity.x, self.gravity.y, self.gravity.z, 0.0],
            },
            BufferUsages::UNIFORM,
        );
        let bind_groups = [
            bind_group_at(
                device,
                &wg.assemble,
                0,
                [(&ctx.params, 0), (&ctx.masses, 2), (ctx.rhs.buffer(), 3)],
            ),
            bind_group(device, &wg.assemble, 1, [params.buffer()]),
        ];
        self.gpu = Some(GravityGpu {
            wg,
            _params: params,
            bind_groups,
            ngroups: ctx.node_count.div_ceil(WORKGROUP_SIZE),
        });
        Ok(())
    }

    fn assemble(&self, device: &Device, pass: &mut ComputePass) {
        let Some(gpu) = &self.gpu else { return };
        KernelDispatch::new(device, pass, &gpu.wg.assemble)
            .bind_group(0, &gpu.bind_groups[0])
            .bind_group(1, &gpu.bind_groups[1])
            .dispatch(gpu.ngroups);
    }
}

wgcloth_core::test_shader_compilation!(WgGravity, crate::bundled_shaders());
