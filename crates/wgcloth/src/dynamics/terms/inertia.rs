//! The inertial term.

use crate::dynamics::sparsity::SparsityBuilder;
use crate::dynamics::terms::DynamicsTerm;
use crate::dynamics::SolverContext;
use wgcloth_core::kernel::{bind_group_at, KernelDispatch};
use wgcloth_core::{ClothResult, ShaderLoader, WORKGROUP_SIZE};
use wgpu::{BindGroup, ComputePass, ComputePipeline, Device};

/// Compute pipeline of the inertial kernel.
pub struct WgInertia {
    /// Adds `M_i · I₃` to every diagonal block.
    pub assemble: ComputePipeline,
}

impl WgInertia {
    /// Compiles the inertial kernel.
    pub fn from_device(device: &Device, shaders: &ShaderLoader) -> ClothResult<Self> {
        let module = shaders.load(device, "inertia.wgsl")?;
        Ok(Self {
            assemble: module.compute_pipeline(device, "assemble")?,
        })
    }
}

/// The mass matrix contribution of the Newton system. No sparsity footprint.
#[derive(Default)]
pub struct InertiaTerm {
    gpu: Option<(WgInertia, BindGroup, u32)>,
}

impl InertiaTerm {
    /// Creates the term.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DynamicsTerm for InertiaTerm {
    fn name(&self) -> &'static str {
        "inertia"
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
        let wg = WgInertia::from_device(device, shaders)?;
        let bg = bind_group_at(
            device,
            &wg.assemble,
            0,
            [(&ctx.masses, 2), (ctx.diag.buffer(), 4)],
        );
        self.gpu = Some((wg, bg, ctx.node_count.div_ceil(WORKGROUP_SIZE)));
        Ok(())
    }

    fn assemble(&self, device: &Device, pass: &mut ComputePass) {
        let Some((wg, bg, ngroups)) = &self.gpu else {
            return;
        };
        KernelDispatch::new(device, pass, &wg.assemble)
            .bind_group(0, bg)
            .dispatch(*ngroups);
    }
}

wgcloth_core::test_shader_compilation!(WgInertia, crate::bundled_shaders());
