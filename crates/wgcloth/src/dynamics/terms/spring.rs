//! The spring term.

use crate::dynamics::components::SpringEdge;
use crate::dynamics::sparsity::SparsityBuilder;
use crate::dynamics::terms::DynamicsTerm;
use crate::dynamics::SolverContext;
use bytemuck::{Pod, Zeroable};
use wgcloth_core::kernel::{bind_group, bind_group_at, KernelDispatch};
use wgcloth_core::tensor::{GpuScalar, GpuVector};
use wgcloth_core::{ClothError, ClothResult, ShaderLoader, WORKGROUP_SIZE};
use wgpu::{BindGroup, BufferUsages, ComputePass, ComputePipeline, Device};

/// Compute pipelines of the spring kernel.
pub struct WgSpring {
    /// Newton assembly: tension force plus rank-1 Hessian blocks.
    pub assemble: ComputePipeline,
    /// Constant `w·SᵀS` blocks of the projective-dynamics system.
    pub assemble_lhs: ComputePipeline,
    /// Fused local projection + right-hand-side scatter.
    pub project_rhs: ComputePipeline,
}

impl WgSpring {
    /// Compiles the spring kernels.
    pub fn from_device(device: &Device, shaders: &ShaderLoader) -> ClothResult<Self> {
        let module = shaders.load(device, "spring.wgsl")?;
        Ok(Self {
            assemble: module.compute_pipeline(device, "assemble")?,
            assemble_lhs: module.compute_pipeline(device, "assemble_lhs")?,
            project_rhs: module.compute_pipeline(device, "project_rhs")?,
        })
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct GpuSpringElement {
    a: u32,
    b: u32,
    rest_length: f32,
    block_ab: u32,
    block_ba: u32,
    _pad: [u32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct GpuSpringParams {
    stiffness: f32,
    _pad: [f32; 3],
}

struct SpringGpu {
    wg: WgSpring,
    _elements: GpuVector<GpuSpringElement>,
    _params: GpuScalar<GpuSpringParams>,
    bg_assemble: [BindGroup; 2],
    bg_lhs: [BindGroup; 2],
    bg_project: [BindGroup; 2],
    ngroups: u32,
}

/// Spring constraints over a flat edge list.
pub struct SpringTerm {
    stiffness: f32,
    edges: Vec<SpringEdge>,
    gpu: Option<SpringGpu>,
}

impl SpringTerm {
    /// Creates the term from its final flat topology.
    pub fn new(stiffness: f32, edges: Vec<SpringEdge>) -> Self {
        Self {
            stiffness,
            edges,
            gpu: None,
        }
    }
}

impl DynamicsTerm for SpringTerm {
    fn name(&self) -> &'static str {
        "spring"
    }

    fn declare_sparsity(&self, builder: &mut SparsityBuilder) -> ClothResult<()> {
        for edge in &self.edges {
            builder.add_edge(edge.nodes[0], edge.nodes[1])?;
        }
        Ok(())
    }

    fn init(
        &mut self,
        device: &Device,
        shaders: &ShaderLoader,
        sparsity: &SparsityBuilder,
        ctx: &SolverContext,
    ) -> ClothResult<()> {
        let mut elements = Vec::with_capacity(self.edges.len());
        for edge in &self.edges {
            let (a, b) = (edge.nodes[0], edge.nodes[1]);
            let block_ab = sparsity
                .csr_index(a, b)
                .ok_or_else(|| missing_block(a, b))?;
            let block_ba = sparsity
                .csr_index(b, a)
                .ok_or_else(|| missing_block(b, a))?;
            elements.push(GpuSpringElement {
                a,
                b,
                rest_length: edge.rest_length,
                block_ab,
                block_ba,
                _pad: [0; 3],
            });
        }

        let wg = WgSpring::from_device(device, shaders)?;
        let elements = GpuVector::init(device, &elements, BufferUsages::STORAGE);
        let params = GpuScalar::init(
            device,
            GpuSpringParams {
                stiffness: self.stiffness,
                _pad: [0.0; 3],
            },
            BufferUsages::UNIFORM,
        );

        let own = |pipeline: &ComputePipeline| {
            bind_group(device, pipeline, 1, [elements.buffer(), params.buffer()])
        };
        let bg_assemble = [
            bind_group_at(
                device,
                &wg.assemble,
                0,
                [
                    (&ctx.params, 0),
                    (&ctx.positions, 1),
                    (ctx.rhs.buffer(), 3),
                    (ctx.diag.buffer(), 4),
                    (ctx.csr_values.buffer(), 5),
                ],
            ),
            own(&wg.assemble),
        ];
        let bg_lhs = [
            bind_group_at(
                device,
                &wg.assemble_lhs,
                0,
                [(ctx.diag.buffer(), 4), (ctx.csr_values.buffer(), 5)],
            ),
            own(&wg.assemble_lhs),
        ];
        let bg_project = [
            bind_group_at(
                device,
                &wg.project_rhs,
                0,
                [(&ctx.positions, 1), (ctx.rhs.buffer(), 3)],
            ),
            own(&wg.project_rhs),
        ];

        self.gpu = Some(SpringGpu {
            wg,
            bg_assemble,
            bg_lhs,
            bg_project,
            ngroups: (self.edges.len() as u32).div_ceil(WORKGROUP_SIZE),
            _elements: elements,
            _params: params,
        });
        Ok(())
    }

    fn assemble(&self, device: &Device, pass: &mut ComputePass) {
        let Some(gpu) = &self.gpu else { return };
        if gpu.ngroups == 0 {
            return;
        }
        KernelDispatch::new(device, pass, &gpu.wg.assemble)
            .bind_group(0, &gpu.bg_assemble[0])
            .bind_group(1, &gpu.bg_assemble[1])
            .dispatch(gpu.ngroups);
    }

    fn assemble_lhs(&self, device: &Device, pass: &mut ComputePass) {
        let Some(gpu) = &self.gpu else { return };
        if gpu.ngroups == 0 {
            return;
        }
        KernelDispatch::new(device, pass, &gpu.wg.assemble_lhs)
            .bind_group(0, &gpu.bg_lhs[0])
            .bind_group(1, &gpu.bg_lhs[1])
            .dispatch(gpu.ngroups);
    }

    fn project_rhs(&self, device: &Device, pass: &mut ComputePass) {
        let Some(gpu) = &self.gpu else { return };
        if gpu.ngroups == 0 {
            return;
        }
        KernelDispatch::new(device, pass, &gpu.wg.project_rhs)
            .bind_group(0, &gpu.bg_project[0])
            .bind_group(1, &gpu.bg_project[1])
            .dispatch(gpu.ngroups);
    }
}

fn missing_block(a: u32, b: u32) -> ClothError {
    ClothError::NotFound(format!(
        "csr entry ({a}, {b}) was not declared during the sparsity phase"
    ))
}

wgcloth_core::test_shader_compilation!(WgSpring, crate::bundled_shaders());
