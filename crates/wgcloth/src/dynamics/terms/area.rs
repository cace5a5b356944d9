//! The area-preservation term.

use crate::dynamics::components::AreaTriangle;
use crate::dynamics::sparsity::SparsityBuilder;
use crate::dynamics::terms::DynamicsTerm;
use crate::dynamics::SolverContext;
use bytemuck::{Pod, Zeroable};
use wgcloth_core::kernel::{bind_group, bind_group_at, KernelDispatch};
use wgcloth_core::tensor::{GpuScalar, GpuVector};
use wgcloth_core::{ClothError, ClothResult, ShaderLoader, WORKGROUP_SIZE};
use wgpu::{BindGroup, BufferUsages, ComputePass, ComputePipeline, Device};

/// Compute pipelines of the area kernel.
pub struct WgArea {
    /// Newton assembly: area force plus Gauss-Newton Hessian blocks.
    pub assemble: ComputePipeline,
    /// Constant `w·SᵀS` blocks of the projective-dynamics system.
    pub assemble_lhs: ComputePipeline,
    /// Fused local projection + right-hand-side scatter.
    pub project_rhs: ComputePipeline,
}

impl WgArea {
    /// Compiles the area kernels.
    pub fn from_device(device: &Device, shaders: &ShaderLoader) -> ClothResult<Self> {
        let module = shaders.load(device, "area.wgsl")?;
        Ok(Self {
            assemble: module.compute_pipeline(device, "assemble")?,
            assemble_lhs: module.compute_pipeline(device, "assemble_lhs")?,
            project_rhs: module.compute_pipeline(device, "project_rhs")?,
        })
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct GpuAreaElement {
    n0: u32,
    n1: u32,
    n2: u32,
    rest_area: f32,
    dm_inv: [f32; 4],
    blocks: [u32; 6],
    _pad: [u32; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct GpuAreaParams {
    stiffness: f32,
    shear_stiffness: f32,
    _pad: [f32; 2],
}

struct AreaGpu {
    wg: WgArea,
    _elements: GpuVector<GpuAreaElement>,
    _params: GpuScalar<GpuAreaParams>,
    bg_assemble: [BindGroup; 2],
    bg_lhs: [BindGroup; 2],
    bg_project: [BindGroup; 2],
    ngroups: u32,
}

/// Area-preservation constraints over a flat triangle list.
pub struct AreaTerm {
    stiffness: f32,
    shear_stiffness: f32,
    triangles: Vec<AreaTriangle>,
    gpu: Option<AreaGpu>,
}

impl AreaTerm {
    /// Creates the term from its final flat topology.
    pub fn new(stiffness: f32, shear_stiffness: f32, triangles: Vec<AreaTriangle>) -> Self {
        Self {
            stiffness,
            shear_stiffness,
            triangles,
            gpu: None,
        }
    }
}

impl DynamicsTerm for AreaTerm {
    fn name(&self) -> &'static str {
        "area"
    }

    fn declare_sparsity(&self, builder: &mut SparsityBuilder) -> ClothResult<()> {
        for tri in &self.triangles {
            let [n0, n1, n2] = tri.nodes;
            builder.add_edge(n0, n1)?;
            builder.add_edge(n0, n2)?;
            builder.add_edge(n1, n2)?;
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
        let mut elements = Vec::with_capacity(self.triangles.len());
        for tri in &self.triangles {
            let [n0, n1, n2] = tri.nodes;
            let index = |a: u32, b: u32| {
                sparsity.csr_index(a, b).ok_or_else(|| {
                    ClothError::NotFound(format!(
                        "csr entry ({a}, {b}) was not declared during the sparsity phase"
                    ))
                })
            };
            elements.push(GpuAreaElement {
                n0,
                n1,
                n2,
                rest_area: tri.rest_area,
                dm_inv: tri.dm_inv,
                blocks: [
                    index(n0, n1)?,
                    index(n1, n0)?,
                    index(n0, n2)?,
                    index(n2, n0)?,
                    index(n1, n2)?,
                    index(n2, n1)?,
                ],
                _pad: [0; 2],
            });
        }

        let wg = WgArea::from_device(device, shaders)?;
        let elements = GpuVector::init(device, &elements, BufferUsages::STORAGE);
        let params = GpuScalar::init(
            device,
            GpuAreaParams {
                stiffness: self.stiffness,
                shear_stiffness: self.shear_stiffness,
                _pad: [0.0; 2],
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

        self.gpu = Some(AreaGpu {
            wg,
            bg_assemble,
            bg_lhs,
            bg_project,
            ngroups: (self.triangles.len() as u32).div_ceil(WORKGROUP_SIZE),
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

wgcloth_core::test_shader_compilation!(WgArea, crate::bundled_shaders());
