//! Two-stage GPU reductions shared by the solvers.

use bytemuck::{Pod, Zeroable};
use wgcloth_core::kernel::KernelDispatch;
use wgcloth_core::{ClothResult, ShaderLoader, WORKGROUP_SIZE};
use wgpu::{Buffer, ComputePass, ComputePipeline, Device};

/// Uniform selecting the partial count and destination slot of a reduction.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct GpuReduceParams {
    pub count: u32,
    pub dst: u32,
    pub _pad: [u32; 2],
}

impl GpuReduceParams {
    pub fn new(count: u32, dst: u32) -> Self {
        Self {
            count,
            dst,
            _pad: [0; 2],
        }
    }
}

/// Dot-product and difference-norm reduction kernels.
pub struct WgReduce {
    dot_partial: ComputePipeline,
    diff_partial: ComputePipeline,
    dot_final: ComputePipeline,
}

impl WgReduce {
    /// Compiles the reduction kernels.
    pub fn from_device(device: &Device, shaders: &ShaderLoader) -> ClothResult<Self> {
        let module = shaders.load(device, "reduce.wgsl")?;
        Ok(Self {
            dot_partial: module.compute_pipeline(device, "dot_partial")?,
            diff_partial: module.compute_pipeline(device, "diff_partial")?,
            dot_final: module.compute_pipeline(device, "dot_final")?,
        })
    }

    /// Records `scalars[params.dst] = Σ dot(a[i].xyz, b[i].xyz)`.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch_dot(
        &self,
        device: &Device,
        pass: &mut ComputePass,
        a: &Buffer,
        b: &Buffer,
        partial: &Buffer,
        scalars: &Buffer,
        params: &Buffer,
        len: u32,
    ) {
        KernelDispatch::new(device, pass, &self.dot_partial)
            .bind_at(0, [(a, 0), (b, 1), (partial, 2)])
            .dispatch(len.div_ceil(WORKGROUP_SIZE));
        KernelDispatch::new(device, pass, &self.dot_final)
            .bind_at(0, [(partial, 2), (scalars, 3), (params, 4)])
            .dispatch(1);
    }

    /// Records `scalars[params.dst] = Σ |a[i].xyz − b[i].xyz|²`.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch_diff(
        &self,
        device: &Device,
        pass: &mut ComputePass,
        a: &Buffer,
        b: &Buffer,
        partial: &Buffer,
        scalars: &Buffer,
        params: &Buffer,
        len: u32,
    ) {
        KernelDispatch::new(device, pass, &self.diff_partial)
            .bind_at(0, [(a, 0), (b, 1), (partial, 2)])
            .dispatch(len.div_ceil(WORKGROUP_SIZE));
        KernelDispatch::new(device, pass, &self.dot_final)
            .bind_at(0, [(partial, 2), (scalars, 3), (params, 4)])
            .dispatch(1);
    }
}

wgcloth_core::test_shader_compilation!(WgReduce, crate::bundled_shaders());
