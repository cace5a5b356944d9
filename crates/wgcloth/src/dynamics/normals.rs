//! Per-vertex normal recomputation.
//!
//! A small companion pass run after each simulation step: clear the normals
//! buffer, scatter face-area-weighted normals with atomic bit-pattern
//! accumulation, then normalize. The renderer consumes the resulting buffer;
//! rendering itself is external.

use wgcloth_core::kernel::{CommandEncoderExt, KernelDispatch};
use wgcloth_core::tensor::GpuVector;
use wgcloth_core::{ClothResult, ShaderLoader, WORKGROUP_SIZE};
use wgpu::{Buffer, BufferUsages, CommandEncoder, ComputePipeline, Device};

/// Compute pipelines of the normals pass.
pub struct WgNormals {
    scatter: ComputePipeline,
    normalize: ComputePipeline,
}

impl WgNormals {
    /// Compiles the normals kernels.
    pub fn from_device(device: &Device, shaders: &ShaderLoader) -> ClothResult<Self> {
        let module = shaders.load(device, "normals.wgsl")?;
        Ok(Self {
            scatter: module.compute_pipeline(device, "scatter_normals")?,
            normalize: module.compute_pipeline(device, "normalize_normals")?,
        })
    }
}

/// Owns the per-vertex normals buffer and records its recomputation.
pub struct NormalsPass {
    wg: WgNormals,
    normals: GpuVector<u32>,
    node_count: u32,
}

impl NormalsPass {
    /// Allocates the normals buffer for `node_count` vertices.
    pub fn new(device: &Device, shaders: &ShaderLoader, node_count: u32) -> ClothResult<Self> {
        Ok(Self {
            wg: WgNormals::from_device(device, shaders)?,
            normals: GpuVector::uninit(
                device,
                node_count * 4,
                BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            ),
            node_count,
        })
    }

    /// The normals buffer, one `vec4<f32>` per vertex.
    pub fn buffer(&self) -> &Buffer {
        self.normals.buffer()
    }

    /// Records clear + scatter + normalize for the given face topology.
    pub fn record(
        &self,
        device: &Device,
        encoder: &mut CommandEncoder,
        positions: &Buffer,
        faces: &Buffer,
        face_count: u32,
    ) {
        if face_count == 0 || self.node_count == 0 {
            return;
        }
        encoder.clear_buffer(self.normals.buffer(), 0, None);
        let mut pass = encoder.compute_pass("normals");
        KernelDispatch::new(device, &mut pass, &self.wg.scatter)
            .bind_at(
                0,
                [
                    (positions, 0),
                    (faces, 1),
                    (self.normals.buffer(), 2),
                ],
            )
            .dispatch(face_count.div_ceil(WORKGROUP_SIZE));
        KernelDispatch::new(device, &mut pass, &self.wg.normalize)
            .bind_at(0, [(self.normals.buffer(), 3)])
            .dispatch(self.node_count.div_ceil(WORKGROUP_SIZE));
    }
}

wgcloth_core::test_shader_compilation!(WgNormals, crate::bundled_shaders());
