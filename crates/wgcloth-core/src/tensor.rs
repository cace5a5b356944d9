//! Typed GPU buffers.
//!
//! [`GpuVector`] and [`GpuScalar`] wrap a `wgpu::Buffer` together with the
//! element type it stores. Plain-old-data types upload through `bytemuck`;
//! types whose WGSL layout differs from their `#[repr(C)]` layout upload
//! through `encase`.

use crate::error::{ClothError, ClothResult};
use bytemuck::Pod;
use encase::internal::WriteInto;
use encase::{ShaderSize, ShaderType};
use std::marker::PhantomData;
use wgpu::util::DeviceExt;
use wgpu::{Buffer, BufferUsages, CommandEncoder, Device, Queue};

/// A GPU buffer holding a contiguous array of `T`.
pub struct GpuVector<T> {
    buffer: Buffer,
    len: u32,
    _marker: PhantomData<T>,
}

impl<T> GpuVector<T> {
    /// The underlying gpu buffer.
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// The number of elements in this vector.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Returns `true` if this vector contains no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Extracts the underlying gpu buffer.
    pub fn into_inner(self) -> Buffer {
        self.buffer
    }
}

impl<T: Pod> GpuVector<T> {
    /// Creates a gpu vector initialized with `data`.
    ///
    /// An empty `data` still allocates a single zeroed element so the buffer
    /// remains bindable (wgpu rejects empty storage bindings); the logical
    /// length stays 0.
    pub fn init(device: &Device, data: &[T], usage: BufferUsages) -> Self {
        let buffer = if data.is_empty() {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: None,
                size: std::mem::size_of::<T>().max(4) as u64,
                usage,
                mapped_at_creation: false,
            })
        } else {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: None,
                contents: bytemuck::cast_slice(data),
                usage,
            })
        };
        Self {
            buffer,
            len: data.len() as u32,
            _marker: PhantomData,
        }
    }

    /// Creates an uninitialized gpu vector with room for `len` elements.
    pub fn uninit(device: &Device, len: u32, usage: BufferUsages) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: (std::mem::size_of::<T>() as u64 * len as u64).max(4),
            usage,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            len,
            _marker: PhantomData,
        }
    }

    /// Overwrites the start of this vector with `data`.
    pub fn write(&self, queue: &Queue, data: &[T]) {
        queue.write_buffer(&self.buffer, 0, bytemuck::cast_slice(data));
    }

    /// Records a copy of the overlapping range of `src` into `self`.
    pub fn copy_from(&self, encoder: &mut CommandEncoder, src: &GpuVector<T>) {
        let len = self.len.min(src.len) as u64 * std::mem::size_of::<T>() as u64;
        encoder.copy_buffer_to_buffer(&src.buffer, 0, &self.buffer, 0, len);
    }

    /// Reads this vector back to the host. Requires `BufferUsages::MAP_READ`.
    pub async fn read(&self, device: &Device) -> ClothResult<Vec<T>> {
        let bytes = map_read(device, &self.buffer).await?;
        let mut out = bytemuck::cast_slice::<_, T>(&bytes).to_vec();
        out.truncate(self.len as usize);
        self.buffer.unmap();
        Ok(out)
    }

    /// Reads this vector back through a temporary staging buffer.
    ///
    /// Requires `BufferUsages::COPY_SRC`. Intended for tests and diagnostics;
    /// it submits its own command encoder and waits for the gpu.
    pub async fn slow_read(&self, gpu: &crate::gpu::GpuInstance) -> ClothResult<Vec<T>> {
        let staging = GpuVector::<T>::uninit(
            gpu.device(),
            self.len,
            BufferUsages::MAP_READ | BufferUsages::COPY_DST,
        );
        let mut encoder = gpu.device().create_command_encoder(&Default::default());
        staging.copy_from(&mut encoder, self);
        gpu.submit_and_wait(encoder)?;
        staging.read(gpu.device()).await
    }
}

impl<T: ShaderType + ShaderSize + WriteInto + Clone> GpuVector<T> {
    /// Creates a gpu vector from types with a WGSL-specific layout.
    pub fn encase(device: &Device, data: &[T], usage: BufferUsages) -> Self {
        let mut bytes = encase::StorageBuffer::new(Vec::<u8>::new());
        bytes
            .write(&data.to_vec())
            .expect("serializing fixed-footprint data cannot fail");
        let bytes = bytes.into_inner();
        let buffer = if bytes.is_empty() {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: None,
                size: 4,
                usage,
                mapped_at_creation: false,
            })
        } else {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: None,
                contents: &bytes,
                usage,
            })
        };
        Self {
            buffer,
            len: data.len() as u32,
            _marker: PhantomData,
        }
    }
}

/// A GPU buffer holding a single `T`.
pub struct GpuScalar<T> {
    buffer: Buffer,
    _marker: PhantomData<T>,
}

impl<T> GpuScalar<T> {
    /// The underlying gpu buffer.
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }
}

impl<T: Pod> GpuScalar<T> {
    /// Creates a gpu scalar initialized with `value`.
    pub fn init(device: &Device, value: T, usage: BufferUsages) -> Self {
        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: None,
            contents: bytemuck::bytes_of(&value),
            usage,
        });
        Self {
            buffer,
            _marker: PhantomData,
        }
    }

    /// Creates an uninitialized gpu scalar.
    pub fn uninit(device: &Device, usage: BufferUsages) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: std::mem::size_of::<T>().max(4) as u64,
            usage,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            _marker: PhantomData,
        }
    }

    /// Overwrites the stored value.
    pub fn write(&self, queue: &Queue, value: T) {
        queue.write_buffer(&self.buffer, 0, bytemuck::bytes_of(&value));
    }

    /// Records a copy of `src` into `self`.
    pub fn copy_from(&self, encoder: &mut CommandEncoder, src: &GpuScalar<T>) {
        encoder.copy_buffer_to_buffer(&src.buffer, 0, &self.buffer, 0, std::mem::size_of::<T>() as u64);
    }

    /// Reads the value back to the host. Requires `BufferUsages::MAP_READ`.
    pub async fn read(&self, device: &Device) -> ClothResult<T> {
        let bytes = map_read(device, &self.buffer).await?;
        let value = *bytemuck::from_bytes::<T>(&bytes[..std::mem::size_of::<T>()]);
        self.buffer.unmap();
        Ok(value)
    }
}

impl<T: ShaderType + WriteInto> GpuScalar<T> {
    /// Creates a gpu scalar from a type with a WGSL-specific layout.
    ///
    /// Uses the uniform address-space layout, which is also valid for
    /// storage bindings of non-array types.
    pub fn encase(device: &Device, value: &T, usage: BufferUsages) -> Self {
        let mut bytes = encase::UniformBuffer::new(Vec::<u8>::new());
        bytes
            .write(value)
            .expect("serializing fixed-footprint data cannot fail");
        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: None,
            contents: &bytes.into_inner(),
            usage,
        });
        Self {
            buffer,
            _marker: PhantomData,
        }
    }
}

async fn map_read(device: &Device, buffer: &Buffer) -> ClothResult<Vec<u8>> {
    let slice = buffer.slice(..);
    let (tx, rx) = futures::channel::oneshot::channel();
    slice.map_async(wgpu::MapMode::Read, move |res| {
        let _ = tx.send(res);
    });
    device
        .poll(wgpu::PollType::Wait)
        .map_err(|e| ClothError::Device(format!("poll failed during readback: {e:?}")))?;
    rx.await
        .map_err(|_| ClothError::Device("map_async callback was dropped".to_string()))?
        .map_err(|e| ClothError::Device(format!("buffer mapping failed: {e:?}")))?;
    let bytes = slice.get_mapped_range().to_vec();
    Ok(bytes)
}

#[cfg(test)]
mod test {
    use super::GpuVector;
    use crate::gpu::GpuInstance;
    use wgpu::BufferUsages;

    #[futures_test::test]
    #[serial_test::serial]
    async fn upload_read_roundtrip() {
        let Ok(gpu) = GpuInstance::new().await else {
            return;
        };

        let data: Vec<[f32; 4]> = (0..257)
            .map(|i| [i as f32, i as f32 * 0.5, -(i as f32), 1.0])
            .collect();
        let v = GpuVector::init(
            gpu.device(),
            &data,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
        );
        let t0 = web_time::Instant::now();
        let roundtrip = v.slow_read(&gpu).await.unwrap();
        println!("readback time: {}", t0.elapsed().as_secs_f32());
        assert_eq!(roundtrip, data);
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn encase_pads_vec3_elements() {
        let Ok(gpu) = GpuInstance::new().await else {
            return;
        };

        // vec3 storage arrays have a 16-byte stride; encase inserts the
        // padding that a plain `#[repr(C)]` upload would miss.
        let data = vec![
            nalgebra::Vector3::new(1.0f32, 2.0, 3.0),
            nalgebra::Vector3::new(4.0f32, 5.0, 6.0),
        ];
        let v = GpuVector::encase(
            gpu.device(),
            &data,
            BufferUsages::STORAGE | BufferUsages::COPY_SRC,
        );
        assert_eq!(v.buffer().size(), 32);

        let staging = GpuVector::<[f32; 4]>::uninit(
            gpu.device(),
            2,
            BufferUsages::MAP_READ | BufferUsages::COPY_DST,
        );
        let mut encoder = gpu.device().create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(v.buffer(), 0, staging.buffer(), 0, 32);
        gpu.submit_and_wait(encoder).unwrap();
        let words = staging.read(gpu.device()).await.unwrap();
        assert_eq!(&words[0][..3], &[1.0, 2.0, 3.0]);
        assert_eq!(&words[1][..3], &[4.0, 5.0, 6.0]);
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn empty_vector_is_bindable() {
        let Ok(gpu) = GpuInstance::new().await else {
            return;
        };

        let v = GpuVector::<f32>::init(gpu.device(), &[], BufferUsages::STORAGE);
        assert!(v.is_empty());
        assert!(v.buffer().size() >= 4);
    }
}
