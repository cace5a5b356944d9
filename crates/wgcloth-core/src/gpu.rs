//! Utilities to initialize a gpu device.

use crate::error::{ClothError, ClothResult};
use std::sync::Arc;
use wgpu::{Adapter, Backends, Device, Instance, InstanceDescriptor, Queue};

/// Helper struct to initialize a device and its queue.
pub struct GpuInstance {
    _instance: Instance,
    adapter: Adapter,
    device: Arc<Device>,
    queue: Queue,
}

impl GpuInstance {
    /// Initializes a gpu instance with any available backend.
    pub async fn new() -> ClothResult<Self> {
        Self::with_backends(Backends::all()).await
    }

    /// Initializes a wgpu instance and its queue for the given set of backends.
    pub async fn with_backends(backends: Backends) -> ClothResult<Self> {
        let instance_desc = InstanceDescriptor {
            backends,
            ..Default::default()
        };
        let instance = wgpu::Instance::new(&instance_desc);
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                ..Default::default()
            })
            .await
            .map_err(|e| ClothError::Device(format!("failed to acquire a gpu adapter: {e:?}")))?;
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: None,
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| ClothError::Device(format!("failed to acquire a gpu device: {e:?}")))?;

        Ok(Self {
            _instance: instance,
            adapter,
            device: Arc::new(device),
            queue,
        })
    }

    /// The `wgpu` adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// The `wgpu` device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The shared `wgpu` device.
    pub fn device_arc(&self) -> Arc<Device> {
        self.device.clone()
    }

    /// The `wgpu` queue.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Submits a command encoder and blocks until the gpu finished executing it.
    pub fn submit_and_wait(&self, encoder: wgpu::CommandEncoder) -> ClothResult<()> {
        self.queue.submit(Some(encoder.finish()));
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| ClothError::Device(format!("wait for submitted work failed: {e:?}")))?;
        Ok(())
    }
}
