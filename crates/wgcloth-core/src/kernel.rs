//! Compute-kernel dispatch helpers.
//!
//! [`KernelDispatch`] builds bind groups on the fly from whole-buffer
//! bindings and records a single dispatch into an active compute pass.

use wgpu::{BindGroup, Buffer, CommandEncoder, ComputePass, ComputePipeline, Device};

/// Extension trait adding a labelled compute-pass constructor to command encoders.
pub trait CommandEncoderExt {
    /// Begins a compute pass with the given debug label.
    fn compute_pass(&mut self, label: &str) -> ComputePass<'_>;
}

impl CommandEncoderExt for CommandEncoder {
    fn compute_pass(&mut self, label: &str) -> ComputePass<'_> {
        self.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        })
    }
}

/// Builder for recording one compute-kernel dispatch.
///
/// Bind groups are created from the pipeline's own layouts, with each buffer
/// bound in its entirety. The builder is consumed by [`KernelDispatch::dispatch`].
pub struct KernelDispatch<'a, 'b> {
    device: &'a Device,
    pass: &'a mut ComputePass<'b>,
    pipeline: &'a ComputePipeline,
    bind_groups: Vec<(u32, BindGroup)>,
}

impl<'a, 'b> KernelDispatch<'a, 'b> {
    /// Starts a dispatch of `pipeline` into `pass`.
    pub fn new(
        device: &'a Device,
        pass: &'a mut ComputePass<'b>,
        pipeline: &'a ComputePipeline,
    ) -> Self {
        Self {
            device,
            pass,
            pipeline,
            bind_groups: Vec::new(),
        }
    }

    /// Binds `buffers` to group 0, at consecutive binding slots starting at 0.
    pub fn bind0<'c>(self, buffers: impl IntoIterator<Item = &'c Buffer>) -> Self {
        self.bind(0, buffers)
    }

    /// Binds `buffers` to the given group, at consecutive binding slots starting at 0.
    pub fn bind<'c>(mut self, group: u32, buffers: impl IntoIterator<Item = &'c Buffer>) -> Self {
        let entries: Vec<_> = buffers
            .into_iter()
            .enumerate()
            .map(|(i, buffer)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        self.push_group(group, &entries);
        self
    }

    /// Binds `(buffer, slot)` pairs to the given group at explicit binding slots.
    pub fn bind_at<'c>(
        mut self,
        group: u32,
        buffers: impl IntoIterator<Item = (&'c Buffer, u32)>,
    ) -> Self {
        let entries: Vec<_> = buffers
            .into_iter()
            .map(|(buffer, slot)| wgpu::BindGroupEntry {
                binding: slot,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        self.push_group(group, &entries);
        self
    }

    /// Binds an empty bind group.
    ///
    /// Auto-derived pipeline layouts materialize an empty layout for every
    /// group index below the highest one an entry point uses; those slots
    /// still have to be occupied at dispatch time.
    pub fn bind_empty(mut self, group: u32) -> Self {
        self.push_group(group, &[]);
        self
    }

    /// Binds an already-created bind group.
    pub fn bind_group(mut self, group: u32, bind_group: &BindGroup) -> Self {
        self.bind_groups.push((group, bind_group.clone()));
        self
    }

    /// Records the dispatch with the given number of workgroups.
    pub fn dispatch(self, ngroups: u32) {
        self.pass.set_pipeline(self.pipeline);
        for (group, bind_group) in &self.bind_groups {
            self.pass.set_bind_group(*group, bind_group, &[]);
        }
        self.pass.dispatch_workgroups(ngroups, 1, 1);
    }

    fn push_group(&mut self, group: u32, entries: &[wgpu::BindGroupEntry]) {
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &self.pipeline.get_bind_group_layout(group),
            entries,
        });
        self.bind_groups.push((group, bind_group));
    }
}

/// Creates a bind group for `group` of `pipeline`, binding each buffer in its
/// entirety at consecutive slots starting at 0.
///
/// Use this to cache bind groups whose buffers never change identity, instead
/// of re-creating them through [`KernelDispatch`] on every dispatch.
pub fn bind_group<'a>(
    device: &Device,
    pipeline: &ComputePipeline,
    group: u32,
    buffers: impl IntoIterator<Item = &'a Buffer>,
) -> BindGroup {
    let entries: Vec<_> = buffers
        .into_iter()
        .enumerate()
        .map(|(i, buffer)| wgpu::BindGroupEntry {
            binding: i as u32,
            resource: buffer.as_entire_binding(),
        })
        .collect();
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: None,
        layout: &pipeline.get_bind_group_layout(group),
        entries: &entries,
    })
}

/// Creates a bind group for `group` of `pipeline` from explicit
/// `(buffer, slot)` pairs.
///
/// With automatically derived pipeline layouts, a bind group must contain
/// exactly the bindings the entry point statically uses; this variant lets
/// callers match that set when it is not contiguous.
pub fn bind_group_at<'a>(
    device: &Device,
    pipeline: &ComputePipeline,
    group: u32,
    buffers: impl IntoIterator<Item = (&'a Buffer, u32)>,
) -> BindGroup {
    let entries: Vec<_> = buffers
        .into_iter()
        .map(|(buffer, slot)| wgpu::BindGroupEntry {
            binding: slot,
            resource: buffer.as_entire_binding(),
        })
        .collect();
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: None,
        layout: &pipeline.get_bind_group_layout(group),
        entries: &entries,
    })
}
