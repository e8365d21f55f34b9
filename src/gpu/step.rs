// gpu/step.rs — The execute()/measure() contract.
//
// Every step struct compiles its program once at construction and
// exposes two entry points with identical buffer effects:
//
//   execute(..)  — enqueue the dispatch on the context's in-order queue
//                  and return immediately. The host never blocks here;
//                  ordering between steps is submission order alone.
//   measure(..)  — drain the queue, enqueue, block until complete, and
//                  return the elapsed wall time in microseconds. Exists
//                  purely for profiling.
//
// `measure_enqueue` is the shared implementation of the second form:
// steps pass their own `execute` as the closure.

use std::time::Instant;

use crate::gpu::device::GpuDevice;

/// Run `enqueue` between two full queue drains and return the elapsed
/// microseconds. The first drain isolates the measurement from earlier
/// asynchronous work; the second makes it include this step's execution.
pub fn measure_enqueue(gpu: &GpuDevice, enqueue: impl FnOnce()) -> u64 {
    gpu.wait_idle();
    let start = Instant::now();
    enqueue();
    gpu.wait_idle();
    start.elapsed().as_micros() as u64
}

/// Shared helper for building a compute pipeline from an already
/// compiled module: every step's program is one entry point of its
/// group's shader module.
pub(crate) fn compute_pipeline(
    gpu: &GpuDevice,
    layout: &wgpu::PipelineLayout,
    module: &wgpu::ShaderModule,
    entry_point: &str,
) -> wgpu::ComputePipeline {
    gpu.device
        .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(entry_point),
            layout: Some(layout),
            module,
            entry_point,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        })
}

/// Bind group layout entry for a non-filterable 2D float texture.
pub(crate) fn texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            multisampled: false,
            view_dimension: wgpu::TextureViewDimension::D2,
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
        },
        count: None,
    }
}

/// Bind group layout entry for a uniform parameter block.
pub(crate) fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Bind group layout entry for a storage buffer. `read_only` must match
/// the shader-side declaration (`read` vs `read_write`), not how this
/// particular step happens to use it.
pub(crate) fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Shared helper for the single-bind-group dispatch every step performs.
pub(crate) fn dispatch(
    gpu: &GpuDevice,
    pipeline: &wgpu::ComputePipeline,
    bind_group: &wgpu::BindGroup,
    label: &str,
    groups: (u32, u32, u32),
) {
    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups(groups.0, groups.1, groups.2);
    }
    gpu.queue.submit(std::iter::once(encoder.finish()));
}
