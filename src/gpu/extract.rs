// gpu/extract.rs — corner extraction steps.
//
// Three step structs over extract.wgsl, one per stage. Each compiles its
// program once at construction and binds its buffer-states once; only
// the parameter block (and the downstream count reset) changes per
// frame. The cull step is shared by both frames (it binds the one gray
// texture, re-uploaded per frame); the depth and ring steps exist once
// per frame because they bind per-frame buffer-states, exactly like the
// reference pipeline's per-frame step objects.

use crate::fast::Point;
use crate::gpu::buffer::{GpuDepthImage, GpuGrayImage, GpuVec};
use crate::gpu::device::GpuDevice;
use crate::gpu::step::{
    compute_pipeline, dispatch, measure_enqueue, storage_entry, texture_entry, uniform_entry,
};

const SHADER: &str = include_str!("../shaders/extract.wgsl");

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct ExtractParams {
    width: u32,
    height: u32,
    threshold: f32,
    ring: u32,
    count: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

fn make_params(gpu: &GpuDevice, label: &str) -> wgpu::Buffer {
    gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: std::mem::size_of::<ExtractParams>() as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Stage 1: cardinal-difference cull over every pixel.
pub struct CullStep {
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    params: wgpu::Buffer,
    width: u32,
    height: u32,
    threshold: f32,
}

impl CullStep {
    pub fn new(
        gpu: &GpuDevice,
        gray: &GpuGrayImage,
        candidates: &GpuVec<Point>,
        threshold: i16,
    ) -> Self {
        let module = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("extract.wgsl/cull"),
                source: wgpu::ShaderSource::Wgsl(SHADER.into()),
            });
        let bgl = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("cull BGL"),
                entries: &[
                    texture_entry(0),
                    uniform_entry(1),
                    storage_entry(3, false),
                    storage_entry(4, false),
                ],
            });
        let layout = gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("cull layout"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
        let pipeline = compute_pipeline(gpu, &layout, &module, "cull_candidates");
        let params = make_params(gpu, "cull params");
        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("cull BG"),
            layout: &bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&gray.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: candidates.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: candidates.count_buffer().as_entire_binding(),
                },
            ],
        });
        CullStep {
            pipeline,
            bind_group,
            params,
            width: gray.width,
            height: gray.height,
            threshold: threshold as f32,
        }
    }

    /// Enqueue; the caller resets the output count first via the
    /// pipeline's reset-then-append protocol.
    pub fn execute(&self, gpu: &GpuDevice, candidates: &GpuVec<Point>) {
        candidates.reset(gpu);
        let p = ExtractParams {
            width: self.width,
            height: self.height,
            threshold: self.threshold,
            ring: 0,
            count: 0,
            _pad0: 0,
            _pad1: 0,
            _pad2: 0,
        };
        gpu.queue.write_buffer(&self.params, 0, bytemuck::bytes_of(&p));
        let (gx, gy) = gpu.image_dispatch(self.width, self.height);
        dispatch(gpu, &self.pipeline, &self.bind_group, "cull", (gx, gy, 1));
    }

    pub fn measure(&self, gpu: &GpuDevice, candidates: &GpuVec<Point>) -> u64 {
        measure_enqueue(gpu, || self.execute(gpu, candidates))
    }
}

/// Stage 2: depth-validity filter over the candidate list.
pub struct DepthClipStep {
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    params: wgpu::Buffer,
}

impl DepthClipStep {
    pub fn new(
        gpu: &GpuDevice,
        depth: &GpuDepthImage,
        candidates: &GpuVec<Point>,
        filtered: &GpuVec<Point>,
    ) -> Self {
        let module = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("extract.wgsl/depth"),
                source: wgpu::ShaderSource::Wgsl(SHADER.into()),
            });
        let bgl = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("depth filter BGL"),
                entries: &[
                    uniform_entry(1),
                    storage_entry(2, true),
                    storage_entry(3, false),
                    storage_entry(4, false),
                    texture_entry(5),
                ],
            });
        let layout = gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("depth filter layout"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
        let pipeline = compute_pipeline(gpu, &layout, &module, "depth_filter");
        let params = make_params(gpu, "depth filter params");
        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("depth filter BG"),
            layout: &bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: candidates.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: filtered.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: filtered.count_buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: wgpu::BindingResource::TextureView(&depth.view),
                },
            ],
        });
        DepthClipStep {
            pipeline,
            bind_group,
            params,
        }
    }

    /// Enqueue over the first `count` candidates.
    pub fn execute(&self, gpu: &GpuDevice, filtered: &GpuVec<Point>, count: u32) {
        filtered.reset(gpu);
        if count == 0 {
            return;
        }
        let p = ExtractParams {
            width: 0,
            height: 0,
            threshold: 0.0,
            ring: 0,
            count,
            _pad0: 0,
            _pad1: 0,
            _pad2: 0,
        };
        gpu.queue.write_buffer(&self.params, 0, bytemuck::bytes_of(&p));
        dispatch(
            gpu,
            &self.pipeline,
            &self.bind_group,
            "depth_filter",
            (gpu.list_dispatch(count), 1, 1),
        );
    }

    pub fn measure(&self, gpu: &GpuDevice, filtered: &GpuVec<Point>, count: u32) -> u64 {
        measure_enqueue(gpu, || self.execute(gpu, filtered, count))
    }
}

/// Stage 3: 16-sample segment test over the filtered candidates.
pub struct RingStep {
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    params: wgpu::Buffer,
    threshold: f32,
    ring: u32,
}

impl RingStep {
    pub fn new(
        gpu: &GpuDevice,
        gray: &GpuGrayImage,
        filtered: &GpuVec<Point>,
        corners: &GpuVec<Point>,
        threshold: i16,
        ring: usize,
    ) -> Self {
        let module = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("extract.wgsl/ring"),
                source: wgpu::ShaderSource::Wgsl(SHADER.into()),
            });
        let bgl = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("ring BGL"),
                entries: &[
                    texture_entry(0),
                    uniform_entry(1),
                    storage_entry(2, true),
                    storage_entry(3, false),
                    storage_entry(4, false),
                ],
            });
        let layout = gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("ring layout"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
        let pipeline = compute_pipeline(gpu, &layout, &module, "ring_test");
        let params = make_params(gpu, "ring params");
        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("ring BG"),
            layout: &bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&gray.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: filtered.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: corners.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: corners.count_buffer().as_entire_binding(),
                },
            ],
        });
        RingStep {
            pipeline,
            bind_group,
            params,
            threshold: threshold as f32,
            ring: ring as u32,
        }
    }

    pub fn execute(&self, gpu: &GpuDevice, corners: &GpuVec<Point>, count: u32) {
        corners.reset(gpu);
        if count == 0 {
            return;
        }
        let p = ExtractParams {
            width: 0,
            height: 0,
            threshold: self.threshold,
            ring: self.ring,
            count,
            _pad0: 0,
            _pad1: 0,
            _pad2: 0,
        };
        gpu.queue.write_buffer(&self.params, 0, bytemuck::bytes_of(&p));
        dispatch(
            gpu,
            &self.pipeline,
            &self.bind_group,
            "ring_test",
            (gpu.list_dispatch(count), 1, 1),
        );
    }

    pub fn measure(&self, gpu: &GpuDevice, corners: &GpuVec<Point>, count: u32) -> u64 {
        measure_enqueue(gpu, || self.execute(gpu, corners, count))
    }
}
