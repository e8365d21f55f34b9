// gpu/descriptor.rs — descriptor generation and clipping steps.
//
// The generation step reproduces the host's tile rounding: the output
// count is the corner count rounded DOWN to whole 64-lane workgroups,
// set on the buffer-state *before* the dispatch is enqueued (the
// producer owns the count; the kernel writes exactly that many
// elements). The ring and blend offset tables come from the host
// generator so both sides sample identical pixels.

use crate::descriptor::{ring_offsets, BlendSize, Descriptor, DESCRIPTOR_TILE};
use crate::fast::Point;
use crate::gpu::buffer::{GpuGrayImage, GpuVec};
use crate::gpu::device::GpuDevice;
use crate::gpu::step::{
    compute_pipeline, dispatch, measure_enqueue, storage_entry, texture_entry, uniform_entry,
};

const SHADER: &str = include_str!("../shaders/descriptor.wgsl");

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct DescriptorParams {
    count: u32,
    blend_n: u32,
    max_bits: u32,
    width: u32,
    height: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

/// Flattened (dx, dy) pairs for the 8×16 ring sample table.
fn ring_offset_data() -> Vec<[i32; 2]> {
    ring_offsets()
        .iter()
        .flat_map(|ring| ring.iter().map(|&(dx, dy)| [dx, dy]))
        .collect()
}

/// Blend neighborhood as (dx, dy) pairs, identical to the host tables.
fn blend_offset_data(blend: BlendSize) -> Vec<[i32; 2]> {
    match blend {
        BlendSize::Single => vec![[0, 0]],
        BlendSize::Cross => vec![[0, 0], [1, 0], [-1, 0], [0, 1], [0, -1]],
        BlendSize::Square => vec![
            [-1, -1], [0, -1], [1, -1],
            [-1, 0], [0, 0], [1, 0],
            [-1, 1], [0, 1], [1, 1],
        ],
    }
}

/// Descriptor generation over the first tile-rounded corner count.
pub struct DescribeStep {
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    params: wgpu::Buffer,
    // Offset tables live as long as the step; bound once.
    _ring_buf: wgpu::Buffer,
    _blend_buf: wgpu::Buffer,
    blend_n: u32,
    width: u32,
    height: u32,
}

impl DescribeStep {
    pub fn new(
        gpu: &GpuDevice,
        gray: &GpuGrayImage,
        corners: &GpuVec<Point>,
        descriptors: &GpuVec<Descriptor>,
        blend: BlendSize,
    ) -> Self {
        use wgpu::util::DeviceExt;

        let module = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("descriptor.wgsl/generate"),
                source: wgpu::ShaderSource::Wgsl(SHADER.into()),
            });
        let bgl = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("describe BGL"),
                entries: &[
                    texture_entry(0),
                    uniform_entry(1),
                    storage_entry(2, true),
                    storage_entry(3, false),
                    storage_entry(4, true),
                    storage_entry(5, true),
                ],
            });
        let layout = gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("describe layout"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
        let pipeline = compute_pipeline(gpu, &layout, &module, "generate");

        let params = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("describe params"),
            size: std::mem::size_of::<DescriptorParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let ring = ring_offset_data();
        let ring_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("ring offsets"),
            contents: bytemuck::cast_slice(&ring),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let blend_offsets = blend_offset_data(blend);
        let blend_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("blend offsets"),
            contents: bytemuck::cast_slice(&blend_offsets),
            usage: wgpu::BufferUsages::STORAGE,
        });

        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("describe BG"),
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
                    resource: corners.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: descriptors.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: ring_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: blend_buf.as_entire_binding(),
                },
            ],
        });

        DescribeStep {
            pipeline,
            bind_group,
            params,
            _ring_buf: ring_buf,
            _blend_buf: blend_buf,
            blend_n: blend_offsets.len() as u32,
            width: gray.width,
            height: gray.height,
        }
    }

    /// Round `corner_count` down to whole tiles, overwrite the output
    /// count, and enqueue the dispatch (exact workgroups, no remainder).
    pub fn execute(&self, gpu: &GpuDevice, descriptors: &GpuVec<Descriptor>, corner_count: u32) {
        let tile = DESCRIPTOR_TILE as u32;
        let n = (corner_count / tile) * tile;
        descriptors.set_len(gpu, n);
        if n == 0 {
            return;
        }
        let p = DescriptorParams {
            count: n,
            blend_n: self.blend_n,
            max_bits: 0,
            width: self.width,
            height: self.height,
            _pad0: 0,
            _pad1: 0,
            _pad2: 0,
        };
        gpu.queue.write_buffer(&self.params, 0, bytemuck::bytes_of(&p));
        dispatch(
            gpu,
            &self.pipeline,
            &self.bind_group,
            "describe",
            (n / tile, 1, 1),
        );
    }

    pub fn measure(
        &self,
        gpu: &GpuDevice,
        descriptors: &GpuVec<Descriptor>,
        corner_count: u32,
    ) -> u64 {
        measure_enqueue(gpu, || self.execute(gpu, descriptors, corner_count))
    }
}

/// In-place max-bits enforcement. Content-only; never touches the count.
pub struct ClipStep {
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    params: wgpu::Buffer,
    max_bits: u32,
}

impl ClipStep {
    pub fn new(gpu: &GpuDevice, descriptors: &GpuVec<Descriptor>, max_bits: u32) -> Self {
        let module = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("descriptor.wgsl/clip"),
                source: wgpu::ShaderSource::Wgsl(SHADER.into()),
            });
        let bgl = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("clip BGL"),
                entries: &[uniform_entry(1), storage_entry(3, false)],
            });
        let layout = gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("clip layout"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
        let pipeline = compute_pipeline(gpu, &layout, &module, "clip");
        let params = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("clip params"),
            size: std::mem::size_of::<DescriptorParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("clip BG"),
            layout: &bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: descriptors.buffer().as_entire_binding(),
                },
            ],
        });
        ClipStep {
            pipeline,
            bind_group,
            params,
            max_bits,
        }
    }

    pub fn execute(&self, gpu: &GpuDevice, count: u32) {
        if count == 0 {
            return;
        }
        let p = DescriptorParams {
            count,
            blend_n: 0,
            max_bits: self.max_bits,
            width: 0,
            height: 0,
            _pad0: 0,
            _pad1: 0,
            _pad2: 0,
        };
        gpu.queue.write_buffer(&self.params, 0, bytemuck::bytes_of(&p));
        dispatch(
            gpu,
            &self.pipeline,
            &self.bind_group,
            "clip",
            (gpu.list_dispatch(count), 1, 1),
        );
    }

    pub fn measure(&self, gpu: &GpuDevice, count: u32) -> u64 {
        measure_enqueue(gpu, || self.execute(gpu, count))
    }
}
