// gpu/matching.rs — forest upload and the tree query step.
//
// The forest itself is built on the host (tree.rs) from the frame-1
// descriptors — once per reference frame, not per query — then uploaded
// verbatim: the node array and the leaf indirection table. The query
// step runs one thread per frame-2 descriptor and appends accepted
// (source, target) pairs.

use crate::descriptor::Descriptor;
use crate::gpu::buffer::GpuVec;
use crate::gpu::device::GpuDevice;
use crate::gpu::step::{
    compute_pipeline, dispatch, measure_enqueue, storage_entry, uniform_entry,
};
use crate::tree::{DescriptorForest, MatchPair};

const SHADER: &str = include_str!("../shaders/matching.wgsl");

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct MatchParams {
    n_queries: u32,
    roots: u32,
    levels: u32,
    leaves: u32,
    max_error: u32,
    rotate: u32,
    _pad0: u32,
    _pad1: u32,
}

/// Device copy of a host-built [`DescriptorForest`].
pub struct GpuForest {
    pub nodes: GpuVec<Descriptor>,
    pub leaf_index: GpuVec<u32>,
    leaves: u32,
    levels: u32,
    roots: u32,
}

impl GpuForest {
    /// Allocate for a forest shape (fixed at pipeline construction).
    pub fn new(gpu: &GpuDevice, leaves: u32, levels: u32) -> Self {
        let roots = leaves >> levels;
        let nodes = GpuVec::new(gpu, 2 * leaves - roots, "forest nodes");
        let leaf_index = GpuVec::new(gpu, leaves, "forest leaf index");
        GpuForest {
            nodes,
            leaf_index,
            leaves,
            levels,
            roots,
        }
    }

    /// Upload a freshly built forest. Frame 1 only.
    ///
    /// # Panics
    /// Panics if the forest shape differs from the allocation.
    pub fn upload(&self, gpu: &GpuDevice, forest: &DescriptorForest) {
        assert_eq!(
            (forest.leaves, forest.levels),
            (self.leaves, self.levels),
            "forest shape changed after allocation"
        );
        self.nodes.write(gpu, &forest.nodes);
        self.leaf_index.write(gpu, &forest.leaf_index);
    }
}

/// Approximate nearest-neighbor query over the uploaded forest.
pub struct TreeFindStep {
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    params: wgpu::Buffer,
    leaves: u32,
    levels: u32,
    roots: u32,
    max_error: u32,
    rotate: bool,
}

impl TreeFindStep {
    pub fn new(
        gpu: &GpuDevice,
        forest: &GpuForest,
        queries: &GpuVec<Descriptor>,
        matches: &GpuVec<MatchPair>,
        max_error: u32,
        rotate: bool,
    ) -> Self {
        let module = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("matching.wgsl"),
                source: wgpu::ShaderSource::Wgsl(SHADER.into()),
            });
        let bgl = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("tree find BGL"),
                entries: &[
                    uniform_entry(0),
                    storage_entry(1, true),
                    storage_entry(2, true),
                    storage_entry(3, true),
                    storage_entry(4, false),
                    storage_entry(5, false),
                ],
            });
        let layout = gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("tree find layout"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
        let pipeline = compute_pipeline(gpu, &layout, &module, "tree_find");
        let params = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tree find params"),
            size: std::mem::size_of::<MatchParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("tree find BG"),
            layout: &bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: forest.nodes.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: forest.leaf_index.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: queries.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: matches.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: matches.count_buffer().as_entire_binding(),
                },
            ],
        });
        TreeFindStep {
            pipeline,
            bind_group,
            params,
            leaves: forest.leaves,
            levels: forest.levels,
            roots: forest.roots,
            max_error,
            rotate,
        }
    }

    pub fn execute(&self, gpu: &GpuDevice, matches: &GpuVec<MatchPair>, n_queries: u32) {
        matches.reset(gpu);
        if n_queries == 0 {
            return;
        }
        let p = MatchParams {
            n_queries,
            roots: self.roots,
            levels: self.levels,
            leaves: self.leaves,
            max_error: self.max_error,
            rotate: u32::from(self.rotate),
            _pad0: 0,
            _pad1: 0,
        };
        gpu.queue.write_buffer(&self.params, 0, bytemuck::bytes_of(&p));
        dispatch(
            gpu,
            &self.pipeline,
            &self.bind_group,
            "tree_find",
            (gpu.list_dispatch(n_queries), 1, 1),
        );
    }

    pub fn measure(&self, gpu: &GpuDevice, matches: &GpuVec<MatchPair>, n_queries: u32) -> u64 {
        measure_enqueue(gpu, || self.execute(gpu, matches, n_queries))
    }
}
