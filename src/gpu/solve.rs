// gpu/solve.rs — correspondence formation and the batched pose solve.
//
// Nine steps over solve.wgsl, one struct per kernel, in enqueue order:
// to_uvquv → mix → ident → (wls → cholesky → se3_exp → compose) ×N →
// score → reproject. Every struct compiles its program once and binds
// its buffer-states once; `execute` overwrites the output count, updates
// the parameter block and enqueues. The iteration loop lives in the
// pipeline, not here — a step enqueues exactly one dispatch.
//
// Hypothesis poses, systems and scores are dense slot-indexed arrays:
// their counts are set by the producer up front (the hypothesis count),
// never appended.

use crate::correspond::Correspondence;
use crate::descriptor::Descriptor;
use crate::fast::Point;
use crate::gpu::buffer::{GpuDepthImage, GpuVec};
use crate::gpu::device::GpuDevice;
use crate::gpu::step::{
    compute_pipeline, dispatch, measure_enqueue, storage_entry, texture_entry, uniform_entry,
};
use crate::tree::MatchPair;

const SHADER: &str = include_str!("../shaders/solve.wgsl");

/// One minimal 3-correspondence set per hypothesis slot.
pub type HypoSet = [Correspondence; 3];
/// Column-major 4×4 matrix, the wgpu-side pose layout.
pub type Mat4 = [f32; 16];
/// Row-major 6×6 normal-equations matrix.
pub type Mat6 = [f32; 36];
/// 6-vector (right-hand side / solved twist).
pub type Vec6 = [f32; 6];

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct SolveParams {
    width: u32,
    n_matches: u32,
    n_corrs: u32,
    n_hypos: u32,
    best: u32,
    cutoff: f32,
    _pad0: u32,
    _pad1: u32,
}

impl SolveParams {
    fn zeroed() -> Self {
        bytemuck::Zeroable::zeroed()
    }
}

/// Pipeline + bound resources + parameter block: the compiled program
/// every step struct wraps.
struct SolveKernel {
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    params: wgpu::Buffer,
    label: &'static str,
}

impl SolveKernel {
    fn new(
        gpu: &GpuDevice,
        label: &'static str,
        entry: &'static str,
        layout_entries: &[wgpu::BindGroupLayoutEntry],
        resources: &[(u32, wgpu::BindingResource)],
    ) -> Self {
        let module = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(SHADER.into()),
            });
        let bgl = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries: layout_entries,
            });
        let layout = gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
        let pipeline = compute_pipeline(gpu, &layout, &module, entry);
        let params = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: std::mem::size_of::<SolveParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut entries: Vec<wgpu::BindGroupEntry> = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: params.as_entire_binding(),
        }];
        for (binding, resource) in resources {
            entries.push(wgpu::BindGroupEntry {
                binding: *binding,
                resource: resource.clone(),
            });
        }
        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &bgl,
            entries: &entries,
        });

        SolveKernel {
            pipeline,
            bind_group,
            params,
            label,
        }
    }

    fn run(&self, gpu: &GpuDevice, p: &SolveParams, groups: u32) {
        gpu.queue.write_buffer(&self.params, 0, bytemuck::bytes_of(p));
        dispatch(gpu, &self.pipeline, &self.bind_group, self.label, (groups, 1, 1));
    }
}

/// Match pairs → correspondence tuples. Count = match count.
pub struct ToUvqUvStep {
    kernel: SolveKernel,
    width: u32,
}

impl ToUvqUvStep {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gpu: &GpuDevice,
        matches: &GpuVec<MatchPair>,
        corners1: &GpuVec<Point>,
        corners2: &GpuVec<Point>,
        rays: &GpuVec<[f32; 2]>,
        depth1: &GpuDepthImage,
        corrs: &GpuVec<Correspondence>,
        width: u32,
    ) -> Self {
        let kernel = SolveKernel::new(
            gpu,
            "to_uvquv",
            "to_uvquv",
            &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, true),
                storage_entry(4, true),
                texture_entry(5),
                storage_entry(6, false),
            ],
            &[
                (1, matches.buffer().as_entire_binding()),
                (2, corners1.buffer().as_entire_binding()),
                (3, corners2.buffer().as_entire_binding()),
                (4, rays.buffer().as_entire_binding()),
                (5, wgpu::BindingResource::TextureView(&depth1.view)),
                (6, corrs.buffer().as_entire_binding()),
            ],
        );
        ToUvqUvStep { kernel, width }
    }

    pub fn execute(&self, gpu: &GpuDevice, corrs: &GpuVec<Correspondence>, n_matches: u32) {
        corrs.set_len(gpu, n_matches);
        if n_matches == 0 {
            return;
        }
        let p = SolveParams {
            width: self.width,
            n_matches,
            ..SolveParams::zeroed()
        };
        self.kernel.run(gpu, &p, gpu.list_dispatch(n_matches));
    }

    pub fn measure(&self, gpu: &GpuDevice, corrs: &GpuVec<Correspondence>, n_matches: u32) -> u64 {
        measure_enqueue(gpu, || self.execute(gpu, corrs, n_matches))
    }
}

/// Minimal-set sampling: 3 distinct correspondences per slot.
pub struct MixStep {
    kernel: SolveKernel,
}

impl MixStep {
    pub fn new(gpu: &GpuDevice, corrs: &GpuVec<Correspondence>, sets: &GpuVec<HypoSet>) -> Self {
        let kernel = SolveKernel::new(
            gpu,
            "mix",
            "mix_sets",
            &[uniform_entry(0), storage_entry(6, false), storage_entry(7, false)],
            &[
                (6, corrs.buffer().as_entire_binding()),
                (7, sets.buffer().as_entire_binding()),
            ],
        );
        MixStep { kernel }
    }

    /// Fewer than 3 correspondences seed nothing: the hypothesis count
    /// becomes 0 and downstream steps dispatch nothing.
    pub fn execute(&self, gpu: &GpuDevice, sets: &GpuVec<HypoSet>, n_corrs: u32, n_hypos: u32) {
        if n_corrs < 3 {
            sets.set_len(gpu, 0);
            return;
        }
        sets.set_len(gpu, n_hypos);
        let p = SolveParams {
            n_corrs,
            n_hypos,
            ..SolveParams::zeroed()
        };
        self.kernel.run(gpu, &p, gpu.list_dispatch(n_hypos));
    }

    pub fn measure(
        &self,
        gpu: &GpuDevice,
        sets: &GpuVec<HypoSet>,
        n_corrs: u32,
        n_hypos: u32,
    ) -> u64 {
        measure_enqueue(gpu, || self.execute(gpu, sets, n_corrs, n_hypos))
    }
}

/// Hypothesis pose ← identity.
pub struct IdentStep {
    kernel: SolveKernel,
}

impl IdentStep {
    pub fn new(gpu: &GpuDevice, poses: &GpuVec<Mat4>) -> Self {
        let kernel = SolveKernel::new(
            gpu,
            "ident",
            "ident",
            &[uniform_entry(0), storage_entry(8, false)],
            &[(8, poses.buffer().as_entire_binding())],
        );
        IdentStep { kernel }
    }

    pub fn execute(&self, gpu: &GpuDevice, poses: &GpuVec<Mat4>, n_hypos: u32) {
        poses.set_len(gpu, n_hypos);
        if n_hypos == 0 {
            return;
        }
        let p = SolveParams {
            n_hypos,
            ..SolveParams::zeroed()
        };
        self.kernel.run(gpu, &p, gpu.list_dispatch(n_hypos));
    }

    pub fn measure(&self, gpu: &GpuDevice, poses: &GpuVec<Mat4>, n_hypos: u32) -> u64 {
        measure_enqueue(gpu, || self.execute(gpu, poses, n_hypos))
    }
}

/// Normal equations of each hypothesis's minimal set at its pose.
pub struct WlsStep {
    kernel: SolveKernel,
}

impl WlsStep {
    pub fn new(
        gpu: &GpuDevice,
        sets: &GpuVec<HypoSet>,
        poses: &GpuVec<Mat4>,
        mat_a: &GpuVec<Mat6>,
        vec_b: &GpuVec<Vec6>,
    ) -> Self {
        let kernel = SolveKernel::new(
            gpu,
            "wls",
            "wls",
            &[
                uniform_entry(0),
                storage_entry(7, false),
                storage_entry(8, false),
                storage_entry(9, false),
                storage_entry(10, false),
            ],
            &[
                (7, sets.buffer().as_entire_binding()),
                (8, poses.buffer().as_entire_binding()),
                (9, mat_a.buffer().as_entire_binding()),
                (10, vec_b.buffer().as_entire_binding()),
            ],
        );
        WlsStep { kernel }
    }

    pub fn execute(
        &self,
        gpu: &GpuDevice,
        mat_a: &GpuVec<Mat6>,
        vec_b: &GpuVec<Vec6>,
        n_hypos: u32,
    ) {
        mat_a.set_len(gpu, n_hypos);
        vec_b.set_len(gpu, n_hypos);
        if n_hypos == 0 {
            return;
        }
        let p = SolveParams {
            n_hypos,
            ..SolveParams::zeroed()
        };
        self.kernel.run(gpu, &p, gpu.list_dispatch(n_hypos));
    }

    pub fn measure(
        &self,
        gpu: &GpuDevice,
        mat_a: &GpuVec<Mat6>,
        vec_b: &GpuVec<Vec6>,
        n_hypos: u32,
    ) -> u64 {
        measure_enqueue(gpu, || self.execute(gpu, mat_a, vec_b, n_hypos))
    }
}

/// Unguarded 6×6 Cholesky solve per hypothesis.
pub struct CholeskyStep {
    kernel: SolveKernel,
}

impl CholeskyStep {
    pub fn new(
        gpu: &GpuDevice,
        mat_a: &GpuVec<Mat6>,
        vec_b: &GpuVec<Vec6>,
        vec_x: &GpuVec<Vec6>,
    ) -> Self {
        let kernel = SolveKernel::new(
            gpu,
            "cholesky",
            "cholesky",
            &[
                uniform_entry(0),
                storage_entry(9, false),
                storage_entry(10, false),
                storage_entry(11, false),
            ],
            &[
                (9, mat_a.buffer().as_entire_binding()),
                (10, vec_b.buffer().as_entire_binding()),
                (11, vec_x.buffer().as_entire_binding()),
            ],
        );
        CholeskyStep { kernel }
    }

    pub fn execute(&self, gpu: &GpuDevice, vec_x: &GpuVec<Vec6>, n_hypos: u32) {
        vec_x.set_len(gpu, n_hypos);
        if n_hypos == 0 {
            return;
        }
        let p = SolveParams {
            n_hypos,
            ..SolveParams::zeroed()
        };
        self.kernel.run(gpu, &p, gpu.list_dispatch(n_hypos));
    }

    pub fn measure(&self, gpu: &GpuDevice, vec_x: &GpuVec<Vec6>, n_hypos: u32) -> u64 {
        measure_enqueue(gpu, || self.execute(gpu, vec_x, n_hypos))
    }
}

/// Twist → incremental rigid transform.
pub struct ExpStep {
    kernel: SolveKernel,
}

impl ExpStep {
    pub fn new(gpu: &GpuDevice, vec_x: &GpuVec<Vec6>, cams: &GpuVec<Mat4>) -> Self {
        let kernel = SolveKernel::new(
            gpu,
            "se3_exp",
            "se3_exp",
            &[
                uniform_entry(0),
                storage_entry(11, false),
                storage_entry(12, false),
            ],
            &[
                (11, vec_x.buffer().as_entire_binding()),
                (12, cams.buffer().as_entire_binding()),
            ],
        );
        ExpStep { kernel }
    }

    pub fn execute(&self, gpu: &GpuDevice, cams: &GpuVec<Mat4>, n_hypos: u32) {
        cams.set_len(gpu, n_hypos);
        if n_hypos == 0 {
            return;
        }
        let p = SolveParams {
            n_hypos,
            ..SolveParams::zeroed()
        };
        self.kernel.run(gpu, &p, gpu.list_dispatch(n_hypos));
    }

    pub fn measure(&self, gpu: &GpuDevice, cams: &GpuVec<Mat4>, n_hypos: u32) -> u64 {
        measure_enqueue(gpu, || self.execute(gpu, cams, n_hypos))
    }
}

/// pose ← increment × pose.
pub struct ComposeStep {
    kernel: SolveKernel,
}

impl ComposeStep {
    pub fn new(gpu: &GpuDevice, poses: &GpuVec<Mat4>, cams: &GpuVec<Mat4>) -> Self {
        let kernel = SolveKernel::new(
            gpu,
            "compose",
            "compose",
            &[
                uniform_entry(0),
                storage_entry(8, false),
                storage_entry(12, false),
            ],
            &[
                (8, poses.buffer().as_entire_binding()),
                (12, cams.buffer().as_entire_binding()),
            ],
        );
        ComposeStep { kernel }
    }

    pub fn execute(&self, gpu: &GpuDevice, n_hypos: u32) {
        if n_hypos == 0 {
            return;
        }
        let p = SolveParams {
            n_hypos,
            ..SolveParams::zeroed()
        };
        self.kernel.run(gpu, &p, gpu.list_dispatch(n_hypos));
    }

    pub fn measure(&self, gpu: &GpuDevice, n_hypos: u32) -> u64 {
        measure_enqueue(gpu, || self.execute(gpu, n_hypos))
    }
}

/// Inlier-weight sum over every correspondence, per hypothesis.
pub struct ScoreStep {
    kernel: SolveKernel,
    cutoff: f32,
}

impl ScoreStep {
    pub fn new(
        gpu: &GpuDevice,
        corrs: &GpuVec<Correspondence>,
        poses: &GpuVec<Mat4>,
        scores: &GpuVec<f32>,
        cutoff: f32,
    ) -> Self {
        let kernel = SolveKernel::new(
            gpu,
            "score",
            "score",
            &[
                uniform_entry(0),
                storage_entry(6, false),
                storage_entry(8, false),
                storage_entry(13, false),
            ],
            &[
                (6, corrs.buffer().as_entire_binding()),
                (8, poses.buffer().as_entire_binding()),
                (13, scores.buffer().as_entire_binding()),
            ],
        );
        ScoreStep { kernel, cutoff }
    }

    pub fn execute(&self, gpu: &GpuDevice, scores: &GpuVec<f32>, n_hypos: u32, n_corrs: u32) {
        scores.set_len(gpu, n_hypos);
        if n_hypos == 0 {
            return;
        }
        let p = SolveParams {
            n_corrs,
            n_hypos,
            cutoff: self.cutoff,
            ..SolveParams::zeroed()
        };
        self.kernel.run(gpu, &p, gpu.list_dispatch(n_hypos));
    }

    pub fn measure(&self, gpu: &GpuDevice, scores: &GpuVec<f32>, n_hypos: u32, n_corrs: u32) -> u64 {
        measure_enqueue(gpu, || self.execute(gpu, scores, n_hypos, n_corrs))
    }
}

/// Reprojection of every correspondence under one selected hypothesis.
/// Runs once, after selection — never per hypothesis.
pub struct ReprojectStep {
    kernel: SolveKernel,
}

impl ReprojectStep {
    pub fn new(
        gpu: &GpuDevice,
        corrs: &GpuVec<Correspondence>,
        poses: &GpuVec<Mat4>,
        uvs: &GpuVec<[f32; 2]>,
    ) -> Self {
        let kernel = SolveKernel::new(
            gpu,
            "reproject",
            "reproject",
            &[
                uniform_entry(0),
                storage_entry(6, false),
                storage_entry(8, false),
                storage_entry(14, false),
            ],
            &[
                (6, corrs.buffer().as_entire_binding()),
                (8, poses.buffer().as_entire_binding()),
                (14, uvs.buffer().as_entire_binding()),
            ],
        );
        ReprojectStep { kernel }
    }

    pub fn execute(&self, gpu: &GpuDevice, uvs: &GpuVec<[f32; 2]>, best: u32, n_corrs: u32) {
        uvs.set_len(gpu, n_corrs);
        if n_corrs == 0 {
            return;
        }
        let p = SolveParams {
            n_corrs,
            best,
            ..SolveParams::zeroed()
        };
        self.kernel.run(gpu, &p, gpu.list_dispatch(n_corrs));
    }

    pub fn measure(&self, gpu: &GpuDevice, uvs: &GpuVec<[f32; 2]>, best: u32, n_corrs: u32) -> u64 {
        measure_enqueue(gpu, || self.execute(gpu, uvs, best, n_corrs))
    }
}
