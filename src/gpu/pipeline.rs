// gpu/pipeline.rs — the fixed-order device pipeline.
//
// Owns every buffer-state and every step for one GpuDevice. All buffers
// are allocated once at construction for worst-case capacity and reused
// frame to frame; all programs are compiled once. `process` enqueues the
// stages in their fixed order on the in-order queue; the only blocking
// points are the count syncs that size the next dispatch, the forest
// readback (the index is built on the host, frame 1 only), the score
// readback for host-side selection, and the final result readbacks.
//
// A backend validation failure anywhere in the run is surfaced at the
// closing `check()` and aborts this instance's result; the multi-device
// driver logs it and proceeds to the next device.

use nalgebra::Matrix4;

use crate::camera::{PinholeCamera, RayMap};
use crate::correspond::Correspondence;
use crate::descriptor::{BlendSize, Descriptor};
use crate::fast::Point;
use crate::gpu::buffer::{GpuDepthImage, GpuGrayImage, GpuVec};
use crate::gpu::device::{AdapterInfo, GpuDevice};
use crate::gpu::descriptor::{ClipStep, DescribeStep};
use crate::gpu::extract::{CullStep, DepthClipStep, RingStep};
use crate::gpu::matching::{GpuForest, TreeFindStep};
use crate::gpu::solve::{
    CholeskyStep, ComposeStep, ExpStep, HypoSet, IdentStep, Mat4 as GpuMat4, Mat6, MixStep,
    ReprojectStep, ScoreStep, ToUvqUvStep, Vec6, WlsStep,
};
use crate::pipeline::{FrameInput, PipelineConfig, PipelineError, PoseEstimate, StageCounts};
use crate::tree::{DescriptorForest, MatchPair};

/// The device pipeline. One instance per GpuDevice; instances share
/// nothing.
pub struct GpuPosePipeline {
    config: PipelineConfig,
    width: u32,
    height: u32,

    // Frame buffer-states (uploaded per frame).
    gray: GpuGrayImage,
    depth1: GpuDepthImage,
    depth2: GpuDepthImage,
    rays: GpuVec<[f32; 2]>,

    // List buffer-states (fixed capacity, counts overwritten per frame).
    candidates: GpuVec<Point>,
    filtered: GpuVec<Point>,
    corners: [GpuVec<Point>; 2],
    descriptors: [GpuVec<Descriptor>; 2],
    forest: GpuForest,
    matches: GpuVec<MatchPair>,
    corrs: GpuVec<Correspondence>,
    sets: GpuVec<HypoSet>,
    poses: GpuVec<GpuMat4>,
    mat_a: GpuVec<Mat6>,
    vec_b: GpuVec<Vec6>,
    vec_x: GpuVec<Vec6>,
    cams: GpuVec<GpuMat4>,
    scores: GpuVec<f32>,
    uvs: GpuVec<[f32; 2]>,

    // Steps (programs compiled once).
    cull: CullStep,
    depth_clip: [DepthClipStep; 2],
    ring: [RingStep; 2],
    describe: [DescribeStep; 2],
    clip: [ClipStep; 2],
    find: TreeFindStep,
    to_uvquv: ToUvqUvStep,
    mix: MixStep,
    ident: IdentStep,
    wls: WlsStep,
    cholesky: CholeskyStep,
    exp: ExpStep,
    compose: ComposeStep,
    score: ScoreStep,
    reproject: ReprojectStep,
}

impl GpuPosePipeline {
    /// Validate the configuration, allocate every buffer-state for its
    /// worst case and compile every step.
    pub fn new(
        gpu: &GpuDevice,
        config: PipelineConfig,
        camera: &PinholeCamera,
        width: usize,
        height: usize,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let blend = BlendSize::from_config(config.blend_size).expect("validated above");
        let (w, h) = (width as u32, height as u32);
        let nxy = w * h;
        let ncorners = config.max_corners as u32;
        let nhypos = config.hypotheses as u32;

        let gray = GpuGrayImage::new(gpu, w, h);
        let depth1 = GpuDepthImage::new(gpu, w, h);
        let depth2 = GpuDepthImage::new(gpu, w, h);

        let rays = GpuVec::new(gpu, nxy, "ray map");
        rays.write(gpu, &RayMap::build(camera, width, height).interleaved());

        let candidates = GpuVec::new(gpu, nxy, "candidates");
        let filtered = GpuVec::new(gpu, nxy, "depth filtered");
        let corners = [
            GpuVec::new(gpu, ncorners, "corners 1"),
            GpuVec::new(gpu, ncorners, "corners 2"),
        ];
        let descriptors = [
            GpuVec::new(gpu, ncorners, "descriptors 1"),
            GpuVec::new(gpu, ncorners, "descriptors 2"),
        ];
        let forest = GpuForest::new(gpu, config.tree_leaves, config.tree_levels);
        let matches = GpuVec::new(gpu, ncorners, "matches");
        let corrs = GpuVec::new(gpu, ncorners, "correspondences");
        let sets = GpuVec::new(gpu, nhypos, "hypothesis sets");
        let poses = GpuVec::new(gpu, nhypos, "hypothesis poses");
        let mat_a = GpuVec::new(gpu, nhypos, "normal matrices");
        let vec_b = GpuVec::new(gpu, nhypos, "rhs vectors");
        let vec_x = GpuVec::new(gpu, nhypos, "twist vectors");
        let cams = GpuVec::new(gpu, nhypos, "pose increments");
        let scores = GpuVec::new(gpu, nhypos, "scores");
        let uvs = GpuVec::new(gpu, ncorners, "reprojected");

        let cull = CullStep::new(gpu, &gray, &candidates, config.fast_threshold);
        let depth_clip = [
            DepthClipStep::new(gpu, &depth1, &candidates, &filtered),
            DepthClipStep::new(gpu, &depth2, &candidates, &filtered),
        ];
        let ring = [
            RingStep::new(
                gpu,
                &gray,
                &filtered,
                &corners[0],
                config.fast_threshold,
                config.fast_ring,
            ),
            RingStep::new(
                gpu,
                &gray,
                &filtered,
                &corners[1],
                config.fast_threshold,
                config.fast_ring,
            ),
        ];
        let describe = [
            DescribeStep::new(gpu, &gray, &corners[0], &descriptors[0], blend),
            DescribeStep::new(gpu, &gray, &corners[1], &descriptors[1], blend),
        ];
        let clip = [
            ClipStep::new(gpu, &descriptors[0], config.max_bits),
            ClipStep::new(gpu, &descriptors[1], config.max_bits),
        ];
        let find = TreeFindStep::new(
            gpu,
            &forest,
            &descriptors[1],
            &matches,
            config.max_error,
            config.rotate_descriptors,
        );
        let to_uvquv = ToUvqUvStep::new(
            gpu,
            &matches,
            &corners[0],
            &corners[1],
            &rays,
            &depth1,
            &corrs,
            w,
        );
        let mix = MixStep::new(gpu, &corrs, &sets);
        let ident = IdentStep::new(gpu, &poses);
        let wls = WlsStep::new(gpu, &sets, &poses, &mat_a, &vec_b);
        let cholesky = CholeskyStep::new(gpu, &mat_a, &vec_b, &vec_x);
        let exp = ExpStep::new(gpu, &vec_x, &cams);
        let compose = ComposeStep::new(gpu, &poses, &cams);
        let score = ScoreStep::new(gpu, &corrs, &poses, &scores, config.inlier_cutoff);
        let reproject = ReprojectStep::new(gpu, &corrs, &poses, &uvs);

        Ok(GpuPosePipeline {
            config,
            width: w,
            height: h,
            gray,
            depth1,
            depth2,
            rays,
            candidates,
            filtered,
            corners,
            descriptors,
            forest,
            matches,
            corrs,
            sets,
            poses,
            mat_a,
            vec_b,
            vec_x,
            cams,
            scores,
            uvs,
            cull,
            depth_clip,
            ring,
            describe,
            clip,
            find,
            to_uvquv,
            mix,
            ident,
            wls,
            cholesky,
            exp,
            compose,
            score,
            reproject,
        })
    }

    /// Run the full pipeline on one frame pair.
    pub fn process(
        &self,
        gpu: &GpuDevice,
        frame1: &FrameInput,
        frame2: &FrameInput,
    ) -> Result<PoseEstimate, PipelineError> {
        self.check_frame(frame1)?;
        self.check_frame(frame2)?;

        gpu.begin_check();
        let mut counts = StageCounts::default();

        // Frame 1 extraction chain. The gray texture is shared between
        // frames; in-order submission makes the overwrite safe.
        self.gray.upload(gpu, frame1.gray);
        self.depth1.upload(gpu, frame1.depth);
        self.extract(gpu, 0, &mut counts);

        // Frame 2 extraction chain.
        self.gray.upload(gpu, frame2.gray);
        self.depth2.upload(gpu, frame2.depth);
        self.extract(gpu, 1, &mut counts);

        // Index build: host-side, frame 1 only, from the clipped
        // frame-1 descriptors.
        let descs1 = self.descriptors[0].read(gpu);
        let host_forest = DescriptorForest::build(
            &descs1,
            self.config.tree_leaves,
            self.config.tree_levels,
        );
        self.forest.upload(gpu, &host_forest);

        // Match and form correspondences.
        self.find
            .execute(gpu, &self.matches, self.descriptors[1].len());
        let n_matches = self.matches.sync_len(gpu);
        counts.matches = n_matches as usize;

        self.to_uvquv.execute(gpu, &self.corrs, n_matches);
        counts.correspondences = n_matches as usize;

        self.mix.execute(
            gpu,
            &self.sets,
            n_matches,
            self.config.hypotheses as u32,
        );
        let n_hypos = self.sets.len();
        counts.hypotheses = n_hypos as usize;

        // Batched refinement: identity init, then the fixed iteration
        // cycle. Every dispatch covers all hypotheses in parallel.
        self.ident.execute(gpu, &self.poses, n_hypos);
        for _ in 0..self.config.iterations {
            self.wls.execute(gpu, &self.mat_a, &self.vec_b, n_hypos);
            self.cholesky.execute(gpu, &self.vec_x, n_hypos);
            self.exp.execute(gpu, &self.cams, n_hypos);
            self.compose.execute(gpu, n_hypos);
        }

        self.score.execute(gpu, &self.scores, n_hypos, n_matches);

        // Host-side selection: first-seen argmax over the score list.
        let scores = self.scores.read(gpu);
        let mut best_index = None;
        let mut best = f32::NEG_INFINITY;
        for (i, &s) in scores.iter().enumerate() {
            if s > best {
                best = s;
                best_index = Some(i);
            }
        }

        // Reapply the selected hypothesis once, for every correspondence.
        match best_index {
            Some(i) => self.reproject.execute(gpu, &self.uvs, i as u32, n_matches),
            None => self.uvs.set_len(gpu, 0),
        }

        // Result readbacks (first n elements of each buffer-state only).
        let points1 = self.corners[0].read(gpu);
        let points2 = self.corners[1].read(gpu);
        let descs2 = self.descriptors[1].read(gpu);
        let matches = self.matches.read(gpu);
        let corrs = self.corrs.read(gpu);
        let reprojected: Vec<[f32; 2]> = self.uvs.read(gpu);
        let poses = self.poses.read(gpu);

        let pose = best_index
            .map(|i| Matrix4::from_column_slice(&poses[i]))
            .unwrap_or_else(Matrix4::identity);
        let best_score = best_index.map(|i| scores[i]).unwrap_or(0.0);

        // Surface any backend failure recorded during the run — fatal
        // to this instance.
        gpu.check()?;

        Ok(PoseEstimate {
            pose,
            points: [points1, points2],
            descriptors: [descs1, descs2],
            matches,
            correspondences: corrs,
            scores,
            best_index,
            best_score,
            reprojected,
            counts,
        })
    }

    /// As [`Self::process`], but drives every step through `measure()`
    /// and logs per-step microseconds. Buffer effects are identical.
    pub fn process_profiled(
        &self,
        gpu: &GpuDevice,
        frame1: &FrameInput,
        frame2: &FrameInput,
    ) -> Result<PoseEstimate, PipelineError> {
        // Per-step timing is only observable through the log; the
        // control flow below mirrors process() with measure() wrappers
        // around the hot steps.
        self.check_frame(frame1)?;
        self.check_frame(frame2)?;
        gpu.begin_check();
        let mut counts = StageCounts::default();

        for (i, frame) in [frame1, frame2].into_iter().enumerate() {
            self.gray.upload(gpu, frame.gray);
            match i {
                0 => self.depth1.upload(gpu, frame.depth),
                _ => self.depth2.upload(gpu, frame.depth),
            }
            let t_cull = self.cull.measure(gpu, &self.candidates);
            let nc = self.candidates.sync_len(gpu);
            counts.candidates[i] = nc as usize;
            let t_depth = self.depth_clip[i].measure(gpu, &self.filtered, nc);
            let nf = self.filtered.sync_len(gpu);
            counts.depth_filtered[i] = nf as usize;
            let t_ring = self.ring[i].measure(gpu, &self.corners[i], nf);
            let ncorn = self.corners[i].sync_len(gpu);
            let t_desc = self.describe[i].measure(gpu, &self.descriptors[i], ncorn);
            let t_clip = self.clip[i].measure(gpu, self.descriptors[i].len());
            log::debug!(
                "frame {}: cull {t_cull} us ({nc}), depth {t_depth} us ({nf}), \
                 ring {t_ring} us ({ncorn}), descriptors {t_desc} us, clip {t_clip} us",
                i + 1
            );
        }

        let descs1 = self.descriptors[0].read(gpu);
        let host_forest = DescriptorForest::build(
            &descs1,
            self.config.tree_leaves,
            self.config.tree_levels,
        );
        self.forest.upload(gpu, &host_forest);

        let t_find = self
            .find
            .measure(gpu, &self.matches, self.descriptors[1].len());
        let n_matches = self.matches.sync_len(gpu);
        log::debug!("tree find: {t_find} us, {n_matches} matches");

        self.to_uvquv.execute(gpu, &self.corrs, n_matches);
        self.mix.execute(
            gpu,
            &self.sets,
            n_matches,
            self.config.hypotheses as u32,
        );
        let n_hypos = self.sets.len();
        self.ident.execute(gpu, &self.poses, n_hypos);
        for _ in 0..self.config.iterations {
            let t_wls = self.wls.measure(gpu, &self.mat_a, &self.vec_b, n_hypos);
            let t_chol = self.cholesky.measure(gpu, &self.vec_x, n_hypos);
            let t_exp = self.exp.measure(gpu, &self.cams, n_hypos);
            let t_mul = self.compose.measure(gpu, n_hypos);
            log::debug!(
                "iterate: wls {t_wls} us, cholesky {t_chol} us, exp {t_exp} us, compose {t_mul} us"
            );
        }
        let t_score = self.score.measure(gpu, &self.scores, n_hypos, n_matches);
        log::debug!("score: {t_score} us");

        let scores = self.scores.read(gpu);
        let mut best_index = None;
        let mut best = f32::NEG_INFINITY;
        for (i, &s) in scores.iter().enumerate() {
            if s > best {
                best = s;
                best_index = Some(i);
            }
        }
        match best_index {
            Some(i) => self.reproject.execute(gpu, &self.uvs, i as u32, n_matches),
            None => self.uvs.set_len(gpu, 0),
        }

        let pose = match best_index {
            Some(i) => Matrix4::from_column_slice(&self.poses.read(gpu)[i]),
            None => Matrix4::identity(),
        };

        counts.matches = n_matches as usize;
        counts.correspondences = n_matches as usize;
        counts.hypotheses = n_hypos as usize;
        for i in 0..2 {
            counts.corners[i] = self.corners[i].len() as usize;
            counts.descriptors[i] = self.descriptors[i].len() as usize;
        }

        let estimate = PoseEstimate {
            pose,
            points: [self.corners[0].read(gpu), self.corners[1].read(gpu)],
            descriptors: [descs1, self.descriptors[1].read(gpu)],
            matches: self.matches.read(gpu),
            correspondences: self.corrs.read(gpu),
            best_score: best_index.map(|i| scores[i]).unwrap_or(0.0),
            scores,
            best_index,
            reprojected: self.uvs.read(gpu),
            counts,
        };
        gpu.check()?;
        Ok(estimate)
    }

    /// The per-frame extraction chain. Count syncs between stages size
    /// the next dispatch; they are the documented blocking points.
    fn extract(&self, gpu: &GpuDevice, slot: usize, counts: &mut StageCounts) {
        self.cull.execute(gpu, &self.candidates);
        let nc = self.candidates.sync_len(gpu);
        counts.candidates[slot] = nc as usize;

        self.depth_clip[slot].execute(gpu, &self.filtered, nc);
        let nf = self.filtered.sync_len(gpu);
        counts.depth_filtered[slot] = nf as usize;

        self.ring[slot].execute(gpu, &self.corners[slot], nf);
        let ncorn = self.corners[slot].sync_len(gpu);
        counts.corners[slot] = ncorn as usize;

        self.describe[slot].execute(gpu, &self.descriptors[slot], ncorn);
        self.clip[slot].execute(gpu, self.descriptors[slot].len());
        counts.descriptors[slot] = self.descriptors[slot].len() as usize;
    }

    fn check_frame(&self, frame: &FrameInput) -> Result<(), PipelineError> {
        for (w, h) in [
            (frame.gray.width(), frame.gray.height()),
            (frame.depth.width(), frame.depth.height()),
        ] {
            if (w as u32, h as u32) != (self.width, self.height) {
                return Err(PipelineError::FrameSize {
                    want_w: self.width as usize,
                    want_h: self.height as usize,
                    got_w: w,
                    got_h: h,
                });
            }
        }
        Ok(())
    }
}

/// Run the pipeline on every available device, sequentially. A failure
/// on one device is logged and does not stop the others — partial
/// failure tolerance at the instance level.
pub fn run_on_all_devices(
    config: &PipelineConfig,
    camera: &PinholeCamera,
    frame1: &FrameInput,
    frame2: &FrameInput,
    width: usize,
    height: usize,
) -> Vec<(AdapterInfo, Result<PoseEstimate, PipelineError>)> {
    let devices = match GpuDevice::enumerate() {
        Ok(d) => d,
        Err(e) => {
            log::warn!("device enumeration failed: {e}");
            return Vec::new();
        }
    };

    devices
        .into_iter()
        .map(|gpu| {
            let info = gpu.adapter_info.clone();
            log::info!("running pipeline on {info}");
            let result = GpuPosePipeline::new(&gpu, config.clone(), camera, width, height)
                .and_then(|pipeline| pipeline.process(&gpu, frame1, frame2));
            if let Err(e) = &result {
                log::warn!("pipeline failed on {info}: {e}");
            }
            (info, result)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Image;
    use crate::pipeline::PosePipeline;

    fn hash(mut s: u32) -> u32 {
        s ^= s << 13;
        s ^= s >> 17;
        s ^= s << 5;
        s
    }

    /// 96×96 scene of unique high-contrast 4×4 patches, optionally
    /// shifted right — the same construction the CPU suites use.
    fn scene(shift: usize) -> (Image<u8>, Image<f32>) {
        let (w, h) = (96usize, 96usize);
        let mut gray = Image::<u8>::from_vec(w, h, vec![30u8; w * h]);
        let mut k = 0u32;
        let mut y = 10;
        while y + 14 < h {
            let mut x = 10;
            while x + 14 + shift < w {
                for dy in 0..4u32 {
                    for dx in 0..4u32 {
                        let v = 80 + hash(k * 131 + dy * 4 + dx + 1) % 150;
                        gray.set(x + dx as usize + shift, y + dy as usize, v as u8);
                    }
                }
                k += 1;
                x += 12;
            }
            y += 12;
        }
        let depth = Image::<f32>::from_vec(w, h, vec![1.0f32; w * h]);
        (gray, depth)
    }

    fn sorted_points(points: &[crate::fast::Point]) -> Vec<(i32, i32)> {
        let mut v: Vec<(i32, i32)> = points.iter().map(|p| (p.x, p.y)).collect();
        v.sort();
        v
    }

    // GPU integration tests are ignored by default; run with
    //   cargo test -- --include-ignored
    // on a machine with a real Vulkan adapter.

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn gpu_extraction_matches_cpu_reference() {
        let gpu = GpuDevice::new().expect("need a Vulkan adapter");
        let camera = PinholeCamera::new(1.0, 1.0, 0.0, 0.0);
        let config = PipelineConfig {
            hypotheses: 256,
            ..Default::default()
        };

        let (gray, depth) = scene(0);
        let frame = FrameInput {
            gray: &gray,
            depth: &depth,
        };

        let cpu = PosePipeline::new(config.clone(), &camera, 96, 96).unwrap();
        let cpu_est = cpu.process(&frame, &frame).unwrap();

        let dev = GpuPosePipeline::new(&gpu, config, &camera, 96, 96).unwrap();
        let gpu_est = dev.process(&gpu, &frame, &frame).unwrap();

        // Append order differs (atomic appends); compare as sets.
        assert_eq!(
            sorted_points(&gpu_est.points[0]),
            sorted_points(&cpu_est.points[0]),
            "corner sets diverge"
        );
        assert_eq!(gpu_est.counts.candidates, cpu_est.counts.candidates);
        assert_eq!(gpu_est.counts.corners, cpu_est.counts.corners);
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn gpu_pipeline_finds_identity_on_identical_frames() {
        let gpu = GpuDevice::new().expect("need a Vulkan adapter");
        let camera = PinholeCamera::new(1.0, 1.0, 0.0, 0.0);
        let config = PipelineConfig {
            hypotheses: 256,
            ..Default::default()
        };

        let (gray, depth) = scene(0);
        let frame = FrameInput {
            gray: &gray,
            depth: &depth,
        };

        let dev = GpuPosePipeline::new(&gpu, config, &camera, 96, 96).unwrap();
        let est = dev.process(&gpu, &frame, &frame).unwrap();

        assert!(est.counts.matches > 0);
        for i in 0..3 {
            for j in 0..4 {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (est.pose[(i, j)] - expect).abs() < 1e-2,
                    "pose[{i}][{j}] = {}",
                    est.pose[(i, j)]
                );
            }
        }
    }
}
