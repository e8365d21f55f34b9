// pipeline.rs — The fixed-order two-frame pose pipeline (CPU reference).
//
// Stage order is declared once, here, by construction order — there is
// no dependency inference. Each stage consumes only outputs of stages
// above it and overwrites its own output count:
//
//   frame 1: cull → depth filter → ring test → descriptors → clip
//   frame 2: cull → depth filter → ring test → descriptors → clip
//   frame 1 only: forest build
//   match → correspondences → hypothesis sets
//   per hypothesis ×10: linearize → Cholesky → exp → compose
//   score → select (host argmax) → reproject best
//
// The GPU pipeline (gpu::pipeline) enqueues the same stages in the same
// order; this module is the authoritative reference it is validated
// against.

use std::time::Instant;

use nalgebra::Matrix4;
use thiserror::Error;

use crate::camera::{PinholeCamera, RayMap};
use crate::correspond::{form_correspondences, sample_hypotheses, Correspondence};
use crate::descriptor::{clip_bits, BlendSize, Descriptor, DescriptorGenerator};
use crate::fast::{cull_candidates, filter_by_depth, Point, RingDetector};
use crate::image::Image;
use crate::pose::{reproject, PoseSolver, SolveResult};
use crate::tree::{DescriptorForest, MatchPair};

/// Invalid configuration, detected synchronously at construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("fast_threshold must be positive (got {0})")]
    Threshold(i16),
    #[error("fast_ring must be 9..=12 (got {0})")]
    Ring(usize),
    #[error("blend_size must be 1, 5 or 9 (got {0})")]
    Blend(u32),
    #[error("tree_leaves must be a power of two (got {0})")]
    Leaves(u32),
    #[error("tree_levels {levels} needs 2^levels <= tree_leaves ({leaves})")]
    Levels { levels: u32, leaves: u32 },
    #[error("max_corners must be positive")]
    Corners,
    #[error("hypothesis count must be positive")]
    Hypotheses,
    #[error("inlier_cutoff must be positive and finite (got {0})")]
    Cutoff(f32),
}

/// A pipeline run failure. Both kinds abort the current run; the
/// multi-device driver catches, logs and moves on.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("frame is {got_w}x{got_h}, pipeline was built for {want_w}x{want_h}")]
    FrameSize {
        want_w: usize,
        want_h: usize,
        got_w: usize,
        got_h: usize,
    },
    #[error(transparent)]
    Gpu(#[from] crate::gpu::device::GpuError),
}

/// Everything the pipeline's constructors recognize.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Corner absolute-difference threshold.
    pub fast_threshold: i16,
    /// Minimum contiguous ring arc, 9..=12.
    pub fast_ring: usize,
    /// Pixels blended per descriptor sample: 1, 5 or 9.
    pub blend_size: u32,
    /// Maximum set bits per descriptor after clipping.
    pub max_bits: u32,
    /// Maximum match error accepted by the index query.
    pub max_error: u32,
    /// Index leaf count (power of two).
    pub tree_leaves: u32,
    /// Index subtree depth.
    pub tree_levels: u32,
    /// Enumerate all 16 pattern rotations while matching.
    pub rotate_descriptors: bool,
    /// Corner list capacity per frame.
    pub max_corners: usize,
    /// Hypothesis slot count.
    pub hypotheses: usize,
    /// Gauss-Newton iterations per hypothesis.
    pub iterations: usize,
    /// Scoring inlier cutoff in normalized-ray units.
    pub inlier_cutoff: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            fast_threshold: 40,
            fast_ring: 9,
            blend_size: 5,
            max_bits: 150,
            max_error: 3,
            tree_leaves: 512,
            tree_levels: 5,
            rotate_descriptors: true,
            max_corners: 2048,
            hypotheses: 8192,
            iterations: crate::pose::DEFAULT_ITERATIONS,
            inlier_cutoff: crate::pose::DEFAULT_INLIER_CUTOFF,
        }
    }
}

impl PipelineConfig {
    /// Check every field; the first violation is returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fast_threshold <= 0 {
            return Err(ConfigError::Threshold(self.fast_threshold));
        }
        if !(9..=12).contains(&self.fast_ring) {
            return Err(ConfigError::Ring(self.fast_ring));
        }
        if BlendSize::from_config(self.blend_size).is_none() {
            return Err(ConfigError::Blend(self.blend_size));
        }
        if !self.tree_leaves.is_power_of_two() {
            return Err(ConfigError::Leaves(self.tree_leaves));
        }
        if self.tree_levels == 0 || (1u32 << self.tree_levels) > self.tree_leaves {
            return Err(ConfigError::Levels {
                levels: self.tree_levels,
                leaves: self.tree_leaves,
            });
        }
        if self.max_corners == 0 {
            return Err(ConfigError::Corners);
        }
        if self.hypotheses == 0 {
            return Err(ConfigError::Hypotheses);
        }
        if !(self.inlier_cutoff > 0.0 && self.inlier_cutoff.is_finite()) {
            return Err(ConfigError::Cutoff(self.inlier_cutoff));
        }
        Ok(())
    }
}

/// One already-decoded RGB-D frame: gray intensities plus metric depth.
#[derive(Clone, Copy)]
pub struct FrameInput<'a> {
    pub gray: &'a Image<u8>,
    pub depth: &'a Image<f32>,
}

/// Per-stage item counts, in pipeline order.
#[derive(Debug, Clone, Default)]
pub struct StageCounts {
    pub candidates: [usize; 2],
    pub depth_filtered: [usize; 2],
    pub corners: [usize; 2],
    pub descriptors: [usize; 2],
    pub matches: usize,
    pub correspondences: usize,
    pub hypotheses: usize,
}

/// The pipeline's full output for one frame pair.
#[derive(Debug, Clone)]
pub struct PoseEstimate {
    /// Selected rigid transform (frame-1 → frame-2).
    pub pose: Matrix4<f32>,
    /// Final corner list per frame.
    pub points: [Vec<Point>; 2],
    /// Clipped descriptor list per frame.
    pub descriptors: [Vec<Descriptor>; 2],
    /// Accepted (frame-1 index, frame-2 index) match pairs.
    pub matches: Vec<MatchPair>,
    /// Correspondence tuples the solver consumed.
    pub correspondences: Vec<Correspondence>,
    /// Score per hypothesis slot.
    pub scores: Vec<f32>,
    /// First-seen argmax of `scores`, if any hypothesis exists.
    pub best_index: Option<usize>,
    /// Score of the selected hypothesis.
    pub best_score: f32,
    /// Frame-1 points reprojected under the selected pose.
    pub reprojected: Vec<[f32; 2]>,
    /// Per-stage counts.
    pub counts: StageCounts,
}

/// The CPU pose pipeline. Construct once per camera/frame size; call
/// [`process`](PosePipeline::process) per frame pair.
pub struct PosePipeline {
    config: PipelineConfig,
    rays: RayMap,
    detector: RingDetector,
    generator: DescriptorGenerator,
    solver: PoseSolver,
}

impl PosePipeline {
    /// Validate the configuration and build the per-pixel ray lookup.
    pub fn new(
        config: PipelineConfig,
        camera: &PinholeCamera,
        width: usize,
        height: usize,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let blend = BlendSize::from_config(config.blend_size).expect("validated above");
        let rays = RayMap::build(camera, width, height);
        let detector = RingDetector::new(config.fast_threshold, config.fast_ring);
        let generator = DescriptorGenerator::new(blend);
        let solver = PoseSolver::new(config.iterations, config.inlier_cutoff);
        Ok(PosePipeline {
            config,
            rays,
            detector,
            generator,
            solver,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn rays(&self) -> &RayMap {
        &self.rays
    }

    /// Run the full pipeline on one frame pair.
    pub fn process(
        &self,
        frame1: &FrameInput,
        frame2: &FrameInput,
    ) -> Result<PoseEstimate, PipelineError> {
        self.check_frame(frame1)?;
        self.check_frame(frame2)?;

        let mut counts = StageCounts::default();
        let started = Instant::now();

        let (points1, descs1) = self.extract(frame1, 0, &mut counts);
        let (points2, descs2) = self.extract(frame2, 1, &mut counts);

        let t = Instant::now();
        let forest = DescriptorForest::build(
            &descs1,
            self.config.tree_leaves,
            self.config.tree_levels,
        );
        log::debug!("forest build: {} us", t.elapsed().as_micros());

        let t = Instant::now();
        let matches = forest.query(
            &descs2,
            self.config.max_error,
            self.config.rotate_descriptors,
        );
        counts.matches = matches.len();
        log::debug!(
            "index query: {} us, {} matches",
            t.elapsed().as_micros(),
            matches.len()
        );

        let corrs = form_correspondences(&matches, &points1, &points2, &self.rays, frame1.depth);
        counts.correspondences = corrs.len();

        let sets = sample_hypotheses(&corrs, self.config.hypotheses);
        counts.hypotheses = sets.len();

        let t = Instant::now();
        let solved: SolveResult = self.solver.solve(&corrs, &sets);
        log::debug!(
            "solve+score {} hypotheses: {} us",
            sets.len(),
            t.elapsed().as_micros()
        );

        let pose = solved.best_pose();
        let reprojected = reproject(&corrs, &pose);

        log::info!(
            "pipeline: {} us, {} matches, best score {:.1}",
            started.elapsed().as_micros(),
            counts.matches,
            solved.best_score()
        );

        Ok(PoseEstimate {
            pose,
            points: [points1, points2],
            descriptors: [descs1, descs2],
            matches,
            correspondences: corrs,
            best_score: solved.best_score(),
            best_index: solved.best_index,
            scores: solved.scores,
            reprojected,
            counts,
        })
    }

    fn check_frame(&self, frame: &FrameInput) -> Result<(), PipelineError> {
        for (w, h) in [
            (frame.gray.width(), frame.gray.height()),
            (frame.depth.width(), frame.depth.height()),
        ] {
            if w != self.rays.width() || h != self.rays.height() {
                return Err(PipelineError::FrameSize {
                    want_w: self.rays.width(),
                    want_h: self.rays.height(),
                    got_w: w,
                    got_h: h,
                });
            }
        }
        Ok(())
    }

    /// Frame-local stages: cull, depth filter, ring test, descriptors,
    /// clip. Returns the final point list and clipped descriptor list.
    fn extract(
        &self,
        frame: &FrameInput,
        slot: usize,
        counts: &mut StageCounts,
    ) -> (Vec<Point>, Vec<Descriptor>) {
        let t = Instant::now();
        let candidates = cull_candidates(frame.gray, self.config.fast_threshold);
        counts.candidates[slot] = candidates.len();

        let filtered = filter_by_depth(&candidates, frame.depth);
        counts.depth_filtered[slot] = filtered.len();

        let corners = self
            .detector
            .detect(frame.gray, &filtered, self.config.max_corners);
        counts.corners[slot] = corners.len();

        let mut descriptors = self.generator.describe_all(frame.gray, &corners);
        clip_bits(&mut descriptors, self.config.max_bits);
        counts.descriptors[slot] = descriptors.len();

        log::debug!(
            "frame {}: {} candidates, {} after depth, {} corners, {} descriptors, {} us",
            slot + 1,
            counts.candidates[slot],
            counts.depth_filtered[slot],
            counts.corners[slot],
            counts.descriptors[slot],
            t.elapsed().as_micros()
        );

        (corners, descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PipelineConfig {
        // Smaller batch so debug-mode tests stay fast; algorithmic
        // parameters keep their defaults.
        PipelineConfig {
            hypotheses: 256,
            ..Default::default()
        }
    }

    fn identity_camera() -> PinholeCamera {
        PinholeCamera::new(1.0, 1.0, 0.0, 0.0)
    }

    fn hash(mut s: u32) -> u32 {
        s ^= s << 13;
        s ^= s >> 17;
        s ^= s << 5;
        s
    }

    /// Scene stamped with unique high-contrast 4×4 patches — enough
    /// guaranteed ring corners to fill descriptor tiles, and distinct
    /// descriptors so matching cannot alias between patches.
    fn scene(w: usize, h: usize) -> (Image<u8>, Image<f32>) {
        let mut gray = Image::<u8>::from_vec(w, h, vec![30u8; w * h]);
        let mut k = 0u32;
        let mut y = 10;
        while y + 14 < h {
            let mut x = 10;
            while x + 14 < w {
                for dy in 0..4u32 {
                    for dx in 0..4u32 {
                        let v = 80 + hash(k * 131 + dy * 4 + dx + 1) % 150;
                        gray.set(x + dx as usize, y + dy as usize, v as u8);
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

    #[test]
    fn default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn bad_configs_are_rejected() {
        let mut c = PipelineConfig::default();
        c.blend_size = 3;
        assert!(matches!(c.validate(), Err(ConfigError::Blend(3))));

        let mut c = PipelineConfig::default();
        c.tree_leaves = 100;
        assert!(matches!(c.validate(), Err(ConfigError::Leaves(100))));

        let mut c = PipelineConfig::default();
        c.tree_levels = 12;
        assert!(matches!(c.validate(), Err(ConfigError::Levels { .. })));

        let mut c = PipelineConfig::default();
        c.fast_ring = 13;
        assert!(matches!(c.validate(), Err(ConfigError::Ring(13))));

        let mut c = PipelineConfig::default();
        c.inlier_cutoff = f32::NAN;
        assert!(matches!(c.validate(), Err(ConfigError::Cutoff(_))));
    }

    #[test]
    fn wrong_frame_size_is_rejected() {
        let pipeline =
            PosePipeline::new(test_config(), &identity_camera(), 64, 64).unwrap();
        let (gray, depth) = scene(96, 96);
        let frame = FrameInput {
            gray: &gray,
            depth: &depth,
        };
        let err = pipeline.process(&frame, &frame).unwrap_err();
        assert!(matches!(err, PipelineError::FrameSize { .. }));
    }

    #[test]
    fn identical_frames_give_identity_pose() {
        let (gray, depth) = scene(96, 96);
        let frame = FrameInput {
            gray: &gray,
            depth: &depth,
        };
        let pipeline =
            PosePipeline::new(test_config(), &identity_camera(), 96, 96).unwrap();
        let est = pipeline.process(&frame, &frame).unwrap();

        assert!(est.counts.corners[0] > 0, "scene produced no corners");
        assert!(est.counts.matches > 0, "no matches on identical frames");
        let best = est.pose;
        for i in 0..3 {
            for j in 0..4 {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (best[(i, j)] - expect).abs() < 1e-3,
                    "pose[{i}][{j}] = {}",
                    best[(i, j)]
                );
            }
        }
    }

    #[test]
    fn counts_respect_capacities_and_chain_order() {
        let (gray, depth) = scene(96, 96);
        let frame = FrameInput {
            gray: &gray,
            depth: &depth,
        };
        let cfg = test_config();
        let pipeline = PosePipeline::new(cfg.clone(), &identity_camera(), 96, 96).unwrap();
        let est = pipeline.process(&frame, &frame).unwrap();

        for slot in 0..2 {
            let c = &est.counts;
            assert!(c.depth_filtered[slot] <= c.candidates[slot]);
            assert!(c.corners[slot] <= c.depth_filtered[slot]);
            assert!(c.corners[slot] <= cfg.max_corners);
            assert!(c.descriptors[slot] <= c.corners[slot]);
            assert_eq!(c.descriptors[slot] % 64, 0, "tile rounding violated");
        }
        assert!(est.counts.matches <= est.counts.descriptors[1]);
        assert_eq!(est.counts.correspondences, est.counts.matches);
        assert!(est.counts.hypotheses <= cfg.hypotheses);
        assert_eq!(est.reprojected.len(), est.correspondences.len());
        assert_eq!(est.scores.len(), est.counts.hypotheses);
    }

    #[test]
    fn processing_is_idempotent() {
        let (gray, depth) = scene(96, 96);
        let frame = FrameInput {
            gray: &gray,
            depth: &depth,
        };
        let pipeline =
            PosePipeline::new(test_config(), &identity_camera(), 96, 96).unwrap();
        let a = pipeline.process(&frame, &frame).unwrap();
        let b = pipeline.process(&frame, &frame).unwrap();
        assert_eq!(a.points[0], b.points[0]);
        assert_eq!(a.points[1], b.points[1]);
        assert_eq!(a.matches, b.matches);
        assert_eq!(a.scores, b.scores);
        assert_eq!(a.best_index, b.best_index);
        assert_eq!(a.pose, b.pose);
    }
}
