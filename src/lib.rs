// rgbd-pose: 6-DoF pose estimation between two RGB-D frames.
//
// Pipeline: corner extraction → binary ring descriptors → hierarchical
// descriptor index → matched correspondences → batched RANSAC-style
// Gauss-Newton pose solve → scoring and selection.
//
// Every stage exists twice: a CPU reference implementation (these
// modules, fully tested, deterministic) and a wgpu compute mirror
// (`gpu`) validated against it. Start with `pipeline::PosePipeline` or
// `gpu::pipeline::GpuPosePipeline`.

pub mod camera;
pub mod correspond;
pub mod descriptor;
pub mod fast;
pub mod gpu;
pub mod image;
pub mod pipeline;
pub mod pose;
pub mod tree;
