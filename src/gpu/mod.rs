// gpu/mod.rs — wgpu compute backend.
//
// Device mirror of the CPU pipeline in the parent crate. The CPU
// implementations remain the authoritative reference — every kernel here
// is validated against them, and the GPU integration tests are gated
// behind `#[ignore = "requires a real Vulkan GPU"]` so the default test
// run needs no adapter.
//
// Layout:
//   device.rs     — adapter enumeration, device + in-order queue
//   buffer.rs     — GpuVec (capacity/count storage buffers), image upload
//   step.rs       — execute()/measure() timing contract
//   extract.rs    — cull, depth filter, ring test kernels
//   descriptor.rs — descriptor generation + bit clip kernels
//   matching.rs   — forest upload + tree query kernel
//   solve.rs      — correspondence, sampling and batched solve kernels
//   pipeline.rs   — the fixed-order pipeline + multi-device driver

pub mod buffer;
pub mod descriptor;
pub mod device;
pub mod extract;
pub mod matching;
pub mod pipeline;
pub mod solve;
pub mod step;
