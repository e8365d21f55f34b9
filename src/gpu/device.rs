// gpu/device.rs — wgpu device abstraction.
//
// Responsibilities:
//   - Enumerate Vulkan adapters and reject software rasterizers.
//   - Own one device + one in-order queue per adapter. A GpuDevice is
//     never shared between pipeline instances; `enumerate()` builds a
//     fully independent instance (its own wgpu::Instance included) per
//     physical adapter so the per-device driver can fail one device
//     without touching the others.
//   - Provide the dispatch geometry helpers every kernel uses.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` uses power-preference heuristics that
// may grab llvmpipe/softpipe where the software renderer appears as a
// valid Vulkan device. We enumerate explicitly and prefer real hardware,
// falling back to whatever exists only as a last resort (the adapter
// name is logged so the choice is visible).

use std::fmt;

use thiserror::Error;

/// 2D workgroup used by the per-pixel kernels. 16×8 = 128 invocations:
/// four 32-wide warps on NVIDIA, two 64-wide waves on AMD, and the
/// 16-wide x dimension aligns with row-major image cache lines.
pub const IMAGE_WORKGROUP: (u32, u32) = (16, 8);

/// 1D workgroup used by the per-point list kernels. Matches
/// [`crate::descriptor::DESCRIPTOR_TILE`]: descriptor generation rounds
/// its count down to whole tiles of this size.
pub const LIST_WORKGROUP: u32 = 64;

/// Errors from device acquisition and backend checks.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error(
        "no suitable Vulkan adapter found (only CPU/software renderers visible); \
         ensure `vulkaninfo` lists a real GPU"
    )]
    NoSuitableAdapter,
    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),
    /// A backend validation or launch failure surfaced at the explicit
    /// check point. Fatal to the current pipeline instance.
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Cached adapter information for logging and for the multi-device
/// driver's per-device reporting.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?}, {:?})",
            self.name, self.backend, self.device_type
        )
    }
}

/// The compute context: one adapter, one device, one in-order queue.
///
/// Expensive to create (Vulkan instance + device initialization);
/// create once and drive every step through it. All work submitted to
/// `queue` executes in submission order — step ordering is exactly
/// enqueue order, which the pipeline relies on.
///
/// # Field drop order
/// Rust drops struct fields in declaration order. `_instance` is
/// declared last so the `wgpu::Instance` outlives `device` and `queue`.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: AdapterInfo,
    /// Keeps the `wgpu::Instance` alive until `device` and `queue` are
    /// dropped. Never accessed directly.
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Create a context on the best available Vulkan adapter.
    pub fn new() -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async(AdapterPick::Best))
    }

    /// Create one fully independent context per physical adapter, best
    /// first. Each context owns its own wgpu::Instance, so instances
    /// share no state whatsoever and one device's failure cannot reach
    /// another's.
    pub fn enumerate() -> Result<Vec<GpuDevice>, GpuError> {
        let count = {
            let instance = make_instance();
            let adapters = ranked_adapters(&instance);
            for a in &adapters {
                let info = a.get_info();
                log::info!(
                    "Vulkan adapter: {} ({:?}, {:?})",
                    info.name,
                    info.backend,
                    info.device_type
                );
            }
            adapters.len()
        };

        if count == 0 {
            return Err(GpuError::NoSuitableAdapter);
        }

        let mut devices = Vec::with_capacity(count);
        for index in 0..count {
            devices.push(pollster::block_on(Self::init_async(AdapterPick::Index(
                index,
            )))?);
        }
        Ok(devices)
    }

    async fn init_async(pick: AdapterPick) -> Result<Self, GpuError> {
        let instance = make_instance();

        let adapters = ranked_adapters(&instance);
        let adapter = match pick {
            AdapterPick::Best => adapters.into_iter().next(),
            AdapterPick::Index(i) => adapters.into_iter().nth(i),
        }
        .ok_or(GpuError::NoSuitableAdapter)?;

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };
        log::info!("using adapter: {adapter_info}");

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("rgbd-pose"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await?;

        Ok(GpuDevice {
            device,
            queue,
            adapter_info,
            _instance: instance,
        })
    }

    /// Workgroup counts covering a width×height image with
    /// [`IMAGE_WORKGROUP`], using ceiling division. Kernels guard
    /// out-of-bounds global ids.
    pub fn image_dispatch(&self, img_w: u32, img_h: u32) -> (u32, u32) {
        let (wx, wy) = IMAGE_WORKGROUP;
        ((img_w + wx - 1) / wx, (img_h + wy - 1) / wy)
    }

    /// Workgroup count covering an n-element list with
    /// [`LIST_WORKGROUP`] lanes per group.
    pub fn list_dispatch(&self, n: u32) -> u32 {
        (n + LIST_WORKGROUP - 1) / LIST_WORKGROUP
    }

    /// Block until every submitted command has completed.
    ///
    /// The only synchronization point besides buffer readbacks; the
    /// pipeline itself never waits between steps.
    pub fn wait_idle(&self) {
        self.device.poll(wgpu::Maintain::Wait);
    }

    /// Open a validation-error scope. Pair with [`Self::check`].
    pub fn begin_check(&self) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
    }

    /// Close the error scope, surfacing any backend failure recorded
    /// since [`Self::begin_check`]. This is the "checked later, fatal to
    /// the instance" error path: nothing between the two calls blocks on
    /// individual steps.
    pub fn check(&self) -> Result<(), GpuError> {
        match pollster::block_on(self.device.pop_error_scope()) {
            None => Ok(()),
            Some(e) => Err(GpuError::Backend(e.to_string())),
        }
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuDevice {{ adapter: {} }}", self.adapter_info)
    }
}

enum AdapterPick {
    Best,
    Index(usize),
}

fn make_instance() -> wgpu::Instance {
    let flags = if cfg!(debug_assertions) {
        wgpu::InstanceFlags::VALIDATION
            | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
    } else {
        wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
    };

    wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::VULKAN,
        flags,
        ..Default::default()
    })
}

/// All Vulkan adapters, real hardware first, software rasterizers last.
fn ranked_adapters(instance: &wgpu::Instance) -> Vec<wgpu::Adapter> {
    let mut adapters: Vec<wgpu::Adapter> =
        instance.enumerate_adapters(wgpu::Backends::VULKAN);
    adapters.sort_by_key(|a| match a.get_info().device_type {
        wgpu::DeviceType::DiscreteGpu => 0,
        wgpu::DeviceType::IntegratedGpu => 1,
        wgpu::DeviceType::VirtualGpu => 2,
        wgpu::DeviceType::Other => 3,
        wgpu::DeviceType::Cpu => 4,
    });
    adapters
}

#[cfg(test)]
mod tests {
    use super::*;

    // Dispatch geometry is pure arithmetic — no GPU needed. The
    // device-creation paths are exercised by the ignored GPU tests in
    // gpu::pipeline.

    struct Geometry;

    impl Geometry {
        fn image_dispatch(&self, w: u32, h: u32) -> (u32, u32) {
            let (wx, wy) = IMAGE_WORKGROUP;
            ((w + wx - 1) / wx, (h + wy - 1) / wy)
        }
    }

    #[test]
    fn image_dispatch_exact_multiples() {
        let g = Geometry;
        assert_eq!(g.image_dispatch(640, 480), (40, 60));
    }

    #[test]
    fn image_dispatch_rounds_up() {
        let g = Geometry;
        // 100/16 = 6.25 → 7; 100/8 = 12.5 → 13.
        assert_eq!(g.image_dispatch(100, 100), (7, 13));
    }

    #[test]
    fn list_workgroup_matches_descriptor_tile() {
        assert_eq!(LIST_WORKGROUP as usize, crate::descriptor::DESCRIPTOR_TILE);
    }
}
