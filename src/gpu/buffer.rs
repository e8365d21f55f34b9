// gpu/buffer.rs — Device-resident buffer-states.
//
// `GpuVec<T>` is the pipeline's central abstraction: a storage array of
// fixed capacity plus a *valid count* n ≤ cap saying how much of it is
// meaningful. The count lives in two places that the step protocol keeps
// coherent:
//
//   - a 4-byte device buffer, bound as `atomic<u32>` by append kernels
//     (reset to 0 by the producing step before it runs, incremented per
//     accepted element, clamped to cap on readback — the kernel guard
//     `slot < cap` drops writes past the end, so the tail is never
//     touched);
//   - a host-side mirror, updated by `set_len` (producer knows the count
//     up front) or `sync_len` (producer counted on the device).
//
// Capacity never changes after allocation; every buffer is created once
// at pipeline construction for the worst case and reused each frame.
// Host transfers move only the first n elements; elements past n are
// undefined and never read.
//
// Image upload compacts rows into a staging buffer whose bytes_per_row
// is 256-aligned, then runs copy_buffer_to_texture on the queue.

use std::cell::Cell;
use std::marker::PhantomData;

use wgpu::util::DeviceExt;

use crate::gpu::device::GpuDevice;
use crate::image::Image;

/// wgpu requires buffer↔texture copies to use a bytes_per_row that is a
/// multiple of this value.
pub(crate) const COPY_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

/// Round `value` up to the next multiple of `alignment`.
#[inline]
pub(crate) fn align_to(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) / alignment * alignment
}

/// Synchronously read `size` bytes from a COPY_SRC buffer.
///
/// Expensive: stalls the queue. Used by count syncs and host readbacks
/// only — never between enqueued steps.
pub(crate) fn read_bytes(gpu: &GpuDevice, src: &wgpu::Buffer, size: u64) -> Vec<u8> {
    let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("readback staging"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback"),
        });
    encoder.copy_buffer_to_buffer(src, 0, &staging, 0, size);
    gpu.queue.submit(std::iter::once(encoder.finish()));

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        let _ = tx.send(r);
    });
    gpu.device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .expect("readback map callback never fired")
        .expect("readback map failed");

    let mapped = slice.get_mapped_range();
    let out = mapped.to_vec();
    drop(mapped);
    staging.unmap();
    out
}

/// A typed device array with capacity/count semantics.
pub struct GpuVec<T: bytemuck::Pod> {
    buffer: wgpu::Buffer,
    count_buffer: wgpu::Buffer,
    cap: u32,
    len: Cell<u32>,
    _marker: PhantomData<T>,
}

impl<T: bytemuck::Pod> GpuVec<T> {
    /// Allocate for `cap` elements. The count starts at 0.
    pub fn new(gpu: &GpuDevice, cap: u32, label: &str) -> Self {
        assert!(cap > 0, "GpuVec {label:?} needs a non-zero capacity");
        let buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: (cap as u64) * std::mem::size_of::<T>() as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let count_buffer = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::bytes_of(&0u32),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
        });
        GpuVec {
            buffer,
            count_buffer,
            cap,
            len: Cell::new(0),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn cap(&self) -> u32 {
        self.cap
    }

    /// The host-side mirror of the valid count.
    #[inline]
    pub fn len(&self) -> u32 {
        self.len.get()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len.get() == 0
    }

    /// The element storage, for bind group construction.
    #[inline]
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// The 4-byte count cell, for append kernels.
    #[inline]
    pub fn count_buffer(&self) -> &wgpu::Buffer {
        &self.count_buffer
    }

    /// Overwrite the count on device and host. Producers that know
    /// their output count call this; append producers call
    /// [`Self::reset`] first and [`Self::sync_len`] after.
    ///
    /// # Panics
    /// Panics if `n > cap` — a malformed producer, not a recoverable
    /// condition.
    pub fn set_len(&self, gpu: &GpuDevice, n: u32) {
        assert!(n <= self.cap, "count {n} exceeds capacity {}", self.cap);
        gpu.queue
            .write_buffer(&self.count_buffer, 0, bytemuck::bytes_of(&n));
        self.len.set(n);
    }

    /// Reset the count to zero ahead of an append kernel.
    pub fn reset(&self, gpu: &GpuDevice) {
        self.set_len(gpu, 0);
    }

    /// Read the device count back, clamp to capacity (append kernels
    /// may bump the counter past cap while dropping the writes), update
    /// the host mirror and return it.
    pub fn sync_len(&self, gpu: &GpuDevice) -> u32 {
        let bytes = read_bytes(gpu, &self.count_buffer, 4);
        let raw = u32::from_le_bytes(bytes[..4].try_into().expect("4-byte count"));
        let n = raw.min(self.cap);
        self.len.set(n);
        n
    }

    /// Upload `data` and set the count to its length.
    ///
    /// # Panics
    /// Panics if `data.len() > cap`.
    pub fn write(&self, gpu: &GpuDevice, data: &[T]) {
        assert!(
            data.len() as u32 <= self.cap,
            "write of {} elements exceeds capacity {}",
            data.len(),
            self.cap
        );
        if !data.is_empty() {
            gpu.queue
                .write_buffer(&self.buffer, 0, bytemuck::cast_slice(data));
        }
        self.set_len(gpu, data.len() as u32);
    }

    /// Read the first `len()` elements back to the host.
    pub fn read(&self, gpu: &GpuDevice) -> Vec<T> {
        let n = self.len.get() as usize;
        if n == 0 {
            return Vec::new();
        }
        let bytes = read_bytes(
            gpu,
            &self.buffer,
            (n * std::mem::size_of::<T>()) as u64,
        );
        // The readback Vec<u8> carries no alignment guarantee, so
        // elements are decoded per-chunk rather than slice-cast.
        bytes
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }
}

/// A gray frame resident on the GPU as an R8Unorm texture.
///
/// Shaders read it as `texture_2d<f32>` with values in [0, 1]; kernels
/// rescale by 255 so thresholds match the CPU's integer math exactly.
pub struct GpuGrayImage {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
}

impl GpuGrayImage {
    /// Allocate for a width×height frame.
    pub fn new(gpu: &GpuDevice, width: u32, height: u32) -> Self {
        let (texture, view) = make_texture(gpu, width, height, wgpu::TextureFormat::R8Unorm);
        GpuGrayImage {
            texture,
            view,
            width,
            height,
        }
    }

    /// Upload a CPU frame, compacting stride padding into a 256-aligned
    /// staging buffer. Enqueued on the in-order queue like any step.
    ///
    /// # Panics
    /// Panics if the frame size differs from the allocation.
    pub fn upload(&self, gpu: &GpuDevice, src: &Image<u8>) {
        assert_eq!(
            (src.width() as u32, src.height() as u32),
            (self.width, self.height),
            "frame size mismatch"
        );
        let aligned = align_to(self.width, COPY_ALIGNMENT);
        let mut staging = vec![0u8; (aligned * self.height) as usize];
        let data = src.as_slice();
        for y in 0..self.height as usize {
            let s = y * src.stride();
            let d = y * aligned as usize;
            staging[d..d + self.width as usize]
                .copy_from_slice(&data[s..s + self.width as usize]);
        }
        upload_texture(gpu, &self.texture, &staging, self.width, self.height, aligned);
    }

    /// Read the texture back (tests only — stalls the queue).
    pub fn readback(&self, gpu: &GpuDevice) -> Vec<u8> {
        let aligned = align_to(self.width, COPY_ALIGNMENT);
        let size = (aligned * self.height) as u64;

        let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("gray readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("gray readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(aligned),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        gpu.device.poll(wgpu::Maintain::Wait);
        rx.recv().expect("readback channel closed").expect("map failed");

        let mapped = slice.get_mapped_range();
        let mut out = vec![0u8; (self.width * self.height) as usize];
        for y in 0..self.height as usize {
            let s = y * aligned as usize;
            let d = y * self.width as usize;
            out[d..d + self.width as usize]
                .copy_from_slice(&mapped[s..s + self.width as usize]);
        }
        drop(mapped);
        staging.unmap();
        out
    }
}

/// A depth frame resident on the GPU as an R32Float texture.
pub struct GpuDepthImage {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
}

impl GpuDepthImage {
    pub fn new(gpu: &GpuDevice, width: u32, height: u32) -> Self {
        let (texture, view) = make_texture(gpu, width, height, wgpu::TextureFormat::R32Float);
        GpuDepthImage {
            texture,
            view,
            width,
            height,
        }
    }

    /// Upload a CPU depth frame (f32 texels, 4-byte rows).
    ///
    /// # Panics
    /// Panics if the frame size differs from the allocation.
    pub fn upload(&self, gpu: &GpuDevice, src: &Image<f32>) {
        assert_eq!(
            (src.width() as u32, src.height() as u32),
            (self.width, self.height),
            "frame size mismatch"
        );
        let row_bytes = self.width * 4;
        let aligned = align_to(row_bytes, COPY_ALIGNMENT);
        let mut staging = vec![0u8; (aligned * self.height) as usize];
        for y in 0..self.height as usize {
            let row = bytemuck::cast_slice::<f32, u8>(src.row(y));
            let d = y * aligned as usize;
            staging[d..d + row_bytes as usize].copy_from_slice(row);
        }
        upload_texture(gpu, &self.texture, &staging, self.width, self.height, aligned);
    }
}

fn make_texture(
    gpu: &GpuDevice,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
        label: Some("frame"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

fn upload_texture(
    gpu: &GpuDevice,
    texture: &wgpu::Texture,
    staging: &[u8],
    width: u32,
    height: u32,
    bytes_per_row: u32,
) {
    let staging_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("upload staging"),
        contents: staging,
        usage: wgpu::BufferUsages::COPY_SRC,
    });

    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("frame upload"),
        });
    encoder.copy_buffer_to_texture(
        wgpu::ImageCopyBuffer {
            buffer: &staging_buf,
            layout: wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(height),
            },
        },
        wgpu::ImageCopyTexture {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
    gpu.queue.submit(std::iter::once(encoder.finish()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_to_rounds_up() {
        assert_eq!(align_to(1, 256), 256);
        assert_eq!(align_to(255, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(257, 256), 512);
        assert_eq!(align_to(640, 256), 768);
    }

    #[test]
    fn align_to_zero_stays_zero() {
        assert_eq!(align_to(0, 256), 0);
    }

    // Staging-row compaction logic, reproduced without wgpu: the same
    // loop GpuGrayImage::upload runs.
    #[test]
    fn staging_compaction_strips_stride_padding() {
        let img = Image::<u8>::from_vec_with_stride(
            3,
            2,
            5,
            vec![
                10, 20, 30, 0, 0, //
                40, 50, 60, 0, 0,
            ],
        );
        let aligned = align_to(3, 256) as usize;
        let mut staging = vec![0u8; aligned * 2];
        for y in 0..2usize {
            let s = y * img.stride();
            let d = y * aligned;
            staging[d..d + 3].copy_from_slice(&img.as_slice()[s..s + 3]);
        }
        assert_eq!(&staging[0..3], &[10, 20, 30]);
        assert_eq!(&staging[aligned..aligned + 3], &[40, 50, 60]);
        assert!(staging[3..aligned].iter().all(|&b| b == 0));
    }
}
