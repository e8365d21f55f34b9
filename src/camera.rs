// camera.rs — Pinhole camera model and the per-pixel ray lookup table.
//
// The calibration source is a plain text stream of four whitespace-
// separated values `fx fy cx cy`, consumed exactly once at setup. File
// handling and richer calibration formats are the caller's concern; this
// module only needs something implementing `BufRead`.
//
// The `RayMap` is the dense per-pixel lookup the rest of the pipeline
// uses: for every pixel (x, y) it stores the normalized ray (u, v) that
// the camera unprojects that pixel to. It is computed once and uploaded
// to the device unchanged, so CPU and GPU read identical values.

use std::io::BufRead;

use thiserror::Error;

/// Errors from calibration parsing and ray-map construction.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("failed to read calibration stream: {0}")]
    Read(#[from] std::io::Error),
    #[error("calibration stream ended after {0} of 4 values")]
    Truncated(usize),
    #[error("calibration value {index} ({text:?}) is not a number")]
    Malformed { index: usize, text: String },
    #[error("focal length must be non-zero (fx={fx}, fy={fy})")]
    ZeroFocal { fx: f32, fy: f32 },
}

/// Pinhole camera intrinsics.
#[derive(Debug, Clone, Copy)]
pub struct PinholeCamera {
    /// Focal length in pixels (x-axis).
    pub fx: f32,
    /// Focal length in pixels (y-axis).
    pub fy: f32,
    /// Principal point x (pixels).
    pub cx: f32,
    /// Principal point y (pixels).
    pub cy: f32,
}

impl PinholeCamera {
    /// Construct from explicit parameters.
    pub fn new(fx: f32, fy: f32, cx: f32, cy: f32) -> Self {
        PinholeCamera { fx, fy, cx, cy }
    }

    /// Consume a calibration text stream: four whitespace-separated
    /// values `fx fy cx cy`. Anything after the fourth value is ignored.
    pub fn from_reader(reader: impl BufRead) -> Result<Self, CameraError> {
        let mut values = [0.0f32; 4];
        let mut count = 0;

        for line in reader.lines() {
            let line = line?;
            for token in line.split_whitespace() {
                if count == 4 {
                    break;
                }
                values[count] = token.parse().map_err(|_| CameraError::Malformed {
                    index: count,
                    text: token.to_string(),
                })?;
                count += 1;
            }
        }

        if count < 4 {
            return Err(CameraError::Truncated(count));
        }

        let [fx, fy, cx, cy] = values;
        if fx == 0.0 || fy == 0.0 {
            return Err(CameraError::ZeroFocal { fx, fy });
        }

        Ok(PinholeCamera { fx, fy, cx, cy })
    }

    /// Unproject pixel coordinates to a normalized ray:
    /// u = (x - cx) / fx, v = (y - cy) / fy.
    #[inline]
    pub fn unproject(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.cx) / self.fx, (y - self.cy) / self.fy)
    }

    /// Project a normalized ray back to pixel coordinates.
    #[inline]
    pub fn project(&self, u: f32, v: f32) -> (f32, f32) {
        (u * self.fx + self.cx, v * self.fy + self.cy)
    }
}

/// Dense per-pixel ray lookup: pixel (x, y) → normalized ray (u, v).
///
/// Stored as two planes (u then v) so the whole table can be handed to
/// the GPU as one flat buffer without interleaving.
#[derive(Debug, Clone)]
pub struct RayMap {
    width: usize,
    height: usize,
    u: Vec<f32>,
    v: Vec<f32>,
}

impl RayMap {
    /// Build the lookup for every pixel of a width×height frame.
    pub fn build(camera: &PinholeCamera, width: usize, height: usize) -> Self {
        let mut u = Vec::with_capacity(width * height);
        let mut v = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let (ru, rv) = camera.unproject(x as f32, y as f32);
                u.push(ru);
                v.push(rv);
            }
        }
        RayMap { width, height, u, v }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// The normalized ray for pixel (x, y).
    ///
    /// # Panics
    /// Panics if (x, y) is out of bounds.
    #[inline]
    pub fn ray(&self, x: usize, y: usize) -> (f32, f32) {
        assert!(
            x < self.width && y < self.height,
            "ray lookup ({x},{y}) out of bounds for {}x{}",
            self.width,
            self.height
        );
        let i = y * self.width + x;
        (self.u[i], self.v[i])
    }

    /// Flat interleaved (u, v) pairs in row-major pixel order, for the
    /// GPU upload path.
    pub fn interleaved(&self) -> Vec<[f32; 2]> {
        self.u
            .iter()
            .zip(self.v.iter())
            .map(|(&u, &v)| [u, v])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Cursor;

    #[test]
    fn parse_calibration_stream() {
        let cam = PinholeCamera::from_reader(Cursor::new("525.0 525.0\n319.5 239.5\n")).unwrap();
        assert_eq!(cam.fx, 525.0);
        assert_eq!(cam.fy, 525.0);
        assert_eq!(cam.cx, 319.5);
        assert_eq!(cam.cy, 239.5);
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let err = PinholeCamera::from_reader(Cursor::new("525.0 525.0")).unwrap_err();
        assert!(matches!(err, CameraError::Truncated(2)));
    }

    #[test]
    fn malformed_value_is_rejected() {
        let err = PinholeCamera::from_reader(Cursor::new("525.0 abc 1 2")).unwrap_err();
        assert!(matches!(err, CameraError::Malformed { index: 1, .. }));
    }

    #[test]
    fn zero_focal_is_rejected() {
        let err = PinholeCamera::from_reader(Cursor::new("0 525 319.5 239.5")).unwrap_err();
        assert!(matches!(err, CameraError::ZeroFocal { .. }));
    }

    #[test]
    fn unproject_project_round_trip() {
        let cam = PinholeCamera::new(525.0, 520.0, 319.5, 239.5);
        let (u, v) = cam.unproject(100.0, 200.0);
        let (x, y) = cam.project(u, v);
        assert_relative_eq!(x, 100.0, epsilon = 1e-4);
        assert_relative_eq!(y, 200.0, epsilon = 1e-4);
    }

    #[test]
    fn ray_map_matches_unproject() {
        let cam = PinholeCamera::new(100.0, 100.0, 8.0, 6.0);
        let map = RayMap::build(&cam, 16, 12);
        for &(x, y) in &[(0usize, 0usize), (8, 6), (15, 11)] {
            let (mu, mv) = map.ray(x, y);
            let (cu, cv) = cam.unproject(x as f32, y as f32);
            assert_eq!(mu, cu);
            assert_eq!(mv, cv);
        }
    }

    #[test]
    fn identity_camera_rays_are_pixel_offsets() {
        // Unit focal length, zero principal point: the ray is the pixel.
        let cam = PinholeCamera::new(1.0, 1.0, 0.0, 0.0);
        let map = RayMap::build(&cam, 4, 4);
        assert_eq!(map.ray(3, 2), (3.0, 2.0));
    }
}
