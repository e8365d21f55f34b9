// fast.rs — Three-stage corner extraction.
//
// The pipeline never scans the full image with the expensive ring test.
// Extraction is staged, each stage consuming the previous stage's point
// list and overwriting its own output count:
//
//   1. cull_candidates  — cheap 4-sample cardinal test over every pixel.
//      Allowed to overestimate; it only exists to discard the obviously
//      flat regions before the per-point stages.
//   2. filter_by_depth  — drop candidates whose depth sample is missing
//      (<= 0 or non-finite); such points cannot contribute an inverse
//      depth later.
//   3. RingDetector     — full 16-point Bresenham circle segment test
//      over the survivors, configurable threshold and arc length.
//
// Reference: Rosten & Drummond, "Machine learning for high-speed corner
// detection" (ECCV 2006) for the segment test.

use crate::image::Image;

/// Bresenham circle of radius 3: 16 (dx, dy) offsets.
/// Listed clockwise starting from 12 o'clock, matching Rosten's convention.
const CIRCLE_OFFSETS: [(isize, isize); 16] = [
    ( 0, -3), ( 1, -3), ( 2, -2), ( 3, -1),
    ( 3,  0), ( 3,  1), ( 2,  2), ( 1,  3),
    ( 0,  3), (-1,  3), (-2,  2), (-3,  1),
    (-3,  0), (-3, -1), (-2, -2), (-1, -3),
];

/// The 4 cardinal circle samples used by the coarse cull, in cyclic
/// order. A pixel survives only if two *adjacent* cardinals both differ
/// from the center by more than the threshold.
const CARDINAL_OFFSETS: [(isize, isize); 4] = [(0, 3), (3, 0), (0, -3), (-3, 0)];

/// An integer image location produced by the extraction stages.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    #[inline]
    pub fn new(x: i32, y: i32) -> Self {
        Point { x, y }
    }
}

/// Coarse candidate cull: keep pixels where two adjacent cardinal
/// samples both differ from the center by more than `threshold`.
///
/// This overestimates the corner set on purpose — every true ring corner
/// passes, plus some edges. Points are emitted in row-major order, which
/// keeps the whole extraction chain deterministic.
pub fn cull_candidates(image: &Image<u8>, threshold: i16) -> Vec<Point> {
    let w = image.width();
    let h = image.height();
    let mut points = Vec::new();

    // The cardinal samples reach ±3 pixels.
    if w <= 6 || h <= 6 {
        return points;
    }

    for y in 3..(h - 3) {
        for x in 3..(w - 3) {
            // SAFETY: x in [3, w-3) and y in [3, h-3), offsets at most ±3.
            unsafe {
                let center = image.get_unchecked(x, y) as i16;

                let mut diff = [false; 4];
                for (i, &(dx, dy)) in CARDINAL_OFFSETS.iter().enumerate() {
                    let p = image.get_unchecked(
                        (x as isize + dx) as usize,
                        (y as isize + dy) as usize,
                    ) as i16;
                    diff[i] = (p - center).abs() > threshold;
                }

                let adjacent = (diff[0] && diff[1])
                    || (diff[1] && diff[2])
                    || (diff[2] && diff[3])
                    || (diff[3] && diff[0]);

                if adjacent {
                    points.push(Point::new(x as i32, y as i32));
                }
            }
        }
    }

    points
}

/// Drop candidates whose depth sample is unusable (<= 0 or non-finite).
///
/// The output preserves input order; its length is the new count.
pub fn filter_by_depth(candidates: &[Point], depth: &Image<f32>) -> Vec<Point> {
    candidates
        .iter()
        .copied()
        .filter(|p| {
            let d = depth.get(p.x as usize, p.y as usize);
            d.is_finite() && d > 0.0
        })
        .collect()
}

/// Segment-test corner detector over a candidate list.
///
/// A candidate is a corner if at least `ring` contiguous circle samples
/// are all brighter than center + threshold, or all darker than
/// center - threshold. The contiguity check wraps (sample 15 is adjacent
/// to sample 0).
pub struct RingDetector {
    /// Intensity difference threshold. Typical: 20–40 for u8 images.
    pub threshold: i16,
    /// Minimum contiguous arc length, in [9, 12].
    pub ring: usize,
}

impl RingDetector {
    /// # Panics
    /// Panics if `ring` is not in the range [9, 12].
    pub fn new(threshold: i16, ring: usize) -> Self {
        assert!(
            (9..=12).contains(&ring),
            "ring size must be 9..=12 (got {ring})"
        );
        RingDetector { threshold, ring }
    }

    /// Run the segment test over `candidates`, keeping at most
    /// `max_corners` accepted points (input order, truncated at the cap
    /// exactly like the fixed-capacity device buffer).
    pub fn detect(
        &self,
        image: &Image<u8>,
        candidates: &[Point],
        max_corners: usize,
    ) -> Vec<Point> {
        let mut corners = Vec::new();

        for &p in candidates {
            if corners.len() == max_corners {
                break;
            }
            if self.is_corner(image, p) {
                corners.push(p);
            }
        }

        corners
    }

    fn is_corner(&self, image: &Image<u8>, p: Point) -> bool {
        let x = p.x as usize;
        let y = p.y as usize;
        debug_assert!(
            x >= 3 && y >= 3 && x < image.width() - 3 && y < image.height() - 3,
            "candidate ({x},{y}) violates the 3-pixel border"
        );

        // SAFETY: candidates come from cull_candidates, which only emits
        // points at least 3 pixels from every border.
        unsafe {
            let center = image.get_unchecked(x, y) as i16;

            // Classify each circle sample: +1 brighter, -1 darker, 0 similar.
            let mut class = [0i8; 16];
            for (i, &(dx, dy)) in CIRCLE_OFFSETS.iter().enumerate() {
                let v = image.get_unchecked(
                    (x as isize + dx) as usize,
                    (y as isize + dy) as usize,
                ) as i16;
                class[i] = if v > center + self.threshold {
                    1
                } else if v < center - self.threshold {
                    -1
                } else {
                    0
                };
            }

            // Wrap-around run scan: walk 16 + ring entries so a run
            // crossing index 15 → 0 is still found.
            let mut run = 0usize;
            let mut run_class = 0i8;
            for i in 0..(16 + self.ring) {
                let c = class[i % 16];
                if c != 0 && c == run_class {
                    run += 1;
                    if run >= self.ring {
                        return true;
                    }
                } else {
                    run_class = c;
                    run = usize::from(c != 0);
                }
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flat background with one bright square; the square's outer
    /// corners are segment-test corners.
    fn square_image() -> Image<u8> {
        let mut img = Image::<u8>::from_vec(32, 32, vec![30u8; 32 * 32]);
        for y in 12..20 {
            for x in 12..20 {
                img.set(x, y, 220);
            }
        }
        img
    }

    #[test]
    fn flat_image_has_no_candidates() {
        let img = Image::<u8>::from_vec(32, 32, vec![128u8; 32 * 32]);
        assert!(cull_candidates(&img, 40).is_empty());
    }

    #[test]
    fn cull_overestimates_ring_corners() {
        let img = square_image();
        let candidates = cull_candidates(&img, 40);
        let corners = RingDetector::new(40, 9).detect(&img, &candidates, 2048);
        assert!(!corners.is_empty(), "square must produce corners");
        // Every ring corner must already be a candidate.
        for c in &corners {
            assert!(candidates.contains(c), "{c:?} missing from candidates");
        }
        assert!(candidates.len() >= corners.len());
    }

    #[test]
    fn extraction_is_deterministic() {
        let img = square_image();
        let a = cull_candidates(&img, 40);
        let b = cull_candidates(&img, 40);
        assert_eq!(a, b);

        let det = RingDetector::new(40, 9);
        assert_eq!(det.detect(&img, &a, 2048), det.detect(&img, &b, 2048));
    }

    #[test]
    fn depth_filter_drops_invalid_samples() {
        let points = vec![Point::new(1, 1), Point::new(2, 1), Point::new(3, 1)];
        let mut depth = Image::<f32>::new(8, 4);
        depth.set(1, 1, 1.5);
        depth.set(2, 1, 0.0); // missing
        depth.set(3, 1, f32::NAN); // invalid
        let kept = filter_by_depth(&points, &depth);
        assert_eq!(kept, vec![Point::new(1, 1)]);
    }

    #[test]
    fn corner_cap_truncates() {
        let img = square_image();
        let candidates = cull_candidates(&img, 40);
        let det = RingDetector::new(40, 9);
        let all = det.detect(&img, &candidates, 2048);
        assert!(all.len() > 1);
        let capped = det.detect(&img, &candidates, 1);
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0], all[0]);
    }

    #[test]
    fn edge_is_not_a_corner() {
        // A straight vertical edge: long bright runs exist on both sides
        // of the circle, but never >= 9 contiguous on one side only...
        // in fact a step edge yields runs of exactly 8. FAST-9 rejects it.
        let mut img = Image::<u8>::from_vec(32, 32, vec![30u8; 32 * 32]);
        for y in 0..32 {
            for x in 16..32 {
                img.set(x, y, 220);
            }
        }
        let candidates = cull_candidates(&img, 40);
        let corners = RingDetector::new(40, 9).detect(&img, &candidates, 2048);
        assert!(corners.is_empty(), "straight edge produced {corners:?}");
    }

    #[test]
    #[should_panic(expected = "ring size")]
    fn bad_ring_size_panics() {
        let _ = RingDetector::new(40, 8);
    }
}
