// correspond.rs — From match pairs to pose-solver input.
//
// A correspondence pairs one frame-1 point's normalized ray and inverse
// depth (u1, v1, q1) with the matched frame-2 point's observed ray
// (u2, v2). The layout is shared verbatim with the GPU buffers (32-byte
// stride), so the struct is Pod and padded explicitly.
//
// Hypothesis sampling draws 3 *distinct* correspondence indices per
// hypothesis slot. There is no RNG on the device, so the draw is a pure
// function of the slot index (Wang integer hash) plus an arithmetic
// skip-adjustment that guarantees distinctness without rejection loops —
// the WGSL kernel runs the identical computation, which keeps the whole
// pipeline deterministic end to end.

use crate::camera::RayMap;
use crate::fast::Point;
use crate::image::Image;
use crate::tree::MatchPair;

/// One matched observation pair: frame-1 ray + inverse depth, frame-2 ray.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Correspondence {
    pub u1: f32,
    pub v1: f32,
    /// Inverse depth of the frame-1 point.
    pub q1: f32,
    pub u2: f32,
    pub v2: f32,
    pub _pad: [f32; 3],
}

impl Correspondence {
    pub fn new(u1: f32, v1: f32, q1: f32, u2: f32, v2: f32) -> Self {
        Correspondence {
            u1,
            v1,
            q1,
            u2,
            v2,
            _pad: [0.0; 3],
        }
    }
}

/// Convert match pairs into correspondence tuples.
///
/// `matches[i].source` indexes `points1` (the list the index was built
/// from), `matches[i].target` indexes `points2`. Depth was validated by
/// the extraction stage, so `1/depth` is finite here. Output count =
/// match count.
pub fn form_correspondences(
    matches: &[MatchPair],
    points1: &[Point],
    points2: &[Point],
    rays: &RayMap,
    depth1: &Image<f32>,
) -> Vec<Correspondence> {
    matches
        .iter()
        .map(|m| {
            let p1 = points1[m.source as usize];
            let p2 = points2[m.target as usize];
            let (u1, v1) = rays.ray(p1.x as usize, p1.y as usize);
            let (u2, v2) = rays.ray(p2.x as usize, p2.y as usize);
            let q1 = 1.0 / depth1.get(p1.x as usize, p1.y as usize);
            Correspondence::new(u1, v1, q1, u2, v2)
        })
        .collect()
}

/// Wang integer hash. Must stay in lockstep with the WGSL copy.
#[inline]
pub fn wang_hash(mut s: u32) -> u32 {
    s = (s ^ 61) ^ (s >> 16);
    s = s.wrapping_mul(9);
    s ^= s >> 4;
    s = s.wrapping_mul(0x27d4_eb2d);
    s ^= s >> 15;
    s
}

/// Draw 3 distinct indices in `[0, n)` for hypothesis slot `slot`.
///
/// The third draw samples `[0, n-2)` and skips over the first two picks,
/// so no rejection loop is needed and degenerate triples are impossible.
///
/// # Panics
/// Panics if `n < 3`.
pub fn sample_indices(n: u32, slot: u32) -> [u32; 3] {
    assert!(n >= 3, "need at least 3 correspondences, got {n}");
    let seed = slot.wrapping_mul(0x9e37_79b9);

    let i0 = wang_hash(seed) % n;
    let i1 = (i0 + 1 + wang_hash(seed.wrapping_add(1)) % (n - 1)) % n;

    let a = i0.min(i1);
    let b = i0.max(i1);
    let mut i2 = wang_hash(seed.wrapping_add(2)) % (n - 2);
    if i2 >= a {
        i2 += 1;
    }
    if i2 >= b {
        i2 += 1;
    }

    [i0, i1, i2]
}

/// Gather one minimal 3-correspondence set per hypothesis slot.
///
/// Fewer than 3 correspondences cannot seed a hypothesis; the result is
/// then empty (a zero count, not an error — scoring simply selects
/// nothing downstream).
pub fn sample_hypotheses(corrs: &[Correspondence], count: usize) -> Vec<[Correspondence; 3]> {
    let n = corrs.len() as u32;
    if n < 3 {
        return Vec::new();
    }
    (0..count as u32)
        .map(|slot| {
            let [i0, i1, i2] = sample_indices(n, slot);
            [
                corrs[i0 as usize],
                corrs[i1 as usize],
                corrs[i2 as usize],
            ]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::PinholeCamera;

    #[test]
    fn sampled_indices_are_distinct() {
        for n in [3u32, 4, 7, 50, 2048] {
            for slot in 0..256 {
                let [a, b, c] = sample_indices(n, slot);
                assert!(a < n && b < n && c < n, "n={n} slot={slot}");
                assert!(a != b && b != c && a != c, "n={n} slot={slot}: [{a},{b},{c}]");
            }
        }
    }

    #[test]
    fn sampling_is_deterministic() {
        for slot in 0..64 {
            assert_eq!(sample_indices(37, slot), sample_indices(37, slot));
        }
    }

    #[test]
    fn sampling_spreads_over_the_set() {
        let n = 64u32;
        let mut seen = vec![false; n as usize];
        for slot in 0..512 {
            for i in sample_indices(n, slot) {
                seen[i as usize] = true;
            }
        }
        let covered = seen.iter().filter(|&&s| s).count();
        assert!(covered > 48, "only {covered}/64 indices ever drawn");
    }

    #[test]
    fn too_few_correspondences_yield_no_hypotheses() {
        let c = Correspondence::new(0.0, 0.0, 1.0, 0.0, 0.0);
        assert!(sample_hypotheses(&[c, c], 100).is_empty());
        assert_eq!(sample_hypotheses(&[c, c, c], 100).len(), 100);
    }

    #[test]
    fn correspondences_read_rays_and_inverse_depth() {
        let cam = PinholeCamera::new(2.0, 2.0, 0.0, 0.0);
        let rays = RayMap::build(&cam, 16, 16);
        let mut depth = Image::<f32>::new(16, 16);
        depth.set(4, 6, 2.0);

        let points1 = vec![Point::new(4, 6)];
        let points2 = vec![Point::new(8, 10)];
        let matches = vec![MatchPair { source: 0, target: 0 }];

        let corrs = form_correspondences(&matches, &points1, &points2, &rays, &depth);
        assert_eq!(corrs.len(), 1);
        let c = corrs[0];
        assert_eq!((c.u1, c.v1), (2.0, 3.0));
        assert_eq!(c.q1, 0.5);
        assert_eq!((c.u2, c.v2), (4.0, 5.0));
    }
}
