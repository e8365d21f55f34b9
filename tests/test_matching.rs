// tests/test_matching.rs — Matching properties on image-derived
// descriptors (the unit suites cover synthetic bit patterns; this suite
// runs the descriptor generator + forest against real pixel data).

use rgbd_pose::descriptor::{clip_bits, BlendSize, DescriptorGenerator};
use rgbd_pose::fast::{cull_candidates, Point, RingDetector};
use rgbd_pose::image::Image;
use rgbd_pose::tree::DescriptorForest;

fn hash(mut s: u32) -> u32 {
    s ^= s << 13;
    s ^= s >> 17;
    s ^= s << 5;
    s
}

/// Flat background stamped with 4×4 high-contrast pseudo-random patches
/// on a 12-pixel grid. Each patch guarantees ring corners at its four
/// patch-corner pixels (the circle keeps an 11-sample background run),
/// and the per-patch texture makes every descriptor distinct.
fn textured_image(w: usize, h: usize, phase: u32) -> Image<u8> {
    let mut img = Image::<u8>::from_vec(w, h, vec![30u8; w * h]);
    let mut k = 0u32;
    let mut y = 10;
    while y + 14 < h {
        let mut x = 10;
        while x + 14 < w {
            for dy in 0..4 {
                for dx in 0..4 {
                    let v = 80 + hash(phase.wrapping_mul(2654435761) + k * 97 + (dy * 4 + dx)) % 150;
                    img.set(x + dx as usize, y + dy as usize, v as u8);
                }
            }
            k += 1;
            x += 12;
        }
        y += 12;
    }
    img
}

fn image_descriptors(img: &Image<u8>, blend: BlendSize) -> Vec<rgbd_pose::descriptor::Descriptor> {
    let candidates = cull_candidates(img, 40);
    let corners = RingDetector::new(40, 9).detect(img, &candidates, 2048);
    DescriptorGenerator::new(blend).describe_all(img, &corners)
}

#[test]
fn extraction_and_descriptors_are_deterministic() {
    let img = textured_image(128, 128, 7);
    let a = image_descriptors(&img, BlendSize::Cross);
    let b = image_descriptors(&img, BlendSize::Cross);
    assert!(!a.is_empty(), "texture produced no descriptors");
    assert_eq!(a, b);
}

#[test]
fn every_blend_variant_produces_matchable_descriptors() {
    let img = textured_image(128, 128, 3);
    for blend in [BlendSize::Single, BlendSize::Cross, BlendSize::Square] {
        let mut descs = image_descriptors(&img, blend);
        clip_bits(&mut descs, 150);
        assert!(!descs.is_empty(), "{blend:?} produced nothing");

        let forest = DescriptorForest::build(&descs, 512, 5);
        let matches = forest.query(&descs, 3, false);

        // Self-query: nearly every descriptor finds itself (or an
        // equally close duplicate) at error 0.
        assert!(
            matches.len() * 10 >= descs.len() * 9,
            "{blend:?}: {} of {} self-queries matched",
            matches.len(),
            descs.len()
        );
        for m in &matches {
            let err = descs[m.target as usize].masked_error(&descs[m.source as usize]);
            assert!(err <= 3, "{blend:?}: match error {err} over bound");
        }
    }
}

#[test]
fn noisy_queries_respect_the_error_bound() {
    let img1 = textured_image(128, 128, 11);
    let mut descs1 = image_descriptors(&img1, BlendSize::Cross);
    clip_bits(&mut descs1, 150);
    let forest = DescriptorForest::build(&descs1, 512, 5);

    // A different texture phase: unrelated descriptors. Whatever still
    // matches must genuinely be within the bound.
    let img2 = textured_image(128, 128, 1_000_003);
    let mut descs2 = image_descriptors(&img2, BlendSize::Cross);
    clip_bits(&mut descs2, 150);

    let max_error = 3;
    let matches = forest.query(&descs2, max_error, true);
    for m in &matches {
        let q = &descs2[m.target as usize];
        let r = &descs1[m.source as usize];
        let err = (0..16u32).map(|s| q.rotate(s).masked_error(r)).min().unwrap();
        assert!(err <= max_error);
    }
    // And the bulk of unrelated queries must NOT match at so tight a
    // bound.
    assert!(
        matches.len() * 2 < descs2.len().max(1),
        "{} of {} unrelated queries matched",
        matches.len(),
        descs2.len()
    );
}

#[test]
fn depth_filter_composes_with_detection() {
    use rgbd_pose::fast::filter_by_depth;

    let img = textured_image(96, 96, 5);
    let candidates = cull_candidates(&img, 40);
    assert!(!candidates.is_empty());

    // Depth valid only in the left half.
    let mut depth = Image::<f32>::new(96, 96);
    for y in 0..96 {
        for x in 0..48 {
            depth.set(x, y, 2.0);
        }
    }

    let filtered = filter_by_depth(&candidates, &depth);
    assert!(filtered.len() < candidates.len());
    assert!(filtered.iter().all(|p: &Point| p.x < 48));

    let corners = RingDetector::new(40, 9).detect(&img, &filtered, 2048);
    assert!(corners.len() <= filtered.len());
    assert!(corners.iter().all(|p| p.x < 48));
}
