// benches/pipeline.rs — CPU reference pipeline benchmarks.
//
// Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use rgbd_pose::camera::PinholeCamera;
use rgbd_pose::descriptor::{BlendSize, DescriptorGenerator};
use rgbd_pose::fast::{cull_candidates, RingDetector};
use rgbd_pose::image::Image;
use rgbd_pose::pipeline::{FrameInput, PipelineConfig, PosePipeline};
use rgbd_pose::tree::DescriptorForest;

fn hash(mut s: u32) -> u32 {
    s ^= s << 13;
    s ^= s >> 17;
    s ^= s << 5;
    s
}

/// 256×192 frame stamped with high-contrast 4×4 patches.
fn scene(w: usize, h: usize) -> (Image<u8>, Image<f32>) {
    let mut gray = Image::<u8>::from_vec(w, h, vec![30u8; w * h]);
    let mut k = 0u32;
    let mut y = 10;
    while y + 14 < h {
        let mut x = 10;
        while x + 14 < w {
            for dy in 0..4u32 {
                for dx in 0..4u32 {
                    let v = 80 + hash(k * 97 + dy * 4 + dx) % 150;
                    gray.set(x + dx as usize, y + dy as usize, v as u8);
                }
            }
            k += 1;
            x += 12;
        }
        y += 12;
    }
    let depth = Image::<f32>::from_vec(w, h, vec![1.5f32; w * h]);
    (gray, depth)
}

fn bench_extraction(c: &mut Criterion) {
    let (gray, _) = scene(256, 192);
    let detector = RingDetector::new(40, 9);

    c.bench_function("cull_candidates 256x192", |b| {
        b.iter(|| cull_candidates(black_box(&gray), 40))
    });

    let candidates = cull_candidates(&gray, 40);
    c.bench_function("ring_test", |b| {
        b.iter(|| detector.detect(black_box(&gray), &candidates, 2048))
    });
}

fn bench_descriptors(c: &mut Criterion) {
    let (gray, _) = scene(256, 192);
    let candidates = cull_candidates(&gray, 40);
    let corners = RingDetector::new(40, 9).detect(&gray, &candidates, 2048);
    let generator = DescriptorGenerator::new(BlendSize::Cross);

    c.bench_function("describe_all", |b| {
        b.iter(|| generator.describe_all(black_box(&gray), &corners))
    });

    let descs = generator.describe_all(&gray, &corners);
    c.bench_function("forest_build 512/5", |b| {
        b.iter(|| DescriptorForest::build(black_box(&descs), 512, 5))
    });

    let forest = DescriptorForest::build(&descs, 512, 5);
    c.bench_function("forest_query rotated", |b| {
        b.iter(|| forest.query(black_box(&descs), 3, true))
    });
}

fn bench_full_pipeline(c: &mut Criterion) {
    let (gray, depth) = scene(256, 192);
    let camera = PinholeCamera::new(200.0, 200.0, 128.0, 96.0);
    let config = PipelineConfig {
        hypotheses: 1024,
        ..Default::default()
    };
    let pipeline = PosePipeline::new(config, &camera, 256, 192).unwrap();
    let frame = FrameInput {
        gray: &gray,
        depth: &depth,
    };

    c.bench_function("full_pipeline 256x192", |b| {
        b.iter(|| pipeline.process(black_box(&frame), black_box(&frame)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_extraction,
    bench_descriptors,
    bench_full_pipeline
);
criterion_main!(benches);
