use criterion::{black_box, criterion_group, criterion_main, Criterion};

use depth_relay::depth::{CalibrationState, ClipMode, DepthTable, RAW_DEPTH_MASK};
use depth_relay::frame::{FrameBuffer, PixelFormat, Resolution};

fn depth_frame() -> FrameBuffer {
    let mut buffer = FrameBuffer::new();
    buffer
        .create(Resolution::new(640, 480), PixelFormat::Depth)
        .expect("valid resolution");
    let samples: Vec<u16> = (0..640 * 480).map(|i| (i as u16) & RAW_DEPTH_MASK).collect();
    buffer.write_samples(&samples);
    buffer
}

fn bench_rebuild(c: &mut Criterion) {
    let linear = CalibrationState::default();
    let raw = CalibrationState {
        linear: false,
        clip_mode: ClipMode::ClampBack,
        ..CalibrationState::default()
    };

    c.bench_function("table_rebuild_linear", |b| b.iter(|| black_box(&linear).build_table()));
    c.bench_function("table_rebuild_raw", |b| b.iter(|| black_box(&raw).build_table()));
}

fn bench_apply(c: &mut Criterion) {
    let table = DepthTable::build(&CalibrationState::default().metric, ClipMode::EraseBack, true);
    let source = depth_frame();
    let mut buffer = source.clone();

    c.bench_function("table_apply_640x480", |b| {
        b.iter(|| {
            buffer.copy_from(&source);
            table.apply(black_box(&mut buffer));
        })
    });
}

criterion_group!(benches, bench_rebuild, bench_apply);
criterion_main!(benches);
