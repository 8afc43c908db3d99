//! Benchmarks for the bridge tick path.
//!
//! Measures an idle tick and full write/read round trips through the driver,
//! register file, DMA engine, and disk model.
//!
//! Run with: `cargo bench -p simblk -- tick`

#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use simblk::backing::create_image;
use simblk::block::{BlockRequest, RecordingLayer};
use simblk::config::{DiskConfig, DriverConfig, SimConfig};
use simblk::driver::BlockDriver;
use simblk::{RegisterFile, Simulation};
use tempfile::tempdir;

type Driver = BlockDriver<Arc<RegisterFile>, Arc<RecordingLayer<u64>>>;

/// Builds a simulation over a fresh 4 MiB image with a bound driver.
fn setup(
    words_per_tick: usize,
) -> (
    Simulation,
    Arc<Driver>,
    Arc<RecordingLayer<u64>>,
    tempfile::TempDir,
) {
    let temp_dir = tempdir().unwrap();
    let image = temp_dir.path().join("bench.img");
    create_image(&image, 8192).unwrap();

    let mut disk = DiskConfig::with_backing(&image);
    disk.read_latency = 1;
    disk.write_latency = 1;
    let config = SimConfig {
        disk,
        words_per_tick,
        ..SimConfig::default()
    };

    let sim = Simulation::new(&config).unwrap();
    let layer = Arc::new(RecordingLayer::new());
    let driver = Arc::new(
        BlockDriver::probe(sim.registers(), Arc::clone(&layer), DriverConfig::default()).unwrap(),
    );
    sim.interrupts().register(driver.interrupt_handler());
    (sim, driver, layer, temp_dir)
}

/// Dispatches `request` and ticks until the driver reports it finished.
fn round_trip(
    sim: &mut Simulation,
    driver: &Driver,
    layer: &RecordingLayer<u64>,
    request: BlockRequest<u64>,
) {
    driver.dispatch(request).unwrap();
    while layer.completed_len() == 0 {
        sim.tick().unwrap();
    }
    black_box(layer.take_completed());
}

fn bench_idle_tick(c: &mut Criterion) {
    let (mut sim, _driver, _layer, _dir) = setup(8);
    c.bench_function("tick/idle", |b| {
        b.iter(|| black_box(sim.tick().unwrap()));
    });
}

fn bench_write_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick/write_round_trip");
    for words_per_tick in [1usize, 8, 64] {
        let (mut sim, driver, layer, _dir) = setup(words_per_tick);
        sim.memory().write(0, &[0xA5; 512]).unwrap();
        let mut sector = 0u32;

        group.bench_with_input(
            BenchmarkId::from_parameter(words_per_tick),
            &words_per_tick,
            |b, _| {
                b.iter(|| {
                    sector = (sector + 1) % 8192;
                    round_trip(
                        &mut sim,
                        &driver,
                        &layer,
                        BlockRequest::write(sector, 1, 0, u64::from(sector)),
                    );
                });
            },
        );
    }
    group.finish();
}

fn bench_read_round_trip(c: &mut Criterion) {
    let (mut sim, driver, layer, _dir) = setup(64);
    let mut sector = 0u32;

    c.bench_function("tick/read_round_trip_16_sectors", |b| {
        b.iter(|| {
            sector = (sector + 16) % 8192;
            round_trip(
                &mut sim,
                &driver,
                &layer,
                BlockRequest::read(sector, 16, 0x1_0000, u64::from(sector)),
            );
        });
    });
}

criterion_group!(
    benches,
    bench_idle_tick,
    bench_write_round_trip,
    bench_read_round_trip
);
criterion_main!(benches);
