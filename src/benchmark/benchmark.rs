use std::time::Instant;

use crate::configuration::config::uniform_cube;
use crate::engine::index::KdIndex;
use crate::error::KdResult;
use crate::fields::{FieldBuffer, FieldSlot};
use crate::index::kd_tree::KdTree;
use crate::smoothing::pipeline::Property;

const SEED: u64 = 7;
const BUCKET: i64 = 16;
const N_SMOOTH: i64 = 32;

/// Index over `n` seeded uniform points with unit masses and zeroed
/// smoothing-length and density outputs bound.
fn make_index(n: usize) -> KdResult<KdIndex> {
    let points = uniform_cube(n, SEED, 1.0);
    let index = KdIndex::create(
        FieldBuffer::from_points(&points),
        FieldBuffer::from_column(vec![1.0; n]),
        BUCKET,
    )?;
    index.bind_field(FieldSlot::Smoothing, FieldBuffer::zeros(n, 1))?;
    index.bind_field(FieldSlot::Density, FieldBuffer::zeros(n, 1))?;
    Ok(index)
}

/// Tree build time for a range of n
pub fn bench_tree_build() -> KdResult<()> {
    let ns = [1_000, 4_000, 16_000, 64_000, 256_000];

    for n in ns {
        let positions = FieldBuffer::from_points(&uniform_cube(n, SEED, 1.0));

        // Warm up
        KdTree::build(positions.clone(), BUCKET as usize)?;

        let t0 = Instant::now();
        let tree = KdTree::build(positions, BUCKET as usize)?;
        let dt = t0.elapsed().as_secs_f64();

        println!("N = {n:7}, build = {:8.6} s, nodes = {}", dt, tree.node_count());
    }
    Ok(())
}

/// Smoothing-length and density passes over a fixed cloud for 1, 2, 4, 8
/// workers
pub fn bench_pipeline() -> KdResult<()> {
    let n = 100_000;
    let index = make_index(n)?;
    let session = index.open_session(N_SMOOTH)?;

    for workers in [1, 2, 4, 8] {
        let t0 = Instant::now();
        index.populate(&session, Property::SmoothingLength, workers)?;
        let dt_hsm = t0.elapsed().as_secs_f64();

        let t1 = Instant::now();
        index.populate(&session, Property::Density, workers)?;
        let dt_rho = t1.elapsed().as_secs_f64();

        println!("N = {n}, workers = {workers}, hsm = {:8.6} s, rho = {:8.6} s", dt_hsm, dt_rho);
    }

    index.close_session(session);
    index.destroy();
    Ok(())
}

/// Both passes for a range of n on `workers` threads.
/// Paste output directly into a spreadsheet to graph
pub fn bench_pipeline_curve(workers: i64) -> KdResult<()> {
    println!("N,hsm_ms,rho_ms");

    for n in (10_000..=200_000).step_by(10_000) {
        let index = make_index(n)?;
        let session = index.open_session(N_SMOOTH)?;

        let t0 = Instant::now();
        index.populate(&session, Property::SmoothingLength, workers)?;
        let ms_hsm = t0.elapsed().as_secs_f64() * 1000.0;

        let t1 = Instant::now();
        index.populate(&session, Property::Density, workers)?;
        let ms_rho = t1.elapsed().as_secs_f64() * 1000.0;

        println!("{},{:.6},{:.6}", n, ms_hsm, ms_rho);
    }
    Ok(())
}
