use kdsmooth::{FieldBuffer, FieldSlot, KdIndex, Property, RunConfig};
use kdsmooth::{bench_pipeline, bench_tree_build};

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

#[derive(Parser, Debug)]
struct Args {
    #[arg(short, default_value = "uniform_cube.yaml")]
    file_name: String,

    /// Run the timing harness instead of a scenario
    #[arg(long)]
    bench: bool,
}

// load here to keep main clean
fn load_run_from_yaml(file_name: &str) -> Result<RunConfig> {
    let config_path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scenarios").join(file_name);
    let file = File::open(&config_path)?;
    let reader = BufReader::new(file);
    let run_cfg: RunConfig = serde_yaml::from_reader(reader)?;
    Ok(run_cfg)
}

fn summarize(name: &str, values: &[f64]) {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
    info!(field = name, min, max, mean, "summary");
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if args.bench {
        bench_tree_build()?;
        bench_pipeline()?;
        return Ok(());
    }

    let run_cfg = load_run_from_yaml(&args.file_name)?;
    let params = run_cfg.smoothing.to_params()?;
    let (points, masses) = run_cfg.particles.generate()?;
    let n = points.len();

    let index = KdIndex::create(
        FieldBuffer::from_points(&points),
        FieldBuffer::from_column(masses),
        run_cfg.tree.bucket_size,
    )?
    .with_claim_strategy(run_cfg.smoothing.strategy);

    let smooth = FieldBuffer::zeros(n, 1);
    let rho = FieldBuffer::zeros(n, 1);
    index.bind_field(FieldSlot::Smoothing, smooth.clone())?;
    index.bind_field(FieldSlot::Density, rho.clone())?;

    let session = index.open_session_with(params)?;
    let workers = run_cfg.smoothing.workers;
    for property in [Property::SmoothingLength, Property::Density] {
        let reports = index.populate(&session, property, workers)?;
        let processed: usize = reports.iter().map(|r| r.processed).sum();
        info!(%property, workers = reports.len(), processed, "pass complete");
    }

    summarize("smooth", &smooth.to_vec());
    summarize("rho", &rho.to_vec());

    index.close_session(session);
    index.destroy();
    Ok(())
}
