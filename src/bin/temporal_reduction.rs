//! Temporal reduction application.
//!
//! source -> temporal_reduction -> writer

use std::sync::Arc;

use clap::Parser;

use stratus::app::{self, CommonArgs};
use stratus::comm::SelfCommunicator;
use stratus::logging;
use stratus::pipeline::{Pipeline, PortHandle};
use stratus::stages;

/// Reduce a time series onto daily/monthly/seasonal/yearly intervals
#[derive(Parser)]
#[command(name = "stratus_temporal_reduction")]
#[command(version)]
#[command(about = "Temporal reductions (mean, min, max, sum) over CF inputs")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Reduction interval: daily, monthly, seasonal, yearly or all
    #[arg(long, default_value = "monthly")]
    interval: String,

    /// Reduction operator: mean, min, max or sum
    #[arg(long, default_value = "mean")]
    operator: String,

    /// Continue an interval when member steps are missing
    #[arg(long)]
    allow_missing: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(&cli.common.log_level);

    if let Err(e) = run(cli).await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if cli.common.arrays.is_empty() && !cli.common.list_properties {
        anyhow::bail!("--arrays is required: name the variables to reduce");
    }

    let comm = Arc::new(SelfCommunicator);
    let mut pipeline = Pipeline::new();

    let source = pipeline.add_stage(stages::create_stage("source")?);
    let reduction = pipeline.add_stage(stages::create_stage("temporal_reduction")?);
    let writer = pipeline.add_stage(stages::create_stage("writer")?);
    pipeline.connect(PortHandle::new(source, 0), reduction, 0)?;
    pipeline.connect(PortHandle::new(reduction, 0), writer, 0)?;

    pipeline.set_property(reduction, "interval", cli.interval.clone().into())?;
    pipeline.set_property(reduction, "operator", cli.operator.clone().into())?;
    if cli.allow_missing {
        pipeline.set_property(reduction, "missing_policy", "fill".into())?;
    }
    pipeline.set_property(reduction, "n_threads", cli.common.n_threads.into())?;
    pipeline.set_property(writer, "file_name", cli.common.output_file.clone().into())?;

    cli.common.configure_source(&mut pipeline, source)?;
    cli.common.apply_properties(&mut pipeline)?;

    if cli.common.list_properties {
        let stages: Vec<_> = ["source", "temporal_reduction", "writer"]
            .iter()
            .filter_map(|name| pipeline.stage_id(name))
            .collect();
        print!("{}", app::render_property_tables(&pipeline, &stages));
        return Ok(());
    }

    let mut executive = cli.common.build_executive(comm)?;
    executive.set_arrays(cli.common.arrays.clone());

    let outputs = pipeline
        .run(PortHandle::new(writer, 0), &mut executive)
        .await?;
    tracing::info!(intervals = outputs.len(), "temporal reduction finished");
    Ok(())
}
