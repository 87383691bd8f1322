//! Integrated vapor transport application.
//!
//! source -> vertical_integral (ivt mode) -> [magnitude] -> writer

use std::sync::Arc;

use clap::Parser;

use stratus::app::{self, CommonArgs};
use stratus::comm::SelfCommunicator;
use stratus::logging;
use stratus::pipeline::{Pipeline, PortHandle};
use stratus::stages;

/// Compute integrated vapor transport from specific humidity and winds
#[derive(Parser)]
#[command(name = "stratus_ivt")]
#[command(version)]
#[command(about = "Compute integrated vapor transport over CF inputs")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Specific humidity variable
    #[arg(long, default_value = "q")]
    specific_humidity: String,

    /// Zonal wind variable
    #[arg(long, default_value = "u")]
    wind_u: String,

    /// Meridional wind variable
    #[arg(long, default_value = "v")]
    wind_v: String,

    /// Write the ivt_u / ivt_v component fields (default when no output
    /// flag is given)
    #[arg(long)]
    compute_ivt: bool,

    /// Reduce the components to the scalar ivt magnitude; composes with
    /// --compute_ivt
    #[arg(long)]
    compute_ivt_magnitude: bool,
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
    let comm = Arc::new(SelfCommunicator);
    let mut pipeline = Pipeline::new();

    let source = pipeline.add_stage(stages::create_stage("source")?);
    let integral = pipeline.add_named_stage("ivt", stages::create_stage("vertical_integral")?);
    pipeline.connect(PortHandle::new(source, 0), integral, 0)?;
    pipeline.set_property(integral, "mode", "ivt".into())?;
    pipeline.set_property(integral, "integrand_variable", cli.specific_humidity.clone().into())?;
    pipeline.set_property(integral, "wind_u_variable", cli.wind_u.clone().into())?;
    pipeline.set_property(integral, "wind_v_variable", cli.wind_v.clone().into())?;
    pipeline.set_property(integral, "output_variable", "ivt".into())?;

    // The magnitude stage chains onto the components when requested; the
    // two flags compose, and asking for nothing means the components.
    let compute_ivt = cli.compute_ivt || !cli.compute_ivt_magnitude;
    let mut terminal_arrays = Vec::new();
    if compute_ivt {
        terminal_arrays.push("ivt_u".to_string());
        terminal_arrays.push("ivt_v".to_string());
    }
    let mut upstream = integral;
    if cli.compute_ivt_magnitude {
        let magnitude =
            pipeline.add_named_stage("ivt_magnitude", stages::create_stage("magnitude")?);
        pipeline.connect(PortHandle::new(upstream, 0), magnitude, 0)?;
        pipeline.set_property(magnitude, "component_0_variable", "ivt_u".into())?;
        pipeline.set_property(magnitude, "component_1_variable", "ivt_v".into())?;
        pipeline.set_property(magnitude, "output_variable", "ivt_magnitude".into())?;
        upstream = magnitude;
        terminal_arrays.push("ivt_magnitude".to_string());
    }

    let writer = pipeline.add_stage(stages::create_stage("writer")?);
    pipeline.connect(PortHandle::new(upstream, 0), writer, 0)?;
    pipeline.set_property(writer, "file_name", cli.common.output_file.clone().into())?;

    cli.common.configure_source(&mut pipeline, source)?;
    cli.common.apply_properties(&mut pipeline)?;

    if cli.common.list_properties {
        let stages: Vec<_> = ["source", "ivt", "ivt_magnitude", "writer"]
            .iter()
            .filter_map(|name| pipeline.stage_id(name))
            .collect();
        print!("{}", app::render_property_tables(&pipeline, &stages));
        return Ok(());
    }

    terminal_arrays.extend(cli.common.arrays.iter().cloned());
    let mut executive = cli.common.build_executive(comm)?;
    executive.set_arrays(terminal_arrays);

    let outputs = pipeline
        .run(PortHandle::new(writer, 0), &mut executive)
        .await?;
    tracing::info!(indices = outputs.len(), "ivt pipeline finished");
    Ok(())
}
