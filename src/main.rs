use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use colored::*;
use log::{error, info, warn};

use livesim::cli::{create_cli, CliArgs};
use livesim::output::Recording;
use livesim::{BuildOutcome, LogDiagnostics, Simulation, SpiceParser};

fn main() {
    env_logger::init();

    let matches = create_cli().get_matches();

    if let Err(e) = CliArgs::from_matches(&matches).and_then(run_application) {
        error!("{}", format!("Error: {:#}", e).red());
        std::process::exit(1);
    }
}

fn run_application(args: CliArgs) -> Result<()> {
    info!("{}", "Starting livesim".green().bold());
    info!("Input file: {}", args.input_file.bright_blue());

    if !Path::new(&args.input_file).exists() {
        return Err(anyhow!("Input file '{}' not found", args.input_file));
    }

    let netlist = SpiceParser::new().parse_file(&args.input_file)?;
    let topology = netlist.topology(args.input_source.as_deref(), args.output_signal.clone())?;
    if args.verbose_level > 0 {
        topology.circuit.print_summary();
    }

    let (simulation, mut processor) = Simulation::new(args.params.clone(), Arc::new(LogDiagnostics));
    for probe in &netlist.probes {
        simulation.add_probe(probe.clone());
    }
    simulation.register_topology_probes(&topology);

    match simulation.rebuild(topology).wait() {
        BuildOutcome::Published { version } => info!("Solution {} published", version),
        BuildOutcome::Superseded { version } => return Err(anyhow!("Build {} was superseded", version)),
        BuildOutcome::Failed(e) => return Err(e.into()),
    }

    let sample_rate = args.params.sample_rate;
    let total = (args.duration * sample_rate).round() as usize;
    info!(
        "Rendering {} samples at {} Hz, oversample {}",
        total, sample_rate, args.params.oversample
    );

    let mut recording = Recording::new();
    let mut block = vec![0.0; args.block_size];
    let mut rendered = 0;
    while rendered < total {
        let len = args.block_size.min(total - rendered);
        let block = &mut block[..len];
        args.stimulus.render(rendered, sample_rate, block);
        processor.process(block, &mut recording);
        if !processor.is_running() {
            warn!("Simulation stopped after {} samples", rendered);
            break;
        }
        rendered += len;
    }

    if let Some(output_file) = args.output_file {
        recording.export(Path::new(&output_file), args.output_format)?;
        info!("Results exported to: {}", output_file.bright_green());
    } else {
        recording.print_summary();
    }

    info!("{}", "Render completed successfully!".green().bold());
    Ok(())
}
