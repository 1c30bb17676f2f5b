use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::circuit::Signal;
use crate::config::{Integration, SimulationParams};
use crate::output::OutputFormat;
use crate::parser::{parse_signal, parse_value_with_unit};

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub input_file: String,
    pub output_file: Option<String>,
    pub output_format: OutputFormat,
    pub verbose_level: u8,
    /// Overrides the netlist's `.input` directive.
    pub input_source: Option<String>,
    /// Overrides the netlist's `.output` directive.
    pub output_signal: Option<Signal>,
    pub stimulus: Stimulus,
    /// Seconds of audio to render.
    pub duration: f64,
    /// Samples per processor call.
    pub block_size: usize,
    pub params: SimulationParams,
}

/// Test signal fed to the input source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stimulus {
    Step { amplitude: f64 },
    Impulse { amplitude: f64 },
    Sine { amplitude: f64, frequency: f64 },
}

impl Stimulus {
    /// Fill `samples` starting at absolute sample index `start`.
    pub fn render(&self, start: usize, sample_rate: f64, samples: &mut [f64]) {
        for (i, sample) in samples.iter_mut().enumerate() {
            let n = start + i;
            *sample = match *self {
                Stimulus::Step { amplitude } => amplitude,
                Stimulus::Impulse { amplitude } => {
                    if n == 0 {
                        amplitude
                    } else {
                        0.0
                    }
                }
                Stimulus::Sine { amplitude, frequency } => {
                    amplitude * (2.0 * std::f64::consts::PI * frequency * n as f64 / sample_rate).sin()
                }
            };
        }
    }
}

pub fn create_cli() -> Command {
    Command::new("livesim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Renders a test stimulus through a circuit with the real-time transient simulator")
        .arg(
            Arg::new("netlist")
                .help("Input SPICE netlist file (.sp)")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("input")
                .long("input")
                .value_name("SOURCE")
                .help("Independent source driven by the stimulus"),
        )
        .arg(
            Arg::new("signal")
                .long("signal")
                .value_name("SIGNAL")
                .help("Output signal, e.g. V(out) or I(R1)"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Output file for the recorded signals"),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_name("FORMAT")
                .default_value("csv")
                .value_parser(["csv", "json"])
                .help("Output format"),
        )
        .arg(
            Arg::new("sample-rate")
                .long("sample-rate")
                .value_name("HZ")
                .default_value("48k")
                .help("Audio sample rate"),
        )
        .arg(
            Arg::new("oversample")
                .long("oversample")
                .value_name("N")
                .default_value("4")
                .value_parser(clap::value_parser!(usize))
                .help("Simulation ticks per audio sample"),
        )
        .arg(
            Arg::new("iterations")
                .long("iterations")
                .value_name("N")
                .default_value("8")
                .value_parser(clap::value_parser!(usize))
                .help("Newton iteration cap per tick"),
        )
        .arg(
            Arg::new("integration")
                .long("integration")
                .value_name("RULE")
                .default_value("trapezoidal")
                .value_parser(["trapezoidal", "euler"])
                .help("Integration rule"),
        )
        .arg(
            Arg::new("stimulus")
                .long("stimulus")
                .value_name("KIND")
                .default_value("sine")
                .value_parser(["step", "impulse", "sine"])
                .help("Test signal applied to the input"),
        )
        .arg(
            Arg::new("amplitude")
                .long("amplitude")
                .value_name("VALUE")
                .default_value("1")
                .help("Stimulus amplitude"),
        )
        .arg(
            Arg::new("frequency")
                .long("frequency")
                .value_name("HZ")
                .default_value("1k")
                .help("Sine stimulus frequency"),
        )
        .arg(
            Arg::new("duration")
                .long("duration")
                .value_name("SECONDS")
                .default_value("10m")
                .help("Length of the render"),
        )
        .arg(
            Arg::new("block")
                .long("block")
                .value_name("SAMPLES")
                .default_value("256")
                .value_parser(clap::value_parser!(usize))
                .help("Samples per processing block"),
        )
        .arg(
            Arg::new("strict")
                .long("strict")
                .action(ArgAction::SetTrue)
                .help("Stop on Newton non-convergence instead of keeping the last iterate"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Increase verbosity level"),
        )
}

impl CliArgs {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let input_file = matches
            .get_one::<String>("netlist")
            .ok_or_else(|| anyhow!("Input file is required"))?
            .clone();

        let output_file = matches.get_one::<String>("output").cloned();
        let input_source = matches.get_one::<String>("input").cloned();
        let output_signal = matches
            .get_one::<String>("signal")
            .map(|s| parse_signal(s))
            .transpose()?;

        let verbose_level = matches.get_count("verbose");

        let output_format = match text(matches, "format")? {
            "csv" => OutputFormat::Csv,
            "json" => OutputFormat::Json,
            other => return Err(anyhow!("Invalid output format: {}", other)),
        };

        let amplitude = value(matches, "amplitude")?;
        let stimulus = match text(matches, "stimulus")? {
            "step" => Stimulus::Step { amplitude },
            "impulse" => Stimulus::Impulse { amplitude },
            "sine" => Stimulus::Sine {
                amplitude,
                frequency: value(matches, "frequency")?,
            },
            other => return Err(anyhow!("Invalid stimulus: {}", other)),
        };

        let integration = match text(matches, "integration")? {
            "trapezoidal" => Integration::Trapezoidal,
            "euler" => Integration::BackwardEuler,
            other => return Err(anyhow!("Invalid integration rule: {}", other)),
        };

        let duration = value(matches, "duration")?;
        if !(duration > 0.0) {
            return Err(anyhow!("Duration must be positive"));
        }
        let block_size = count(matches, "block")?;
        if block_size == 0 {
            return Err(anyhow!("Block size must be positive"));
        }

        let mut params = SimulationParams::new()
            .with_sample_rate(value(matches, "sample-rate")?)
            .with_oversample(count(matches, "oversample")?)
            .with_iterations(count(matches, "iterations")?)
            .with_integration(integration)
            .with_max_block_size(block_size);
        params.limits.strict = matches.get_flag("strict");
        params.validate()?;

        Ok(CliArgs {
            input_file,
            output_file,
            output_format,
            verbose_level,
            input_source,
            output_signal,
            stimulus,
            duration,
            block_size,
            params,
        })
    }
}

fn text<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str> {
    matches
        .get_one::<String>(name)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("Missing --{}", name))
}

fn value(matches: &ArgMatches, name: &str) -> Result<f64> {
    parse_value_with_unit(text(matches, name)?).map_err(|e| anyhow!("--{}: {}", name, e))
}

fn count(matches: &ArgMatches, name: &str) -> Result<usize> {
    matches
        .get_one::<usize>(name)
        .copied()
        .ok_or_else(|| anyhow!("Missing --{}", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn parse(args: &[&str]) -> Result<CliArgs> {
        let matches = create_cli().try_get_matches_from(args)?;
        CliArgs::from_matches(&matches)
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["livesim", "clipper.sp"]).unwrap();
        assert_eq!(args.input_file, "clipper.sp");
        assert_eq!(args.output_format, OutputFormat::Csv);
        assert_eq!(args.params, SimulationParams::default().with_max_block_size(256));
        assert_eq!(args.stimulus, Stimulus::Sine { amplitude: 1.0, frequency: 1000.0 });
        assert_relative_eq!(args.duration, 0.01);
        assert!(args.output_signal.is_none());
    }

    #[test]
    fn test_overrides() {
        let args = parse(&[
            "livesim",
            "amp.sp",
            "--input",
            "Vin",
            "--signal",
            "V(out)",
            "--stimulus",
            "step",
            "--amplitude",
            "500m",
            "--sample-rate",
            "96k",
            "--oversample",
            "2",
            "--integration",
            "euler",
            "--strict",
            "-f",
            "json",
            "-vv",
        ])
        .unwrap();
        assert_eq!(args.input_source.as_deref(), Some("Vin"));
        assert_eq!(args.output_signal, Some(Signal::voltage("out")));
        assert_eq!(args.stimulus, Stimulus::Step { amplitude: 0.5 });
        assert_eq!(args.params.sample_rate, 96_000.0);
        assert_eq!(args.params.oversample, 2);
        assert_eq!(args.params.integration, Integration::BackwardEuler);
        assert!(args.params.limits.strict);
        assert_eq!(args.output_format, OutputFormat::Json);
        assert_eq!(args.verbose_level, 2);
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(parse(&["livesim", "a.sp", "--oversample", "0"]).is_err());
        assert!(parse(&["livesim", "a.sp", "--signal", "out"]).is_err());
        assert!(parse(&["livesim", "a.sp", "--duration", "0"]).is_err());
        assert!(parse(&["livesim"]).is_err());
    }

    #[test]
    fn test_stimulus_render() {
        let mut samples = [0.0; 4];
        Stimulus::Impulse { amplitude: 2.0 }.render(0, 48_000.0, &mut samples);
        assert_eq!(samples, [2.0, 0.0, 0.0, 0.0]);
        Stimulus::Impulse { amplitude: 2.0 }.render(4, 48_000.0, &mut samples);
        assert_eq!(samples, [0.0; 4]);

        Stimulus::Sine { amplitude: 1.0, frequency: 12_000.0 }.render(0, 48_000.0, &mut samples);
        assert_relative_eq!(samples[1], 1.0);
        assert_relative_eq!(samples[2], 0.0, epsilon = 1e-12);
    }
}
