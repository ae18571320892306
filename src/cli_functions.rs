use crate::{
    generator::Generator,
    integrands::{integrand_factory, HasIntegrand},
    integrate::{generate_and_evaluate, integrate},
    multichannel::Sampleable,
    utils::{print_banner, VERSION},
    Settings,
};
use chrono::{Datelike, Local, Timelike};
use clap::{App, Arg, ArgMatches, SubCommand};
use color_eyre::{Help, Report};
use colored::{ColoredString, Colorize};
use eyre::{eyre, WrapErr};
use log::LevelFilter;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use rand::{rngs::SmallRng, SeedableRng};
use std::path::Path;
use std::str::FromStr;
use std::{fs, time::Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Long,
    Short,
    Min,
}

impl FromStr for LogFormat {
    type Err = Report;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "long" => LogFormat::Long,
            "short" => LogFormat::Short,
            "min" => LogFormat::Min,
            _ => return Err(eyre!("Unknown log format '{}'", s)),
        })
    }
}

fn format_level(level: log::Level) -> ColoredString {
    match level {
        log::Level::Error => format!("{:<8}", "ERROR").red(),
        log::Level::Warn => format!("{:<8}", "WARNING").yellow(),
        log::Level::Info => format!("{:<8}", "INFO").into(),
        log::Level::Debug => format!("{:<8}", "DEBUG").bright_black(),
        log::Level::Trace => format!("{:<8}", "TRACE").into(),
    }
}

fn format_target(target: &str, level: log::Level) -> ColoredString {
    let split_targets = target.split("::").collect::<Vec<_>>();
    let start = split_targets.len().saturating_sub(2);
    let mut shortened_path = split_targets[start..].join("::");
    if level < log::Level::Debug && shortened_path.len() > 20 {
        shortened_path = format!("{}...", shortened_path.chars().take(17).collect::<String>());
    }
    format!("{:<20}", shortened_path).bright_blue()
}

pub fn setup_log(level: LevelFilter, format: LogFormat) -> Result<(), Report> {
    fern::Dispatch::new()
        .level(level)
        .format(move |out, message, record| {
            let now = Local::now();
            match format {
                LogFormat::Long => out.finish(format_args!(
                    "[{}] @{} {}: {}",
                    format!(
                        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}",
                        now.year(),
                        now.month(),
                        now.day(),
                        now.hour(),
                        now.minute(),
                        now.second(),
                        now.timestamp_subsec_millis()
                    )
                    .bright_green(),
                    format_target(record.target(), record.level()),
                    format_level(record.level()),
                    message
                )),
                LogFormat::Short => out.finish(format_args!(
                    "[{}] {}: {}",
                    format!("{:02}:{:02}:{:02}", now.hour(), now.minute(), now.second())
                        .bright_green(),
                    format_level(record.level()),
                    message
                )),
                LogFormat::Min => out.finish(format_args!(
                    "{}: {}",
                    format_level(record.level()),
                    message
                )),
            }
        })
        .chain(std::io::stdout())
        .chain(fern::log_file("phasespace_output.log")?)
        .apply()?;
    Ok(())
}

fn parse_arg<T: FromStr>(matches: &ArgMatches, name: &str) -> Result<Option<T>, Report>
where
    T::Err: std::fmt::Display,
{
    matches
        .value_of(name)
        .map(|x| {
            T::from_str(x.trim_end_matches(','))
                .map_err(|e| eyre!("Invalid value '{}' for --{}: {}", x, name, e))
        })
        .transpose()
}

pub fn cli(args: &[String]) -> Result<(), Report> {
    let matches = App::new("phasespace")
        .version(VERSION)
        .about("Recursive phase-space generation with adaptive multichannel integration")
        .arg(
            Arg::with_name("config")
                .short("f")
                .long("config")
                .value_name("CONFIG_FILE")
                .default_value("./run_card.yaml")
                .help("Set the configuration file"),
        )
        .arg(
            Arg::with_name("target")
                .short("t")
                .long("target")
                .allow_hyphen_values(true)
                .value_name("TARGET")
                .help("Specify the integration target"),
        )
        .arg(
            Arg::with_name("debug")
                .short("d")
                .long("debug")
                .value_name("LEVEL")
                .help("Set the debug level. Higher means more verbose."),
        )
        .arg(
            Arg::with_name("log_format")
                .long("log_format")
                .value_name("FORMAT")
                .possible_values(&["long", "short", "min"])
                .default_value("short")
                .help("Format of the log lines"),
        )
        .arg(
            Arg::with_name("n_start")
                .long("n_start")
                .value_name("N_START")
                .help("Number of starting samples for the integrator"),
        )
        .arg(
            Arg::with_name("n_max")
                .long("n_max")
                .value_name("N_MAX")
                .help("Max number of samples to consider for integration"),
        )
        .arg(
            Arg::with_name("n_increase")
                .long("n_increase")
                .value_name("N_INCREASE")
                .help("Increase of number of sample points for each successive iteration"),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .value_name("SEED")
                .help("Seed of the random number generator"),
        )
        .arg(
            Arg::with_name("state")
                .long("state")
                .value_name("STATE_FILE")
                .help("Resume the adaptation from this file if it exists and save it there afterwards"),
        )
        .arg(
            Arg::with_name("result")
                .long("result")
                .value_name("RESULT_FILE")
                .help("Write the integration result to this file as JSON"),
        )
        .subcommand(
            SubCommand::with_name("inspect")
                .about("Generate a single event and show its momenta, invariants and weights"),
        )
        .subcommand(
            SubCommand::with_name("bench")
                .about("Benchmark timing for the generation of individual events")
                .arg(
                    Arg::with_name("samples")
                        .required(true)
                        .long("samples")
                        .short("s")
                        .value_name("SAMPLES")
                        .help("Number of samples for benchmark"),
                ),
        )
        .get_matches_from(args);

    let config = matches
        .value_of("config")
        .ok_or_else(|| eyre!("No configuration file given"))?;
    let mut settings = Settings::from_file(config)?;

    if let Some(x) = parse_arg(&matches, "debug")? {
        settings.general.debug = x;
    }
    if let Some(x) = parse_arg(&matches, "n_start")? {
        settings.integrator.n_start = x;
    }
    if let Some(x) = parse_arg(&matches, "n_max")? {
        settings.integrator.n_max = x;
    }
    if let Some(x) = parse_arg(&matches, "n_increase")? {
        settings.integrator.n_increase = x;
    }
    if let Some(x) = parse_arg(&matches, "seed")? {
        settings.integrator.seed = x;
    }
    let target: Option<f64> = parse_arg(&matches, "target")?;
    let log_format: LogFormat = parse_arg(&matches, "log_format")?.unwrap_or(LogFormat::Short);

    let level = match settings.general.debug {
        0 => LevelFilter::Info,
        1 | 2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    setup_log(level, log_format)?;
    crate::set_interrupt_handler();

    print_banner();
    if settings.general.debug > 0 {
        info!(
            "{}",
            format!("Debug mode enabled at level {}", settings.general.debug).red()
        );
        info!("");
    }

    let state = matches.value_of("state");
    let result_file = matches.value_of("result");
    match settings.kinematics.dimension {
        4 => run::<4>(&settings, &matches, state, result_file, target),
        5 => run::<5>(&settings, &matches, state, result_file, target),
        6 => run::<6>(&settings, &matches, state, result_file, target),
        d => Err(eyre!("Unsupported spacetime dimension {}", d))
            .suggestion("The command line front-end supports dimensions 4 to 6"),
    }
}

fn run<const D: usize>(
    settings: &Settings,
    matches: &ArgMatches,
    state: Option<&str>,
    result_file: Option<&str>,
    target: Option<f64>,
) -> Result<(), Report> {
    let mut generator = Generator::<D>::new(settings).wrap_err("Could not set up the generator")?;
    if let Some(path) = state {
        if Path::new(path).exists() {
            let bytes = fs::read(path).wrap_err_with(|| format!("Could not read state file {}", path))?;
            generator
                .restore_state(&bytes)
                .wrap_err("Could not load the generator state")
                .suggestion("Was the state saved with the same settings?")?;
            info!("Resuming from state file {}", path.green());
        }
    }
    let integrand = integrand_factory(settings).wrap_err("Could not build the integrand")?;

    if matches.subcommand_matches("inspect").is_some() {
        inspect(&mut generator, settings);
    } else if let Some(matches) = matches.subcommand_matches("bench") {
        let n_samples: usize = parse_arg(matches, "samples")?.unwrap_or(1);
        info!(
            "\nBenchmarking event generation for '{}' over {} samples...\n",
            HasIntegrand::<D>::name(&integrand).green(),
            format!("{}", n_samples).blue()
        );
        let mut rng = SmallRng::seed_from_u64(settings.integrator.seed);
        let now = Instant::now();
        let mut failed = 0;
        for _ in 0..n_samples {
            let (point, _) = generate_and_evaluate(&mut generator, &integrand, &mut rng, 0);
            if !point.is_valid() {
                failed += 1;
            }
        }
        let total_time = now.elapsed().as_secs_f64();
        info!(
            "\n> Total time: {} s for {} samples, {} µs per sample, {} failed\n",
            format!("{:.1}", total_time).blue(),
            format!("{}", n_samples).blue(),
            format!("{:.3}", total_time * 1.0e6 / (n_samples.max(1) as f64)).green(),
            format!("{}", failed).blue(),
        );
    } else {
        let result = integrate(&mut generator, &integrand, settings, target);
        info!("");
        info!(
            "{}",
            format!(
                "Integration completed after {} sample evaluations.",
                format!("{:.2}M", (result.neval as f64) / 1000000.)
                    .bold()
                    .blue()
            )
            .bold()
            .green()
        );
        info!(
            "Result: {} ({} zero-weight samples)",
            crate::utils::format_uncertainty(result.result, result.error).blue(),
            result.fail
        );
        info!("");
        if let Some(path) = result_file {
            fs::write(path, serde_json::to_string_pretty(&result)?)
                .wrap_err_with(|| format!("Could not write result file {}", path))?;
            info!("Integration result written to {}", path.green());
        }
    }

    if let Some(path) = state {
        let bytes = generator.save_state()?;
        fs::write(path, bytes).wrap_err_with(|| format!("Could not write state file {}", path))?;
        info!("Saved generator state to {}", path.green());
    }
    Ok(())
}

/// Generate one event and print everything the generator knows about it.
fn inspect<const D: usize>(generator: &mut Generator<D>, settings: &Settings) {
    let mut rng = SmallRng::seed_from_u64(settings.integrator.seed);
    let point = generator.generate(&mut rng);
    if !point.is_valid() {
        warn!("The generated event failed, try another seed");
        return;
    }
    info!(
        "Event from topology {} with weight {:+.16e}",
        point.topology.map_or("-".to_owned(), |t| t.to_string()),
        point.weight
    );
    if point.x1 != 1. || point.x2 != 1. {
        info!("x1 = {:.16e}, x2 = {:.16e}", point.x1, point.x2);
    }
    for (i, p) in point.momenta.iter().enumerate() {
        info!("p{} = ( {:-23})", i, format!("{:+.16e}", p));
    }
    info!("Invariants:");
    for (_, channel) in generator.arena().iter() {
        info!(
            "  {:<16} {:+.16e}{}",
            channel.legs.to_string(),
            channel.mass_squared,
            if channel.spacelike { " (t)" } else { "" }
        );
    }
    info!("Topologies:");
    let weights = generator.topology_weights().to_vec();
    for (i, topology) in generator.topologies().iter().enumerate() {
        info!(
            "  #{:<3} {:<16} α = {:.6e}  w = {:+.16e}",
            i,
            topology.name(),
            generator.alphas()[i],
            weights[i]
        );
        // one line per branching, with the joint mass of its children's densities
        let integrals = generator.pair_integrals(i).unwrap_or_default();
        for (line, integral) in topology.describe(generator.arena()).lines().zip(integrals) {
            info!(
                "        {:<40} {}",
                line.bright_black(),
                format!("∫ dΦ(s1, s2) = {:.6e}", integral).bright_black()
            );
        }
    }
    let mut scored = generator.arena().clone();
    let mut topologies = generator.topologies().to_vec();
    for (i, topology) in topologies.iter_mut().enumerate() {
        if generator.alphas()[i] == 0. {
            scored.reset();
            if scored.set_external_momenta(&point.momenta).is_ok() {
                info!(
                    "  #{:<3} pruned, would weigh {:+.16e}",
                    i,
                    topology.evaluate_weight(&mut scored)
                );
            }
        }
    }
}
