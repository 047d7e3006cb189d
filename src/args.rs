//! Argument parsing for running from the command line

use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Station configuration file (YAML or TOML), overridden by APP_* env vars
    #[clap(short, long, default_value = "config.yaml")]
    pub config: PathBuf,
    /// Simulated radio: peak amplitude of the uniform noise, as a fraction of full scale
    #[clap(short, long, default_value_t = 1.0)]
    #[clap(value_parser = unit_interval)]
    pub noise: f32,
    /// Simulated radio: chance of one full-scale impulse per buffer
    #[clap(short, long, default_value_t = 0.0)]
    #[clap(value_parser = unit_interval_f64)]
    pub impulse_probability: f64,
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

fn unit_interval_f64(s: &str) -> Result<f64, String> {
    let v: f64 = s.parse().map_err(|_| format!("{} is not a number", s))?;
    if (0.0..=1.0).contains(&v) {
        Ok(v)
    } else {
        Err(format!("{} is outside [0, 1]", v))
    }
}

fn unit_interval(s: &str) -> Result<f32, String> {
    unit_interval_f64(s).map(|v| v as f32)
}
