use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::report::OutputFormat;
use crate::sampler::{Band, SamplerSettings};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Print extra debugging information
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Measure download and upload speed against a server
    Test(TestArgs),
    /// List saved server profiles
    Servers(ServersArgs),
    /// Run a speed test server
    Serve(Serve),
}

#[derive(Args, Clone, Debug)]
pub struct ServersArgs {
    /// List the closest public speedtest.net servers instead
    #[arg(long)]
    pub nearby: bool,
}

#[derive(Args, Clone, Debug)]
pub struct TestArgs {
    /// Speed test server profile or URL (default: the configured default_server,
    /// else the closest speedtest.net server)
    pub server: Option<String>,

    /// EWMA weight for speed confidence
    #[arg(long, default_value_t = 8.0)]
    pub ewma_weight: f64,

    /// Length of each request to try for, in seconds
    #[arg(long = "target-seconds", value_parser = parse_seconds, default_value = "1.0")]
    pub target: Duration,

    /// Skip download test
    #[arg(long)]
    pub no_download: bool,

    /// Skip upload test
    #[arg(long)]
    pub no_upload: bool,

    /// Number of bytes to request for the initial download
    #[arg(long, default_value_t = 1024 * 1024)]
    pub initial_download: u64,

    /// Number of bytes to send for the initial upload
    #[arg(long, default_value_t = 128 * 1024)]
    pub initial_upload: u64,

    /// Minimum number of samples to gather per individual download/upload test
    #[arg(long, default_value_t = 10)]
    pub minimum_samples: usize,

    /// Maximum number of samples to gather per individual download/upload test
    #[arg(long, default_value_t = 50)]
    pub maximum_samples: usize,

    /// Multiplier applied to each resized request
    #[arg(long, default_value_t = 1.0)]
    pub overshoot: f64,

    /// Elapsed time, as LOW,HIGH multiples of the target, that ends ramp-up
    #[arg(long, value_parser = parse_band, default_value = "0.9,1.5")]
    pub ramp_up_band: Band,

    /// Smoothed elapsed time, as LOW,HIGH multiples of the target, that counts as converged
    #[arg(long, value_parser = parse_band, default_value = "0.95,1.25")]
    pub convergence_band: Band,

    /// Per-request timeout, in seconds
    #[arg(long, value_parser = parse_seconds, default_value = "30")]
    pub timeout: Duration,

    /// Output format of the final summary
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

impl TestArgs {
    pub fn sampler_settings(&self) -> SamplerSettings {
        SamplerSettings {
            target: self.target,
            ewma_weight: self.ewma_weight,
            min_samples: self.minimum_samples,
            max_samples: self.maximum_samples,
            initial_download: self.initial_download,
            initial_upload: self.initial_upload,
            overshoot: self.overshoot,
            ramp_up_band: self.ramp_up_band,
            convergence_band: self.convergence_band,
        }
    }
}

#[derive(Parser, Clone, Debug)]
pub struct Serve {
    /// TCP listen address
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub host: SocketAddr,
}

fn parse_seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("expected a positive number of seconds, got {s}"));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

fn parse_band(s: &str) -> Result<Band, String> {
    let (low, high) = s
        .split_once(',')
        .ok_or_else(|| format!("expected LOW,HIGH, got {s}"))?;
    let low: f64 = low.trim().parse().map_err(|e| format!("{e}"))?;
    let high: f64 = high.trim().parse().map_err(|e| format!("{e}"))?;
    Ok(Band::new(low, high))
}
