mod cli;
mod config;
mod error;
mod ewma;
mod nearby;
mod payload;
mod progress;
mod report;
mod sampler;
mod server;
mod transport;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use crossbeam_channel as channel;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, ServersArgs, TestArgs};
use crate::config::{ResolvedServer, UserConfig};
use crate::error::{ConfigError, NearbyError, TestError};
use crate::report::OutputFormat;
use crate::sampler::{Mode, Summary};
use crate::server::run_serve;
use crate::transport::{HttpTransport, StopFlag};

fn init_tracing(debug: bool, serving: bool) {
    let default = match (debug, serving) {
        (true, _) => "qospeedtest=debug",
        (false, true) => "info",
        (false, false) => "warn",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false);
    if debug || serving {
        builder.try_init().ok();
    } else {
        builder.without_time().try_init().ok();
    }
}

fn print_servers(args: ServersArgs) -> Result<()> {
    if args.nearby {
        for server in nearby::servers(nearby::FETCH_TIMEOUT)?.iter().take(nearby::LISTED) {
            println!("{server}");
        }
        return Ok(());
    }
    let config = UserConfig::load()?;
    if config.servers.is_empty() {
        eprintln!("<no servers>");
        return Ok(());
    }
    for (name, profile) in &config.servers {
        if config.default_server.as_deref() == Some(name.as_str()) {
            println!("{name}\t{}\t(default)", profile.url);
        } else {
            println!("{name}\t{}", profile.url);
        }
    }
    Ok(())
}

fn run_speed_test(args: TestArgs, debug: bool) -> Result<()> {
    let settings = args.sampler_settings();
    settings.validate()?;
    let modes: Vec<Mode> = [(Mode::Download, args.no_download), (Mode::Upload, args.no_upload)]
        .into_iter()
        .filter(|(_, skip)| !skip)
        .map(|(mode, _)| mode)
        .collect();
    if modes.is_empty() {
        return Err(TestError::Settings("both download and upload tests are disabled".into()).into());
    }

    let config = UserConfig::load()?;
    let server = match config.resolve_server(args.server.as_deref()) {
        Err(ConfigError::NoServer) => {
            let closest = nearby::closest(args.timeout)?;
            eprintln!(
                "Using closest speedtest.net server: {} in {}, {}",
                closest.sponsor, closest.name, closest.cc
            );
            ResolvedServer {
                url: closest.url()?,
                profile: None,
            }
        }
        resolved => resolved?,
    };
    info!(url = %server.url, profile = ?server.profile, "Using server");

    let stop_flag: StopFlag = Arc::new(AtomicBool::new(false));
    {
        let stop = stop_flag.clone();
        let _ = ctrlc::set_handler(move || {
            stop.store(true, Ordering::Relaxed);
        });
    }

    let mut transport = HttpTransport::new(server.url.clone(), args.timeout)?;

    let show_progress = !debug && args.format == OutputFormat::Text && progress::enabled();
    let (progress_tx, renderer) = if show_progress {
        let (tx, rx) = channel::unbounded();
        (Some(tx), Some(progress::spawn_renderer(rx)))
    } else {
        (None, None)
    };

    let mut run_all = || -> Result<Vec<Summary>> {
        let mut summaries = Vec::with_capacity(modes.len());
        for &mode in &modes {
            let summary = sampler::run(&mut transport, mode, &settings, &stop_flag, progress_tx.as_ref())
                .with_context(|| format!("{mode} test against {}", server.url))?;
            summaries.push(summary);
        }
        Ok(summaries)
    };
    let result = run_all();

    // The renderer exits once every sender is gone.
    drop(progress_tx);
    if let Some(handle) = renderer {
        let _ = handle.join();
    }

    let summaries = result?;
    report::write_summaries(&mut io::stdout().lock(), &summaries, args.format)
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug, matches!(cli.command, Some(Commands::Serve(_))));

    let result: Result<()> = match cli.command {
        Some(Commands::Test(args)) => run_speed_test(args, cli.debug),
        Some(Commands::Servers(args)) => print_servers(args),
        Some(Commands::Serve(serve)) => run_serve(serve),
        None => {
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(err) = result {
        // Map to stable exit codes
        let code = exit_code_for_error(&err);
        if code == 130 {
            eprintln!("interrupted");
        } else {
            eprintln!("error: {err:?}");
        }
        std::process::exit(code);
    }
}

pub(crate) fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    // 2: config/settings, 3: transport, 4: protocol, 5: bind failure, 130: interrupted, 1: other
    for cause in err.chain() {
        if let Some(nearby) = cause.downcast_ref::<NearbyError>() {
            match nearby {
                // The TestError source follows in the chain.
                NearbyError::Fetch(_) => continue,
                NearbyError::Parse(_) | NearbyError::Empty => return 4,
                NearbyError::Cache { .. } => return 1,
            }
        }
        if let Some(test) = cause.downcast_ref::<TestError>() {
            return match test {
                t if t.is_transport() => 3,
                TestError::Protocol(_) => 4,
                TestError::Interrupted => 130,
                TestError::Settings(_) => 2,
                _ => 1,
            };
        }
        if cause.is::<ConfigError>() {
            return 2;
        }
        if let Some(ioe) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind::*;
            return match ioe.kind() {
                AddrInUse | AddrNotAvailable | PermissionDenied => 5,
                _ => 1,
            };
        }
    }
    1
}
