use crate::config::{
    BenchmarkSettings, DEFAULT_STREAM_CONFIG, RawStreamConfig, RoleSelection, Settings, app_name, app_version,
};
use crate::pipeline::description::Platform;
use crate::pipeline::simulated::SimulatedBackend;
use crate::pipeline::SystemStageClock;
use crate::supervisor::registry::HandleRegistry;
use crate::supervisor::{Environment, SupervisorHandle};
use crate::telemetry::FrameIdAssigner;
use crate::utils::sos::SignalOfStop;
use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::{panic, process};
use tokio::io::BufReader;
use tracing_subscriber::filter::LevelFilter;

pub mod config;
pub mod control;
pub mod pipeline;
pub mod supervisor;
pub mod telemetry;
pub mod utils;

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            process::exit(1);
        }
    }
}

fn cli() -> Command {
    Command::new(app_name())
        .version(app_version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("role")
                .short('r')
                .long("role")
                .value_name("ROLE")
                .help("Pipelines to drive (sender/receiver/both).")
                .ignore_case(true)
                .default_value("both"),
        )
        .arg(
            Arg::new("platform")
                .short('p')
                .long("platform")
                .value_name("PLATFORM")
                .help("Pipeline profile (desktop/jetson).")
                .ignore_case(true)
                .default_value("desktop"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON configuration published before reading control input.")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("benchmark-samples")
                .long("benchmark-samples")
                .value_name("FRAMES")
                .help("Dump raw checkpoint timestamps of this many frames, then stop recording.")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("dump-dir")
                .long("dump-dir")
                .value_name("DIR")
                .help("Directory receiving benchmark dumps.")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value("."),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase log verbosity (-v debug, -vv trace).")
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("print-default")
                .long("print-default")
                .help("Print the default configuration as a control object and exit.")
                .action(ArgAction::SetTrue),
        )
}

fn settings_from(matches: &ArgMatches) -> anyhow::Result<Settings> {
    let role: RoleSelection = matches
        .get_one::<String>("role")
        .map(String::as_str)
        .unwrap_or("both")
        .parse()?;
    let platform: Platform = matches
        .get_one::<String>("platform")
        .map(String::as_str)
        .unwrap_or("desktop")
        .parse()?;

    let benchmark = matches
        .get_one::<usize>("benchmark-samples")
        .map(|samples| BenchmarkSettings {
            samples: *samples,
            dump_dir: matches
                .get_one::<PathBuf>("dump-dir")
                .cloned()
                .unwrap_or_else(|| PathBuf::from(".")),
        });

    Ok(Settings {
        role,
        platform,
        benchmark,
        initial_config: matches.get_one::<PathBuf>("config").cloned(),
        ..Settings::default()
    })
}

async fn run() -> anyhow::Result<i32> {
    let matches = cli().get_matches();

    let level = match matches.get_count("verbose") {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    if matches.get_flag("print-default") {
        let raw = RawStreamConfig::from(&DEFAULT_STREAM_CONFIG);
        println!("{}", serde_json::to_string_pretty(&raw)?);
        return Ok(0);
    }

    let settings = settings_from(&matches)?;

    // kill the process as soon as a supervisor thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    info!(
        "{} {} starting: role {:?}, platform {}",
        app_name(),
        app_version(),
        settings.role,
        settings.platform
    );

    let env = Environment {
        backend: Arc::new(SimulatedBackend::new()),
        channel: control::ConfigChannel::new(),
        registry: HandleRegistry::new(),
        sos: SignalOfStop::new(),
        clock: Arc::new(SystemStageClock::new()),
        frame_ids: Arc::new(FrameIdAssigner::new()),
        telemetry: true,
    };
    let supervisors = supervisor::spawn_all(&settings, &env)?;

    if let Some(path) = &settings.initial_config {
        let config = control::load_config_file(path)?;
        config.dump();
        let version = env.channel.publish(config);
        info!("Published configuration version {} from {}", version, path.display());
    }

    let reader = {
        let channel = env.channel.clone();
        let sos = env.sos.clone();
        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            match control::reader::run(stdin, channel, sos.clone()).await {
                Ok(exit) => debug!("Control reader finished: {:?}", exit),
                Err(e) => {
                    error!("Control input failed: {}", e);
                    sos.cancel();
                }
            }
        })
    };

    let token = env.sos.token();
    let code = tokio::select! {
        _ = token.cancelled() => 0,
        signal = wait_for_signal() => signal?,
    };

    env.sos.cancel();
    if code != 0 {
        warn!("Received signal {}, stopping all pipelines", code);
        let registry = env.registry.clone();
        let timeout = settings.timings.stop_timeout;
        let stopped = tokio::task::spawn_blocking(move || registry.stop_all(timeout))
            .await
            .context("pipeline stop task failed")?;
        info!("{} pipelines stopped", stopped);
    }

    join_supervisors(supervisors, &settings).await;
    reader.abort();

    info!("{} exiting with code {}", app_name(), code);
    Ok(code)
}

async fn join_supervisors(supervisors: Vec<SupervisorHandle>, settings: &Settings) {
    let joined = tokio::task::spawn_blocking(move || {
        for supervisor in supervisors {
            if supervisor.thread.join().is_err() {
                error!("[{}] supervisor thread panicked", supervisor.id);
            }
        }
    });

    match tokio::time::timeout(settings.shutdown_grace, joined).await {
        Ok(Ok(())) => debug!("All supervisors finished"),
        Ok(Err(e)) => error!("Supervisor join task failed: {}", e),
        Err(_) => warn!(
            "Supervisors still running after {:?}, exiting anyway",
            settings.shutdown_grace
        ),
    }
}

/// Wait for SIGINT, SIGTERM or SIGHUP and return its number
#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<i32> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt()).context("cannot install SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("cannot install SIGHUP handler")?;

    let kind = tokio::select! {
        _ = interrupt.recv() => SignalKind::interrupt(),
        _ = terminate.recv() => SignalKind::terminate(),
        _ = hangup.recv() => SignalKind::hangup(),
    };
    Ok(kind.as_raw_value())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<i32> {
    tokio::signal::ctrl_c()
        .await
        .context("cannot install Ctrl-C handler")?;
    Ok(2)
}
