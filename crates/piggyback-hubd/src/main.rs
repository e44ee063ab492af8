//! piggyback-hub: relays piggyback data between Checkmk sites.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};

use hub_core::HubSettings;
use hub_services::{AmqpConnector, CrashReportStore, CrashReporter};

use piggyback_hubd::cli::Args;
use piggyback_hubd::daemon::{self, AlreadyRunning, PidFile};
use piggyback_hubd::logging;
use piggyback_hubd::supervisor::Hub;

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    if args.debug {
        return run(args);
    }

    let crash = CrashReportStore::new(&args.omd_root);
    match run(args) {
        Ok(code) => Ok(code),
        Err(e) if AlreadyRunning::is_in(&e) => {
            tracing::warn!(error = %e, "piggyback hub not started");
            eprintln!("piggyback-hub: {e}");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "piggyback hub failed");
            crash.report("main", &e);
            eprintln!("piggyback-hub: {e:#}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn run(args: Args) -> Result<ExitCode> {
    if !args.foreground {
        daemon::daemonize()?;
    }
    logging::init(&args.log_file, args.log_level.into())?;
    let _pid_file = PidFile::acquire(&args.pid_file)?;

    let settings = HubSettings::load(&args.omd_root).context("failed to load hub settings")?;
    tracing::info!(
        site = %args.omd_site,
        root = %args.omd_root.display(),
        version = env!("CARGO_PKG_VERSION"),
        "piggyback hub starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let exit = runtime.block_on(async {
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let foreground = args.foreground;
        let terminate = async move {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("SIGTERM received"),
                _ = tokio::signal::ctrl_c(), if foreground => tracing::info!("interrupted"),
            }
        };

        let hub = Hub {
            connector: Arc::new(AmqpConnector::new(
                args.omd_root.clone(),
                args.omd_site.clone(),
                &settings.broker,
            )),
            crash: Arc::new(CrashReportStore::new(&args.omd_root)),
            root: args.omd_root.clone(),
            site: args.omd_site.clone(),
            settings,
        };
        anyhow::Ok(hub.run(terminate).await)
    })?;

    // Aborted workers may still sit in a blocking call.
    runtime.shutdown_timeout(Duration::from_secs(1));
    tracing::info!(exit_code = exit.code(), ?exit, "piggyback hub stopped");
    Ok(ExitCode::from(exit.code()))
}
