//! Fleetform: barrier-synchronized desired-state deployment for small
//! fleets.

use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

mod cli;
mod config;
mod configuration;
mod coordinator;
mod deploy;
mod host;
mod logs;
mod packages;
mod run;
mod template;

use cli::Commands;
use configuration::{Configuration, DirAssets};
use deploy::{DeployReport, Deployment};
use run::Secret;

fn main() {
    let cli = cli::get_cli();

    // The askpass hook runs as a short-lived child of sudo; it must stay
    // silent on stdout except for the password itself.
    if let Commands::Askpass { fifo, timeout } = &cli.command {
        run::sudo::askpass_main(fifo, Duration::from_secs_f64(*timeout));
    }

    match run_cli(cli) {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{e:?}");
            std::process::exit(1);
        }
    }
}

fn run_cli(cli: cli::Cli) -> Result<bool> {
    color_eyre::install()?;

    let mut builder = logs::LoggerBuilder::new();
    builder.with_verbosity(cli.verbosity);
    if cli.no_log_file {
        builder.without_log_file();
    }
    let _log_guard = builder
        .build()?
        .start()
        .wrap_err("Failed to initialize logging")?;

    let (config_path, fleet_path) = match &cli.command {
        Commands::Apply { config, fleet }
        | Commands::Delete { config, fleet }
        | Commands::Check { config, fleet } => (config.clone(), fleet.clone()),
        Commands::Askpass { .. } => unreachable!("handled before logging starts"),
    };

    let mut configuration = Configuration::from_toml_file(&config_path)?;
    if let Some(assets_root) = &cli.assets {
        configuration.attach_assets(Arc::new(DirAssets::new(assets_root)));
    }

    let fleet = match &fleet_path {
        Some(path) => config::FleetFile::load(path)?,
        None => config::FleetFile::localhost(),
    };

    let fallback_sudo_password = if cli.ask_sudo_pass {
        Some(prompt_sudo_password()?)
    } else {
        None
    };
    let hosts = fleet.build_hosts(fallback_sudo_password.as_ref())?;

    let deployment = Deployment {
        synchronize: fleet.synchronize && !cli.no_sync,
        fail_early: fleet.fail_early && !cli.no_fail_early,
        workers: cli.workers.or(fleet.workers),
        ..Deployment::default()
    };

    let (report, success) = match &cli.command {
        Commands::Apply { .. } => {
            let report = deployment.apply(&configuration, hosts)?;
            let success = report.all_ok();
            (report, success)
        }
        Commands::Delete { .. } => {
            let report = deployment.delete(&configuration, hosts)?;
            let success = report.all_ok();
            (report, success)
        }
        Commands::Check { .. } => {
            let report = deployment.is_applied(&configuration, hosts)?;
            let success = report.all_applied();
            (report, success)
        }
        Commands::Askpass { .. } => unreachable!("handled before logging starts"),
    };

    print_report(&report);
    Ok(success)
}

fn print_report(report: &DeployReport) {
    for (host, value) in &report.ok {
        info!("[{host}] ok: {value}");
    }
    for (host, error) in &report.err {
        error!("[{host}] {error}");
        // An enforcement failure carries the full process record.
        if let configuration::OpError::Failed { error: cause, .. } = error {
            if let Some(run_error) = cause.downcast_ref::<run::RunError>() {
                if let Some(dump) = run_error.dump() {
                    for line in dump.lines() {
                        error!("[{host}]   {line}");
                    }
                }
            }
        }
    }
}

/// Interactive password prompt for `--ask-sudo-pass`.
fn prompt_sudo_password() -> Result<Secret> {
    let password = dialoguer::Password::new()
        .with_prompt(format!("[sudo] password for {}", whoami::username()))
        .interact()
        .wrap_err("Failed to read sudo password")?;
    Ok(Secret::new(password))
}
