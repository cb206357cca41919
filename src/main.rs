use std::{panic, process::ExitCode};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::{
    cli::Args,
    core::{cancel::cancellation, report::RunClass},
};

mod cli;
mod config;
mod core;
mod corpus;
mod native;

#[cfg(test)]
mod stubs;
#[cfg(test)]
mod test_support;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args);
    set_panic_hook();

    let (handle, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            handle.cancel();
        }
    });

    match cli::run(&args, signal).await {
        Ok(report) => {
            print!("{}", cli::render_summary(&report));
            ExitCode::from(report.class().exit_code())
        }
        Err(err) => {
            tracing::error!("{:#}", err);
            eprintln!("error: {:#}", err);
            ExitCode::from(RunClass::InfrastructureFailure.exit_code())
        }
    }
}

fn init_tracing(args: &Args) {
    let default = if args.verbose { "ubdiff=debug" } else { "ubdiff=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if args.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
