mod cli;
mod detile;
mod drm;
mod encode;
mod info;
mod mux;
mod record;
mod screenshot;
mod workers;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, FromArgMatches};

use cli::{Cli, Mode};

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut command = Cli::command();
    let matches = match command.clone().try_get_matches() {
        Ok(matches) => matches,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return;
        }
        Err(e) => {
            let _ = e.print();
            let _ = command.print_help();
            std::process::exit(1);
        }
    };
    let args = match Cli::from_arg_matches(&matches) {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli::mode(&matches), &args) {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(mode: Mode, args: &Cli) -> Result<()> {
    match mode {
        Mode::DumpInfo => info::dump_report(&mut std::io::stdout().lock()),
        Mode::Screenshot => screenshot::take(&mut std::io::stdout().lock(), args.geometry.as_ref()),
        Mode::Record => {
            let output = args
                .output
                .as_deref()
                .context("for recording, provide an output file with -o or --output")?;
            record::record(
                output,
                &args.preset,
                args.geometry.as_ref(),
                args.record_every_th,
            )
        }
    }
}
