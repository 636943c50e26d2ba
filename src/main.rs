use clap::Parser as _;
use colored::Colorize as _;
use std::process::ExitCode;

use svn2git::cli::Cli;

fn main() -> ExitCode {
    // Make panic messages red.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic| {
        if let Some(payload) = panic.payload().downcast_ref::<&str>() {
            eprintln!("\n{}\n", payload.red());
        }
        if let Some(payload) = panic.payload().downcast_ref::<String>() {
            eprintln!("\n{}\n", payload.red());
        }
        default_hook(panic);
    }));

    let args = Cli::parse();
    let level = match args.log_level.value() {
        Ok(level) => level,
        Err(err) => {
            eprintln!("{err:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = svn2git::log::init(level) {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    match svn2git::driver::run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
