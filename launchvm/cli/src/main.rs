mod args;
mod tap_control;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

fn main() -> ExitCode {
    let args = args::Args::parse();

    env_logger::Builder::new().filter_level(args.verbose.log_level_filter()).init();
    log::debug!("CLI ARGS: {args:?}");

    args.run().unwrap_or_exit()
}

pub trait UnwrapOrExit<T> {
    fn unwrap_or_exit(self) -> T;
}

impl<T> UnwrapOrExit<T> for Result<T> {
    fn unwrap_or_exit(self) -> T {
        self.unwrap_or_else(|e| {
            log::error!("{e:#}");
            std::process::exit(1);
        })
    }
}
