//! The main entrypoint for bootenv, which just performs global initialization, and then
//! calls out into the library.

use anyhow::Result;

fn run() -> Result<()> {
    bootenv_utils::initialize_tracing();
    tracing::trace!("starting {}", env!("CARGO_PKG_NAME"));
    bootenv_lib::cli::run_from_iter(std::env::args_os())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
