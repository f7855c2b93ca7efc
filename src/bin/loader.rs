//! CLI front-end: opens the named executable and hands it to the loader.
//!
//! Thin glue per spec.md §1/§6: argument parsing only, no paging policy
//! lives here.

use clap::Parser;

/// Run a statically linked ELF64 executable under the on-demand loader.
#[derive(Parser)]
#[command(name = "loader", author, version, about)]
struct Cli {
    /// Path to the executable image.
    path: String,

    /// Arguments passed through to the target program (argv[0] is `path`).
    args: Vec<String>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = demand_loader::init() {
        log::error!("loader initialisation failed: {e}");
        std::process::exit(2);
    }

    let mut argv = Vec::with_capacity(cli.args.len() + 1);
    argv.push(cli.path.clone());
    argv.extend(cli.args);

    match demand_loader::execute(&cli.path, &argv) {
        Ok(_) => unreachable!("execute only returns on error"),
        Err(e) => {
            log::error!("failed to launch {}: {e}", cli.path);
            std::process::exit(2);
        }
    }
}
