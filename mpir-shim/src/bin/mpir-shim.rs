//! Command-line front end for the MPIR shim.
//!
//! Drives [`mpir_shim::run`] against the scripted PMIx runtime for dry runs;
//! a production deployment substitutes a transport backed by the system PMIx
//! library.

use std::path::PathBuf;
use std::process::exit;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use mpir_shim::pmix::sim::{SimConfig, SimTool};
use mpir_shim::{run, RunMode, ShimOptions};

#[derive(Parser)]
#[clap(
    name = "mpir-shim",
    about = "MPIR process-acquisition front end for PMIx launchers",
    version
)]
struct Cli {
    /// How to reach the launcher: proxy, non-proxy, attach or dynamic.
    #[clap(long, default_value_t = RunMode::Dynamic)]
    mode: RunMode,

    /// Pid of an already-running launcher (attach mode).
    #[clap(long, default_value_t = 0)]
    pid: i32,

    /// Emit shim progress diagnostics.
    #[clap(long, short)]
    debug: bool,

    /// PMIx installation prefix handed to the launcher.
    #[clap(long)]
    pmix_prefix: Option<PathBuf>,

    /// Number of application processes the dry-run transport reports.
    #[clap(long, default_value_t = 2)]
    nprocs: u32,

    /// The launcher command and all of its arguments.
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    run_args: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.debug);

    let mut sim = SimConfig {
        nprocs: cli.nprocs,
        ..SimConfig::default()
    };
    if let Some(executable) = cli.run_args.last() {
        sim.executable = executable.clone();
    }

    let launcher = cli.run_args.first().cloned();
    let options = ShimOptions {
        mode: cli.mode,
        target_pid: cli.pid,
        debug: cli.debug,
        run_args: cli.run_args,
        pmix_prefix: cli.pmix_prefix,
    };
    let result = run(options, Box::new(SimTool::new(sim))).with_context(|| match launcher {
        Some(launcher) => format!("failed to debug '{launcher}'"),
        None => "failed to attach to the launcher".into(),
    });
    match result {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("mpir-shim: {err:#}");
            exit(1);
        }
    }
}

fn setup_logging(debug: bool) {
    let default = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
