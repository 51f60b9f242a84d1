//! workers-wasi CLI - run a preview1 guest against the in-memory filesystem
//!
//! Commands:
//!   workers-wasi run <guest.wasm> --memfs <memfs.wasm>  - Run a guest to completion

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use workers_wasi::{Runtime, WasiError, WasiOptions};

#[derive(Parser)]
#[command(name = "workers-wasi")]
#[command(about = "Run WASI preview1 guests with an in-memory filesystem", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a guest module to completion
    Run {
        /// Path to the guest WASM file
        guest: PathBuf,

        /// Path to the filesystem WASM module
        #[arg(long)]
        memfs: PathBuf,

        /// Argument passed to the guest (repeatable; the first is argv[0])
        #[arg(long = "arg")]
        args: Vec<String>,

        /// Environment variable as KEY=VALUE (repeatable)
        #[arg(long = "env", value_parser = parse_pair)]
        env: Vec<(String, String)>,

        /// Preopened directory (repeatable)
        #[arg(long = "preopen")]
        preopens: Vec<String>,

        /// Initial file as PATH=CONTENTS (repeatable)
        #[arg(long = "file", value_parser = parse_pair)]
        files: Vec<(String, String)>,

        /// Buffer stdio instead of streaming it (for guests without asyncify)
        #[arg(long)]
        no_stream_stdio: bool,

        /// Report proc_exit as the exit status instead of an error
        #[arg(long)]
        return_on_exit: bool,

        /// Log every WASI import call
        #[arg(long)]
        trace_imports: bool,
    },
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?;

    let status = match cli.command {
        Commands::Run {
            guest,
            memfs,
            args,
            env,
            preopens,
            files,
            no_stream_stdio,
            return_on_exit,
            trace_imports,
        } => {
            let mut options = WasiOptions::new()
                .args(args)
                .return_on_exit(return_on_exit)
                .stream_stdio(!no_stream_stdio)
                .trace_imports(trace_imports)
                .stdin(Box::new(tokio::io::stdin()))
                .stdout(Box::new(tokio::io::stdout()))
                .stderr(Box::new(tokio::io::stderr()));
            options.env = env;
            options.preopens = preopens;
            options.fs = files.into_iter().collect();

            runtime.block_on(run_command(&guest, &memfs, options))?
        }
    };

    std::process::exit(status);
}

async fn run_command(guest: &Path, memfs: &Path, options: WasiOptions) -> anyhow::Result<i32> {
    let memfs_bytes = std::fs::read(memfs)
        .with_context(|| format!("Failed to read {}", memfs.display()))?;
    let guest_bytes = std::fs::read(guest)
        .with_context(|| format!("Failed to read {}", guest.display()))?;

    let runtime = Runtime::new(&memfs_bytes)?;
    let module = runtime.load_module(&guest_bytes)?;

    match runtime.run(&module, options).await {
        Ok(status) => Ok(status.unwrap_or(0)),
        Err(WasiError::Exit(exit)) => Ok(exit.code),
        Err(e) => Err(e.into()),
    }
}
