//! Roundwork binary.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Parse configuration** from flags and `ROUNDWORK_*` environment variables.
//! 2. **Wire logging**: `tracing-subscriber` with an `EnvFilter` (`RUST_LOG`,
//!    default `info`) writing to stderr, since stdout carries the response.
//! 3. **Select the transport**:
//!    - `run` handles exactly one call: request on stdin, response on stdout,
//!      non-zero exit with a diagnostic on stderr if the call fails.
//!    - `serve` runs the TCP listener from the `listener` crate.

mod demos;

use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use listener::NodeProvider;
use nodes::{Node, NodeOptions};
use pipeline::{AdvancePolicy, CallRequest, Role};
use tracing_subscriber::EnvFilter;

use crate::demos::DemoPipeline;

/// Roundwork - resumable phase pipelines for multi-party computations
#[derive(Parser, Debug)]
#[command(name = "roundwork")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log output format on stderr
    #[arg(long, value_enum, default_value = "pretty", env = "ROUNDWORK_LOG_FORMAT", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Handle one call: request JSON on stdin, response JSON on stdout
    Run {
        /// Party this process plays: local or remote
        #[arg(long, env = "ROUNDWORK_ROLE")]
        role: Role,

        #[command(flatten)]
        node: NodeArgs,
    },

    /// Serve calls for both roles over newline-delimited JSON on TCP
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:8881", env = "ROUNDWORK_BIND")]
        bind: String,

        #[command(flatten)]
        node: NodeArgs,
    },
}

#[derive(clap::Args, Debug, Clone, Copy)]
struct NodeArgs {
    /// Pipeline to run
    #[arg(long, value_enum, env = "ROUNDWORK_PIPELINE")]
    pipeline: DemoPipeline,

    /// Append a record of every call to <outputDirectory>/<ROLE>_<clientId>_logs.txt
    #[arg(long, env = "ROUNDWORK_DEBUG_LOG")]
    debug_log: bool,

    /// When single-iteration phases advance
    #[arg(long, value_enum, default_value = "always", env = "ROUNDWORK_ADVANCE_POLICY")]
    advance_policy: PolicyArg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    Pretty,
    /// One JSON object per event
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    /// Single-iteration phases advance after one execution
    Always,
    /// Every phase waits for jump_to_next
    Explicit,
}

impl From<PolicyArg> for AdvancePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Always => AdvancePolicy::SingleIterationAlwaysAdvances,
            PolicyArg::Explicit => AdvancePolicy::ExplicitSignalOnly,
        }
    }
}

impl NodeArgs {
    fn build_node(self, role: Role) -> Result<Node, pipeline::PipelineError> {
        let pipeline = demos::build(self.pipeline, role, self.advance_policy.into())?;
        let options = NodeOptions {
            debug_log: self.debug_log,
        };
        Ok(Node::with_options(pipeline, options))
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { role, node } => run_once(role, node),
        Command::Serve { bind, node } => serve(&bind, node),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Pretty => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

fn run_once(role: Role, args: NodeArgs) -> anyhow::Result<()> {
    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("failed to read the request from stdin")?;

    let node = args.build_node(role)?;
    let request = CallRequest::from_json(&raw)?;
    let response = node.compute(request).inspect_err(|e| {
        tracing::error!(%role, error = %e, retry = ?e.retry_policy(), "Call failed");
    })?;

    let encoded = response.to_json()?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{encoded}").context("failed to write the response to stdout")?;
    stdout.flush()?;
    Ok(())
}

fn serve(bind: &str, args: NodeArgs) -> anyhow::Result<()> {
    // Both roles must build before the listener accepts connections.
    for role in [Role::Local, Role::Remote] {
        args.build_node(role)?;
    }

    let provider: NodeProvider = Arc::new(move |role| args.build_node(role));
    let runtime = tokio::runtime::Runtime::new().context("failed to start the async runtime")?;
    runtime.block_on(listener::serve(bind, provider))?;
    Ok(())
}
