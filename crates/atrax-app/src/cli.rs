use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "atrax", about = "Reverse proxy aggregating MCP upstreams behind one downstream server")]
pub struct Cli {
    /// Path to the proxy configuration document.
    #[arg(long)]
    pub config: PathBuf,

    /// Output format for log lines.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Tracing filter directive, e.g. "info" or "atrax_core=debug".
    /// Falls back to the RUST_LOG environment variable, then "info".
    #[arg(long)]
    pub log_level: Option<String>,
}
