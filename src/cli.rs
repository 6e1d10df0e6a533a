use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "only1mcp", version, about = "Aggregating proxy for the Model Context Protocol")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "config/only1mcp.yaml")]
    pub config: PathBuf,

    /// Override the configured `log_level`.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override the configured HTTP ingress listen address.
    #[arg(long)]
    pub listen: Option<String>,

    /// Also serve a client-facing MCP endpoint over this process's own
    /// stdin/stdout, alongside the HTTP ingress.
    #[arg(long)]
    pub stdio: bool,
}
