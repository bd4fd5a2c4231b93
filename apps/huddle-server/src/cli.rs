use clap::Parser;

/// Session signaling server for multi-party real-time sessions.
#[derive(Debug, Parser)]
#[command(name = "huddle-server", version, about)]
pub struct Cli {
    /// Port to listen on (overrides HUDDLE_PORT).
    #[arg(long)]
    pub port: Option<u16>,

    /// Address to bind (overrides HUDDLE_BIND).
    #[arg(long)]
    pub bind: Option<String>,
}
