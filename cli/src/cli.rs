use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tether")]
#[command(version)]
#[command(about = "Invoke commands on and exchange events with a tether host")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Host socket path (overrides config file and TETHER_SOCKET)
    #[arg(short, long, global = true)]
    pub socket: Option<PathBuf>,

    /// Window label of this client (overrides config file and TETHER_LABEL)
    #[arg(short, long, global = true)]
    pub label: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Invoke a host command and print its result
    Invoke(InvokeArgs),

    /// Print events as they arrive
    Listen(ListenArgs),

    /// Emit an event to the host
    Emit(EmitArgs),

    /// Run a loopback host answering `echo` and `ping`
    Serve(ServeArgs),
}

#[derive(Args)]
pub struct InvokeArgs {
    /// Command name to invoke
    pub command: String,

    /// Arguments as key=value; values are parsed as JSON, falling back to strings
    pub args: Vec<String>,

    /// Give up after this many milliseconds (waits forever by default)
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

#[derive(Args)]
pub struct ListenArgs {
    /// Event name to listen to
    pub event: String,

    /// Exit after the first event
    #[arg(long)]
    pub once: bool,
}

#[derive(Args)]
pub struct EmitArgs {
    /// Event name
    pub event: String,

    /// Payload, parsed as JSON, falling back to a string
    pub payload: Option<String>,

    /// Only deliver to the window with this label
    #[arg(long)]
    pub window: Option<String>,
}

#[derive(Args)]
pub struct ServeArgs {
    /// Event to broadcast to every client once a second, for testing listeners
    #[arg(long)]
    pub heartbeat: Option<String>,
}
