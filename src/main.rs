//! TCP Chat - Entry Point
//!
//! `tcp_chat server --address <host:port>` binds and serves;
//! `tcp_chat client --address <host:port>` dials and runs the console client.

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tcp_chat::config::{ServerConfig, DEFAULT_OUTBOUND_QUEUE};
use tcp_chat::codec::DEFAULT_MAX_FRAME_LENGTH;
use tcp_chat::{console, listener};

#[derive(Parser, Debug)]
#[command(name = "tcp_chat", version, about = "TCP chat server and console client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the chat server
    Server(ServerArgs),
    /// Connect to a chat server
    Client(ClientArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Address to bind the server to
    #[arg(short, long)]
    address: String,
    /// Per-connection outbound queue capacity
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_QUEUE)]
    outbound_queue: usize,
    /// Maximum encoded record length in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LENGTH)]
    max_frame_length: usize,
    /// Close sessions idle for this many seconds
    #[arg(long)]
    read_timeout_secs: Option<u64>,
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Address of the server to connect to
    #[arg(short, long)]
    address: String,
    /// Register with this username instead of prompting
    #[arg(short, long)]
    username: Option<String>,
    /// Maximum encoded record length in bytes; match the server's setting
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LENGTH)]
    max_frame_length: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=tcp_chat=trace
    // Logs go to stderr so the client transcript owns stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tcp_chat=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Server(args) => {
            let config = ServerConfig::new(args.address)
                .with_outbound_queue(args.outbound_queue)
                .with_max_frame_length(args.max_frame_length)
                .with_read_timeout(args.read_timeout_secs.map(Duration::from_secs));
            listener::run(config).await?;
        }
        Command::Client(args) => {
            console::run(&args.address, args.username, args.max_frame_length).await?;
        }
    }

    Ok(())
}
