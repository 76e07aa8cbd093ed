mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sessiond-ctl", about = "Inspect and drive the device session service")]
struct Cli {
    /// Service socket (defaults to the per-user runtime socket)
    #[arg(long, global = true, env = "SESSIOND_SOCKET")]
    socket: Option<PathBuf>,

    /// Print raw JSON payloads instead of tables
    #[arg(long, global = true)]
    json: bool,

    /// Caller name attached to requests
    #[arg(long, global = true, default_value = "sessiond-ctl")]
    caller: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the service answers
    Handshake,

    /// Report a fresh device enumeration
    Enumerate {
        /// Transport paths of the connected devices
        paths: Vec<String>,
    },

    /// List devices with their owning sessions
    List,

    /// Acquire a device (intent and done)
    Acquire {
        /// Public device path
        path: String,

        /// Session currently owning the device, to take it over
        #[arg(long)]
        previous: Option<String>,

        /// Owner recorded on the session
        #[arg(long)]
        owner: Option<String>,
    },

    /// Release a session (intent and done)
    Release {
        /// Session to release
        session: String,
    },

    /// Show the transport path held by a session
    Path {
        /// Session to look up
        session: String,
    },

    /// Stream service events as JSON lines
    Watch,

    /// Drop every session
    Dispose,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let socket = cli
        .socket
        .unwrap_or_else(sessiond_protocol::paths::default_socket_path);
    let ctx = commands::Context::connect(&socket, cli.caller, cli.json).await?;

    match cli.command {
        Commands::Handshake => ctx.handshake().await,
        Commands::Enumerate { paths } => ctx.enumerate(paths).await,
        Commands::List => ctx.list().await,
        Commands::Acquire {
            path,
            previous,
            owner,
        } => ctx.acquire(path, previous, owner).await,
        Commands::Release { session } => ctx.release(session).await,
        Commands::Path { session } => ctx.path(session).await,
        Commands::Watch => ctx.watch().await,
        Commands::Dispose => ctx.dispose().await,
    }
}
