mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tether_session::{ClientConfig, ENDPOINT_ENV};

use crate::commands::Target;

#[derive(Parser)]
#[command(name = "tether", about = "Talk to a coding-assistant backend from the terminal")]
struct Cli {
    /// Backend endpoint: unix:/path, tcp://host:port or a socket path
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Config file (default: $XDG_CONFIG_HOME/tether/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a chat message and print the response
    Chat {
        message: String,

        /// File to attach (repeatable)
        #[arg(long = "file")]
        files: Vec<String>,

        /// Image to attach (repeatable)
        #[arg(long = "image")]
        images: Vec<String>,

        /// Keep printing status updates until the task finishes
        #[arg(long)]
        follow: bool,
    },

    /// Create, modify or delete a file through the backend
    Edit {
        path: String,

        /// New file content
        #[arg(long, conflicts_with = "from")]
        content: Option<String>,

        /// Read new content from a local file
        #[arg(long)]
        from: Option<PathBuf>,

        /// Create the file instead of modifying it
        #[arg(long, conflicts_with = "delete")]
        create: bool,

        /// Delete the file
        #[arg(long)]
        delete: bool,
    },

    /// Run a shell command on the backend
    Run {
        command: String,

        /// Working directory on the backend
        #[arg(long)]
        cwd: Option<String>,
    },

    /// Cancel a running task
    Cancel {
        /// Task ID
        task_id: String,
    },

    /// Stream inbound frames as JSON lines
    Watch {
        /// Only these kinds, e.g. task.status (repeatable)
        #[arg(long = "kind")]
        kinds: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries JSON.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether_cli=warn,tether_session=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = ClientConfig::load(cli.config.as_deref())?;
    let env_endpoint = std::env::var(ENDPOINT_ENV).ok();
    let target = Target {
        endpoint: config.resolve_endpoint(cli.endpoint.as_deref(), env_endpoint.as_deref())?,
        session: config.session,
    };
    tracing::debug!(endpoint = %target.endpoint, "resolved endpoint");

    match cli.command {
        Commands::Chat {
            message,
            files,
            images,
            follow,
        } => commands::chat(&target, message, files, images, follow).await,
        Commands::Edit {
            path,
            content,
            from,
            create,
            delete,
        } => commands::edit(&target, path, content, from, create, delete).await,
        Commands::Run { command, cwd } => commands::run(&target, command, cwd).await,
        Commands::Cancel { task_id } => commands::cancel(&target, task_id).await,
        Commands::Watch { kinds } => commands::watch(&target, kinds).await,
    }
}
