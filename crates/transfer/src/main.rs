use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;
use transfer_server::events::ChangeNotifier;
use transfer_server::storage::LocalFolder;
use transfer_server::transfer::{format_file_size, FileTransfer, DEFAULT_CHUNK_SIZE};
use transfer_server::ServerConfig;

mod client;
mod console;

use client::Remote;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "transfer", about = "Share a folder with devices on your local network", version)]
struct Cli {
    /// Server URL for client commands (default: http://localhost:8000 or $TRANSFER_SERVER)
    #[arg(long, env = "TRANSFER_SERVER", default_value = "http://localhost:8000")]
    server: String,

    /// Server password, if one is set ($TRANSFER_PASSWORD)
    #[arg(long, env = "TRANSFER_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Share a folder over HTTP and approve clients from this terminal
    Serve {
        /// Folder to share ($TRANSFER_FOLDER). Without one, use `start <folder>` at the prompt
        #[arg(env = "TRANSFER_FOLDER")]
        folder: Option<PathBuf>,
        /// Port to listen on (default: $TRANSFER_PORT or 8000)
        #[arg(long, env = "TRANSFER_PORT", default_value = "8000")]
        port: u16,
        /// Host to bind (default: $TRANSFER_HOST or 0.0.0.0)
        #[arg(long, env = "TRANSFER_HOST", default_value = "0.0.0.0")]
        host: IpAddr,
        /// Let clients in without asking for approval
        #[arg(long)]
        no_ip_approval: bool,
        /// How long an approval lasts, e.g. 1h, 30m
        #[arg(long, env = "TRANSFER_APPROVAL_TTL", value_parser = humantime::parse_duration)]
        approval_ttl: Option<Duration>,
        /// Streaming buffer size in bytes
        #[arg(long, env = "TRANSFER_CHUNK_SIZE")]
        chunk_size: Option<usize>,
        /// Where settings.json lives ($TRANSFER_DATA_DIR)
        #[arg(long, env = "TRANSFER_DATA_DIR")]
        data_dir: Option<PathBuf>,
    },
    /// Save text into a folder as pasted_text_N.txt (reads stdin without TEXT)
    Paste {
        /// Text to save
        text: Option<String>,
        /// Destination folder
        #[arg(long, env = "TRANSFER_FOLDER", default_value = ".")]
        folder: PathBuf,
    },
    /// List files on a server
    List,
    /// Download a file from a server
    Get {
        /// File name on the server
        name: String,
        /// Where to write it (default: the same name in the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Upload a file to a server, replacing any file of the same name
    Push {
        /// Local file
        path: PathBuf,
        /// Name on the server (default: the local file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Download every file on a server as one zip
    Zip {
        /// Where to write the archive
        #[arg(short, long, default_value = "transfer_files.zip")]
        output: PathBuf,
    },
    /// Delete a file on a server
    Delete {
        /// File name on the server
        name: String,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("TRANSFER_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let remote = Remote::new(&cli.server, cli.password.clone());

    match cli.command {
        Commands::Serve {
            folder,
            port,
            host,
            no_ip_approval,
            approval_ttl,
            chunk_size,
            data_dir,
        } => {
            let defaults = ServerConfig::default();
            let cfg = ServerConfig {
                host,
                port,
                folder,
                password: cli.password,
                ip_approval: no_ip_approval.then_some(false).or(defaults.ip_approval),
                approval_ttl: approval_ttl.unwrap_or(defaults.approval_ttl),
                chunk_size: chunk_size.filter(|n| *n > 0).unwrap_or(defaults.chunk_size),
                data_dir,
                ..defaults
            };
            cmd_serve(cfg).await
        }

        Commands::Paste { text, folder } => cmd_paste(text, &folder).await,

        Commands::List => cmd_list(&remote).await,

        Commands::Get { name, output } => {
            let dest = output.unwrap_or_else(|| PathBuf::from(&name));
            let bytes = remote.download(&name, &dest).await?;
            println!("{} ({})", dest.display(), format_file_size(bytes));
            Ok(())
        }

        Commands::Push { path, name } => {
            let name = match name {
                Some(n) => n,
                None => file_name(&path)?,
            };
            println!("{}", remote.push(&path, &name).await?);
            Ok(())
        }

        Commands::Zip { output } => {
            match remote.download_zip(&output).await? {
                Some(bytes) => println!("{} ({})", output.display(), format_file_size(bytes)),
                None => println!("no files to download"),
            }
            Ok(())
        }

        Commands::Delete { name } => {
            println!("{}", remote.delete(&name).await?);
            Ok(())
        }
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn cmd_serve(cfg: ServerConfig) -> Result<()> {
    let handle = transfer_server::run(cfg).await?;
    let result = console::run(&handle).await;
    println!("shutting down");
    handle.shutdown().await;
    result
}

async fn cmd_paste(text: Option<String>, folder: &Path) -> Result<()> {
    let text = match text {
        Some(t) => t,
        None => {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .context("read stdin")?;
            buf
        }
    };
    if text.trim().is_empty() {
        anyhow::bail!("nothing to paste");
    }

    let transfer = FileTransfer::new(
        Arc::new(LocalFolder::new(folder)),
        ChangeNotifier::new(),
        DEFAULT_CHUNK_SIZE,
    );
    let name = transfer
        .create_text_file("pasted_text", &text)
        .await
        .with_context(|| format!("write into {}", folder.display()))?;
    println!("{}", folder.join(name).display());
    Ok(())
}

async fn cmd_list(remote: &Remote) -> Result<()> {
    let files = remote.list().await?;
    if files.is_empty() {
        println!("(no files)");
        return Ok(());
    }

    let width = files.iter().map(|f| f.name.len()).max().unwrap_or(0);
    for f in &files {
        println!(
            "{:<width$}  {:>10}  {}",
            f.name, f.formatted_size, f.last_modified
        );
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned)
        .with_context(|| format!("{} has no usable file name; pass --name", path.display()))
}
