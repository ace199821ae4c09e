use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use graphsync::config::DEFAULT_PORT;
use graphsync::listener::TransmissionListener;
use graphsync::store::NodeRecord;
use graphsync::{
    run_transmission, CloudServer, Credentials, DirectoryStore, SyncConfig, SyncError,
    Transmission, TransmissionResult,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "graphsync")]
#[command(about = "Push and pull graph entities and file content between instances", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// TOML config file
    #[arg(long, global = true, env = "GRAPHSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve a directory store to remote peers
    Serve {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// List the syncable root entities of a remote instance
    List {
        #[command(flatten)]
        remote: RemoteArgs,
        /// Only entities of this type
        #[arg(long = "type")]
        type_filter: Option<String>,
    },
    /// Pull a node (and with --recursive its subgraph) into a local store
    Pull {
        node_id: String,
        #[arg(long)]
        root: PathBuf,
        #[arg(short, long)]
        recursive: bool,
        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Push a node (and with --recursive its subgraph) to a remote instance
    Push {
        node_id: String,
        #[arg(long)]
        root: PathBuf,
        #[arg(short, long)]
        recursive: bool,
        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Add a local file to a directory store as a file node
    Import {
        file: PathBuf,
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        id: String,
        #[arg(long = "type", default_value = "File")]
        node_type: String,
    },
}

#[derive(Args, Debug)]
struct RemoteArgs {
    #[arg(long, default_value = "localhost")]
    host: String,
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    #[arg(long, env = "GRAPHSYNC_USER", default_value = "admin")]
    user: String,
    #[arg(long, env = "GRAPHSYNC_PASSWORD", hide_env_values = true)]
    password: String,
}

impl RemoteArgs {
    fn credentials(&self) -> Credentials {
        Credentials::new(self.user.clone(), self.password.clone())
    }
}

/// Terminal progress for one transmission.
struct ProgressListener {
    bar: ProgressBar,
}

impl ProgressListener {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} objects {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }
}

impl TransmissionListener for ProgressListener {
    fn started(&mut self) {
        self.bar.set_message("connecting");
    }

    fn progress(&mut self, current: u64, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(current);
    }

    fn chunk_progress(&mut self, _container_id: &str, bytes: u64, total: u64) {
        self.bar
            .set_message(format!("{}/{}", format_bytes(bytes), format_bytes(total)));
    }

    fn finished(&mut self) {
        self.bar.finish_and_clear();
    }

    fn aborted(&mut self, _error: &SyncError) {
        self.bar.abandon_with_message("aborted");
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "graphsync=info",
        1 => "graphsync=debug",
        _ => "graphsync=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn print_summary(action: &str, result: &TransmissionResult) {
    println!(
        "{} {} {} objects, {} in {:.2?}",
        "✓".green().bold(),
        action,
        result.objects_transferred,
        format_bytes(result.bytes_transferred),
        result.duration
    );
    if result.anomalies > 0 {
        println!(
            "{} {} anomalous requests from peer ignored",
            "!".yellow().bold(),
            result.anomalies
        );
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Received Ctrl+C, shutting down...");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };

    match cli.command {
        Command::Serve { root, bind, port } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(port) = port {
                config.server.port = port;
            }

            let store = DirectoryStore::open(&root)
                .await
                .with_context(|| format!("Failed to open store at {}", root.display()))?;
            let server = CloudServer::bind(&config, Arc::new(store)).await?;
            println!(
                "{} serving {} on {}",
                "→".cyan(),
                root.display(),
                server.local_addr()?
            );
            server.serve_until(shutdown_signal()).await?;
        }

        Command::List {
            remote,
            type_filter,
        } => {
            let transmission =
                Transmission::list(type_filter, remote.credentials(), &remote.host, remote.port);
            let store = Arc::new(graphsync::MemoryStore::new());
            let result =
                run_transmission(&transmission, store, Box::new(ProgressListener::new()), &config.transfer)
                    .await?;

            for entry in &result.syncables {
                let size = if entry.is_file {
                    format_bytes(entry.size)
                } else {
                    "-".to_string()
                };
                println!(
                    "{:<38} {:<16} {:>10}  {}",
                    entry.id,
                    entry.node_type.dimmed(),
                    size,
                    entry.name
                );
            }
            println!("{} {} entities", "✓".green().bold(), result.syncables.len());
        }

        Command::Pull {
            node_id,
            root,
            recursive,
            remote,
        } => {
            let store = DirectoryStore::open(&root)
                .await
                .with_context(|| format!("Failed to open store at {}", root.display()))?;
            let transmission = Transmission::pull(
                node_id,
                recursive,
                remote.credentials(),
                &remote.host,
                remote.port,
            );
            let result = run_transmission(
                &transmission,
                Arc::new(store),
                Box::new(ProgressListener::new()),
                &config.transfer,
            )
            .await?;
            print_summary("pulled", &result);
        }

        Command::Push {
            node_id,
            root,
            recursive,
            remote,
        } => {
            let store = DirectoryStore::open(&root)
                .await
                .with_context(|| format!("Failed to open store at {}", root.display()))?;
            let transmission = Transmission::push(
                node_id,
                recursive,
                remote.credentials(),
                &remote.host,
                remote.port,
            );
            let result = run_transmission(
                &transmission,
                Arc::new(store),
                Box::new(ProgressListener::new()),
                &config.transfer,
            )
            .await?;
            print_summary("pushed", &result);
        }

        Command::Import {
            file,
            root,
            id,
            node_type,
        } => {
            let store = DirectoryStore::open(&root)
                .await
                .with_context(|| format!("Failed to open store at {}", root.display()))?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| id.clone());
            store
                .import_file(NodeRecord::new(id.clone(), node_type, name), &file)
                .await
                .with_context(|| format!("Failed to import {}", file.display()))?;
            graphsync::SyncStore::flush(&store).await?;
            println!("{} imported {} as {}", "✓".green().bold(), file.display(), id);
        }
    }

    Ok(())
}
