//! Entry point for `udp-ftp`.
//!
//! Parses CLI arguments and dispatches into **server**, **upload** or
//! **download** mode.  All protocol work is delegated to library modules;
//! `main.rs` owns only process setup (logging, signal handling, argument
//! parsing and path checks).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use udp_file_transfer::client;
use udp_file_transfer::server::Server;
use udp_file_transfer::{ArqMode, ClientConfig, ProtocolConfig, ServerConfig};

/// Reliable file transfer over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Serve a storage directory.
    Server {
        #[command(flatten)]
        common: Common,
        /// Directory files are served from and stored into.
        #[arg(short, long)]
        storage: PathBuf,
        /// Number of transfers served concurrently.
        #[arg(long, default_value_t = 10)]
        workers: usize,
    },
    /// Send a local file to the server.
    Upload {
        #[command(flatten)]
        common: Common,
        /// Directory containing the file to upload.
        #[arg(short, long)]
        src: PathBuf,
        /// Name of the file.
        #[arg(short, long)]
        name: String,
    },
    /// Fetch a file from the server.
    Download {
        #[command(flatten)]
        common: Common,
        /// Directory the file is written into.
        #[arg(short, long)]
        dst: PathBuf,
        /// Name of the file.
        #[arg(short, long)]
        name: String,
    },
}

#[derive(Args)]
struct Common {
    /// Log every packet.
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,
    /// Only log errors.
    #[arg(short, long)]
    quiet: bool,
    /// Server host name or address.
    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,
    /// Server port.
    #[arg(short, long, default_value_t = 8080, value_parser = clap::value_parser!(u16).range(1024..))]
    port: u16,
    /// Use Selective-Repeat instead of Stop-and-Wait.
    #[arg(short = 'r', long)]
    selective_repeat: bool,
    /// Selective-Repeat window size, in packets.
    #[arg(short, long, default_value_t = 32)]
    window: usize,
}

impl Common {
    fn mode(&self) -> ArqMode {
        if self.selective_repeat {
            ArqMode::SelectiveRepeat
        } else {
            ArqMode::StopAndWait
        }
    }

    fn protocol(&self) -> ProtocolConfig {
        ProtocolConfig::default().with_window_size(self.window)
    }

    async fn address(&self) -> Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("cannot resolve {}", self.host))?
            .next()
            .with_context(|| format!("{} has no addresses", self.host))
    }

    async fn client_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::new(self.address().await?);
        config.mode = self.mode();
        config.verbose = self.verbose;
        config.protocol = self.protocol();
        Ok(config)
    }

    fn init_logging(&self) {
        let level = if self.verbose {
            LevelFilter::Debug
        } else if self.quiet {
            LevelFilter::Error
        } else {
            LevelFilter::Info
        };
        // RUST_LOG still wins when set.
        env_logger::Builder::new()
            .filter_level(level)
            .parse_default_env()
            .init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let started = Instant::now();

    if let Err(e) = run(cli).await {
        log::error!("{e:#}");
        eprintln!("ERROR: {e:#}");
        process::exit(1);
    }
    log::info!("finished in {:?}", started.elapsed());
}

async fn run(cli: Cli) -> Result<()> {
    match cli.mode {
        Mode::Server {
            common,
            storage,
            workers,
        } => {
            common.init_logging();
            require_dir(&storage)?;
            let mut config = ServerConfig::new(common.address().await?, storage);
            config.mode = common.mode();
            config.verbose = common.verbose;
            config.protocol = common.protocol();
            config.workers = workers;

            let server = Server::bind(config).await?;
            server
                .run_until(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        log::error!("cannot listen for Ctrl-C: {e}");
                        std::future::pending::<()>().await;
                    }
                })
                .await?;
        }
        Mode::Upload { common, src, name } => {
            common.init_logging();
            require_dir(&src)?;
            let source = src.join(&name);
            if !source.is_file() {
                bail!("{} is not a readable file", source.display());
            }
            let config = common.client_config().await?;
            let stats = client::upload(&config, &source, &name).await?;
            log::info!("uploaded {} bytes of {name:?}", stats.bytes);
        }
        Mode::Download { common, dst, name } => {
            common.init_logging();
            require_dir(&dst)?;
            let target = dst.join(&name);
            if target.exists() {
                bail!("{} already exists", target.display());
            }
            let config = common.client_config().await?;
            let stats = client::download(&config, &name, &dst).await?;
            log::info!("downloaded {} bytes of {name:?}", stats.bytes);
        }
    }
    Ok(())
}

fn require_dir(path: &Path) -> Result<()> {
    if !path.is_dir() {
        bail!("{} is not a directory", path.display());
    }
    Ok(())
}
