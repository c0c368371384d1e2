//! Client entry points: one upload or one download per call.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::ClientConfig;
use crate::connection::{Connection, TransferError, TransferStats};
use crate::handshake::{Handshake, HandshakeError, Request};
use crate::socket::{Channel, Socket, SocketError};
use crate::state::{Direction, Side};
use crate::transfer::{Staging, Transfer};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not open a local endpoint: {0}")]
    Bind(SocketError),
    #[error("could not reserve the local staging file: {0}")]
    Staging(io::Error),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Upload the local file `source` to the server under `name`.
pub async fn upload(
    config: &ClientConfig,
    source: &Path,
    name: &str,
) -> Result<TransferStats, ClientError> {
    let socket = bind_for(config.server).await?;
    upload_with(socket, config, source, name).await
}

/// Download `name` from the server into `destination/name`.
pub async fn download(
    config: &ClientConfig,
    name: &str,
    destination: &Path,
) -> Result<TransferStats, ClientError> {
    let socket = bind_for(config.server).await?;
    download_with(socket, config, name, destination).await
}

/// [`upload`] over a caller-supplied channel.
pub async fn upload_with<C: Channel>(
    channel: C,
    config: &ClientConfig,
    source: &Path,
    name: &str,
) -> Result<TransferStats, ClientError> {
    let request = Request::new(Direction::Upload, name)?;
    run(channel, config, request, source.to_path_buf()).await
}

/// [`download`] over a caller-supplied channel.
pub async fn download_with<C: Channel>(
    channel: C,
    config: &ClientConfig,
    name: &str,
    destination: &Path,
) -> Result<TransferStats, ClientError> {
    let request = Request::new(Direction::Download, name)?;
    run(channel, config, request, destination.join(name)).await
}

async fn run<C: Channel>(
    channel: C,
    config: &ClientConfig,
    request: Request,
    path: PathBuf,
) -> Result<TransferStats, ClientError> {
    log::info!(
        "{} {:?} via {} ({})",
        request.direction,
        request.file_name,
        config.server,
        config.mode
    );
    // A download claims its staging file before asking, so a local clash
    // never leaves the server streaming into silence.
    let staging = match request.direction {
        Direction::Download => Some(Staging::create(&path).await.map_err(ClientError::Staging)?),
        Direction::Upload => None,
    };
    let connected = Handshake::new(&channel, &config.protocol)
        .connect(config.server, &request)
        .await;
    let established = match connected {
        Ok(established) => established,
        Err(e) => {
            if let Some(staging) = staging {
                staging.discard().await;
            }
            return Err(e.into());
        }
    };
    log::debug!("transfer peer is {}", established.peer);

    let connection = Connection::new(
        channel,
        established.peer,
        config.protocol.clone(),
        config.verbose,
    );
    let mut transfer = Transfer::new(connection, Side::Client, request.direction, path, config.mode);
    if let Some(staging) = staging {
        transfer = transfer.with_staging(staging);
    }
    Ok(transfer.run(established.first).await?)
}

/// Ephemeral local endpoint in the server's address family.
async fn bind_for(server: SocketAddr) -> Result<Socket, ClientError> {
    let local = match server {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    };
    Socket::bind(local).await.map_err(ClientError::Bind)
}
