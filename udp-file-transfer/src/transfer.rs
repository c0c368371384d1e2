//! One established transfer: a file on disk on one end, a [`Connection`] on
//! the other.
//!
//! The receiving side writes into a hidden staging file next to the target
//! (`.<name>.part`) and renames it into place after CLOSE.  Only then is the
//! CLOSE acknowledged, so a sender that sees the ACK knows the file exists
//! under its real name, and a failed transfer never leaves a truncated file
//! behind.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::connection::{Connection, TransferError, TransferStats};
use crate::packet::Packet;
use crate::socket::Channel;
use crate::state::{ArqMode, Direction, Role, Side};

/// An exclusively created `.<name>.part` file that becomes its target on
/// [`commit`](Staging::commit).
#[derive(Debug)]
pub struct Staging {
    file: File,
    path: PathBuf,
    target: PathBuf,
}

impl Staging {
    /// Reserve the staging file for `target`.  Fails with
    /// [`io::ErrorKind::AlreadyExists`] while another transfer holds it.
    pub async fn create(target: &Path) -> io::Result<Self> {
        let path = staging_path(target);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(Self {
            file,
            path,
            target: target.to_path_buf(),
        })
    }

    /// Flush to disk and rename onto the target.
    pub async fn commit(mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);
        fs::rename(&self.path, &self.target).await
    }

    /// Remove the staging file, logging rather than failing.
    pub async fn discard(self) {
        drop(self.file);
        if let Err(e) = fs::remove_file(&self.path).await {
            log::warn!("could not remove {}: {e}", self.path.display());
        }
    }
}

pub struct Transfer<C> {
    connection: Connection<C>,
    side: Side,
    direction: Direction,
    path: PathBuf,
    mode: ArqMode,
    staging: Option<Staging>,
}

impl<C: Channel> Transfer<C> {
    /// `path` is the file read from (sending role) or written to (receiving
    /// role).
    pub fn new(
        connection: Connection<C>,
        side: Side,
        direction: Direction,
        path: PathBuf,
        mode: ArqMode,
    ) -> Self {
        Self {
            connection,
            side,
            direction,
            path,
            mode,
            staging: None,
        }
    }

    /// Receive into a staging file reserved before the handshake finished.
    pub fn with_staging(mut self, staging: Staging) -> Self {
        self.staging = Some(staging);
        self
    }

    pub fn role(&self) -> Role {
        Role::of(self.side, self.direction)
    }

    /// Run the data phase to completion.  The channel is released when this
    /// returns, whatever the outcome.
    pub async fn run(mut self, first: Option<Packet>) -> Result<TransferStats, TransferError> {
        match self.role() {
            Role::Sender => {
                let mut file = File::open(&self.path).await?;
                self.connection.send_stream(self.mode, &mut file).await
            }
            Role::Receiver => self.receive(first).await,
        }
    }

    async fn receive(&mut self, first: Option<Packet>) -> Result<TransferStats, TransferError> {
        let mut staging = match self.staging.take() {
            Some(staging) => staging,
            None => Staging::create(&self.path).await?,
        };

        let close_seq = match self
            .connection
            .receive_stream(self.mode, &mut staging.file, first)
            .await
        {
            Ok(seq) => seq,
            Err(e) => {
                staging.discard().await;
                return Err(e);
            }
        };

        // The peer keeps repeating CLOSE until it sees the ACK, so a failed
        // rename is reported to it by silence.
        if let Err(e) = staging.commit().await {
            log::error!("could not store {}: {e}", self.path.display());
            return Err(e.into());
        }
        self.connection.acknowledge_close(close_seq).await
    }
}

/// Hidden sibling of `path` that collects bytes until the transfer ends.
pub fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.part"))
}
