//! End-to-end tests: a real [`Server`] on loopback and the client entry
//! points, with temporary directories on both sides.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use udp_file_transfer::{
    client::{self, ClientError},
    handshake::HandshakeError,
    packet::{Kind, Packet},
    server::{Server, ServerError},
    socket::{Channel, Received, Socket, SocketError},
    ArqMode, ClientConfig, ProtocolConfig, ServerConfig,
};

/// Channel wrapper that records every outbound `(kind, seq)`.
struct Recorder {
    inner: Socket,
    sent: Arc<Mutex<Vec<(Kind, u16)>>>,
}

impl Channel for Recorder {
    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    async fn send_to(&self, packet: &Packet, dest: SocketAddr) -> Result<(), SocketError> {
        self.sent.lock().unwrap().push((packet.kind, packet.seq));
        self.inner.send_to(packet, dest).await
    }

    async fn recv_from(&self) -> Result<(Packet, SocketAddr), SocketError> {
        self.inner.recv_from().await
    }
}

struct Running {
    addr: SocketAddr,
    storage: TempDir,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl Running {
    async fn shutdown(self) {
        let _ = self.stop.send(());
        self.handle.await.unwrap().expect("server run");
    }
}

fn protocol(window: usize) -> ProtocolConfig {
    ProtocolConfig {
        handshake_timeout: Duration::from_millis(60),
        ..ProtocolConfig::default()
    }
    .with_window_size(window)
}

async fn start(mode: ArqMode, workers: usize, queue_capacity: usize) -> Running {
    let storage = tempfile::tempdir().unwrap();
    let mut config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), storage.path());
    config.mode = mode;
    config.workers = workers;
    config.queue_capacity = queue_capacity;
    config.verbose = true;
    config.protocol = protocol(8);

    let server = Server::bind(config).await.expect("bind");
    let addr = server.local_addr();
    let (stop, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run_until(async {
        let _ = stopped.await;
    }));
    Running {
        addr,
        storage,
        stop,
        handle,
    }
}

fn client_config(server: SocketAddr, mode: ArqMode) -> ClientConfig {
    let mut config = ClientConfig::new(server);
    config.mode = mode;
    config.verbose = true;
    config.protocol = protocol(8);
    config
}

fn contents(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

fn dir_entries(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

async fn loopback() -> Socket {
    Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
}

// ---------------------------------------------------------------------------
// Successful transfers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn selective_repeat_upload_of_10000_bytes() {
    let server = start(ArqMode::SelectiveRepeat, 2, 8).await;
    let local = tempfile::tempdir().unwrap();
    let source = local.path().join("upload.bin");
    let data = contents(10_000);
    std::fs::write(&source, &data).unwrap();

    let sent = Arc::new(Mutex::new(Vec::new()));
    let channel = Recorder {
        inner: loopback().await,
        sent: Arc::clone(&sent),
    };
    let config = client_config(server.addr, ArqMode::SelectiveRepeat);
    let stats = client::upload_with(channel, &config, &source, "upload.bin")
        .await
        .expect("upload");

    assert_eq!(stats.bytes, 10_000);
    assert!(stats.close_confirmed);
    assert_eq!(
        std::fs::read(server.storage.path().join("upload.bin")).unwrap(),
        data
    );

    let sent = sent.lock().unwrap().clone();
    assert_eq!(sent.first(), Some(&(Kind::Upload, 0)));
    let mut data_seqs: Vec<u16> = sent
        .iter()
        .filter(|(kind, _)| *kind == Kind::Data)
        .map(|&(_, seq)| seq)
        .collect();
    data_seqs.sort_unstable();
    data_seqs.dedup();
    assert_eq!(data_seqs, vec![1, 2, 3]);
    assert!(sent.contains(&(Kind::Close, 4)));

    server.shutdown().await;
}

#[tokio::test]
async fn stop_and_wait_download_round_trip() {
    let server = start(ArqMode::StopAndWait, 2, 8).await;
    let data = contents(3 * 4096 + 123);
    std::fs::write(server.storage.path().join("report.pdf"), &data).unwrap();

    let local = tempfile::tempdir().unwrap();
    let config = client_config(server.addr, ArqMode::StopAndWait);
    let stats = client::download(&config, "report.pdf", local.path())
        .await
        .expect("download");

    assert_eq!(stats.bytes, data.len() as u64);
    assert_eq!(std::fs::read(local.path().join("report.pdf")).unwrap(), data);
    assert_eq!(dir_entries(local.path()), vec!["report.pdf".to_string()]);

    server.shutdown().await;
}

#[tokio::test]
async fn empty_file_download() {
    let server = start(ArqMode::SelectiveRepeat, 1, 4).await;
    std::fs::write(server.storage.path().join("empty"), b"").unwrap();

    let local = tempfile::tempdir().unwrap();
    let config = client_config(server.addr, ArqMode::SelectiveRepeat);
    let stats = client::download(&config, "empty", local.path())
        .await
        .expect("download");

    assert_eq!(stats.bytes, 0);
    assert!(std::fs::read(local.path().join("empty")).unwrap().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn concurrent_uploads_share_the_pool() {
    let server = start(ArqMode::SelectiveRepeat, 2, 8).await;
    let local = tempfile::tempdir().unwrap();

    let mut tasks = Vec::new();
    for i in 0..4 {
        let name = format!("file{i}.bin");
        let source = local.path().join(&name);
        std::fs::write(&source, contents(20_000 + i)).unwrap();
        let config = client_config(server.addr, ArqMode::SelectiveRepeat);
        tasks.push(tokio::spawn(async move {
            client::upload(&config, &source, &name).await
        }));
    }
    for task in tasks {
        task.await.unwrap().expect("upload");
    }

    for i in 0..4 {
        let stored = std::fs::read(server.storage.path().join(format!("file{i}.bin"))).unwrap();
        assert_eq!(stored, contents(20_000 + i));
    }
    server.shutdown().await;
}

#[tokio::test]
async fn stored_file_is_complete_when_upload_returns() {
    for mode in [ArqMode::StopAndWait, ArqMode::SelectiveRepeat] {
        let server = start(mode, 2, 8).await;
        let local = tempfile::tempdir().unwrap();

        for round in 0..6 {
            let name = format!("round{round}.bin");
            let source = local.path().join(&name);
            let data = contents(4096 * (round % 3) + 7 * round);
            std::fs::write(&source, &data).unwrap();

            let config = client_config(server.addr, mode);
            let stats = client::upload(&config, &source, &name).await.expect("upload");
            assert!(stats.close_confirmed);

            // No settling delay: ACK(CLOSE) means the rename already happened.
            let stored = server.storage.path().join(&name);
            assert_eq!(std::fs::read(&stored).unwrap(), data, "{mode} round {round}");
        }
        let mut left = dir_entries(server.storage.path());
        left.retain(|name| name.ends_with(".part"));
        assert!(left.is_empty(), "{left:?}");

        server.shutdown().await;
    }
}

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upload_while_staging_file_exists_is_rejected() {
    let server = start(ArqMode::StopAndWait, 1, 4).await;
    std::fs::write(server.storage.path().join(".x.bin.part"), b"partial").unwrap();

    let local = tempfile::tempdir().unwrap();
    let source = local.path().join("x.bin");
    std::fs::write(&source, b"new bytes").unwrap();
    let config = client_config(server.addr, ArqMode::StopAndWait);

    let started = Instant::now();
    let result = client::upload(&config, &source, "x.bin").await;
    match result {
        Err(ClientError::Handshake(HandshakeError::Rejected(msg))) => {
            assert!(msg.contains("x.bin"), "{msg}");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    // Answered during the handshake, not by an idle timeout.
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!server.storage.path().join("x.bin").exists());
    assert_eq!(
        std::fs::read(server.storage.path().join(".x.bin.part")).unwrap(),
        b"partial"
    );

    server.shutdown().await;
}

#[tokio::test]
async fn download_with_local_staging_clash_never_contacts_server() {
    let server = start(ArqMode::StopAndWait, 1, 4).await;
    std::fs::write(server.storage.path().join("y.bin"), b"remote").unwrap();

    let local = tempfile::tempdir().unwrap();
    std::fs::write(local.path().join(".y.bin.part"), b"stale").unwrap();
    let config = client_config(server.addr, ArqMode::StopAndWait);

    let result = client::download(&config, "y.bin", local.path()).await;
    assert!(matches!(result, Err(ClientError::Staging(_))), "{result:?}");
    assert!(!local.path().join("y.bin").exists());

    server.shutdown().await;
}

#[tokio::test]
async fn download_of_missing_file_is_rejected() {
    let server = start(ArqMode::StopAndWait, 1, 4).await;
    let local = tempfile::tempdir().unwrap();
    let config = client_config(server.addr, ArqMode::StopAndWait);

    let result = client::download(&config, "missing.txt", local.path()).await;
    match result {
        Err(ClientError::Handshake(HandshakeError::Rejected(msg))) => {
            assert!(msg.contains("missing.txt"), "{msg}");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(dir_entries(local.path()).is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn upload_over_existing_file_is_rejected() {
    let server = start(ArqMode::StopAndWait, 1, 4).await;
    std::fs::write(server.storage.path().join("taken.txt"), b"original").unwrap();

    let local = tempfile::tempdir().unwrap();
    let source = local.path().join("taken.txt");
    std::fs::write(&source, b"replacement").unwrap();
    let config = client_config(server.addr, ArqMode::StopAndWait);

    let result = client::upload(&config, &source, "taken.txt").await;
    assert!(matches!(
        result,
        Err(ClientError::Handshake(HandshakeError::Rejected(_)))
    ));
    assert_eq!(
        std::fs::read(server.storage.path().join("taken.txt")).unwrap(),
        b"original"
    );

    server.shutdown().await;
}

// ---------------------------------------------------------------------------
// Dispatcher behaviour
// ---------------------------------------------------------------------------

/// Collect packets arriving at `socket` until `window` passes.
async fn drain(socket: &Socket, window: Duration) -> Vec<(Packet, SocketAddr)> {
    let deadline = Instant::now() + window;
    let mut got = Vec::new();
    while let Received::Packet(pkt, from) = socket.recv_until(deadline).await.unwrap() {
        got.push((pkt, from));
    }
    got
}

#[tokio::test]
async fn repeated_request_is_served_once() {
    let server = start(ArqMode::StopAndWait, 4, 8).await;
    let raw = loopback().await;
    let request = Packet::request(Kind::Upload, "once.bin");

    raw.send_to(&request, server.addr).await.unwrap();
    raw.send_to(&request, server.addr).await.unwrap();

    let replies = drain(&raw, Duration::from_millis(300)).await;
    let mut workers: Vec<SocketAddr> = replies
        .iter()
        .filter(|(pkt, _)| pkt.kind == Kind::Ack)
        .map(|&(_, from)| from)
        .collect();
    workers.sort_unstable();
    workers.dedup();
    assert_eq!(workers.len(), 1, "{replies:?}");

    server.handle.abort();
}

#[tokio::test]
async fn full_queue_answers_busy_from_rendezvous() {
    let server = start(ArqMode::StopAndWait, 1, 1).await;

    // The only worker sits in a handshake with a client that never sends
    // data.
    let stalled = loopback().await;
    stalled
        .send_to(&Packet::request(Kind::Upload, "a"), server.addr)
        .await
        .unwrap();
    let (first, _) = stalled.recv_from().await.unwrap();
    assert_eq!(first, Packet::ack(0));

    // One more fits in the queue; the next is turned away.
    let queued = loopback().await;
    queued
        .send_to(&Packet::request(Kind::Upload, "b"), server.addr)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let refused = loopback().await;
    refused
        .send_to(&Packet::request(Kind::Upload, "c"), server.addr)
        .await
        .unwrap();
    let replies = drain(&refused, Duration::from_millis(200)).await;
    let busy = replies
        .iter()
        .find(|(pkt, _)| pkt.kind == Kind::Error)
        .expect("busy reply");
    assert!(busy.0.text().contains("busy"));
    assert_eq!(busy.1, server.addr);

    server.handle.abort();
}
