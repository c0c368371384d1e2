//! Integration tests for the Stop-and-Wait and Selective-Repeat data phase.
//!
//! Each test runs a sending and a receiving [`Connection`] over loopback as
//! separate tokio tasks.  Faults are injected with the [`Simulator`] wrapper
//! or by a scripted raw peer that speaks the wire format directly.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;
use udp_file_transfer::{
    connection::{Connection, TransferError, TransferStats},
    packet::{Kind, Packet, MAX_PAYLOAD},
    simulator::{FaultConfig, Simulator},
    socket::{Channel, Received, Socket},
    ArqMode, ProtocolConfig,
};

type SimConn = Connection<Simulator<Socket>>;

async fn ephemeral() -> Socket {
    let addr = "127.0.0.1:0".parse().unwrap();
    Socket::bind(addr).await.expect("bind failed")
}

fn config(window: usize) -> ProtocolConfig {
    ProtocolConfig {
        handshake_timeout: Duration::from_millis(40),
        ..ProtocolConfig::default()
    }
    .with_window_size(window)
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

struct Outcome {
    received: Vec<u8>,
    sender: SimConn,
    receiver: SimConn,
    sent_stats: TransferStats,
    received_stats: TransferStats,
}

/// Run one transfer of `data` between two simulated endpoints.
async fn run_pair(
    mode: ArqMode,
    cfg: ProtocolConfig,
    data: Vec<u8>,
    wrap_sender: impl FnOnce(Socket) -> Simulator<Socket>,
    wrap_receiver: impl FnOnce(Socket) -> Simulator<Socket>,
) -> Outcome {
    let tx_sock = ephemeral().await;
    let rx_sock = ephemeral().await;
    let tx_addr = tx_sock.local_addr;
    let rx_addr = rx_sock.local_addr;

    let mut sender = Connection::new(wrap_sender(tx_sock), rx_addr, cfg.clone(), true);
    let mut receiver = Connection::new(wrap_receiver(rx_sock), tx_addr, cfg, true);

    let rx = tokio::spawn(async move {
        let mut out = Vec::new();
        let close_seq = receiver
            .receive_stream(mode, &mut out, None)
            .await
            .expect("receive");
        let stats = receiver
            .acknowledge_close(close_seq)
            .await
            .expect("acknowledge CLOSE");
        (out, stats, receiver)
    });
    let tx = tokio::spawn(async move {
        let stats = sender
            .send_stream(mode, &mut data.as_slice())
            .await
            .expect("send");
        (stats, sender)
    });

    let (rx, tx) = tokio::join!(rx, tx);
    let (received, received_stats, receiver) = rx.unwrap();
    let (sent_stats, sender) = tx.unwrap();
    Outcome {
        received,
        sender,
        receiver,
        sent_stats,
        received_stats,
    }
}

// ---------------------------------------------------------------------------
// Stop-and-Wait
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sw_clean_transfer() {
    let data = payload(3 * MAX_PAYLOAD + 17);
    let out = run_pair(
        ArqMode::StopAndWait,
        config(1),
        data.clone(),
        Simulator::transparent,
        Simulator::transparent,
    )
    .await;

    assert_eq!(out.received, data);
    assert_eq!(out.sent_stats.bytes, data.len() as u64);
    assert_eq!(out.received_stats.bytes, data.len() as u64);
    assert!(out.sent_stats.close_confirmed);
}

#[tokio::test]
async fn sw_empty_file_is_just_close() {
    let out = run_pair(
        ArqMode::StopAndWait,
        config(1),
        Vec::new(),
        Simulator::transparent,
        Simulator::transparent,
    )
    .await;

    assert!(out.received.is_empty());
    assert!(out.sent_stats.close_confirmed);
    assert_eq!(out.sent_stats.packets, 1);
}

#[tokio::test]
async fn sw_duplicated_data_is_written_once() {
    let data = payload(5 * MAX_PAYLOAD);
    let always_duplicate = FaultConfig {
        duplicate_rate: 1.0,
        ..FaultConfig::default()
    };
    let out = run_pair(
        ArqMode::StopAndWait,
        config(1),
        data.clone(),
        |s| Simulator::new(s, always_duplicate),
        Simulator::transparent,
    )
    .await;

    assert_eq!(out.received, data);
    assert!(out.sender.channel().duplicated() > 0);
    assert!(out.received_stats.duplicates > 0);
}

#[tokio::test]
async fn sw_lost_data_is_retransmitted() {
    let data = payload(3 * MAX_PAYLOAD);
    let out = run_pair(
        ArqMode::StopAndWait,
        config(1),
        data.clone(),
        |s| Simulator::transparent(s).drop_once(Kind::Data, 2),
        Simulator::transparent,
    )
    .await;

    assert_eq!(out.received, data);
    assert_eq!(out.sender.channel().dropped(), 1);
    assert!(out.sent_stats.retransmissions >= 1);
}

#[tokio::test]
async fn sw_lost_ack_is_recovered() {
    let data = payload(3 * MAX_PAYLOAD);
    let out = run_pair(
        ArqMode::StopAndWait,
        config(1),
        data.clone(),
        Simulator::transparent,
        |s| Simulator::transparent(s).drop_once(Kind::Ack, 1),
    )
    .await;

    // The resent DATA 1 is re-ACKed, not written a second time.
    assert_eq!(out.received, data);
    assert_eq!(out.receiver.channel().dropped(), 1);
    assert!(out.received_stats.duplicates >= 1);
}

#[tokio::test]
async fn sw_survives_random_loss() {
    let data = payload(12 * MAX_PAYLOAD + 5);
    let lossy = |seed| FaultConfig {
        loss_rate: 0.2,
        duplicate_rate: 0.05,
        seed,
    };
    let out = run_pair(
        ArqMode::StopAndWait,
        config(1),
        data.clone(),
        |s| Simulator::new(s, lossy(1)),
        |s| Simulator::new(s, lossy(2)),
    )
    .await;

    assert_eq!(out.received, data);
}

// ---------------------------------------------------------------------------
// Selective-Repeat
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sr_clean_transfer() {
    let data = payload(20 * MAX_PAYLOAD + 1);
    let out = run_pair(
        ArqMode::SelectiveRepeat,
        config(8),
        data.clone(),
        Simulator::transparent,
        Simulator::transparent,
    )
    .await;

    assert_eq!(out.received, data);
    assert!(out.sent_stats.close_confirmed);
}

#[tokio::test]
async fn sr_lost_data_only_resends_the_gap() {
    let data = payload(8 * MAX_PAYLOAD);
    let out = run_pair(
        ArqMode::SelectiveRepeat,
        config(8),
        data.clone(),
        |s| Simulator::transparent(s).drop_once(Kind::Data, 3),
        Simulator::transparent,
    )
    .await;

    assert_eq!(out.received, data);
    assert_eq!(out.sender.channel().dropped(), 1);
    assert!((1..8).contains(&out.sent_stats.retransmissions));
}

#[tokio::test]
async fn sr_survives_random_loss_both_ways() {
    let data = payload(40 * MAX_PAYLOAD + 100);
    let lossy = |seed| FaultConfig {
        loss_rate: 0.2,
        duplicate_rate: 0.05,
        seed,
    };
    let out = run_pair(
        ArqMode::SelectiveRepeat,
        config(8),
        data.clone(),
        |s| Simulator::new(s, lossy(7)),
        |s| Simulator::new(s, lossy(11)),
    )
    .await;

    assert_eq!(out.received, data);
}

/// DATA for chunks C0..C4 (sequences 1..=5) arrives as C2, C0, C1, C4, C3.
#[tokio::test]
async fn sr_receiver_reorders_and_acks_individually() {
    let raw = ephemeral().await;
    let rx_sock = ephemeral().await;
    let rx_addr = rx_sock.local_addr;
    let mut receiver = Connection::new(rx_sock, raw.local_addr, config(8), true);

    let rx = tokio::spawn(async move {
        let mut out = Vec::new();
        let close_seq = receiver
            .receive_stream(ArqMode::SelectiveRepeat, &mut out, None)
            .await
            .expect("receive");
        (out, close_seq, receiver)
    });

    let chunk = |i: u8| vec![b'a' + i; 10];
    for i in [2u8, 0, 1, 4, 3] {
        let seq = u16::from(i) + 1;
        raw.send_to(&Packet::data(seq, chunk(i)), rx_addr).await.unwrap();
    }

    let mut acked = BTreeSet::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while acked.len() < 5 {
        match raw.recv_until(deadline).await.unwrap() {
            Received::Packet(pkt, _) if pkt.kind == Kind::Ack => {
                acked.insert(pkt.seq);
            }
            Received::Packet(..) => {}
            Received::TimedOut => panic!("missing ACKs, got {acked:?}"),
        }
    }
    assert_eq!(acked, (1..=5).collect::<BTreeSet<u16>>());

    raw.send_to(&Packet::close(6), rx_addr).await.unwrap();
    let (out, close_seq, mut receiver) = rx.await.unwrap();
    let expected: Vec<u8> = (0..5u8).flat_map(chunk).collect();
    assert_eq!(out, expected);
    assert_eq!(close_seq, 6);

    // CLOSE stays unacknowledged until the caller says the output is stored.
    let early = raw
        .recv_until(Instant::now() + Duration::from_millis(60))
        .await
        .unwrap();
    assert!(matches!(early, Received::TimedOut), "{early:?}");

    let teardown = tokio::spawn(async move { receiver.acknowledge_close(close_seq).await });
    match raw.recv_until(Instant::now() + Duration::from_secs(1)).await.unwrap() {
        Received::Packet(pkt, _) => assert_eq!(pkt, Packet::ack(6)),
        Received::TimedOut => panic!("CLOSE not acknowledged"),
    }
    let stats = teardown.await.unwrap().expect("acknowledge CLOSE");
    assert_eq!(stats.bytes, 50);
}

/// A CLOSE repeated because its ACK was lost gets the same ACK again.
#[tokio::test]
async fn repeated_close_is_acknowledged_while_lingering() {
    let raw = ephemeral().await;
    let rx_sock = ephemeral().await;
    let rx_addr = rx_sock.local_addr;
    let mut receiver = Connection::new(rx_sock, raw.local_addr, config(4), true);

    let rx = tokio::spawn(async move {
        let mut out = Vec::new();
        let close_seq = receiver
            .receive_stream(ArqMode::StopAndWait, &mut out, None)
            .await
            .expect("receive");
        let stats = receiver
            .acknowledge_close(close_seq)
            .await
            .expect("acknowledge CLOSE");
        (out, stats)
    });

    raw.send_to(&Packet::data(1, b"hello".to_vec()), rx_addr).await.unwrap();
    raw.send_to(&Packet::close(2), rx_addr).await.unwrap();

    let mut acks = Vec::new();
    let deadline = Instant::now() + Duration::from_millis(500);
    while acks.len() < 2 {
        match raw.recv_until(deadline).await.unwrap() {
            Received::Packet(pkt, _) => acks.push(pkt),
            Received::TimedOut => panic!("missing ACKs, got {acks:?}"),
        }
    }
    assert_eq!(acks, vec![Packet::ack(1), Packet::ack(2)]);

    // Pretend ACK(2) was lost: the repeat is answered identically.
    raw.send_to(&Packet::close(2), rx_addr).await.unwrap();
    match raw.recv_until(Instant::now() + Duration::from_millis(500)).await.unwrap() {
        Received::Packet(pkt, _) => assert_eq!(pkt, Packet::ack(2)),
        Received::TimedOut => panic!("repeated CLOSE not acknowledged"),
    }

    let (out, stats) = rx.await.unwrap();
    assert_eq!(out, b"hello");
    assert_eq!(stats.bytes, 5);
    assert_eq!(stats.duplicates, 1);
}

#[tokio::test]
async fn sr_sender_never_exceeds_window() {
    const WINDOW: usize = 4;
    let raw = ephemeral().await;
    let tx_sock = ephemeral().await;
    let cfg = ProtocolConfig {
        sr_sender_timeout: Duration::from_secs(2),
        ..config(WINDOW)
    };
    let mut sender = Connection::new(tx_sock, raw.local_addr, cfg, true);
    let data = payload(10 * MAX_PAYLOAD);

    let tx = tokio::spawn(async move {
        let _ = sender
            .send_stream(ArqMode::SelectiveRepeat, &mut data.as_slice())
            .await;
    });

    // Withhold every ACK: only the first window may arrive.
    let mut seen = BTreeSet::new();
    let mut sender_addr = None;
    let deadline = Instant::now() + Duration::from_millis(300);
    while let Received::Packet(pkt, from) = raw.recv_until(deadline).await.unwrap() {
        assert_eq!(pkt.kind, Kind::Data);
        seen.insert(pkt.seq);
        sender_addr = Some(from);
    }
    assert_eq!(seen, (1..=WINDOW as u16).collect::<BTreeSet<u16>>());

    // Acknowledging the base opens exactly one slot.
    let sender_addr = sender_addr.expect("sender never transmitted");
    raw.send_to(&Packet::ack(1), sender_addr).await.unwrap();
    let mut fresh = BTreeSet::new();
    let deadline = Instant::now() + Duration::from_millis(300);
    while let Received::Packet(pkt, _) = raw.recv_until(deadline).await.unwrap() {
        if !seen.contains(&pkt.seq) {
            fresh.insert(pkt.seq);
        }
    }
    assert_eq!(fresh, BTreeSet::from([WINDOW as u16 + 1]));
    tx.abort();
}

// ---------------------------------------------------------------------------
// Idle limit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn receiver_gives_up_on_silent_peer() {
    let silent = ephemeral().await;
    let rx_sock = ephemeral().await;
    let cfg = ProtocolConfig {
        idle_timeout: Duration::from_millis(150),
        ..config(4)
    };
    let mut receiver = Connection::new(rx_sock, silent.local_addr, cfg, false);

    let mut out = Vec::new();
    let result = receiver
        .receive_stream(ArqMode::StopAndWait, &mut out, None)
        .await;
    assert!(matches!(result, Err(TransferError::PeerSilent(_))));
}

#[tokio::test]
async fn sender_gives_up_on_silent_peer() {
    let silent = ephemeral().await;
    let tx_sock = ephemeral().await;
    let cfg = ProtocolConfig {
        idle_timeout: Duration::from_millis(150),
        ..config(4)
    };
    let mut sender = Connection::new(tx_sock, silent.local_addr, cfg, false);

    let data = payload(100);
    let result = sender
        .send_stream(ArqMode::SelectiveRepeat, &mut data.as_slice())
        .await;
    assert!(matches!(result, Err(TransferError::PeerSilent(_))));
}

#[tokio::test]
async fn unacknowledged_close_is_not_fatal() {
    let peer = ephemeral().await;
    let peer_addr = peer.local_addr;
    let tx_sock = ephemeral().await;
    let tx_addr = tx_sock.local_addr;
    let cfg = ProtocolConfig {
        handshake_timeout: Duration::from_millis(10),
        ..config(1)
    }
    .with_max_tries(3);
    let mut sender = Connection::new(tx_sock, peer_addr, cfg, false);

    // ACK the single DATA, then ignore every CLOSE.
    let acker = tokio::spawn(async move {
        loop {
            let (pkt, from) = peer.recv_from().await.unwrap();
            assert_eq!(from, tx_addr);
            if pkt.kind == Kind::Data {
                peer.send_to(&Packet::ack(pkt.seq), from).await.unwrap();
            }
        }
    });

    let stats = sender
        .send_stream(ArqMode::StopAndWait, &mut &b"tiny"[..])
        .await
        .expect("CLOSE timeout is a soft failure");
    assert!(!stats.close_confirmed);
    assert_eq!(stats.bytes, 4);
    acker.abort();
}
