// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use meshcore::bootstrap::coordinator::BootstrapCoordinator;
use meshcore::core::codec::{self, WireMessage};
use meshcore::core::membership::MembershipStore;
use meshcore::core::pool::ConnectionPool;
use meshcore::core::types::{Address, BootstrapSettings, NetworkAddress};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

fn settings(bootstrap_addr: &str) -> BootstrapSettings {
    BootstrapSettings {
        bootstrap_addr: bootstrap_addr.to_string(),
        max_connections: 16,
        peer_inactive_timeout_secs: 120,
        connect_timeout_secs: 5,
        read_timeout_secs: 5,
        write_timeout_secs: 5,
        block_write_timeout_secs: 5,
        keepalive_interval_secs: 30,
        node_ok_interval_secs: 30,
        backoff_base_secs: 1,
        backoff_cap_secs: 5,
        max_retries: 3,
        block_poll_interval_secs: 5,
    }
}

async fn read_until_req_snapshot(reader: &mut BufReader<tokio::net::tcp::ReadHalf<'_>>) {
    let mut line = String::new();
    loop {
        line.clear();
        let n = tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .expect("read did not time out")
            .expect("read succeeded");
        assert!(n > 0, "connection closed before REQ snapshot");
        if line.trim_start().starts_with("REQ") {
            while !line.contains("NONCE|") {
                let mut more = String::new();
                tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut more))
                    .await
                    .expect("read did not time out")
                    .expect("read succeeded");
                line.push_str(&more);
            }
            return;
        }
    }
}

/// Join, then spam a message type the steady-state read loop doesn't accept
/// (another `READY_REQUEST`) until the session is closed by the peer-score
/// gate. Returns once the remote side has closed the connection.
async fn join_then_get_banned(bootstrap_addr_str: &str, joiner_address: Address, joiner_net: NetworkAddress) {
    let mut stream = TcpStream::connect(bootstrap_addr_str).await.unwrap();
    let ready = WireMessage::Ready {
        addr: joiner_address,
        net_addr: joiner_net.clone(),
    };
    stream
        .write_all(codec::encode_frame(&ready).as_bytes())
        .await
        .unwrap();

    let (read_half, mut write_half) = stream.split();
    let mut reader = BufReader::new(read_half);
    read_until_req_snapshot(&mut reader).await;

    // `READY_REQUEST` decodes fine but isn't a message the steady-state read
    // loop accepts, so each repetition is one "unexpected message type"
    // violation. The default ban threshold (200) with bad_inc=5 needs 40 of
    // these; send a comfortable margin above that.
    let bad_line = codec::encode_frame(&WireMessage::Ready {
        addr: joiner_address,
        net_addr: joiner_net,
    });
    let mut closed = false;
    for _ in 0..80 {
        if write_half.write_all(bad_line.as_bytes()).await.is_err() {
            closed = true;
            break;
        }
        // Drain anything the broadcast path might have queued so the write
        // side never blocks on a full socket buffer.
        let mut discard = [0u8; 4096];
        let _ = tokio::time::timeout(Duration::from_millis(20), reader.read(&mut discard)).await;
    }

    if !closed {
        // The remote-close may only be observable on the next read/write.
        let mut buf = [0u8; 1];
        let result = tokio::time::timeout(Duration::from_secs(5), reader.read(&mut buf)).await;
        match result {
            Ok(Ok(0)) => closed = true,
            Ok(Err(_)) => closed = true,
            _ => {
                if write_half.write_all(bad_line.as_bytes()).await.is_err() {
                    closed = true;
                }
            }
        }
    }

    assert!(closed, "session was not closed after repeated protocol violations");
}

/// A joiner that keeps sending a message type the coordinator doesn't accept
/// on the steady-state read loop (`READY_REQUEST` again) eventually gets its
/// session closed, even though each individual occurrence is logged and
/// tolerated rather than an instant disconnect (§7/§14).
#[tokio::test]
async fn repeated_unexpected_messages_close_the_session() {
    let bootstrap_address = Address::from_bytes([0xEE; 20]);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bootstrap_addr_str = listener.local_addr().unwrap().to_string();
    let bootstrap_net = NetworkAddress::parse(&bootstrap_addr_str).unwrap();

    let membership = Arc::new(MembershipStore::new(bootstrap_address));
    let pool = Arc::new(ConnectionPool::new(16, 60_000));
    let (block_tx, _block_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let coordinator = Arc::new(BootstrapCoordinator::new(
        bootstrap_address,
        bootstrap_net,
        membership.clone(),
        pool.clone(),
        settings(&bootstrap_addr_str),
        block_tx,
    ));
    tokio::spawn(coordinator.run(listener, shutdown_rx));

    let joiner_address = Address::from_bytes([0xFF; 20]);
    let joiner_net = NetworkAddress::parse("10.0.0.6:31600").unwrap();

    join_then_get_banned(&bootstrap_addr_str, joiner_address, joiner_net).await;

    assert!(pool.is_banned(&joiner_address.0));

    let _ = shutdown_tx.send(true);
}

/// Once an `Address` is banned, a brand new TCP connection (a fresh ephemeral
/// port, so a different pre-handshake `ip:port` key) from that same address
/// must still be refused, not just the original connection (§14).
#[tokio::test]
async fn banned_address_is_rejected_on_reconnect_from_new_port() {
    let bootstrap_address = Address::from_bytes([0xDE; 20]);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bootstrap_addr_str = listener.local_addr().unwrap().to_string();
    let bootstrap_net = NetworkAddress::parse(&bootstrap_addr_str).unwrap();

    let membership = Arc::new(MembershipStore::new(bootstrap_address));
    let pool = Arc::new(ConnectionPool::new(16, 60_000));
    let (block_tx, _block_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let coordinator = Arc::new(BootstrapCoordinator::new(
        bootstrap_address,
        bootstrap_net,
        membership.clone(),
        pool.clone(),
        settings(&bootstrap_addr_str),
        block_tx,
    ));
    tokio::spawn(coordinator.run(listener, shutdown_rx));

    let joiner_address = Address::from_bytes([0xAD; 20]);
    let joiner_net = NetworkAddress::parse("10.0.0.7:31700").unwrap();

    join_then_get_banned(&bootstrap_addr_str, joiner_address, joiner_net.clone()).await;
    assert!(pool.is_banned(&joiner_address.0));

    // A fresh TCP connection gets a brand new ephemeral source port, so the
    // pre-handshake `ip:port` key is unbanned; only the post-handshake
    // `Address` check can catch this reconnect.
    let mut stream = TcpStream::connect(&bootstrap_addr_str).await.unwrap();
    let ready = WireMessage::Ready {
        addr: joiner_address,
        net_addr: joiner_net,
    };
    stream
        .write_all(codec::encode_frame(&ready).as_bytes())
        .await
        .unwrap();

    let (read_half, _write_half) = stream.split();
    let mut reader = BufReader::new(read_half);
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), reader.read(&mut buf))
        .await
        .expect("read did not time out")
        .expect("read succeeded");
    assert_eq!(n, 0, "banned address's reconnect should be refused, not admitted");

    let _ = shutdown_tx.send(true);
}
