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

#![forbid(unsafe_code)]

use meshcore::bootstrap::coordinator::BootstrapCoordinator;
use meshcore::core::codec::{self, WireMessage};
use meshcore::core::membership::MembershipStore;
use meshcore::core::pool::ConnectionPool;
use meshcore::core::types::{Address, BootstrapSettings, NetworkAddress};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
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

#[tokio::test]
async fn joiner_receives_req_snapshot_and_is_admitted() {
    let bootstrap_address = Address::from_bytes([0xAA; 20]);
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

    let joiner_address = Address::from_bytes([0xBB; 20]);
    let joiner_net = NetworkAddress::parse("10.0.0.5:31500").unwrap();

    let mut stream = TcpStream::connect(&bootstrap_addr_str).await.unwrap();
    let ready = WireMessage::Ready {
        addr: joiner_address,
        net_addr: joiner_net.clone(),
    };
    stream
        .write_all(codec::encode_frame(&ready).as_bytes())
        .await
        .unwrap();

    let (read_half, _write_half) = stream.split();
    let mut reader = BufReader::new(read_half);
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
            break;
        }
    }

    let msg = codec::decode_frame(line.trim_end()).expect("REQ snapshot decodes");
    match msg {
        WireMessage::Req {
            self_addr, nonce, ..
        } => {
            assert_eq!(self_addr, bootstrap_address);
            assert_eq!(nonce, 1);
        }
        other => panic!("expected REQ, got {other:?}"),
    }

    let info = membership.get_info().await;
    assert_eq!(info.nodes, 1);
    assert_eq!(info.voters, 2);
    let voters = membership.get_voters().await;
    assert!(voters.contains(&joiner_address));

    let _ = shutdown_tx.send(true);
}
