//! End-to-end tunnel scenarios from `spec.md` §8: pure pass-through and
//! shutdown under load. Exercises real loopback sockets, matching the
//! teacher's own integration-test style (`collector/tests/
//! system_runner_test.rs` drives real `/proc` files rather than mocks).

use std::net::SocketAddr;
use std::sync::Arc;

use jn_lineage_proxy::repository::{FsRepository, RepositoryStore};
use jn_lineage_proxy::session::{NetworkEndpoint, Ports, Session};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn loopback_ports(base: u16) -> Ports {
    Ports {
        shell: base,
        stdin: base + 1,
        iopub: base + 2,
        control: base + 3,
        heartbeat: base + 4,
    }
}

async fn spawn_echo_server(addr: SocketAddr) {
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        loop {
            let (mut conn, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    let n = match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    if conn.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
}

#[tokio::test]
async fn pure_pass_through_records_and_forwards() {
    let dst_base = 29100;
    for offset in 0..5u16 {
        let addr: SocketAddr = format!("127.0.0.1:{}", dst_base + offset).parse().unwrap();
        spawn_echo_server(addr).await;
    }

    let dir = tempfile::tempdir().unwrap();
    let repo: Arc<dyn RepositoryStore> = Arc::new(FsRepository::new(dir.path()));

    let src = NetworkEndpoint {
        ip: "127.0.0.1".parse().unwrap(),
        ports: loopback_ports(19100),
    };
    let dst = NetworkEndpoint {
        ip: "127.0.0.1".parse().unwrap(),
        ports: loopback_ports(dst_base),
    };
    let session = Session::new(src, dst, repo, None, None, Vec::new()).unwrap();
    session.start().await.unwrap();

    let mut client = TcpStream::connect("127.0.0.1:19100").await.unwrap();
    client.write_all(b"hello").await.unwrap();
    let mut buf = vec![0u8; 64];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello");
    drop(client);

    session.stop().await.unwrap();

    let entries: Vec<_> = std::fs::read_dir(dir.path().join("shell")).unwrap().collect();
    assert_eq!(entries.len(), 1);
    let name = entries[0].as_ref().unwrap().file_name();
    assert!(name.to_string_lossy().starts_with("0000000000000001_"));
}

#[tokio::test]
async fn shutdown_under_load_completes_and_produces_valid_provenance() {
    let dst_base = 29200;
    for offset in 0..5u16 {
        let addr: SocketAddr = format!("127.0.0.1:{}", dst_base + offset).parse().unwrap();
        spawn_echo_server(addr).await;
    }

    let dir = tempfile::tempdir().unwrap();
    let repo: Arc<dyn RepositoryStore> = Arc::new(FsRepository::new(dir.path()));

    let src = NetworkEndpoint {
        ip: "127.0.0.1".parse().unwrap(),
        ports: loopback_ports(19200),
    };
    let dst = NetworkEndpoint {
        ip: "127.0.0.1".parse().unwrap(),
        ports: loopback_ports(dst_base),
    };
    let session = Arc::new(Session::new(src, dst, repo, None, None, Vec::new()).unwrap());
    session.start().await.unwrap();

    let mut clients = Vec::new();
    for offset in 0..5u16 {
        let mut conn = TcpStream::connect(format!("127.0.0.1:{}", 19200 + offset)).await.unwrap();
        conn.write_all(b"traffic").await.unwrap();
        clients.push(conn);
    }

    let stop_result = tokio::time::timeout(std::time::Duration::from_secs(5), session.stop()).await;
    assert!(stop_result.is_ok(), "stop() did not complete within 5s");
    stop_result.unwrap().unwrap();

    let builder = jn_lineage_proxy::provenance::Builder {
        id: "jn-lineage-proxy".to_string(),
        version: "0.1.0".to_string(),
    };
    let statement = session
        .provenance(builder, Vec::new(), dir.path().display().to_string())
        .unwrap();
    let bytes = serde_json::to_vec(&statement).unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(parsed["predicateType"], "https://slsa.dev/provenance/v1");
}
