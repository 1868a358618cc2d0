//! One TCP tunnel per named Jupyter channel: bind `src`, dial `dst` on
//! accept, copy bytes bidirectionally, recording the ingress (client ->
//! kernel) direction to the repository before it is forwarded.
//!
//! See `spec.md` §4.2 and §5. Grounded on `examples/original_source/pkg/
//! jnproxy/internal/proxy/jserver/proxy.go`, the most complete iteration of
//! this idea in the upstream Go source — in particular its `recordConns`
//! (connection admission checked under the same mutex as cancellation) and
//! `forward` (record-before-forward, 2048-byte reads) functions, translated
//! into a cooperatively cancelled tokio task tree.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::repository::RepositoryStore;

const READ_BUFFER_SIZE: usize = 2048;

/// `{ name, src, dst }`. Five are derived from a pair of [`crate::session::
/// NetworkEndpoint`]s.
#[derive(Clone, Debug)]
pub struct ChannelBinding {
    pub name: &'static str,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

/// Registry of live connection halves for one tunnel, guarded by the same
/// mutex as the cancellation flag. This is the sole correctness-critical
/// invariant of §4.2/§5: admitting a new connection pair and checking
/// cancellation must be atomic, or a connection accepted concurrently with
/// `stop()` can leak past it.
struct Registry {
    cancelled: bool,
    conns: Vec<Arc<TcpStream>>,
}

/// A single named tunnel. Owns its listener and the connections it has
/// accepted; `stop()` tears all of it down and waits for every spawned task
/// to finish.
pub struct Tunnel {
    binding: ChannelBinding,
    repo: Arc<dyn RepositoryStore>,
    sequence: Arc<AtomicU64>,
    registry: Arc<AsyncMutex<Registry>>,
    shutdown: Arc<Notify>,
    accept_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Tunnel {
    pub fn new(binding: ChannelBinding, repo: Arc<dyn RepositoryStore>, sequence: Arc<AtomicU64>) -> Self {
        Self {
            binding,
            repo,
            sequence,
            registry: Arc::new(AsyncMutex::new(Registry {
                cancelled: false,
                conns: Vec::new(),
            })),
            shutdown: Arc::new(Notify::new()),
            accept_task: AsyncMutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.binding.name
    }

    /// Binds the listener and spawns the acceptor. Failing to bind aborts
    /// the whole session start (the caller propagates the error).
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(self.binding.src)
            .await
            .map_err(|e| Error::invalid(format!("bind {} ({}): {e}", self.binding.name, self.binding.src)))?;
        info!(channel = self.binding.name, addr = %self.binding.src, "tunnel listening");

        let binding = self.binding.clone();
        let repo = self.repo.clone();
        let sequence = self.sequence.clone();
        let registry = self.registry.clone();
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            accept_loop(listener, binding, repo, sequence, registry, shutdown).await;
        });
        *self.accept_task.lock().await = Some(task);
        Ok(())
    }

    /// Cancels the tunnel: closes the listener (via the shutdown signal),
    /// then closes every registered connection under the registry mutex so
    /// that no admission can race past this point, then waits for every
    /// spawned task to exit.
    pub async fn stop(&self) {
        {
            let mut reg = self.registry.lock().await;
            reg.cancelled = true;
            for conn in reg.conns.drain(..) {
                shutdown_conn(&conn);
            }
        }
        self.shutdown.notify_waiters();

        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

/// Closes both halves of `conn` immediately so a peer blocked in `read()`
/// wakes up with EOF rather than waiting for the copy loop to notice
/// cancellation on its own.
fn shutdown_conn(conn: &TcpStream) {
    let _ = socket2::SockRef::from(conn).shutdown(std::net::Shutdown::Both);
}

async fn accept_loop(
    listener: TcpListener,
    binding: ChannelBinding,
    repo: Arc<dyn RepositoryStore>,
    sequence: Arc<AtomicU64>,
    registry: Arc<AsyncMutex<Registry>>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                info!(channel = binding.name, "tunnel accept loop exiting");
                return;
            }
            accepted = listener.accept() => {
                let (src, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(channel = binding.name, error = %e, "accept failed");
                        continue;
                    }
                };
                info!(channel = binding.name, peer = %peer, "accepted connection");

                let dst = match TcpStream::connect(binding.dst).await {
                    Ok(d) => d,
                    Err(e) => {
                        error!(channel = binding.name, dst = %binding.dst, error = %e, "dial failed");
                        drop(src);
                        continue;
                    }
                };

                if let Err(e) = configure_conn(&src) {
                    warn!(channel = binding.name, error = %e, "failed to configure src conn settings");
                }
                if let Err(e) = configure_conn(&dst) {
                    warn!(channel = binding.name, error = %e, "failed to configure dst conn settings");
                }

                let src = Arc::new(src);
                let dst = Arc::new(dst);

                // Admission is checked under the same mutex as cancellation.
                // Without this, a connection pair accepted concurrently with
                // `stop()` can be forwarded for and recorded past shutdown.
                let admitted = {
                    let mut reg = registry.lock().await;
                    if reg.cancelled {
                        false
                    } else {
                        reg.conns.push(src.clone());
                        reg.conns.push(dst.clone());
                        true
                    }
                };
                if !admitted {
                    info!(channel = binding.name, "dropping connection admitted after stop");
                    continue;
                }

                spawn_copy(binding.name, src.clone(), dst.clone(), true, repo.clone(), sequence.clone());
                spawn_copy(binding.name, dst, src, false, repo.clone(), sequence.clone());
            }
        }
    }
}

fn configure_conn(conn: &TcpStream) -> std::io::Result<()> {
    conn.set_nodelay(true)?;
    let sock_ref = socket2::SockRef::from(conn);
    sock_ref.set_keepalive(true)?;
    Ok(())
}

fn spawn_copy(
    channel: &'static str,
    from: Arc<TcpStream>,
    to: Arc<TcpStream>,
    record: bool,
    repo: Arc<dyn RepositoryStore>,
    sequence: Arc<AtomicU64>,
) {
    tokio::spawn(async move {
        copy_loop(channel, from, to, record, repo, sequence).await;
    });
}

/// One read of `from` becomes exactly one `RecordedFrame` (no reassembly)
/// when `record` is true, written to the store *before* the bytes are
/// forwarded to `to`. This ordering is a trust property: a malicious kernel
/// must not be able to acknowledge bytes it then claims never arrived.
async fn copy_loop(
    channel: &'static str,
    from: Arc<TcpStream>,
    to: Arc<TcpStream>,
    record: bool,
    repo: Arc<dyn RepositoryStore>,
    sequence: Arc<AtomicU64>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match read_nonblocking(&from, &mut buf).await {
            Ok(n) => n,
            Err(e) => {
                debug!(channel, error = %e, "read terminated");
                break;
            }
        };
        if n == 0 {
            debug!(channel, "peer closed connection");
            break;
        }

        if record {
            let seq = sequence.fetch_add(1, Ordering::SeqCst) + 1;
            let timestamp = Utc::now().to_rfc3339();
            let path = format!("{channel}/{seq:016x}_{timestamp}");
            if let Err(e) = repo.create_file(&path, &buf[..n]) {
                error!(channel, path, error = %e, "record-before-forward failed, terminating flow");
                break;
            }
        }

        if let Err(e) = write_all(&to, &buf[..n]).await {
            debug!(channel, error = %e, "write terminated");
            break;
        }
    }
    let _ = shutdown_write(&to).await;
}

async fn read_nonblocking(conn: &Arc<TcpStream>, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        conn.readable().await?;
        match conn.try_read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

async fn write_all(conn: &Arc<TcpStream>, data: &[u8]) -> std::io::Result<()> {
    let mut written = 0;
    while written < data.len() {
        conn.writable().await?;
        match conn.try_write(&data[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn shutdown_write(conn: &Arc<TcpStream>) -> std::io::Result<()> {
    socket2::SockRef::from(conn.as_ref()).shutdown(std::net::Shutdown::Write)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};
    use tokio::net::TcpListener as TestListener;

    #[tokio::test]
    async fn pass_through_echoes_and_records() {
        let upstream = TestListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut conn, _)) = upstream.accept().await {
                let mut buf = vec![0u8; 64];
                if let Ok(n) = AsyncReadExt::read(&mut conn, &mut buf).await {
                    let _ = conn.write_all(&buf[..n]).await;
                }
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let repo: Arc<dyn RepositoryStore> = Arc::new(crate::repository::FsRepository::new(dir.path()));
        repo.init().unwrap();

        let src_listener = TestListener::bind("127.0.0.1:0").await.unwrap();
        let src_addr = src_listener.local_addr().unwrap();
        drop(src_listener);

        let binding = ChannelBinding {
            name: "shell",
            src: src_addr,
            dst: upstream_addr,
        };
        let tunnel = Tunnel::new(binding, repo.clone(), Arc::new(AtomicU64::new(0)));
        tunnel.start().await.unwrap();

        let mut client = TcpStream::connect(src_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut resp = vec![0u8; 64];
        let n = AsyncReadExt::read(&mut client, &mut resp).await.unwrap();
        assert_eq!(&resp[..n], b"hello");

        tunnel.stop().await;

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("shell"))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1);
        let recorded = std::fs::read(entries[0].path()).unwrap();
        assert_eq!(recorded, b"hello");
    }
}
