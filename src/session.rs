//! Session orchestrator: owns the five Jupyter channel tunnels and the
//! optional HTTPS MITM proxy, and produces the final provenance statement.
//!
//! Grounded on `examples/original_source/pkg/jnproxy/jnproxy.go` (the
//! `New`/`Start`/`Stop`/`Provenance` state machine and the five
//! `AddressBinding`s derived from a pair of `NetworkMetadata`) — generalized
//! to also own the HTTP MITM proxy described in `spec.md` §4.4, which the
//! upstream source starts as a separate, unwired component (see
//! `pkg/jnproxy/http.go`).

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::ca::CertificateAuthority;
use crate::error::{Error, Result};
use crate::http_proxy::Proxy as HttpProxy;
use crate::provenance::{Builder as ProvenanceBuilderInput, ProvenanceBuilder, ProvenanceInput, Statement, Subject};
use crate::repository::RepositoryStore;
use crate::tunnel::{ChannelBinding, Tunnel};

/// Per-endpoint Jupyter kernel port assignment.
/// See https://jupyter-client.readthedocs.io/en/stable/messaging.html
#[derive(Clone, Copy, Debug)]
pub struct Ports {
    pub shell: u16,
    pub stdin: u16,
    pub iopub: u16,
    pub control: u16,
    pub heartbeat: u16,
}

#[derive(Clone, Debug)]
pub struct NetworkEndpoint {
    pub ip: IpAddr,
    pub ports: Ports,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    New,
    Started,
    Finished,
}

/// Owns one proxied Jupyter session: five channel tunnels, an optional HTTP
/// MITM proxy, and the repository they record into.
pub struct Session {
    state: std::sync::Mutex<State>,
    tunnels: Vec<Tunnel>,
    http_proxy: Option<Arc<HttpProxy>>,
    repo: Arc<dyn RepositoryStore>,
    sequence: Arc<AtomicU64>,
    started_at: std::sync::Mutex<Option<DateTime<Utc>>>,
    finished_at: std::sync::Mutex<Option<DateTime<Utc>>>,
    provenance: ProvenanceBuilder,
}

impl Session {
    pub fn new(
        src: NetworkEndpoint,
        dst: NetworkEndpoint,
        repo: Arc<dyn RepositoryStore>,
        ca: Option<Arc<CertificateAuthority>>,
        http_addr: Option<SocketAddr>,
        handlers: Vec<Arc<dyn crate::http_proxy::handler::Handler>>,
    ) -> Result<Self> {
        let sequence = Arc::new(AtomicU64::new(0));
        let bindings = [
            ("shell", src.ports.shell, dst.ports.shell),
            ("stdin", src.ports.stdin, dst.ports.stdin),
            ("iopub", src.ports.iopub, dst.ports.iopub),
            ("control", src.ports.control, dst.ports.control),
            ("heartbeat", src.ports.heartbeat, dst.ports.heartbeat),
        ];
        let tunnels = bindings
            .into_iter()
            .map(|(name, src_port, dst_port)| {
                Tunnel::new(
                    ChannelBinding {
                        name,
                        src: SocketAddr::new(src.ip, src_port),
                        dst: SocketAddr::new(dst.ip, dst_port),
                    },
                    repo.clone(),
                    sequence.clone(),
                )
            })
            .collect();

        let http_proxy = match (ca, http_addr) {
            (Some(ca), Some(addr)) => Some(Arc::new(HttpProxy::new(addr, ca, handlers, repo.clone(), sequence.clone()))),
            (None, None) => None,
            _ => return Err(Error::invalid("http proxy requires both a CA and a listen address")),
        };

        Ok(Self {
            state: std::sync::Mutex::new(State::New),
            tunnels,
            http_proxy,
            repo,
            sequence,
            started_at: std::sync::Mutex::new(None),
            finished_at: std::sync::Mutex::new(None),
            provenance: ProvenanceBuilder::new(),
        })
    }

    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("session state poisoned");
            if *state != State::New {
                return Err(Error::invalid(format!("cannot start from state {:?}", *state)));
            }
            *state = State::Started;
        }

        self.repo.init()?;

        let mut start_err = None;
        for tunnel in &self.tunnels {
            if let Err(e) = tunnel.start().await {
                start_err = Some(e);
                break;
            }
        }
        if start_err.is_none() {
            if let Some(proxy) = &self.http_proxy {
                if let Err(e) = proxy.start().await {
                    start_err = Some(e);
                }
            }
        }

        if let Some(e) = start_err {
            // A bind/listen failure partway through leaves some tunnels (and
            // possibly the HTTP proxy) already listening; tear the whole set
            // down rather than leak them, matching spec.md §4.7.
            self.stop().await.ok();
            return Err(e);
        }

        *self.started_at.lock().expect("session state poisoned") = Some(Utc::now());
        Ok(())
    }

    /// Best-effort teardown: every tunnel and the HTTP proxy are stopped
    /// even if an earlier one failed, matching the "don't return early"
    /// intent noted in the upstream source's `Stop()`.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("session state poisoned");
            if *state == State::Finished {
                return Err(Error::invalid(format!("cannot stop from state {:?}", *state)));
            }
            *state = State::Finished;
        }

        for tunnel in &self.tunnels {
            tunnel.stop().await;
        }
        if let Some(proxy) = &self.http_proxy {
            proxy.stop().await;
        }
        if let Err(e) = self.repo.close() {
            tracing::error!(error = %e, "repository close failed");
        }

        *self.finished_at.lock().expect("session state poisoned") = Some(Utc::now());
        Ok(())
    }

    /// Builds (or returns the cached) provenance statement. Only valid once
    /// the session has finished.
    pub fn provenance(&self, builder: ProvenanceBuilderInput, subjects: Vec<Subject>, repository_uri: String) -> Result<Statement> {
        if *self.state.lock().expect("session state poisoned") != State::Finished {
            return Err(Error::invalid("provenance requires a finished session"));
        }

        let repository_digest = self.repo.digest()?;
        let mut descriptors = Vec::new();
        if let Some(proxy) = &self.http_proxy {
            descriptors.extend(proxy.dependencies());
        }

        let started_on = self.started_at.lock().expect("session state poisoned").unwrap_or_else(Utc::now);
        let finished_on = self.finished_at.lock().expect("session state poisoned").unwrap_or_else(Utc::now);

        Ok(self.provenance.build(ProvenanceInput {
            builder,
            subjects,
            repository_uri,
            repository_digest,
            descriptors,
            started_on,
            finished_on,
        }))
    }
}
