//! Fallible builder for session configuration, replacing the upstream
//! source's `[]Option` functional-options list (`examples/original_source/
//! pkg/jnproxy/jnproxy.go`'s `Option`/`WithLogger`/`WithCA`) with a single
//! `Config` value built by [`ConfigBuilder`], per `spec.md` §9's note that a
//! `Config` value with a fallible builder is the idiomatic replacement.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::ca::CertificateAuthority;
use crate::error::{Error, Result};
use crate::http_proxy::handler::Handler;
use crate::http_proxy::handlers::{Allow, Deny, HuggingfaceDataset, HuggingfaceModel};
use crate::repository::{FsRepository, RepositoryStore};
use crate::session::NetworkEndpoint;

/// Fully resolved configuration for one [`crate::session::Session`].
pub struct Config {
    pub src: NetworkEndpoint,
    pub dst: NetworkEndpoint,
    pub repository_dir: PathBuf,
    pub repository: Arc<dyn RepositoryStore>,
    pub ca: Option<Arc<CertificateAuthority>>,
    pub http_listen_addr: Option<SocketAddr>,
    pub handlers: Vec<Arc<dyn Handler>>,
}

#[derive(Default)]
pub struct ConfigBuilder {
    src: Option<NetworkEndpoint>,
    dst: Option<NetworkEndpoint>,
    repository_dir: Option<PathBuf>,
    cert_dir: Option<PathBuf>,
    http_listen_addr: Option<SocketAddr>,
    handlers: Vec<Arc<dyn Handler>>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn src(mut self, src: NetworkEndpoint) -> Self {
        self.src = Some(src);
        self
    }

    pub fn dst(mut self, dst: NetworkEndpoint) -> Self {
        self.dst = Some(dst);
        self
    }

    pub fn repository_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.repository_dir = Some(dir.into());
        self
    }

    pub fn cert_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cert_dir = Some(dir.into());
        self
    }

    pub fn http_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.http_listen_addr = Some(addr);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Installs the four built-in handlers in the order `spec.md` §4.5
    /// lists them, replacing whatever handlers were set previously —
    /// mirrors `InstallBuiltinHandlers` resetting `httpHandlers` to nil
    /// first in `examples/original_source/pkg/jnproxy/handler.go`.
    pub fn with_builtin_handlers(mut self) -> Self {
        self.handlers = vec![
            Arc::new(HuggingfaceModel::new()) as Arc<dyn Handler>,
            Arc::new(HuggingfaceDataset::new()) as Arc<dyn Handler>,
            Arc::new(Allow::new()) as Arc<dyn Handler>,
        ];
        self
    }

    pub fn with_deny_handler(mut self) -> Self {
        self.handlers = vec![Arc::new(Deny::new()) as Arc<dyn Handler>];
        self
    }

    pub fn build(self) -> Result<Config> {
        let src = self.src.ok_or_else(|| Error::invalid("missing src network endpoint"))?;
        let dst = self.dst.ok_or_else(|| Error::invalid("missing dst network endpoint"))?;

        let ca = match self.cert_dir {
            Some(dir) => {
                let cert_pem = std::fs::read_to_string(dir.join("ca.cert"))
                    .map_err(|e| Error::invalid(format!("read ca.cert: {e}")))?;
                let key_pem = std::fs::read_to_string(dir.join("ca.key"))
                    .map_err(|e| Error::invalid(format!("read ca.key: {e}")))?;
                Some(Arc::new(CertificateAuthority::from_pem(&cert_pem, &key_pem)?))
            }
            None if self.http_listen_addr.is_some() => Some(Arc::new(CertificateAuthority::generate()?)),
            None => None,
        };

        let repository_dir = match self.repository_dir {
            Some(dir) => dir,
            None => tempfile::tempdir()
                .map_err(|e| Error::invalid(format!("create temporary repository directory: {e}")))?
                .into_path(),
        };
        let repository: Arc<dyn RepositoryStore> = Arc::new(FsRepository::new(&repository_dir));

        Ok(Config {
            src,
            dst,
            repository_dir,
            repository,
            ca,
            http_listen_addr: self.http_listen_addr,
            handlers: self.handlers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Ports;

    fn endpoint() -> NetworkEndpoint {
        NetworkEndpoint {
            ip: "127.0.0.1".parse().unwrap(),
            ports: Ports {
                shell: 1,
                stdin: 2,
                iopub: 3,
                control: 4,
                heartbeat: 5,
            },
        }
    }

    #[test]
    fn build_fails_without_src() {
        let err = ConfigBuilder::new().dst(endpoint()).build().unwrap_err();
        assert!(err.is_invalid());
    }

    #[test]
    fn build_succeeds_with_src_and_dst() {
        let config = ConfigBuilder::new().src(endpoint()).dst(endpoint()).build().unwrap();
        assert!(config.ca.is_none());
        assert!(config.http_listen_addr.is_none());
    }

    #[test]
    fn builtin_handlers_install_three_handlers_in_order() {
        let config = ConfigBuilder::new()
            .src(endpoint())
            .dst(endpoint())
            .with_builtin_handlers()
            .build()
            .unwrap();
        assert_eq!(config.handlers.len(), 3);
        assert_eq!(config.handlers[0].name(), "HuggingfaceModel/v0.1");
        assert_eq!(config.handlers[2].name(), "Allow/v0.1");
    }
}
