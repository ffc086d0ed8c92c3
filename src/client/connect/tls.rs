//! TLS provider abstraction.
//!
//! Both backends are rustls sessions; they differ only in where trust roots
//! come from. `System` reads the platform store, `Embedded` ships its own
//! set, `Auto` prefers the platform store and falls back when it is empty or
//! unreadable. Minimum protocol version is TLS 1.2 and the record layer is
//! rustls's concern; the rest of the crate treats the session as an ordered
//! duplex byte stream.

use std::io;
use std::sync::Arc;

use rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::client::options::TlsBackend;
use crate::common::cancel::CancelToken;
use crate::error::{Error, Result};

/// ALPN protocol ids offered for https targets.
pub(crate) const ALPN_H2_H11: &[&[u8]] = &[b"h2", b"http/1.1"];
/// WebSocket upgrades negotiate over plain HTTP/1.1; no ALPN is offered.
pub(crate) const ALPN_NONE: &[&[u8]] = &[];

/// A ready-to-handshake TLS configuration for one `(backend, alpn)` pair.
pub(crate) struct TlsProvider {
    backend_id: &'static str,
    alpn_fingerprint: String,
    connector: TlsConnector,
}

impl TlsProvider {
    pub(crate) fn new(backend: TlsBackend, alpn: &[&[u8]]) -> Result<TlsProvider> {
        let (roots, backend_id) = load_roots(backend)?;
        let mut config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

        let alpn_fingerprint = alpn
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect::<Vec<_>>()
            .join(",");

        Ok(TlsProvider {
            backend_id,
            alpn_fingerprint,
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Identifies the resolved backend inside pool keys.
    pub(crate) fn backend_id(&self) -> &'static str {
        self.backend_id
    }

    pub(crate) fn alpn_fingerprint(&self) -> &str {
        &self.alpn_fingerprint
    }

    /// Runs the handshake with SNI set to `host`.
    pub(crate) async fn handshake(
        &self,
        host: &str,
        tcp: TcpStream,
        cancel: &CancelToken,
    ) -> Result<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(host)
            .map_err(|_| Error::new_invalid_request(format!("invalid SNI host {}", host)))?;

        let stream = tokio::select! {
            res = self.connector.connect(server_name, tcp) => {
                res.map_err(map_handshake_err)?
            }
            _ = cancel.canceled() => return Err(cancel.error()),
        };
        trace!(
            "tls handshake complete; alpn={:?}",
            stream.get_ref().1.alpn_protocol().map(String::from_utf8_lossy)
        );
        Ok(stream)
    }
}

/// True if the session negotiated `h2`.
pub(crate) fn alpn_is_h2(stream: &TlsStream<TcpStream>) -> bool {
    stream.get_ref().1.alpn_protocol() == Some(b"h2")
}

fn load_roots(backend: TlsBackend) -> Result<(RootCertStore, &'static str)> {
    match backend {
        TlsBackend::System => {
            let roots = system_roots()
                .map_err(|e| Error::new_certificate(format!("platform trust store: {}", e)))?;
            Ok((roots, "system"))
        }
        TlsBackend::Embedded => Ok((embedded_roots(), "embedded")),
        TlsBackend::Auto => match system_roots() {
            Ok(roots) => Ok((roots, "system")),
            Err(err) => {
                debug!("platform trust store unavailable ({}), using embedded roots", err);
                Ok((embedded_roots(), "embedded"))
            }
        },
    }
}

fn system_roots() -> io::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs()?;
    let mut loaded = 0usize;
    for cert in certs {
        if roots.add(&rustls::Certificate(cert.0)).is_ok() {
            loaded += 1;
        }
    }
    if loaded == 0 {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no usable roots in platform store",
        ));
    }
    Ok(roots)
}

fn embedded_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    roots
}

/// Chain, hostname and validity problems map to `CertificateError`; anything
/// else on the handshake path is a `NetworkError`.
fn map_handshake_err(err: io::Error) -> Error {
    if let Some(inner) = err.get_ref() {
        if let Some(tls_err) = inner.downcast_ref::<rustls::Error>() {
            if matches!(tls_err, rustls::Error::InvalidCertificate(_)) {
                return Error::new_certificate(format!("{}", tls_err));
            }
        }
    }
    Error::new_io(err)
}
