//! Proxy selection, bypass matching and CONNECT tunneling.

use std::net::IpAddr;

use base64::Engine;
use bytes::{BufMut, BytesMut};
use http::{StatusCode, Uri};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::client::options::ProxyOptions;
use crate::common::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::headers;
use crate::proto::h1::io::BufferedIo;
use crate::proto::h1::parse;

/// Bound on a proxy response head.
const MAX_TUNNEL_HEAD_BYTES: usize = 16 * 1024;

/// Bound on a drained 407 body; anything larger forfeits the retry.
const MAX_DRAIN_BYTES: u64 = 64 * 1024;

/// How requests reach the selected proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProxyMode {
    /// CONNECT tunnel; used for https and wss targets.
    Tunnel,
    /// Absolute-form requests on the proxy connection; http and ws targets.
    Forward,
}

#[derive(Debug, Clone)]
pub(crate) struct ProxyIntent {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) mode: ProxyMode,
    pub(crate) credentials: Option<(String, String)>,
    /// Distinguishes proxied connections inside pool keys.
    pub(crate) id: String,
}

/// Resolves the effective proxy for a destination.
///
/// Precedence: explicit configuration, then `HTTPS_PROXY`/`https_proxy` for
/// TLS targets, then `HTTP_PROXY`/`http_proxy` for plaintext targets, then
/// the bypass rules from configuration and `NO_PROXY`/`no_proxy`. The https
/// to `HTTP_PROXY` fall-back stays off unless enabled.
pub(crate) struct ProxySelector {
    explicit: Option<(String, u16)>,
    env_https: Option<(String, u16)>,
    env_http: Option<(String, u16)>,
    credentials: Option<(String, String)>,
    bypass: Vec<BypassRule>,
    allow_http_fallback_for_https: bool,
    pub(crate) allow_plaintext_auth: bool,
}

impl ProxySelector {
    pub(crate) fn from_options(options: &ProxyOptions) -> Result<ProxySelector> {
        let explicit = match &options.address {
            Some(uri) => Some(proxy_authority(uri)?),
            None => None,
        };

        let (env_https, env_http) = if options.use_env {
            (
                env_proxy("HTTPS_PROXY").or_else(|| env_proxy("https_proxy")),
                env_proxy("HTTP_PROXY").or_else(|| env_proxy("http_proxy")),
            )
        } else {
            (None, None)
        };

        let mut bypass = Vec::new();
        if let Some(list) = &options.bypass_list {
            parse_bypass_list(list, &mut bypass);
        }
        if options.use_env {
            for name in ["NO_PROXY", "no_proxy"] {
                if let Ok(list) = std::env::var(name) {
                    parse_bypass_list(&list, &mut bypass);
                    break;
                }
            }
        }

        Ok(ProxySelector {
            explicit,
            env_https,
            env_http,
            credentials: options.credentials.clone(),
            bypass,
            allow_http_fallback_for_https: options.allow_http_fallback_for_https,
            allow_plaintext_auth: options.allow_plaintext_auth,
        })
    }

    pub(crate) fn intent_for(&self, scheme: &str, host: &str, port: u16) -> Option<ProxyIntent> {
        if self.bypass.iter().any(|rule| rule.matches(host, port)) {
            trace!("proxy bypass matched {}:{}", host, port);
            return None;
        }

        let secure = scheme == "https" || scheme == "wss";
        let selected = if let Some(explicit) = &self.explicit {
            Some(explicit)
        } else if secure {
            self.env_https.as_ref().or(if self.allow_http_fallback_for_https {
                self.env_http.as_ref()
            } else {
                None
            })
        } else {
            self.env_http.as_ref()
        }?;

        let mode = if secure {
            ProxyMode::Tunnel
        } else {
            ProxyMode::Forward
        };
        Some(ProxyIntent {
            host: selected.0.clone(),
            port: selected.1,
            mode,
            credentials: self.credentials.clone(),
            id: format!("{}:{}", selected.0, selected.1),
        })
    }
}

fn proxy_authority(uri: &Uri) -> Result<(String, u16)> {
    let host = uri
        .host()
        .ok_or_else(|| Error::new_invalid_request("proxy address missing host"))?;
    let port = uri.port_u16().unwrap_or(3128);
    Ok((host.to_ascii_lowercase(), port))
}

fn env_proxy(name: &str) -> Option<(String, u16)> {
    let value = std::env::var(name).ok()?;
    if value.is_empty() {
        return None;
    }
    let uri: Uri = value.parse().ok()?;
    proxy_authority(&uri).ok()
}

// ===== bypass rules =====

#[derive(Debug, Clone, PartialEq)]
enum BypassRule {
    All,
    Exact { host: String, port: Option<u16> },
    Suffix { domain: String, port: Option<u16> },
    Cidr { net: IpAddr, prefix: u8 },
}

impl BypassRule {
    fn matches(&self, host: &str, port: u16) -> bool {
        let host = host.to_ascii_lowercase();
        match self {
            BypassRule::All => true,
            BypassRule::Exact { host: h, port: p } => {
                p.map(|p| p == port).unwrap_or(true) && h == &host
            }
            BypassRule::Suffix { domain, port: p } => {
                p.map(|p| p == port).unwrap_or(true)
                    && (host == *domain || host.ends_with(&format!(".{}", domain)))
            }
            BypassRule::Cidr { net, prefix } => {
                let addr = match host.trim_start_matches('[').trim_end_matches(']').parse() {
                    Ok(addr) => normalize_mapped(addr, net),
                    Err(_) => return false,
                };
                cidr_contains(net, *prefix, &addr)
            }
        }
    }
}

/// IPv4-mapped IPv6 addresses compare against IPv4 rules as IPv4.
fn normalize_mapped(addr: IpAddr, net: &IpAddr) -> IpAddr {
    if let (IpAddr::V6(v6), IpAddr::V4(_)) = (&addr, net) {
        if let Some(v4) = v6.to_ipv4_mapped() {
            return IpAddr::V4(v4);
        }
    }
    addr
}

fn cidr_contains(net: &IpAddr, prefix: u8, addr: &IpAddr) -> bool {
    match (net, addr) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - prefix as u32)
            };
            (u32::from(*net) & mask) == (u32::from(*addr) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - prefix as u32)
            };
            (u128::from(*net) & mask) == (u128::from(*addr) & mask)
        }
        _ => false,
    }
}

fn parse_bypass_list(list: &str, out: &mut Vec<BypassRule>) {
    for raw in list.split(',') {
        let rule = raw.trim();
        if rule.is_empty() {
            continue;
        }
        if rule == "*" {
            out.push(BypassRule::All);
            continue;
        }
        if rule.contains('/') {
            match parse_cidr(rule) {
                Some(parsed) => out.push(parsed),
                // out-of-range prefix lengths are ignored
                None => debug!("ignoring malformed bypass rule: {}", rule),
            }
            continue;
        }
        let (host_part, port) = split_port(rule);
        let host_part = host_part.to_ascii_lowercase();
        if let Some(domain) = host_part
            .strip_prefix("*.")
            .or_else(|| host_part.strip_prefix('.'))
        {
            out.push(BypassRule::Suffix {
                domain: domain.to_owned(),
                port,
            });
        } else {
            out.push(BypassRule::Exact {
                host: host_part
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .to_owned(),
                port,
            });
        }
    }
}

fn parse_cidr(rule: &str) -> Option<BypassRule> {
    let (addr, prefix) = rule.split_once('/')?;
    let net: IpAddr = addr
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    let max = match net {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix > max {
        return None;
    }
    let (net, prefix) = match net {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) if prefix >= 96 => (IpAddr::V4(v4), prefix - 96),
            _ => (IpAddr::V6(v6), prefix),
        },
        v4 => (v4, prefix),
    };
    Some(BypassRule::Cidr { net, prefix })
}

/// Splits a trailing `:port`, leaving IPv6 literals intact.
fn split_port(rule: &str) -> (&str, Option<u16>) {
    if let Some(end) = rule.rfind(':') {
        let (head, tail) = rule.split_at(end);
        let tail = &tail[1..];
        let head_is_v6 = head.matches(':').count() > 0 && !head.starts_with('[');
        if !head_is_v6 || head.ends_with(']') {
            if let Ok(port) = tail.parse::<u16>() {
                return (head, Some(port));
            }
        }
    }
    (rule, None)
}

// ===== CONNECT tunnel =====

/// Performs the CONNECT exchange. On 407 with Basic credentials available,
/// one retry happens on the same connection, but only when the refusal can
/// be drained safely.
pub(crate) async fn tunnel(
    tcp: TcpStream,
    target_host: &str,
    target_port: u16,
    intent: &ProxyIntent,
    allow_plaintext_auth: bool,
    cancel: &CancelToken,
) -> Result<TcpStream> {
    let mut io = BufferedIo::new(tcp);

    write_connect(&mut io, target_host, target_port, None, cancel).await?;
    let head = read_tunnel_head(&mut io, cancel).await?;

    let head = if head.status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        let Some((user, pass)) = &intent.credentials else {
            return Err(Error::new_proxy_auth());
        };
        if !allow_plaintext_auth {
            return Err(Error::new_proxy_tunnel(
                "credentials over an unencrypted proxy are not allowed",
            ));
        }
        if !drain_if_safe(&mut io, &head, cancel).await? {
            return Err(Error::new_proxy_tunnel(
                "407 response cannot be drained for a retry",
            ));
        }
        debug!("retrying CONNECT with proxy credentials");
        let auth = basic_auth(user, pass);
        write_connect(&mut io, target_host, target_port, Some(&auth), cancel).await?;
        let head = read_tunnel_head(&mut io, cancel).await?;
        if head.status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            return Err(Error::new_proxy_auth());
        }
        head
    } else {
        head
    };

    if !head.status.is_success() {
        return Err(Error::new_proxy_tunnel(format!(
            "proxy refused CONNECT with {}",
            head.status
        )));
    }

    let (tcp, leftover) = io.into_parts();
    if !leftover.is_empty() {
        // Nothing may arrive before our TLS ClientHello.
        return Err(Error::new_proxy_tunnel("unexpected bytes after CONNECT"));
    }
    trace!("CONNECT tunnel to {}:{} established", target_host, target_port);
    Ok(tcp)
}

async fn write_connect(
    io: &mut BufferedIo<TcpStream>,
    host: &str,
    port: u16,
    auth: Option<&str>,
    cancel: &CancelToken,
) -> Result<()> {
    let mut head = BytesMut::with_capacity(128);
    let bracketed = host.contains(':') && !host.starts_with('[');
    let authority = if bracketed {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    head.put_slice(b"CONNECT ");
    head.put_slice(authority.as_bytes());
    head.put_slice(b" HTTP/1.1\r\nhost: ");
    head.put_slice(authority.as_bytes());
    head.put_slice(b"\r\n");
    if let Some(auth) = auth {
        head.put_slice(b"proxy-authorization: ");
        head.put_slice(auth.as_bytes());
        head.put_slice(b"\r\n");
    }
    head.put_slice(b"\r\n");

    tokio::select! {
        res = io.write_all(&head) => res.map_err(Error::new_proxy_connect)?,
        _ = cancel.canceled() => return Err(cancel.error()),
    }
    tokio::select! {
        res = io.flush() => res.map_err(Error::new_proxy_connect),
        _ = cancel.canceled() => Err(cancel.error()),
    }
}

async fn read_tunnel_head(
    io: &mut BufferedIo<TcpStream>,
    cancel: &CancelToken,
) -> Result<parse::ResponseHead> {
    tokio::select! {
        res = parse::read_head(io, MAX_TUNNEL_HEAD_BYTES) => {
            res.map_err(|err| Error::new_proxy_tunnel(err))
        }
        _ = cancel.canceled() => Err(cancel.error()),
    }
}

/// The connection is reusable for the credentials retry only when the 407
/// did not ask for a close and carries a fully drainable known-length body.
async fn drain_if_safe(
    io: &mut BufferedIo<TcpStream>,
    head: &parse::ResponseHead,
    cancel: &CancelToken,
) -> Result<bool> {
    if headers::connection_close(&head.headers) {
        return Ok(false);
    }
    if headers::transfer_encoding_is_chunked(&head.headers) {
        return Ok(false);
    }
    let len = match headers::content_length_parse_all(&head.headers) {
        Ok(Some(len)) => len,
        Ok(None) => 0,
        Err(()) => return Ok(false),
    };
    if len > MAX_DRAIN_BYTES {
        return Ok(false);
    }
    let mut remaining = len as usize;
    while remaining > 0 {
        if !io.has_buffered_input() {
            let n = tokio::select! {
                res = io.fill() => res.map_err(Error::new_proxy_connect)?,
                _ = cancel.canceled() => return Err(cancel.error()),
            };
            if n == 0 {
                return Ok(false);
            }
        }
        let taken = io.take(remaining);
        remaining -= taken.len();
    }
    Ok(true)
}

fn basic_auth(user: &str, pass: &str) -> String {
    let raw = format!("{}:{}", user, pass);
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(raw.as_bytes())
    )
}
