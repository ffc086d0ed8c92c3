//! Connection establishment: DNS, dual-stack racing, TLS.

pub(crate) mod dns;
pub(crate) mod tls;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::client::options::{FamilyPreference, HappyEyeballsOptions};
use crate::common::cancel::CancelToken;
use crate::error::{Error, Result};

use self::dns::Resolve;

/// An established byte stream, plain or TLS.
#[derive(Debug)]
pub(crate) enum Transport {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Transport {
    /// The raw socket, for liveness probing.
    pub(crate) fn tcp_ref(&self) -> &TcpStream {
        match self {
            Transport::Plain(tcp) => tcp,
            Transport::Tls(tls) => tls.get_ref().0,
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_read(cx, buf),
            Transport::Tls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_write(cx, buf),
            Transport::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_flush(cx),
            Transport::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(tcp) => Pin::new(tcp).poll_shutdown(cx),
            Transport::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One-shot signal shared by every attempt in a connect race.
struct RaceCancel {
    fired: AtomicBool,
    notify: tokio::sync::Notify,
}

impl RaceCancel {
    fn new() -> RaceCancel {
        RaceCancel {
            fired: AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
        }
    }

    fn fire(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    async fn fired(&self) {
        loop {
            if self.fired.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.fired.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// Interleaves the address list by family, leading with the preferred one.
fn interleave(addrs: Vec<SocketAddr>, preference: FamilyPreference) -> Vec<SocketAddr> {
    let (v6, v4): (Vec<_>, Vec<_>) = addrs.into_iter().partition(|a| a.is_ipv6());
    let (mut first, mut second) = match preference {
        FamilyPreference::V6First => (v6.into_iter(), v4.into_iter()),
        FamilyPreference::V4First => (v4.into_iter(), v6.into_iter()),
    };
    let mut out = Vec::with_capacity(first.len() + second.len());
    loop {
        match (first.next(), second.next()) {
            (None, None) => break,
            (a, b) => {
                out.extend(a);
                out.extend(b);
            }
        }
    }
    out
}

/// Races connect attempts with a stagger delay (RFC 8305 style).
///
/// Every attempt runs as its own task selecting on the shared race signal, so
/// a losing attempt closes its own socket on its own task; nothing tears a
/// socket down from a cancellation callback. The race signal outlives all
/// attempts: losers are awaited before this function returns.
pub(crate) async fn race_connect(
    addrs: Vec<SocketAddr>,
    options: &HappyEyeballsOptions,
    cancel: &CancelToken,
) -> Result<TcpStream> {
    let addrs = interleave(addrs, options.family_preference);
    debug_assert!(!addrs.is_empty());

    let race = Arc::new(RaceCancel::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<(usize, io::Result<TcpStream>)>();
    let mut handles = Vec::with_capacity(addrs.len());

    let start_attempt = |idx: usize,
                         addr: SocketAddr,
                         handles: &mut Vec<tokio::task::JoinHandle<()>>| {
        trace!("happy eyeballs: starting attempt {} to {}", idx, addr);
        let race = race.clone();
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = race.fired() => {
                    // Lost before the connect resolved; the in-flight socket
                    // is dropped here, on the task that owns it.
                }
                res = TcpStream::connect(addr) => {
                    let _ = tx.send((idx, res));
                }
            }
        }));
    };

    let mut started = 1usize;
    let mut finished = 0usize;
    let mut last_err: Option<io::Error> = None;
    let mut winner: Option<TcpStream> = None;
    let mut last_start = tokio::time::Instant::now();
    start_attempt(0, addrs[0], &mut handles);

    let canceled = loop {
        if winner.is_some() || finished == addrs.len() {
            break false;
        }
        tokio::select! {
            recv = rx.recv() => {
                // tx clones are held by attempts; channel cannot close while
                // any attempt is outstanding.
                let (idx, res) = recv.expect("attempt result channel closed");
                finished += 1;
                match res {
                    Ok(tcp) => {
                        debug!("happy eyeballs: attempt {} won", idx);
                        winner = Some(tcp);
                    }
                    Err(err) => {
                        trace!("happy eyeballs: attempt {} failed: {}", idx, err);
                        last_err = Some(err);
                        if started < addrs.len() {
                            last_start = tokio::time::Instant::now();
                            start_attempt(started, addrs[started], &mut handles);
                            started += 1;
                        }
                    }
                }
            }
            _ = tokio::time::sleep_until(last_start + options.stagger),
                if started < addrs.len() =>
            {
                last_start = tokio::time::Instant::now();
                start_attempt(started, addrs[started], &mut handles);
                started += 1;
            }
            _ = cancel.canceled() => break true,
        }
    };

    // Wake every attempt still in flight and wait for them; only then may
    // the race signal be dropped.
    race.fire();
    for handle in handles {
        let _ = handle.await;
    }
    drop(tx);
    // Sockets from attempts that completed after the winner are closed here.
    while let Ok((_, res)) = rx.try_recv() {
        if winner.is_none() {
            if let Ok(tcp) = res {
                winner = Some(tcp);
            }
        }
    }

    if canceled && winner.is_none() {
        return Err(cancel.error());
    }
    match winner {
        Some(tcp) => Ok(tcp),
        None => Err(match last_err {
            Some(err) => Error::new_network(err),
            None => Error::new_network("all connect attempts failed"),
        }),
    }
}

/// Resolves and connects, returning a configured TCP socket.
pub(crate) struct Connector {
    resolver: Box<dyn Resolve>,
    pub(crate) happy_eyeballs: HappyEyeballsOptions,
    pub(crate) dns_timeout: Duration,
}

impl Connector {
    pub(crate) fn new(happy_eyeballs: HappyEyeballsOptions, dns_timeout: Duration) -> Connector {
        Connector {
            resolver: Box::new(dns::GaiResolver::new()),
            happy_eyeballs,
            dns_timeout,
        }
    }

    pub(crate) async fn connect_tcp(
        &self,
        host: &str,
        port: u16,
        cancel: &CancelToken,
    ) -> Result<TcpStream> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let addrs =
            dns::resolve_with_timeout(self.resolver.as_ref(), host, port, self.dns_timeout)
                .await?;
        let tcp = race_connect(addrs, &self.happy_eyeballs, cancel).await?;
        if let Err(err) = tcp.set_nodelay(true) {
            trace!("set_nodelay failed: {}", err);
        }
        Ok(tcp)
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("dns_timeout", &self.dns_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn he_options(stagger_ms: u64) -> HappyEyeballsOptions {
        HappyEyeballsOptions {
            stagger: Duration::from_millis(stagger_ms),
            family_preference: FamilyPreference::V6First,
        }
    }

    #[test]
    fn interleave_leads_with_preference() {
        let v6a: SocketAddr = "[2001:db8::1]:80".parse().unwrap();
        let v4a: SocketAddr = "192.0.2.1:80".parse().unwrap();
        let v4b: SocketAddr = "192.0.2.2:80".parse().unwrap();

        let out = interleave(vec![v4a, v6a, v4b], FamilyPreference::V6First);
        assert_eq!(out, vec![v6a, v4a, v4b]);

        let out = interleave(vec![v4a, v6a, v4b], FamilyPreference::V4First);
        assert_eq!(out, vec![v4a, v6a, v4b]);
    }

    #[tokio::test]
    async fn fallback_wins_when_preferred_hangs() {
        // A listener that never accepts still completes TCP connects, so the
        // "hanging" preferred address is an unroutable documentation address
        // while the fallback is a live local listener.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();

        let slow_v6: SocketAddr =
            SocketAddr::new(Ipv6Addr::new(0x2001, 2, 0, 0, 0, 0, 0, 0xfe).into(), 9);
        let addrs = vec![slow_v6, SocketAddr::new(Ipv4Addr::LOCALHOST.into(), local.port())];

        let cancel = CancelToken::new();
        let stream = race_connect(addrs, &he_options(100), &cancel)
            .await
            .unwrap();
        assert!(stream.peer_addr().unwrap().is_ipv4());
    }

    #[tokio::test]
    async fn all_failures_surface_last_error() {
        // Port 1 on localhost refuses quickly.
        let addrs: Vec<SocketAddr> = vec!["127.0.0.1:1".parse().unwrap()];
        let cancel = CancelToken::new();
        let err = race_connect(addrs, &he_options(10), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_network());
    }

    #[tokio::test]
    async fn cancellation_stops_the_race() {
        let slow_v6: SocketAddr =
            SocketAddr::new(Ipv6Addr::new(0x2001, 2, 0, 0, 0, 0, 0, 0xfe).into(), 9);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = race_connect(vec![slow_v6], &he_options(10), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_canceled());
    }
}
