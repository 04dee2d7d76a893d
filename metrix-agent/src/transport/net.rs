use std::{
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use http::Uri;
use itertools::Itertools;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpStream, lookup_host},
    task::JoinSet,
};
use tokio_native_tls::{TlsConnector as TokioTlsConnector, TlsStream, native_tls::TlsConnector};
use tracing::{debug, trace};

const HAPPY_EYEBALLS_DELAY: Duration = Duration::from_millis(150);

pub enum MaybeTlsStream<S> {
    Plain(S),
    Tls(TlsStream<S>),
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for MaybeTlsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MaybeTlsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// An open stream plus the local address the collector will see us as.
pub struct Connection {
    pub stream: MaybeTlsStream<TcpStream>,
    pub local_addr: SocketAddr,
}

pub async fn connect(uri: &Uri, tls: bool, prefer_ipv6: bool) -> anyhow::Result<Connection> {
    let domain = uri
        .host()
        .ok_or_else(|| anyhow::anyhow!("URL error: no host name"))?;
    // IPv6 literals come bracketed
    let domain = domain.trim_start_matches('[').trim_end_matches(']');
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    trace!("connecting to ({domain}, {port})");
    let stream = connect_happy_eyeballs((domain, port), prefer_ipv6).await?;
    let local_addr = stream.local_addr()?;

    let stream = if tls {
        let connector = TokioTlsConnector::from(TlsConnector::new()?);
        MaybeTlsStream::Tls(connector.connect(domain, stream).await?)
    } else {
        MaybeTlsStream::Plain(stream)
    };

    Ok(Connection { stream, local_addr })
}

/// Races the resolved addresses, alternating families and starting a new
/// attempt every [`HAPPY_EYEBALLS_DELAY`] until one connects.
async fn connect_happy_eyeballs(
    addr: (&str, u16),
    prefer_ipv6: bool,
) -> anyhow::Result<TcpStream> {
    let addrs = {
        let (v4, v6): (Vec<_>, Vec<_>) = lookup_host(addr).await?.partition(|a| a.is_ipv4());

        let (first, second) = if prefer_ipv6 { (v6, v4) } else { (v4, v6) };
        first.into_iter().interleave(second).collect::<Vec<_>>()
    };

    let mut attempts = JoinSet::new();
    let settle = |res: Result<std::io::Result<TcpStream>, _>| match res {
        Ok(Ok(stream)) => {
            debug!(
                peer = %stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or("<unknown>".to_string()),
                "connection established"
            );
            Some(stream)
        }
        Ok(Err(e)) => {
            trace!("connection attempt failed: {e}");
            None
        }
        Err(e) => {
            trace!("connection attempt panicked: {e}");
            None
        }
    };

    for addr in addrs {
        attempts.spawn(TcpStream::connect(addr));
        loop {
            tokio::select! {
                biased;

                res = attempts.join_next() => match res {
                    Some(res) => {
                        if let Some(stream) = settle(res) {
                            return Ok(stream);
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep(HAPPY_EYEBALLS_DELAY) => break,
            }
        }
    }

    while let Some(res) = attempts.join_next().await {
        if let Some(stream) = settle(res) {
            return Ok(stream);
        }
    }

    Err(anyhow::anyhow!("I/O error: all connection attempts failed"))
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn connect_reports_local_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().1 });

        let uri: Uri = format!("http://127.0.0.1:{port}/").parse().unwrap();
        let conn = connect(&uri, false, false).await.unwrap();

        assert_eq!(accept.await.unwrap(), conn.local_addr);
        assert!(matches!(conn.stream, MaybeTlsStream::Plain(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        // bind then drop to find a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let uri: Uri = format!("http://127.0.0.1:{port}/").parse().unwrap();

        assert!(connect(&uri, false, false).await.is_err());
    }
}
