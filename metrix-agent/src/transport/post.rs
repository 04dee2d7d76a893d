use std::net::IpAddr;

use bytes::{BufMut, Bytes, BytesMut};
use http::{Method, Request, Response, StatusCode, Uri, header, response};
use metrix_proto::{
    Snapshot,
    msg::{HASH_HEADER, MIME_APPLICATION_POSTCARD, REAL_IP_HEADER, RpcCode, UPDATES_PATH},
    seal::{Sealed, Sealer},
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use super::{Transport, TransportError, net};
use crate::config::AgentConfig;

/// Sends each snapshot as one `POST /updates` on a fresh connection.
pub struct HttpTransport {
    uri: Uri,
    host: String,
    tls: bool,
    prefer_ipv6: bool,
    sealer: Sealer,
}

impl HttpTransport {
    pub fn new(config: &AgentConfig, sealer: Sealer) -> anyhow::Result<Self> {
        let uri = format!(
            "{}://{}{UPDATES_PATH}",
            if config.tls { "https" } else { "http" },
            config.server_addr
        )
        .parse::<Uri>()?;
        let host = uri
            .authority()
            .ok_or_else(|| anyhow::anyhow!("URL error: no host name"))?
            .as_str()
            .to_owned();
        if host.is_empty() {
            anyhow::bail!("URL error: empty host name");
        }

        Ok(HttpTransport {
            uri,
            host,
            tls: config.tls,
            prefer_ipv6: config.prefer_ipv6,
            sealer,
        })
    }

    fn request(&self, sealed: Sealed, local_ip: IpAddr) -> anyhow::Result<Request<Vec<u8>>> {
        let mut req = Request::builder()
            .method(Method::POST)
            .uri(&self.uri)
            .header(header::HOST, &self.host)
            .header(header::CONNECTION, "close")
            .header(header::ACCEPT_ENCODING, "identity")
            .header(header::CONTENT_TYPE, MIME_APPLICATION_POSTCARD)
            .header(header::CONTENT_LENGTH, sealed.body.len())
            .header(REAL_IP_HEADER, local_ip.to_string());
        if let Some(tag) = sealed.tag {
            req = req.header(HASH_HEADER, tag);
        }
        Ok(req.body(sealed.body)?)
    }
}

impl Transport for HttpTransport {
    async fn send_metrics(&self, snapshot: &Snapshot) -> Result<(), TransportError> {
        let sealed = self.sealer.seal(&snapshot.to_bytes()?)?;

        let net::Connection {
            mut stream,
            local_addr,
        } = net::connect(&self.uri, self.tls, self.prefer_ipv6).await?;
        let req = self.request(sealed, local_addr.ip())?;

        let resp: anyhow::Result<Response<Bytes>> = async {
            stream.write_all(&assemble_http_request(&req)).await?;
            stream.flush().await?;

            let mut buffer = BytesMut::with_capacity(128);
            while stream.read_buf(&mut buffer).await? != 0 {}
            let buffer = buffer.freeze();
            trace!("response: {:?}", String::from_utf8_lossy(&buffer));
            parse_http_response(buffer)
        }
        .await;

        outcome(resp?)
    }
}

/// Maps the collector's status onto the same rejection codes the RPC
/// transport reports.
fn outcome(resp: Response<Bytes>) -> Result<(), TransportError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }

    let code = match status {
        StatusCode::FORBIDDEN => RpcCode::PermissionDenied,
        s if s.is_client_error() => RpcCode::InvalidArgument,
        _ => RpcCode::Internal,
    };
    let message = String::from_utf8_lossy(resp.body()).trim().to_owned();
    Err(TransportError::Rejected {
        code,
        message: if message.is_empty() {
            status.to_string()
        } else {
            message
        },
    })
}

fn assemble_http_request<T: AsRef<[u8]>>(req: &Request<T>) -> Bytes {
    let mut buffer = BytesMut::with_capacity(256);

    buffer.put_slice(
        format!(
            "{} {} {:?}\r\n",
            req.method(),
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/"),
            req.version()
        )
        .as_bytes(),
    );

    for (name, value) in req.headers() {
        buffer.put_slice(name.as_str().as_bytes());
        buffer.put_slice(b": ");
        buffer.put(value.as_bytes());
        buffer.put_slice(b"\r\n");
    }

    buffer.put_slice(b"\r\n");
    buffer.put_slice(req.body().as_ref());

    buffer.freeze()
}

fn parse_http_response(bytes: Bytes) -> anyhow::Result<Response<Bytes>> {
    const MAX_HEADERS: usize = 64;
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    let status = resp.parse(&bytes)?;
    let httparse::Status::Complete(body_start) = status else {
        anyhow::bail!("HTTP error: response is incomplete");
    };

    let mut builder = response::Builder::new()
        .status(resp.code.unwrap_or(200))
        .version(match resp.version.unwrap_or(1) {
            0 => http::Version::HTTP_10,
            _ => http::Version::HTTP_11,
        });
    for header in resp.headers.iter() {
        builder = builder.header(header.name, header.value);
    }

    Ok(builder.body(bytes.slice(body_start..))?)
}

#[cfg(test)]
mod tests {
    use metrix_proto::{Metric, integrity::IntegrityKey};
    use tokio::net::TcpListener;

    use super::*;

    fn snapshot() -> Snapshot {
        Snapshot::new(3, vec![Metric::gauge("CPUutilization0", 12.5)])
    }

    struct Captured {
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    impl Captured {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }
    }

    /// Accepts one request, answers with `reply` and hands back what it read.
    async fn fake_collector(reply: &'static str) -> (String, tokio::task::JoinHandle<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = Vec::new();
            let captured = loop {
                let mut chunk = [0u8; 1024];
                let n = socket.read(&mut chunk).await.unwrap();
                assert_ne!(n, 0, "client hung up before finishing its request");
                buffer.extend_from_slice(&chunk[..n]);

                let mut headers = [httparse::EMPTY_HEADER; 32];
                let mut req = httparse::Request::new(&mut headers);
                let httparse::Status::Complete(body_start) = req.parse(&buffer).unwrap() else {
                    continue;
                };
                let headers: Vec<_> = req
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_owned(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect();
                let len: usize = headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                    .map(|(_, v)| v.parse().unwrap())
                    .unwrap();
                if buffer.len() >= body_start + len {
                    break Captured {
                        headers,
                        body: buffer[body_start..body_start + len].to_vec(),
                    };
                }
            };
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            captured
        });

        (addr, handle)
    }

    fn transport(server_addr: String, sealer: Sealer) -> HttpTransport {
        let config = AgentConfig {
            server_addr,
            ..Default::default()
        };
        HttpTransport::new(&config, sealer).unwrap()
    }

    #[tokio::test]
    async fn posts_signed_snapshot() {
        let (addr, collector) =
            fake_collector("HTTP/1.1 200 OK\r\nContent-Length: 12\r\n\r\n{\"stored\":2}")
                .await;
        let key = IntegrityKey::from_secret("s3cret").unwrap();
        let transport = transport(addr, Sealer::new(None, Some(key.clone())));

        transport.send_metrics(&snapshot()).await.unwrap();
        let captured = collector.await.unwrap();

        assert_eq!(
            captured.header("content-type"),
            Some(MIME_APPLICATION_POSTCARD)
        );
        assert_eq!(captured.header(REAL_IP_HEADER), Some("127.0.0.1"));
        let tag = captured.header(HASH_HEADER).unwrap();
        assert!(key.verify(&captured.body, tag));
        assert_eq!(Snapshot::from_bytes(&captured.body).unwrap(), snapshot());
    }

    #[tokio::test]
    async fn unsigned_snapshot_has_no_tag() {
        let (addr, collector) = fake_collector("HTTP/1.1 200 OK\r\n\r\n").await;
        let transport = transport(addr, Sealer::default());

        transport.send_metrics(&snapshot()).await.unwrap();

        assert_eq!(collector.await.unwrap().header(HASH_HEADER), None);
    }

    #[tokio::test]
    async fn status_maps_to_rejection_code() {
        let cases = [
            ("HTTP/1.1 403 Forbidden\r\n\r\nuntrusted origin", RpcCode::PermissionDenied),
            ("HTTP/1.1 400 Bad Request\r\n\r\nintegrity tag mismatch", RpcCode::InvalidArgument),
            ("HTTP/1.1 503 Service Unavailable\r\n\r\n", RpcCode::Internal),
        ];

        for (reply, expected) in cases {
            let (addr, _collector) = fake_collector(reply).await;
            let err = transport(addr, Sealer::default())
                .send_metrics(&snapshot())
                .await
                .unwrap_err();

            assert!(
                matches!(err, TransportError::Rejected { code, .. } if code == expected),
                "{reply:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn rejection_message_falls_back_to_status() {
        let resp = Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Bytes::new())
            .unwrap();

        let TransportError::Rejected { code, message } = outcome(resp).unwrap_err() else {
            panic!("expected a rejection");
        };
        assert_eq!(code, RpcCode::Internal);
        assert_eq!(message, "500 Internal Server Error");
    }

    #[test]
    fn truncated_response_is_an_error() {
        assert!(parse_http_response(Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent")).is_err());
        assert!(parse_http_response(Bytes::new()).is_err());
    }

    #[test]
    fn request_line_and_headers() {
        let transport = transport("collector:8080".to_owned(), Sealer::default());
        let req = transport
            .request(
                Sealed {
                    body: b"abc".to_vec(),
                    tag: Some("00ff".to_owned()),
                },
                "10.0.0.5".parse().unwrap(),
            )
            .unwrap();
        let raw = assemble_http_request(&req);
        let raw = String::from_utf8_lossy(&raw);

        assert!(raw.starts_with("POST /updates HTTP/1.1\r\n"));
        assert!(raw.contains("host: collector:8080\r\n"));
        assert!(raw.contains("content-length: 3\r\n"));
        assert!(raw.contains("hashsha256: 00ff\r\n"));
        assert!(raw.contains("x-real-ip: 10.0.0.5\r\n"));
        assert!(raw.ends_with("\r\n\r\nabc"));
    }
}
