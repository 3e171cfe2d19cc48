//! HTTPS front door
//! Picks a certificate per server name and reverse-proxies authenticated requests

use crate::auth::{AuthDecision, AuthGate};
use crate::certificate::CertificateCache;
use crate::http::{empty_body, error_response, full_body};
use crate::vhost::{VhostRegistry, VirtualHost};
use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONNECTION, HOST, UPGRADE, WWW_AUTHENTICATE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};
use url::Url;

/// Clients that stall the handshake are cut off
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Port 443 listener
pub struct HttpsServer {
    certs: Arc<CertificateCache>,
    vhosts: Arc<VhostRegistry>,
    auth: Arc<AuthGate>,
    upstream_tls: Arc<ClientConfig>,
}

impl HttpsServer {
    pub fn new(
        certs: Arc<CertificateCache>,
        vhosts: Arc<VhostRegistry>,
        auth: Arc<AuthGate>,
    ) -> Self {
        Self {
            certs,
            vhosts,
            auth,
            upstream_tls: danger::client_config(),
        }
    }

    /// Accept connections until shutdown
    pub async fn run(
        self: Arc<Self>,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind HTTPS listener on {}", addr))?;
        info!("HTTPS server listening on {}", addr);

        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.changed() => {
                    info!("HTTPS server stopping");
                    return Ok(());
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("HTTPS connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Inspect the client hello, pick the certificate for the requested name,
    /// and serve the connection; no name or no certificate drops the handshake
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> Result<()> {
        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
        let start = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor)
            .await
            .map_err(|_| anyhow!("TLS client hello from {} timed out", remote_addr))?
            .context("read TLS client hello")?;

        let server_name = match start.client_hello().server_name() {
            Some(name) => name.to_string(),
            None => bail!("no server name in client hello from {}", remote_addr),
        };

        let Some(config) = self.certs.config_for(&server_name).await else {
            bail!("no certificate for {}", server_name);
        };

        let tls_stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, start.into_stream(config))
            .await
            .map_err(|_| anyhow!("TLS handshake with {} timed out", remote_addr))?
            .context("complete TLS handshake")?;

        let io = TokioIo::new(tls_stream);
        let server = self.clone();

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let server = server.clone();
                    let server_name = server_name.clone();
                    async move { server.handle_request(req, remote_addr, &server_name).await }
                }),
            )
            .with_upgrades()
            .await
            .map_err(|e| anyhow!("HTTPS service error: {}", e))
    }

    /// Handle incoming request
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        server_name: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
        match self.process_request(req, remote_addr, server_name).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!("Request error: {}", e);
                Ok(error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error",
                ))
            }
        }
    }

    /// Process request
    async fn process_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        server_name: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
        let path = req.uri().path().to_string();
        debug!("{} {} from {}", req.method(), path, remote_addr);

        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(|h| h.split(':').next().unwrap_or(h).to_string())
            .unwrap_or_else(|| server_name.to_string());

        let vhost = match self.vhosts.lookup(&host).await? {
            Some(vhost) => vhost,
            None => {
                debug!("No virtual host for {}", host);
                return Ok(error_response(StatusCode::NOT_FOUND, "Not Found"));
            }
        };

        if let Some(policy) = &vhost.auth {
            let authorization = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|h| h.to_str().ok());

            match self.auth.check(policy, authorization, remote_addr.ip()).await {
                AuthDecision::Allow => {}
                AuthDecision::Unauthorized => {
                    return Ok(unauthorized_response(self.auth.realm()));
                }
                AuthDecision::TooManyRequests => {
                    return Ok(error_response(
                        StatusCode::TOO_MANY_REQUESTS,
                        "Too Many Requests",
                    ));
                }
            }
        }

        if is_websocket_upgrade(&req) {
            return self.proxy_websocket(req, &vhost, remote_addr).await;
        }

        self.proxy_request(req, &vhost, remote_addr).await
    }

    /// Proxy the request to the virtual host's backend
    async fn proxy_request(
        &self,
        req: Request<Incoming>,
        vhost: &VirtualHost,
        remote_addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
        let original_host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();

        let target: Url = vhost
            .options
            .target
            .parse()
            .context("invalid backend target")?;
        let (addr, tls_host) = backend_addr(&target);

        debug!("Proxying to {}", addr);

        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to connect to backend {}: {}", addr, e);
                return Ok(error_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
            }
        };

        let (parts, body) = req.into_parts();

        let body_bytes = match body.collect().await {
            Ok(body) => body.to_bytes(),
            Err(e) => {
                error!("Failed to read request body: {}", e);
                return Ok(error_response(StatusCode::BAD_REQUEST, "Bad Request"));
            }
        };

        let uri: Uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse()
            .context("invalid request URI")?;

        let mut builder = Request::builder()
            .method(parts.method)
            .uri(uri)
            .version(Version::HTTP_11);

        for (key, value) in parts.headers.iter() {
            if key != HOST {
                builder = builder.header(key, value);
            }
        }

        builder = builder.header(HOST, &original_host);
        builder = builder.header("X-Forwarded-For", remote_addr.ip().to_string());
        builder = builder.header("X-Forwarded-Host", &original_host);
        builder = builder.header("X-Forwarded-Proto", "https");

        let proxy_req = builder
            .body(Full::new(body_bytes))
            .context("build proxy request")?;

        let sent = if target.scheme() == "https" {
            match self.connect_backend_tls(stream, &tls_host).await {
                Ok(tls) => send_request(tls, proxy_req).await,
                Err(e) => Err(e),
            }
        } else {
            send_request(stream, proxy_req).await
        };

        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to reach backend {}: {}", addr, e);
                return Ok(error_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
            }
        };

        let (parts, body) = response.into_parts();

        let body_bytes = match body.collect().await {
            Ok(body) => body.to_bytes(),
            Err(e) => {
                error!("Failed to read response body: {}", e);
                return Ok(error_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
            }
        };

        let mut builder = Response::builder().status(parts.status);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        Ok(builder.body(full_body(body_bytes)).context("build response")?)
    }

    /// Bridge a WebSocket upgrade to the backend and splice the two streams
    async fn proxy_websocket(
        &self,
        req: Request<Incoming>,
        vhost: &VirtualHost,
        remote_addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
        let original_host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();

        let target: Url = vhost
            .options
            .target
            .parse()
            .context("invalid backend target")?;
        let (addr, tls_host) = backend_addr(&target);

        debug!("WebSocket proxying to {}", addr);

        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to connect to backend {}: {}", addr, e);
                return Ok(error_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
            }
        };

        // hand-rolled upgrade request, forwarding the client's headers
        let uri_str = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let mut upgrade_req = format!("GET {} HTTP/1.1\r\nHost: {}\r\n", uri_str, original_host);

        for (key, value) in req.headers().iter() {
            if key != HOST {
                if let Ok(v) = value.to_str() {
                    upgrade_req.push_str(&format!("{}: {}\r\n", key.as_str(), v));
                }
            }
        }

        upgrade_req.push_str(&format!("X-Forwarded-For: {}\r\n", remote_addr.ip()));
        upgrade_req.push_str(&format!("X-Forwarded-Host: {}\r\n", original_host));
        upgrade_req.push_str("X-Forwarded-Proto: https\r\n");
        upgrade_req.push_str("\r\n");

        if target.scheme() == "https" {
            let tls = match self.connect_backend_tls(stream, &tls_host).await {
                Ok(tls) => tls,
                Err(e) => {
                    error!("Failed to reach backend {}: {}", addr, e);
                    return Ok(error_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
                }
            };
            run_websocket_tunnel(tls, req, &upgrade_req).await
        } else {
            run_websocket_tunnel(stream, req, &upgrade_req).await
        }
    }

    async fn connect_backend_tls(
        &self,
        stream: TcpStream,
        host: &str,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let connector = TlsConnector::from(self.upstream_tls.clone());
        let server_name =
            ServerName::try_from(host.to_string()).context("backend server name")?;
        connector
            .connect(server_name, stream)
            .await
            .context("TLS handshake with backend")
    }
}

/// Send one buffered request over an established backend connection
async fn send_request<S>(stream: S, req: Request<Full<Bytes>>) -> Result<Response<Incoming>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .context("establish connection to backend")?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Backend connection error: {}", e);
        }
    });

    sender
        .send_request(req)
        .await
        .context("send request to backend")
}

/// Complete the upgrade against the backend, answer the client with 101, and
/// splice bytes both ways until either side closes
async fn run_websocket_tunnel<S>(
    mut backend: S,
    req: Request<Incoming>,
    upgrade_req: &str,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    backend.write_all(upgrade_req.as_bytes()).await?;

    let mut response_buf = vec![0u8; 4096];
    let n = backend.read(&mut response_buf).await?;
    let Some(header_end) = header_end(&response_buf[..n]) else {
        warn!("Backend WebSocket response had no header terminator");
        return Ok(error_response(
            StatusCode::BAD_GATEWAY,
            "WebSocket upgrade failed",
        ));
    };

    let head = String::from_utf8_lossy(&response_buf[..header_end]).to_string();
    if !head.starts_with("HTTP/1.1 101") {
        warn!("WebSocket upgrade rejected by backend");
        return Ok(error_response(
            StatusCode::BAD_GATEWAY,
            "WebSocket upgrade failed",
        ));
    }

    // frames the backend sent together with its 101 must reach the client
    let leftover = response_buf[header_end..n].to_vec();
    let accept_key = websocket_accept_header(&head);

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade");
    if let Some(accept) = accept_key {
        builder = builder.header("Sec-WebSocket-Accept", accept);
    }
    let response = builder
        .body(empty_body())
        .context("build WebSocket response")?;

    let upgrade = hyper::upgrade::on(req);
    tokio::spawn(async move {
        let upgraded = match upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                debug!("WebSocket upgrade never completed: {}", e);
                return;
            }
        };

        let mut client = TokioIo::new(upgraded);
        if !leftover.is_empty() {
            if let Err(e) = client.write_all(&leftover).await {
                debug!("WebSocket client write error: {}", e);
                return;
            }
        }

        match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
            Ok((up, down)) => debug!("WebSocket closed ({} bytes up, {} bytes down)", up, down),
            Err(e) => debug!("WebSocket tunnel error: {}", e),
        }
    });

    Ok(response)
}

/// Check if request is WebSocket upgrade
fn is_websocket_upgrade<T>(req: &Request<T>) -> bool {
    if let Some(upgrade) = req.headers().get(UPGRADE) {
        if upgrade
            .to_str()
            .ok()
            .map(|s| s.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
        {
            return true;
        }
    }
    false
}

/// Resolve a parsed target into a dialable address and its TLS name
fn backend_addr(target: &Url) -> (String, String) {
    let host = target.host_str().unwrap_or("localhost").to_string();
    let port = target
        .port()
        .unwrap_or(if target.scheme() == "https" { 443 } else { 80 });
    (format!("{}:{}", host, port), host)
}

/// Locate the end of the response head, including the blank line
fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Pull the accept key out of a backend's upgrade response
fn websocket_accept_header(head: &str) -> Option<String> {
    head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("sec-websocket-accept") {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

fn unauthorized_response(realm: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(WWW_AUTHENTICATE, format!("Basic realm=\"{}\"", realm))
        .header("Content-Type", "text/plain")
        .body(full_body(Bytes::from("Unauthorized")))
        .unwrap()
}

mod danger {
    //! TLS client settings for reaching backends over private networks

    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct, Error, SignatureScheme};
    use std::sync::Arc;

    /// Backends present self-signed or internal certificates; the gateway
    /// terminates the client's TLS itself, so upstream chains are not checked.
    #[derive(Debug)]
    struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    pub(super) fn client_config() -> Arc<ClientConfig> {
        Arc::new(
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_websocket_upgrade() {
        let upgrade = Request::builder()
            .uri("/socket")
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(is_websocket_upgrade(&upgrade));

        let upper = Request::builder()
            .uri("/socket")
            .header(UPGRADE, "WebSocket")
            .body(())
            .unwrap();
        assert!(is_websocket_upgrade(&upper));

        let plain = Request::builder().uri("/").body(()).unwrap();
        assert!(!is_websocket_upgrade(&plain));
    }

    #[test]
    fn test_backend_addr_defaults_by_scheme() {
        let https: Url = "https://app-service".parse().unwrap();
        assert_eq!(backend_addr(&https), ("app-service:443".to_string(), "app-service".to_string()));

        let http: Url = "http://app-service:3000".parse().unwrap();
        assert_eq!(backend_addr(&http), ("app-service:3000".to_string(), "app-service".to_string()));
    }

    #[test]
    fn test_header_end() {
        assert_eq!(header_end(b"HTTP/1.1 101 x\r\n\r\nrest"), Some(18));
        assert_eq!(header_end(b"HTTP/1.1 101 x\r\n"), None);
    }

    #[test]
    fn test_websocket_accept_header() {
        let head = "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n";
        assert_eq!(
            websocket_accept_header(head),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=".to_string())
        );
        assert_eq!(websocket_accept_header("HTTP/1.1 200 OK\r\n"), None);
    }

    #[test]
    fn test_unauthorized_response_names_the_realm() {
        let response = unauthorized_response("gateway");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(WWW_AUTHENTICATE).unwrap(),
            "Basic realm=\"gateway\""
        );
    }
}
