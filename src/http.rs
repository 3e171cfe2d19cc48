//! HTTP front door
//! Answers ACME challenge requests from the store and sends everything else to HTTPS

use crate::acme::ChallengeRecord;
use crate::store::{self, StoreRead};
use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Well-known path prefix the CA fetches during HTTP-01 validation
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Port 80 listener
pub struct HttpServer {
    store: Arc<dyn StoreRead>,
    challenge_root: String,
}

impl HttpServer {
    pub fn new(store: Arc<dyn StoreRead>, challenge_root: &str) -> Self {
        Self {
            store,
            challenge_root: challenge_root.to_string(),
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
            .with_context(|| format!("bind HTTP listener on {}", addr))?;
        info!("HTTP server listening on {}", addr);

        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.changed() => {
                    info!("HTTP server stopping");
                    return Ok(());
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single HTTP connection
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> Result<()> {
        let io = TokioIo::new(stream);
        let server = self.clone();

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req, remote_addr).await }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle incoming request
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
        match self.process_request(req, remote_addr).await {
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
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
        let path = req.uri().path().to_string();
        debug!("{} {} from {}", req.method(), path, remote_addr);

        if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
            return self.answer_challenge(token).await;
        }

        // everything else moves to HTTPS, host preserved verbatim
        let host = match req.headers().get(HOST).and_then(|h| h.to_str().ok()) {
            Some(h) => h.to_string(),
            None => {
                return Ok(error_response(
                    StatusCode::BAD_REQUEST,
                    "Missing Host header",
                ))
            }
        };

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let location = format!("https://{}{}", host, path_and_query);
        Ok(redirect_response(&location))
    }

    /// Serve the key authorization the CA expects for a challenge token
    async fn answer_challenge(
        &self,
        token: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
        let key = store::join_key(&self.challenge_root, token);
        let value = self
            .store
            .read(&key)
            .await
            .context("read challenge record")?;

        let Some(value) = value else {
            bail!("no challenge record for token {}", token);
        };

        let record: ChallengeRecord =
            serde_json::from_str(&value).context("parse challenge record")?;

        debug!("Answering challenge for {}", record.domain);
        Ok(text_response(StatusCode::OK, &record.response))
    }
}

/// Create text response
pub(crate) fn text_response(status: StatusCode, body: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(full_body(Bytes::from(body.to_string())))
        .unwrap()
}

/// Create error response
pub(crate) fn error_response(
    status: StatusCode,
    message: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(full_body(Bytes::from(message.to_string())))
        .unwrap()
}

/// Create redirect response
pub(crate) fn redirect_response(location: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header("Location", location)
        .body(empty_body())
        .unwrap()
}

/// Create full body
pub(crate) fn full_body(bytes: Bytes) -> BoxBody<Bytes, hyper::Error> {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Create empty body
pub(crate) fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct MemStore {
        entries: HashMap<String, String>,
    }

    #[async_trait]
    impl StoreRead for MemStore {
        async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
            Ok(self.entries.get(key).cloned())
        }

        async fn read_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
            Ok(self
                .entries
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }
    }

    fn server_with(entries: HashMap<String, String>) -> HttpServer {
        HttpServer::new(Arc::new(MemStore { entries }), "/challenges")
    }

    #[tokio::test]
    async fn test_answer_challenge_serves_response_body() {
        let record = ChallengeRecord {
            domain: "app.example.com".to_string(),
            order: "https://ca.example/order/1".to_string(),
            challenge: "https://ca.example/chall/2".to_string(),
            response: "abc123.keyauth".to_string(),
        };
        let entries = HashMap::from([(
            "/challenges/abc123".to_string(),
            serde_json::to_string(&record).unwrap(),
        )]);

        let response = server_with(entries).answer_challenge("abc123").await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from("abc123.keyauth"));
    }

    #[tokio::test]
    async fn test_answer_challenge_unknown_token_is_an_error() {
        let result = server_with(HashMap::new()).answer_challenge("missing").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_answer_challenge_malformed_record_is_an_error() {
        let entries = HashMap::from([(
            "/challenges/abc123".to_string(),
            "not json".to_string(),
        )]);
        let result = server_with(entries).answer_challenge("abc123").await;
        assert!(result.is_err());
    }

    #[test]
    fn test_redirect_response_sets_location() {
        let response = redirect_response("https://app.example.com/path?q=1");
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get("Location").unwrap(),
            "https://app.example.com/path?q=1"
        );
    }
}
