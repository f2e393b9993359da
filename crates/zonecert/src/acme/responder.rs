//! Challenge responder listeners
//!
//! Each responder binds its socket before returning, so bind failures are
//! reported to the caller synchronously. The accept loop then runs as its
//! own task; its outcome is observable through [`ResponderHandle`].

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::ServerConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use zonecert_common::ChallengeType;

use super::challenge::ChallengeManager;
use super::error::AcmeError;

/// Upper bound for reading a request or completing a handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Read buffer limit for the HTTP responder; hyper's minimum is 8 KiB
const MAX_BUF_SIZE: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

/// A running challenge responder
#[derive(Debug)]
pub struct ResponderHandle {
    challenge: ChallengeType,
    local_addr: SocketAddr,
    task: JoinHandle<Result<(), AcmeError>>,
}

impl ResponderHandle {
    pub fn challenge(&self) -> ChallengeType {
        self.challenge
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the accept loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the accept loop to exit and return its outcome
    pub async fn join(self) -> Result<(), AcmeError> {
        let challenge = self.challenge;
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(AcmeError::ResponderFailed {
                challenge,
                message: e.to_string(),
            }),
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

async fn bind(challenge: ChallengeType, addr: SocketAddr) -> Result<TcpListener, AcmeError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| AcmeError::ResponderBind {
            challenge,
            address: addr.to_string(),
            message: e.to_string(),
        })
}

/// Accept errors that affect one connection rather than the listener
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Run an accept loop until shutdown, handing each connection to `serve`.
///
/// Clears the listening flag on every exit path.
async fn accept_loop<F, Fut>(
    challenge: ChallengeType,
    listener: TcpListener,
    manager: ChallengeManager,
    shutdown: CancellationToken,
    serve: F,
) -> Result<(), AcmeError>
where
    F: Fn(TcpStream, ChallengeManager) -> Fut,
    Fut: std::future::Future<Output = io::Result<()>> + Send + 'static,
{
    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(challenge = %challenge, "Challenge responder shutting down");
                break Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    trace!(challenge = %challenge, peer = %peer, "Accepted challenge connection");
                    let conn = serve(stream, manager.clone());
                    tokio::spawn(async move {
                        match tokio::time::timeout(CONNECTION_TIMEOUT, conn).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => debug!(challenge = %challenge, peer = %peer, error = %e, "Challenge connection failed"),
                            Err(_) => debug!(challenge = %challenge, peer = %peer, "Challenge connection timed out"),
                        }
                    });
                }
                Err(e) if is_transient(&e) => {
                    warn!(challenge = %challenge, error = %e, "Transient accept error");
                }
                Err(e) => {
                    error!(challenge = %challenge, error = %e, "Challenge responder accept loop failed");
                    break Err(AcmeError::ResponderFailed {
                        challenge,
                        message: e.to_string(),
                    });
                }
            }
        }
    };

    manager.set_listening(challenge, false);
    result
}

// ============================================================================
// HTTP-01
// ============================================================================

/// Bind the HTTP-01 responder and start serving
pub async fn start_http_responder(
    addr: SocketAddr,
    manager: ChallengeManager,
    shutdown: CancellationToken,
) -> Result<ResponderHandle, AcmeError> {
    let challenge = ChallengeType::Http01;
    let listener = bind(challenge, addr).await?;
    let local_addr = listener.local_addr().map_err(|e| AcmeError::ResponderBind {
        challenge,
        address: addr.to_string(),
        message: e.to_string(),
    })?;

    manager.set_listening(challenge, true);
    info!(challenge = %challenge, address = %local_addr, "Challenge responder listening");

    let task = tokio::spawn(accept_loop(
        challenge,
        listener,
        manager,
        shutdown,
        |stream, manager| async move { serve_http(stream, manager).await },
    ));

    Ok(ResponderHandle {
        challenge,
        local_addr,
        task,
    })
}

/// Answer one HTTP/1.x request and close the connection
async fn serve_http(stream: TcpStream, manager: ChallengeManager) -> io::Result<()> {
    let service = service_fn(move |req: Request<Incoming>| {
        let response = respond(&req, &manager);
        async move { Ok::<_, Infallible>(response) }
    });

    http1::Builder::new()
        .keep_alive(false)
        .max_buf_size(MAX_BUF_SIZE)
        .max_headers(MAX_HEADERS)
        .serve_connection(TokioIo::new(stream), service)
        .await
        .map_err(io::Error::other)
}

fn respond<B>(req: &Request<B>, manager: &ChallengeManager) -> Response<Full<Bytes>> {
    let (status, body) = route(req.method(), req.uri().path(), manager);

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Map a request method and path to a status and body
fn route(method: &Method, path: &str, manager: &ChallengeManager) -> (StatusCode, String) {
    if method != Method::GET && method != Method::HEAD {
        return (StatusCode::METHOD_NOT_ALLOWED, String::new());
    }

    let response = ChallengeManager::extract_token(path)
        .filter(|token| !token.is_empty() && !token.contains('/'))
        .and_then(|token| manager.get_response(token));

    match response {
        Some(key_authorization) => {
            debug!(path = %path, "Served ACME HTTP-01 challenge");
            (StatusCode::OK, key_authorization)
        }
        None => {
            trace!(path = %path, "Unknown ACME challenge path");
            (StatusCode::NOT_FOUND, String::new())
        }
    }
}

// ============================================================================
// TLS-ALPN-01
// ============================================================================

/// Bind the TLS-ALPN-01 responder and start serving.
///
/// `config` should come from `TlsParams::build_challenge` with a
/// resolver from [`ChallengeManager::resolver`].
pub async fn start_tls_alpn_responder(
    addr: SocketAddr,
    manager: ChallengeManager,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) -> Result<ResponderHandle, AcmeError> {
    let challenge = ChallengeType::TlsAlpn01;
    let listener = bind(challenge, addr).await?;
    let local_addr = listener.local_addr().map_err(|e| AcmeError::ResponderBind {
        challenge,
        address: addr.to_string(),
        message: e.to_string(),
    })?;

    manager.set_listening(challenge, true);
    info!(challenge = %challenge, address = %local_addr, "Challenge responder listening");

    let acceptor = TlsAcceptor::from(config);
    let task = tokio::spawn(accept_loop(
        challenge,
        listener,
        manager,
        shutdown,
        move |stream, _manager| {
            let acceptor = acceptor.clone();
            async move { serve_tls_alpn(stream, acceptor).await }
        },
    ));

    Ok(ResponderHandle {
        challenge,
        local_addr,
        task,
    })
}

/// Complete the handshake, which is the whole validation, then close
async fn serve_tls_alpn(stream: TcpStream, acceptor: TlsAcceptor) -> io::Result<()> {
    let mut tls = acceptor.accept(stream).await?;

    let (_, connection) = tls.get_ref();
    trace!(
        server_name = ?connection.server_name(),
        alpn = ?connection.alpn_protocol().map(String::from_utf8_lossy),
        "TLS-ALPN-01 handshake completed"
    );

    tls.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn get(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[test]
    fn test_route() {
        let manager = ChallengeManager::new();
        manager.add_challenge("tok", "tok.thumb");
        let path = "/.well-known/acme-challenge/tok";

        let (status, body) = route(&Method::GET, path, &manager);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "tok.thumb");

        let (status, _) = route(&Method::HEAD, path, &manager);
        assert_eq!(status, StatusCode::OK);

        let (status, _) = route(&Method::GET, "/.well-known/acme-challenge/other", &manager);
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = route(&Method::GET, "/index.html", &manager);
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = route(&Method::POST, path, &manager);
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn test_respond_uses_request_path() {
        let manager = ChallengeManager::new();
        manager.add_challenge("tok", "tok.thumb");

        for target in [
            "/.well-known/acme-challenge/tok",
            "/.well-known/acme-challenge/tok?x=1",
            "http://example.test/.well-known/acme-challenge/tok",
        ] {
            let req = Request::get(target).body(()).unwrap();
            let response = respond(&req, &manager);
            assert_eq!(response.status(), StatusCode::OK, "{target}");
            assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
        }
    }

    #[tokio::test]
    async fn test_http_responder_serves_tokens() {
        let manager = ChallengeManager::new();
        manager.add_challenge("abc", "abc.key");
        let shutdown = CancellationToken::new();

        let handle = start_http_responder(
            "127.0.0.1:0".parse().unwrap(),
            manager.clone(),
            shutdown.clone(),
        )
        .await
        .unwrap();
        assert!(manager.is_listening(ChallengeType::Http01));

        let response = get(
            handle.local_addr(),
            "GET /.well-known/acme-challenge/abc HTTP/1.1\r\nHost: example.test\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.ends_with("abc.key"));

        let response = get(handle.local_addr(), "GET / HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 404"), "{response}");

        shutdown.cancel();
        handle.join().await.unwrap();
        assert!(!manager.is_listening(ChallengeType::Http01));
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = occupied.local_addr().unwrap();
        let manager = ChallengeManager::new();

        let err = start_http_responder(addr, manager.clone(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AcmeError::ResponderBind {
                challenge: ChallengeType::Http01,
                ..
            }
        ));
        assert!(!manager.is_listening(ChallengeType::Http01));
    }
}
