//! Listener setup and connection handling.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use bytes::Bytes;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::http::handler::create_router;
use crate::http::identity::PeerCertificate;
use crate::http::tls::build_acceptor;
use crate::AppState;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// HTTP gateway
// ---------------------------------------------------------------------------

/// Bind `0.0.0.0:{port}` and serve the gateway until `cancel` fires.
pub async fn run_http_server(state: Arc<AppState>, cancel: CancellationToken) -> Result<()> {
    let listen_addr = SocketAddr::from(([0, 0, 0, 0], state.config.server.port));
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;
    serve(listener, state, cancel).await
}

/// Serve on an already bound listener: HTTPS when `server.tls` is set,
/// plain HTTP otherwise.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    cancel: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr().context("listener has no local address")?;
    let base = state.config.server.base_path();
    let tls = state.config.server.tls.clone();
    let app = create_router(state);

    match tls {
        Some(tls) => {
            let acceptor = build_acceptor(&tls)?;
            info!(%local_addr, base = %base, "HTTPS server listening");
            serve_tls(listener, acceptor, app, cancel).await;
        }
        None => {
            info!(%local_addr, base = %base, "HTTP server listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
                .context("HTTP server error")?;
        }
    }

    info!("HTTP server stopped");
    Ok(())
}

async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    cancel: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            },
        };

        tokio::spawn(serve_tls_connection(
            stream,
            peer,
            acceptor.clone(),
            app.clone(),
            cancel.clone(),
        ));
    }
}

async fn serve_tls_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    app: Router,
    cancel: CancellationToken,
) {
    let tls = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            debug!(%peer, error = %e, "TLS handshake failed");
            return;
        }
        Err(_) => {
            debug!(%peer, "TLS handshake timed out");
            return;
        }
    };

    let peer_cert = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|chain| chain.first())
        .map(|cert| PeerCertificate(Bytes::copy_from_slice(cert.as_ref())));
    debug!(%peer, client_cert = peer_cert.is_some(), "TLS connection established");

    let service = hyper::service::service_fn(move |mut request: hyper::Request<Incoming>| {
        if let Some(cert) = &peer_cert {
            request.extensions_mut().insert(cert.clone());
        }
        app.clone().oneshot(request)
    });

    let builder = ConnBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(tls), service);
    let mut conn = std::pin::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        () = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };
    if let Err(e) = result {
        debug!(%peer, error = %e, "connection closed with error");
    }
}

// ---------------------------------------------------------------------------
// Proxy mode
// ---------------------------------------------------------------------------

/// Connection-level proxy mode (`server.http_server: false`).
pub async fn run_proxy_server(_state: Arc<AppState>, _cancel: CancellationToken) -> Result<()> {
    anyhow::bail!("connection proxy mode is not implemented; set server.http_server to true")
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

/// Resolve on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}
