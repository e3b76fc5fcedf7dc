//! HTTP server runner with graceful shutdown.
//!
//! The server stops accepting connections on SIGINT, SIGTERM, SIGHUP or
//! SIGQUIT (Ctrl+C only on other platforms), drains in-flight requests and
//! then runs the caller's shutdown hook, e.g. to close the database pool.

use std::{future::Future, net::SocketAddr};

use anyhow::Context;
use axum::Router;
use tokio::{net::TcpListener, signal};

/// Bind `addr` and serve `router` until a termination signal arrives.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve<F, Fut>(router: Router, addr: SocketAddr, on_shutdown: F) -> anyhow::Result<()>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    serve_until(listener, router, shutdown_signal(), on_shutdown).await
}

/// Serve `router` on `listener` until `signal` resolves.
///
/// Client addresses are available to handlers and middleware as
/// `ConnectInfo<SocketAddr>`.
pub async fn serve_until<S, F, Fut>(
    listener: TcpListener,
    router: Router,
    signal: S,
    on_shutdown: F,
) -> anyhow::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    let addr = listener.local_addr().context("listener has no local address")?;
    tracing::info!(%addr, "server listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal)
    .await
    .context("server error")?;

    tracing::info!("server stopped, running shutdown hook");
    on_shutdown().await;
    tracing::info!("shutdown complete");

    Ok(())
}

/// Resolve on the first termination signal.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => tracing::info!("received Ctrl+C, initiating graceful shutdown"),
            Err(error) => {
                tracing::warn!(%error, "failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    {
        use signal::unix::SignalKind;

        tokio::select! {
            () = ctrl_c => {}
            () = wait_for(SignalKind::terminate(), "SIGTERM") => {}
            () = wait_for(SignalKind::hangup(), "SIGHUP") => {}
            () = wait_for(SignalKind::quit(), "SIGQUIT") => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}

#[cfg(unix)]
async fn wait_for(kind: signal::unix::SignalKind, name: &'static str) {
    match signal::unix::signal(kind) {
        Ok(mut stream) => {
            stream.recv().await;
            tracing::info!(signal = name, "received signal, initiating graceful shutdown");
        }
        Err(error) => {
            tracing::warn!(%error, signal = name, "failed to install signal handler");
            std::future::pending::<()>().await;
        }
    }
}
