//! Accept loop: binds the listening socket and spawns one `ProxySession`
//! per connection, gated by a semaphore so a burst of clients can't
//! unbound the worker count.

use std::sync::Arc;

use nagato_core::{ProxySession, StrategyTable};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument};

pub async fn bind_listener(listen_addr: &str) -> anyhow::Result<TcpListener> {
    info!(target: "nagato::listener", listen = %listen_addr, "binding listener");
    match TcpListener::bind(listen_addr).await {
        Ok(listener) => {
            info!(target: "nagato::listener", listen = %listen_addr, "bind successful");
            Ok(listener)
        }
        Err(e) => {
            error!(target: "nagato::listener", listen = %listen_addr, error = ?e, "failed to bind listener");
            Err(e.into())
        }
    }
}

#[instrument(skip(listener, strategies), fields(listen = %listen_addr))]
pub async fn accept_loop(
    listener: TcpListener,
    listen_addr: String,
    max_connections: usize,
    strategies: Arc<StrategyTable>,
) -> anyhow::Result<()> {
    let semaphore = Arc::new(Semaphore::new(max_connections));

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(target: "nagato::listener", error = ?e, "failed to accept connection");
                continue;
            }
        };

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(e) => {
                error!(target: "nagato::listener", error = ?e, "failed to acquire connection permit");
                continue;
            }
        };

        let _ = stream.set_nodelay(true);
        let strategies = strategies.clone();

        debug!(
            target: "nagato::listener",
            client_addr = %addr,
            available_permits = semaphore.available_permits(),
            "connection accepted"
        );

        tokio::spawn(async move {
            let _permit = permit;
            let session = ProxySession::new(stream, addr, strategies);
            if let Err(e) = session.run().await {
                if !e.is_quiet() {
                    error!(target: "nagato::session", client_addr = %addr, error = ?e, "session ended with error");
                }
            }
        });
    }
}
