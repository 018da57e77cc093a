mod cli;
mod listener;
mod logging;

use std::sync::Arc;

use nagato_core::StrategyTable;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = cli::NagatoConfig::from_args(std::env::args().skip(1))?;
    logging::init_tracing(cfg.verbosity);

    info!(
        target: "nagato::main",
        listen = %cfg.listen_addr(),
        max_connections = cfg.max_connections,
        "starting nagato"
    );

    let tcp_listener = listener::bind_listener(&cfg.listen_addr()).await?;
    let strategies = Arc::new(StrategyTable::new());

    let accept = listener::accept_loop(
        tcp_listener,
        cfg.listen_addr(),
        cfg.max_connections,
        strategies,
    );

    tokio::select! {
        result = accept => result,
        _ = tokio::signal::ctrl_c() => {
            info!(target: "nagato::main", "received ctrl-c, shutting down");
            Ok(())
        }
    }
}
