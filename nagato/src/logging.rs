//! Tracing initialization, mirroring the registry+EnvFilter+compact-fmt
//! layering the rest of the workspace uses, with verbosity mapped from
//! repeated `-v` flags when `RUST_LOG` isn't set explicitly.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub fn init_tracing(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "warn,nagato=info,nagato_core=info",
        1 => "info,nagato=debug,nagato_core=debug",
        _ => "debug,nagato=trace,nagato_core=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .compact()
                .with_target(true)
                .with_thread_ids(false),
        )
        .init();
}
