use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use opinion_map_worker::{
    app::{ComponentRegistry, build_router},
    config::Config,
    pipeline::retention::spawn_retention_daemon,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed");
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<String>()
                    .map(String::as_str)
            })
            .unwrap_or("unknown panic payload");

        if let Some(location) = panic_info.location() {
            error!(
                thread = thread_name,
                file = location.file(),
                line = location.line(),
                message,
                "panic occurred"
            );
        } else {
            error!(thread = thread_name, message, "panic occurred without location information");
        }
    }));

    let config = Config::from_env().context("failed to load configuration")?;
    let bind_addr = config.http_bind();
    let shutdown = CancellationToken::new();

    // Telemetry::new() は build 内で初期化される
    let registry = ComponentRegistry::build(&config, shutdown.clone())
        .await
        .context("failed to build component registry")?;
    let retention = spawn_retention_daemon(
        registry.sessions(),
        config.session_retention_days(),
        shutdown.clone(),
    );
    let router = build_router(registry);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
    info!(%bind_addr, "listening");

    let signal = shutdown.clone();
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(error = %error, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
            signal.cancel();
        })
        .await;
    if let Err(error) = served {
        warn!(error = %error, "server exited with error");
    }

    shutdown.cancel();
    if let Err(error) = retention.await {
        warn!(error = %error, "retention daemon did not stop cleanly");
    }
    Ok(())
}
