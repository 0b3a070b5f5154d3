#[tokio::main]
async fn main() {
    let config = match ccproxy::config::Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    };

    let default_filter = if config.debug {
        "info,ccproxy=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    if let Err(err) = run(config).await {
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

async fn run(config: ccproxy::config::Config) -> Result<(), ccproxy::error::AppError> {
    let addr = config.listen_addr();
    let state = ccproxy::app::load_state(config)?;
    tracing::info!(
        "forwarding /v1/messages to {} ({:?})",
        state.config.upstream_base_url,
        state.config.provider_class()
    );
    let app = ccproxy::app::build_app(state);

    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|err| {
        ccproxy::error::AppError::api(format!("failed to bind {addr}: {err}"))
    })?;
    tracing::info!("listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| ccproxy::error::AppError::api(format!("server error: {err}")))?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("received interrupt, shutting down");
    }
}
