use std::net::SocketAddr;
use std::sync::Arc;

use llm_extproc::api::build_router;
use llm_extproc::config::{load_config, AppConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use llm_extproc::observability::init_tracing;
use llm_extproc::state::AppState;

fn main() {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = load_config(&path).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration from '{path}': {e}");
        eprintln!("Please copy 'config.example.yaml' to 'config.yaml' and modify as needed.");
        std::process::exit(1);
    });

    init_tracing(&config.features);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Failed to initialize Tokio runtime: {e}");
            std::process::exit(1);
        });

    runtime.block_on(async move {
        run(config).await;
    });
}

async fn run(config: AppConfig) {
    let metrics_addr: SocketAddr = match config.server.metrics_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Invalid metrics address '{}': {e}", config.server.metrics_addr);
            std::process::exit(1);
        }
    };
    let listen_addr = config.server.listen_addr.clone();
    let policies = config.policies.len();

    let state = match AppState::new(config) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            eprintln!("Failed to initialize state: {e}");
            std::process::exit(1);
        }
    };

    // Compile every configured policy up front.
    for name in state.config.policies.keys() {
        if let Err(e) = state.guardrails_for(name) {
            eprintln!("Failed to compile policy '{name}': {e}");
            std::process::exit(1);
        }
    }

    let listener = tokio::net::TcpListener::bind(metrics_addr)
        .await
        .unwrap_or_else(|err| {
            eprintln!("Failed to bind to {metrics_addr}: {err}");
            std::process::exit(1);
        });

    tracing::info!(
        %metrics_addr,
        ext_proc_addr = %listen_addr,
        policies,
        "llm-extproc is ready"
    );

    if let Err(e) = axum::serve(listener, build_router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "metrics server stopped");
    }
    tracing::info!("llm-extproc shut down");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
