//! Gatehouse - multi-tenant agent gateway

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatehouse::agent::{AgentEngine, UnavailableEngine};
use gatehouse::auth;
use gatehouse::config::Args;
use gatehouse::secrets::SecretResolver;
use gatehouse::server::{self, AppState};
use gatehouse::tunnel::{self, TunnelConfig};
use gatehouse::types::GatewayError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("gatehouse={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Gatehouse - agent gateway");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Auth mode: {}", args.auth_mode);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!(
        "Identity provider: {}",
        args.iam_issuer.as_deref().unwrap_or("(none)")
    );
    info!(
        "Commerce: {}",
        args.commerce_api_url.as_deref().unwrap_or("(none)")
    );
    info!("Tunnel provider: {}", args.tunnel_provider);
    info!("State dir: {}", args.state_dir.display());
    info!("======================================");

    // Dereference every configured secret exactly once; failures are fatal
    let secrets = SecretResolver::from_args(&args);
    let resolved_auth = match auth::resolve_auth(&args, &secrets).await {
        Ok(resolved) => resolved,
        Err(e) => {
            error!("Secret resolution failed: {}", e);
            std::process::exit(2);
        }
    };
    let iam_client_secret = match secrets.resolve_opt(args.iam_client_secret.as_deref()).await {
        Ok(secret) => secret,
        Err(e) => {
            error!("Secret resolution failed: {}", e);
            std::process::exit(2);
        }
    };
    let commerce_service_token = match secrets
        .resolve_opt(args.commerce_service_token.as_deref())
        .await
    {
        Ok(token) => token,
        Err(e) => {
            error!("Secret resolution failed: {}", e);
            std::process::exit(2);
        }
    };

    // The execution engine is an external collaborator; embedders wire a
    // real one through AppState::new
    let engine: Arc<dyn AgentEngine> = Arc::new(UnavailableEngine);
    warn!("no agent engine attached; chat requests will fail until one is wired");

    let state = Arc::new(AppState::new(
        args.clone(),
        resolved_auth,
        iam_client_secret,
        commerce_service_token,
        engine,
    ));

    if state.usage.is_enabled() {
        info!("Usage reporting enabled");
    }

    // Egress tunnel is best-effort: failure to start is not fatal
    let tunnel_config = TunnelConfig::from_args(&args);
    let tunnel = match tunnel::start(&tunnel_config, Arc::clone(&state.origin)).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Tunnel failed to start: {}", e);
            None
        }
    };
    if let Some(ref handle) = tunnel {
        info!(
            "Public gateway URL: {} (via {})",
            handle.public_url, handle.provider
        );
    }

    tokio::select! {
        result = server::run(Arc::clone(&state)) => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                let code = match e {
                    GatewayError::Bind(_) => 3,
                    _ => 1,
                };
                std::process::exit(code);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    if let Some(handle) = tunnel {
        handle.stop().await;
    }
    // Drain pending usage records before exit
    state.usage.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}
