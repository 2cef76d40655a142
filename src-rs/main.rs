mod config;
mod handlers;
mod middleware;
mod rate_limit;
mod solution;
mod state;
mod stripe_api;
mod subscriptions;
mod supabase;
mod timeout;
mod webhook;

use std::{
    collections::HashSet,
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use config::Config;
use state::AppState;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let loaded_env_files = load_env_files()?;
    init_tracing();
    if loaded_env_files.is_empty() {
        tracing::warn!("No .env or .env.local file found. Using process environment only.");
    } else {
        let files = loaded_env_files
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(files = %files, "Loaded environment files");
    }

    let config = Config::from_env()?;

    let is_production = env::var("NODE_ENV")
        .ok()
        .map(|value| value.eq_ignore_ascii_case("production"))
        .unwrap_or(false);

    if config.stripe_secret_key.is_none() {
        if is_production {
            return Err(anyhow::anyhow!(
                "STRIPE_SECRET_KEY environment variable is not set"
            ));
        }
        tracing::warn!(
            "STRIPE_SECRET_KEY is not set. Stripe functionality will not work until it is provided."
        );
    }
    if config.stripe_webhook_secret.is_none() {
        tracing::warn!(
            "STRIPE_WEBHOOK_SECRET is not set. Webhook deliveries will be rejected until it is provided."
        );
    }
    if config.openai_api_key.is_none() {
        tracing::warn!(
            "OPENAI_API_KEY is not set. Solution generation will not work until it is provided."
        );
    }

    let db = supabase::SupabaseClient::new(
        config.supabase_url.clone(),
        &config.supabase_service_role_key,
    )?;
    let stripe = stripe_api::StripeApi::new(
        config.stripe_secret_key.clone(),
        config.stripe_webhook_secret.clone(),
    )?;
    let openai = solution::OpenAiClient::new(config.openai_model.clone(), config.openai_timeout)?;

    let state = AppState::new(config.clone(), db, stripe, openai);

    match state.db.ping().await {
        Ok(()) => {
            tracing::info!("Supabase connectivity check passed");
        }
        Err(error) => {
            tracing::error!(
                error = ?error,
                supabase_url = %config.supabase_url,
                "Supabase connectivity check failed. Verify SUPABASE_URL and the service role key."
            );
        }
    }

    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    if let Some((cert_path, key_path)) = valid_tls_paths(&config) {
        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .context("failed to load TLS certificate/key")?;

        tracing::info!(
            port = config.port,
            "TLS configuration loaded. Running in HTTPS mode."
        );

        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("HTTPS server failed")?;
    } else {
        tracing::info!(port = config.port, "Running in HTTP mode.");
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind TCP listener")?;

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .context("HTTP server failed")?;
    }

    Ok(())
}

fn build_router(state: AppState) -> Router {
    let generate_router = Router::new()
        .route("/generate/solution", post(handlers::generate_solution))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::generate_rate_limit,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/stripe/webhook", post(handlers::handle_stripe_webhook))
        .nest("/api", generate_router)
        .route("/health", get(handlers::health))
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn valid_tls_paths(config: &Config) -> Option<(PathBuf, PathBuf)> {
    let (cert_path, key_path) = match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert_path), Some(key_path)) => (cert_path.clone(), key_path.clone()),
        (None, None) => return None,
        (cert_path, key_path) => {
            tracing::error!(
                cert = ?cert_path,
                key = ?key_path,
                "TLS requires both TLS_CERT_PATH and TLS_KEY_PATH"
            );
            tracing::error!("Proceeding without TLS.");
            return None;
        }
    };

    for path in [&cert_path, &key_path] {
        if !path.is_file() {
            tracing::error!(path = %path.display(), "TLS file not found");
            tracing::error!("Proceeding without TLS.");
            return None;
        }
    }

    Some((cert_path, key_path))
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_env_files() -> anyhow::Result<Vec<PathBuf>> {
    let mut roots: Vec<PathBuf> = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        roots.push(cwd);
    }
    if let Some(executable_dir) = env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(Path::to_path_buf))
    {
        roots.push(executable_dir);
    }
    roots.push(PathBuf::from(env!("CARGO_MANIFEST_DIR")));

    let mut seen_roots = HashSet::new();
    let mut loaded = Vec::new();

    for root in roots {
        if !seen_roots.insert(root.clone()) {
            continue;
        }

        for filename in [".env", ".env.local"] {
            let path = root.join(filename);
            if path.is_file() {
                dotenvy::from_path(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?;
                loaded.push(path);
            }
        }
    }

    if loaded.is_empty() {
        if let Ok(path) = dotenvy::dotenv() {
            loaded.push(path);
        }
    }

    Ok(loaded)
}
