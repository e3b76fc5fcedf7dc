//! Demo service built on the kit.
//!
//! A REST API managing business accounts, authenticated with API keys. It
//! wires every helper of the library together against PostgreSQL.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment variables
//! 2. Initialize logging
//! 3. Create database connection pool and run migrations
//! 4. Build HTTP router with routes and middleware
//! 5. Serve until a termination signal, then close the pool

mod db;
mod handlers;
mod models;
mod services;

use axum::{
    Router,
    routing::{get, post},
};
use axum_service_kit::{
    auth::AuthManager,
    config::Config,
    logging,
    middleware::request_log::{self, RequestLogConfig},
    server,
};

use handlers::AppState;
use models::account::AccountRepository;
use services::api_key_resolver::ApiKeyResolver;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    logging::init(config.log_format).map_err(|error| anyhow::anyhow!(error))?;
    tracing::info!("Configuration loaded");

    let pool = db::create_pool(&config.database_url()?, config.database.max_connections).await?;
    tracing::info!("Database pool created");

    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let state = AppState {
        pool: pool.clone(),
        accounts: AccountRepository::new(pool.clone())
            .with_slow_query_threshold(config.slow_query_threshold()),
    };

    // Every route in this group requires a valid API key
    let auth = AuthManager::new(ApiKeyResolver::new(pool.clone()), config.auth.clone());
    let authenticated_routes = auth.protect(
        Router::new()
            .route(
                "/api/v1/accounts",
                post(handlers::accounts::create_account).get(handlers::accounts::list_accounts),
            )
            .route(
                "/api/v1/accounts/{id}",
                get(handlers::accounts::get_account)
                    .patch(handlers::accounts::update_account)
                    .delete(handlers::accounts::delete_account),
            )
            .route("/api/v1/whoami", get(handlers::whoami::whoami)),
    );

    let app = Router::new()
        .route("/health", get(handlers::health::health_check))
        .merge(authenticated_routes)
        .with_state(state);

    let app = request_log::instrument(
        app,
        RequestLogConfig::default().with_fatal_error_message(config.fatal_error_message.clone()),
    );

    server::serve(app, config.server_addr()?, || async move {
        pool.close().await;
        tracing::info!("Database pool closed");
    })
    .await
}
