use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use bistro_orderservice::{
    config, consumers, db,
    lock::DistributedLock,
    maintenance::{MaintenanceRunner, RunningJobs, jobs},
    notify::{HttpTransport, ProviderRelay},
    routes,
    state::AppState,
    store::{MemoryStore, PgStore, Store, pg},
};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = config::load()?;

    let store: Arc<dyn Store> = match &config.database.url {
        Some(url) => {
            tracing::info!("Running migrations...");
            let migrations_count = db::run_migrations_blocking(url).await?;
            tracing::info!("Run {} new migrations successfully", migrations_count);
            Arc::new(PgStore::new(pg::connect(url).await?))
        }
        None => Arc::new(MemoryStore::new()),
    };

    let http_client = reqwest::Client::new();
    let relay = config
        .webhooks
        .relay_url
        .as_ref()
        .map(|url| ProviderRelay::new(http_client.clone(), url.as_str()));
    let state = AppState::new(
        store.clone(),
        &config,
        Arc::new(HttpTransport::new(http_client)),
        relay,
    );

    let mut runner = MaintenanceRunner::new(
        DistributedLock::new(store.clone()),
        config.instance_id.clone(),
        Arc::new(RunningJobs::new(config.job_max_duration)),
        config.job_max_duration,
        config.retention.stale_lock_minutes,
    );
    for job in jobs::default_jobs(
        store.clone(),
        state.dispatcher.webhooks().clone(),
        &config.retention,
    ) {
        runner.register(job);
    }
    let _jobs = Arc::new(runner).start();

    let _amqp = match &config.amqp_url {
        Some(url) => {
            tracing::info!("Starting consumers...");
            Some(
                consumers::start(
                    url,
                    "OrderService",
                    Arc::new(state.clone()),
                    consumers::HANDLERS,
                )
                .await?,
            )
        }
        None => None,
    };

    let (router, mut openapi) = routes::routes_with_openapi().split_for_parts();
    openapi.info = utoipa::openapi::InfoBuilder::new()
        .title("Bistro OrderService API")
        .version("1.0.0")
        .build();
    let swagger_ui = SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi);

    let app = Router::new()
        .merge(router.with_state(state))
        .merge(swagger_ui)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.server_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server_addr))?;
    tracing::info!(instance = %config.instance_id, "OrderService listening on {}", config.server_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
