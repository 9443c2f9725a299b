mod api;
mod archive;
mod auth;
mod blob;
mod config;
mod dedup;
mod error;
mod generation;
mod ledger;
mod models;
mod notify;
mod openai;
mod provisioning;
mod reconcile;
mod replicate;
mod store;
#[cfg(test)]
mod testutil;
mod uploads;

use std::sync::Arc;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use config::Config;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    blob::{BlobStore, FsBlobStore},
    notify::{Notifier, QueueNotifier},
    openai::{OpenAiClient, PromptEnhancer},
    replicate::{ByteFetcher, ReplicateClient, TrainerClient},
    store::{MemoryRecordStore, RecordStore},
};

/// Shared collaborators behind their ports, so the pipelines run unchanged
/// against the in-memory fakes in tests.
#[derive(Clone)]
pub struct Deps {
    pub records: Arc<dyn RecordStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub trainer: Arc<dyn TrainerClient>,
    pub fetcher: Arc<dyn ByteFetcher>,
    pub notifier: Arc<dyn Notifier>,
    pub enhancer: Option<Arc<dyn PromptEnhancer>>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub deps: Deps,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flux_atelier=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    if config.api_key_is_fallback {
        warn!("ATELIER_API_KEY not configured; requests must use the generated fallback key");
    }

    let blobs = Arc::new(FsBlobStore::new(
        config.data_root.clone(),
        config.public_base_url.clone(),
    ));
    blobs.ensure_root().await?;

    let replicate = Arc::new(ReplicateClient::new(
        config.replicate.clone(),
        config.request_timeout_seconds,
    )?);

    let (notifier, outbox_rx) = QueueNotifier::new(config.notify_queue_capacity);
    notify::spawn_outbox_worker(blobs.clone(), outbox_rx);

    let enhancer: Option<Arc<dyn PromptEnhancer>> = match &config.openai {
        Some(settings) => Some(Arc::new(OpenAiClient::new(
            settings.clone(),
            config.request_timeout_seconds,
        )?)),
        None => None,
    };

    let deps = Deps {
        records: Arc::new(MemoryRecordStore::new()),
        blobs,
        trainer: replicate.clone(),
        fetcher: replicate,
        notifier: Arc::new(notifier),
        enhancer,
    };
    let state = AppState {
        config: config.clone(),
        deps,
    };

    let app = Router::new()
        .route("/healthz", get(api::healthz))
        .route("/v1/images", post(api::upload_images))
        .route("/v1/trainings", post(api::create_training))
        .route("/v1/trainings/status", post(api::training_status))
        .route("/v1/generations", post(api::generate_image))
        .route("/v1/webhooks/replicate", post(api::replicate_webhook))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("flux-atelier listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
