use crate::{
    api::{self, handlers::AppState},
    extractor::{DisabledExtractor, EmbeddingExtractor, HttpExtractor},
    login::{LoginConfig, LoginOrchestrator, SessionTokenIssuer},
    store::{MemoryStore, PgStore, Store},
};
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub extractor_url: Option<Url>,
    pub extractor_timeout_ms: u64,
    pub session_ttl_seconds: u64,
    pub token_ttl_seconds: u64,
    pub admin_token: SecretString,
    pub code_pepper: SecretString,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database or extractor cannot be set up, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let extractor_timeout = Duration::from_millis(args.extractor_timeout_ms);

    let store: Arc<dyn Store> = if let Some(dsn) = &args.dsn {
        Arc::new(
            PgStore::connect(dsn)
                .await
                .context("Failed to connect to database")?,
        )
    } else {
        warn!("No DSN configured, identities and attempts are kept in memory only");
        Arc::new(MemoryStore::new())
    };

    let extractor: Arc<dyn EmbeddingExtractor> = if let Some(url) = args.extractor_url {
        info!("Embedding extractor: {}", url);
        Arc::new(
            HttpExtractor::new(url, extractor_timeout)
                .context("Failed to build embedding extractor client")?,
        )
    } else {
        warn!("No extractor configured, only precomputed embeddings can match");
        Arc::new(DisabledExtractor)
    };

    let config = LoginConfig::default()
        .with_session_ttl(Duration::from_secs(args.session_ttl_seconds))
        .with_extractor_timeout(extractor_timeout)
        .with_code_pepper(args.code_pepper.expose_secret().as_bytes());

    let orchestrator = LoginOrchestrator::new(
        store.clone(),
        extractor,
        Arc::new(SessionTokenIssuer::new(args.token_ttl_seconds)),
        config,
    );

    let state = Arc::new(AppState::new(
        store,
        orchestrator,
        args.admin_token.expose_secret(),
    ));

    let result = api::new(args.port, state).await;
    crate::cli::telemetry::shutdown_tracer();
    result
}
