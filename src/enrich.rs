//! Enrichment hand-off.
//!
//! After a commit the orchestrator pushes the conversation id onto an
//! unbounded channel and moves on. A background task drains the channel:
//! it builds (or reuses) the canonical artifact, sends it to the external
//! [`Enricher`], and stores whatever comes back verbatim. Failures are
//! logged and never reach the ingestion path.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use transcript_harness_core::models::EnrichmentRecord;
use transcript_harness_core::store::Store;

use crate::canonical::ArtifactService;
use crate::config::{Config, EnrichmentConfig};

/// Input contract of the enrichment service.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentRequest {
    pub conversation_id: String,
    pub canonical_type: String,
    pub token_count: usize,
    pub text: String,
}

/// External text-generation consumer of canonical artifacts.
#[async_trait]
pub trait Enricher: Send + Sync {
    fn name(&self) -> &str;

    /// Returns opaque structured output.
    async fn enrich(&self, request: &EnrichmentRequest) -> Result<Value>;
}

/// POSTs the request as JSON and returns the JSON response body.
pub struct HttpEnricher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpEnricher {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Enricher for HttpEnricher {
    fn name(&self) -> &str {
        "http"
    }

    async fn enrich(&self, request: &EnrichmentRequest) -> Result<Value> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.endpoint))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("enrichment service returned {}: {}", status, body);
        }
        Ok(response.json::<Value>().await?)
    }
}

/// Build the configured enricher; `None` when enrichment is disabled.
pub fn enricher_from_config(config: &EnrichmentConfig) -> Result<Option<Arc<dyn Enricher>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "http" => {
            let endpoint = match &config.endpoint {
                Some(e) => e.clone(),
                None => bail!("enrichment.endpoint must be specified when provider is 'http'"),
            };
            let enricher = HttpEnricher::new(endpoint, Duration::from_secs(config.timeout_secs))?;
            Ok(Some(Arc::new(enricher)))
        }
        other => bail!("Unknown enrichment provider: '{}'", other),
    }
}

/// Sending side of the hand-off channel.
#[derive(Clone)]
pub struct EnrichmentQueue {
    tx: mpsc::UnboundedSender<String>,
}

impl EnrichmentQueue {
    /// Queue a conversation for enrichment. Never blocks; returns false if
    /// the worker has stopped.
    pub fn enqueue(&self, conversation_id: impl Into<String>) -> bool {
        self.tx.send(conversation_id.into()).is_ok()
    }
}

/// Start the background worker. It exits once every queue handle is
/// dropped, returning the number of conversations enriched.
pub fn spawn_worker(
    store: Arc<dyn Store>,
    config: Arc<Config>,
    enricher: Arc<dyn Enricher>,
) -> (EnrichmentQueue, JoinHandle<usize>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let artifacts = ArtifactService::new(store.clone(), config.clone());
    let canonical_type = config.enrichment.canonical_type.clone();
    let strategy = config.sampling.strategy;

    let handle = tokio::spawn(async move {
        let mut done = 0usize;
        while let Some(conversation_id) = rx.recv().await {
            let result = enrich_one(
                store.as_ref(),
                &artifacts,
                enricher.as_ref(),
                &conversation_id,
                &canonical_type,
                strategy,
            )
            .await;
            match result {
                Ok(()) => done += 1,
                Err(e) => warn!(
                    conversation = %conversation_id,
                    error = %format!("{:#}", e),
                    "enrichment failed"
                ),
            }
        }
        done
    });

    (EnrichmentQueue { tx }, handle)
}

async fn enrich_one(
    store: &dyn Store,
    artifacts: &ArtifactService,
    enricher: &dyn Enricher,
    conversation_id: &str,
    canonical_type: &str,
    strategy: transcript_harness_core::models::SamplingStrategy,
) -> Result<()> {
    let (artifact, _) = artifacts
        .get_or_build(conversation_id, canonical_type, strategy)
        .await?;
    let request = EnrichmentRequest {
        conversation_id: artifact.conversation_id.clone(),
        canonical_type: artifact.canonical_type.clone(),
        token_count: artifact.token_count,
        text: artifact.text,
    };
    let payload = enricher.enrich(&request).await?;
    store
        .put_enrichment(&EnrichmentRecord {
            conversation_id: request.conversation_id,
            canonical_type: request.canonical_type,
            source_revision: artifact.source_revision,
            provider: enricher.name().to_string(),
            payload,
            created_at: Utc::now().timestamp(),
        })
        .await?;
    debug!(conversation = conversation_id, "enrichment stored");
    Ok(())
}
