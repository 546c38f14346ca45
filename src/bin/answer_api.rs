use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use lexrag::generation::{GenerationClient, GenerationRequest};
use lexrag::rerank::Reranker;
use lexrag::retriever::HybridRetriever;
use lexrag::{
    Answer, Cli, EmbeddingEngine, HttpGenerationClient, IngestDocument, Ingestor, JsonlAuditSink,
    MemoryChunkStore, Orchestrator, QueryRequest, Segmenter, SimilarityIndex,
};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "lexrag-api",
    about = "HTTP API answering legal questions over an ingested corpus"
)]
struct ApiCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "LEXRAG_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// JSONL file of documents to ingest at startup (one document per line).
    #[arg(long, env = "LEXRAG_CORPUS")]
    corpus: Option<PathBuf>,

    /// Max requests per minute allowed (0 disables rate limiting).
    #[arg(long, default_value_t = 120)]
    max_requests_per_minute: u32,

    /// Rate-limit burst size (tokens available instantly).
    #[arg(long, default_value_t = 12)]
    rate_limit_burst: u32,

    #[command(flatten)]
    pipeline: Cli,
}

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    rate_limiter: Option<RateLimiter>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

/// Stand-in generation backend when no key is configured; every query
/// degrades to the templated source-listing answer.
struct DisabledGeneration;

impl GenerationClient for DisabledGeneration {
    fn generate(&self, _request: &GenerationRequest) -> Result<String> {
        anyhow::bail!("no generation backend configured")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = ApiCli::parse();
    let pipeline = &cli.pipeline;

    let engine = Arc::new(EmbeddingEngine::init(&pipeline.embedding_config()));
    info!(mode = ?engine.mode(), model = %engine.model_id(), "embedding engine ready");

    let store = Arc::new(MemoryChunkStore::new());
    let index = Arc::new(RwLock::new(SimilarityIndex::new()));

    if let Some(corpus) = &cli.corpus {
        let ingestor = Ingestor::new(
            store.clone(),
            engine.clone(),
            index.clone(),
            Segmenter::new(pipeline.segmenter_config()),
            64,
        );
        let loaded = load_corpus(&ingestor, corpus)?;
        info!(documents = loaded, corpus = %corpus.display(), "corpus ingested");
    }

    let generator: Arc<dyn GenerationClient> = if pipeline.generation_enabled() {
        Arc::new(HttpGenerationClient::new(
            pipeline.gen_api_key.clone(),
            pipeline.gen_base_url.clone(),
            pipeline.gen_model.clone(),
            pipeline.gen_timeout(),
        )?)
    } else {
        info!("no generation key configured; answers will degrade to source listings");
        Arc::new(DisabledGeneration)
    };

    let orchestrator = Arc::new(Orchestrator::new(
        engine,
        index,
        store,
        HybridRetriever::new(pipeline.retriever_config()),
        Reranker::new(pipeline.rerank_config()),
        generator,
        Arc::new(JsonlAuditSink::new(pipeline.audit_log.clone())),
        pipeline.orchestrator_config(),
    ));

    let state = AppState {
        orchestrator,
        rate_limiter: RateLimiter::new(cli.max_requests_per_minute, cli.rate_limit_burst),
    };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/ask", post(ask_handler))
        .with_state(state);

    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    info!(%addr, "lexrag-api listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .await
        .context("server shutdown")?;
    Ok(())
}

/// Loads documents from a JSONL corpus file. A bad line costs that document
/// only; the rest of the corpus still loads.
fn load_corpus(ingestor: &Ingestor, path: &PathBuf) -> Result<usize> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read corpus {}", path.display()))?;
    let mut loaded = 0usize;
    let mut skipped = 0usize;
    for (line_no, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let document: IngestDocument = match serde_json::from_str(line) {
            Ok(document) => document,
            Err(err) => {
                warn!(line = line_no + 1, error = %err, "skipping malformed corpus line");
                skipped += 1;
                continue;
            }
        };
        match ingestor.ingest(&document) {
            Ok(report) => {
                info!(
                    doc_id = %report.doc_id,
                    chunks = report.chunks_created,
                    skipped = report.chunks_failed,
                    duplicate = report.duplicate,
                    "document ingested"
                );
                loaded += 1;
            }
            Err(err) => {
                warn!(line = line_no + 1, error = %err, "skipping document rejected at ingestion");
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        warn!(loaded, skipped, "corpus loaded with skipped lines");
    }
    Ok(loaded)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn ask_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<Answer>, (StatusCode, Json<ErrorBody>)> {
    if request.question.trim().is_empty() {
        return Err(bad_request("question text must not be empty"));
    }
    if let Some(limiter) = &state.rate_limiter {
        if !limiter.acquire() {
            return Err(too_many_requests("rate limit exceeded"));
        }
    }
    Ok(Json(state.orchestrator.answer(request).await))
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}

fn too_many_requests(message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}

#[derive(Clone)]
struct RateLimiter {
    state: Arc<Mutex<RateState>>,
    capacity: f64,
    refill_per_sec: f64,
}

struct RateState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(max_per_minute: u32, burst: u32) -> Option<Self> {
        if max_per_minute == 0 || burst == 0 {
            return None;
        }
        Some(Self {
            state: Arc::new(Mutex::new(RateState {
                tokens: burst as f64,
                last_refill: Instant::now(),
            })),
            capacity: burst as f64,
            refill_per_sec: max_per_minute as f64 / 60.0,
        })
    }

    fn acquire(&self) -> bool {
        let Ok(mut guard) = self.state.lock() else {
            return true;
        };
        let now = Instant::now();
        let elapsed = now.duration_since(guard.last_refill).as_secs_f64();
        guard.last_refill = now;
        guard.tokens = (guard.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if guard.tokens >= 1.0 {
            guard.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexrag::{EmbeddingConfig, SegmenterConfig};
    use std::io::Write;

    fn test_ingestor() -> Ingestor {
        let engine = Arc::new(EmbeddingEngine::init(&EmbeddingConfig {
            fallback_dimension: 32,
            ..EmbeddingConfig::default()
        }));
        Ingestor::new(
            Arc::new(MemoryChunkStore::new()),
            engine,
            Arc::new(RwLock::new(SimilarityIndex::new())),
            Segmenter::new(SegmenterConfig::default()),
            16,
        )
    }

    #[test]
    fn corpus_load_survives_malformed_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{not valid json").unwrap();
        writeln!(
            file,
            r#"{{"metadata":{{"name":"Tenancy Law","doc_type":"law","jurisdiction":"dubai"}},"body":{{"flat":[{{"number":1,"text":"Either party may terminate the lease with ninety days notice."}}]}}}}"#
        )
        .unwrap();
        writeln!(
            file,
            r#"{{"metadata":{{"name":"","doc_type":"law","jurisdiction":"dubai"}},"body":{{"flat":[{{"text":"Body without a document name."}}]}}}}"#
        )
        .unwrap();
        let loaded = load_corpus(&test_ingestor(), &file.path().to_path_buf()).unwrap();
        assert_eq!(loaded, 1);
    }
}
