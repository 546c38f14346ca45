use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use lexrag::store::ChunkRecord;
use lexrag::{Cli, EmbeddingEngine, IngestDocument, Segmenter};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "lexrag-ingestd",
    about = "Offline ingestion pipeline: documents in, embedded chunk records out"
)]
struct IngestCli {
    /// Input JSONL of documents (one document per line)
    #[arg(long, env = "LEXRAG_INGEST_INPUT", default_value = "documents.jsonl")]
    input: PathBuf,

    /// Output JSONL of embedded chunk records
    #[arg(long, env = "LEXRAG_INGEST_OUTPUT", default_value = "chunks.jsonl")]
    output: PathBuf,

    /// Optional fingerprint file; documents already listed are skipped and
    /// new fingerprints are appended on success
    #[arg(long, env = "LEXRAG_INGEST_FINGERPRINTS")]
    fingerprints: Option<PathBuf>,

    /// Number of concurrent ingestion workers
    #[arg(long, env = "LEXRAG_INGEST_THREADS", default_value_t = 1)]
    worker_threads: usize,

    #[command(flatten)]
    pipeline: Cli,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = IngestCli::parse();
    let engine = Arc::new(EmbeddingEngine::init(&cli.pipeline.embedding_config()));
    info!(mode = ?engine.mode(), model = %engine.model_id(), "embedding engine ready");
    let segmenter = Segmenter::new(cli.pipeline.segmenter_config());

    let seen = match &cli.fingerprints {
        Some(path) => load_fingerprints(path)?,
        None => HashSet::new(),
    };

    let input =
        File::open(&cli.input).with_context(|| format!("failed to open {:?}", cli.input))?;
    let reader = BufReader::new(input);
    let output =
        File::create(&cli.output).with_context(|| format!("failed to create {:?}", cli.output))?;
    let mut writer = BufWriter::new(output);

    let report = process_stream(
        reader,
        &mut writer,
        engine,
        segmenter,
        &seen,
        cli.worker_threads,
    )?;
    writer.flush()?;

    if let Some(path) = &cli.fingerprints {
        append_fingerprints(path, &report.new_fingerprints)?;
    }
    info!(
        documents = report.documents,
        skipped = report.skipped,
        chunks = report.chunks,
        "ingestion complete"
    );
    Ok(())
}

struct StreamReport {
    documents: usize,
    skipped: usize,
    chunks: usize,
    new_fingerprints: Vec<String>,
}

fn process_stream<R: BufRead, W: Write>(
    reader: R,
    writer: &mut W,
    engine: Arc<EmbeddingEngine>,
    segmenter: Segmenter,
    seen: &HashSet<String>,
    worker_threads: usize,
) -> Result<StreamReport> {
    let worker_threads = worker_threads.max(1);
    info!(workers = worker_threads, "launching ingestion workers");
    let (task_tx, task_rx) = bounded::<IngestTask>(worker_threads * 2);
    let (result_tx, result_rx) = bounded::<WorkerResult>(worker_threads * 2);

    for _ in 0..worker_threads {
        let worker_engine = engine.clone();
        let worker_segmenter = segmenter.clone();
        let worker_rx = task_rx.clone();
        let worker_tx = result_tx.clone();
        thread::spawn(move || worker_loop(worker_rx, worker_tx, worker_engine, worker_segmenter));
    }
    drop(task_rx);
    drop(result_tx);

    let mut report = StreamReport {
        documents: 0,
        skipped: 0,
        chunks: 0,
        new_fingerprints: Vec::new(),
    };
    let mut pending_results: BTreeMap<usize, Vec<ChunkRecord>> = BTreeMap::new();
    let mut next_task_id = 0usize;
    let mut next_result_id = 0usize;
    let mut inflight = 0usize;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", line_no + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let document: IngestDocument = serde_json::from_str(&line)
            .with_context(|| format!("invalid document at line {}", line_no + 1))?;
        if let Err(err) = document.validate() {
            warn!(line = line_no + 1, error = %err, "rejecting document");
            continue;
        }
        let fingerprint = document.fingerprint();
        if seen.contains(&fingerprint) {
            report.skipped += 1;
            continue;
        }
        report.documents += 1;
        report.new_fingerprints.push(fingerprint);

        task_tx
            .send(IngestTask {
                id: next_task_id,
                document,
            })
            .map_err(|_| anyhow!("ingestion worker channel closed"))?;
        next_task_id += 1;
        inflight += 1;

        drain_ready_results(
            &result_rx,
            &mut pending_results,
            &mut next_result_id,
            writer,
            &mut report.chunks,
            &mut inflight,
        )?;
    }
    drop(task_tx);

    while inflight > 0 {
        let result = match result_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(res) => res,
            Err(RecvTimeoutError::Timeout) => {
                info!(inflight, "still waiting on ingestion batches");
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                anyhow::bail!("ingestion worker channel closed unexpectedly")
            }
        };
        inflight -= 1;
        process_result(
            result?,
            &mut pending_results,
            &mut next_result_id,
            writer,
            &mut report.chunks,
        )?;
    }
    Ok(report)
}

fn drain_ready_results<W: Write>(
    result_rx: &Receiver<WorkerResult>,
    pending_results: &mut BTreeMap<usize, Vec<ChunkRecord>>,
    next_result_id: &mut usize,
    writer: &mut W,
    chunks_written: &mut usize,
    inflight: &mut usize,
) -> Result<()> {
    loop {
        let result = match result_rx.try_recv() {
            Ok(res) => res,
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                anyhow::bail!("ingestion worker channel closed unexpectedly")
            }
        };
        *inflight = inflight.saturating_sub(1);
        process_result(
            result?,
            pending_results,
            next_result_id,
            writer,
            chunks_written,
        )?;
    }
    Ok(())
}

// Results arrive out of order; buffer by task id so the output stream keeps
// input document order.
fn process_result<W: Write>(
    batch: TaskResult,
    pending_results: &mut BTreeMap<usize, Vec<ChunkRecord>>,
    next_result_id: &mut usize,
    writer: &mut W,
    chunks_written: &mut usize,
) -> Result<()> {
    pending_results.insert(batch.id, batch.records);
    while let Some(records) = pending_results.remove(next_result_id) {
        for record in &records {
            serde_json::to_writer(&mut *writer, record)?;
            writer.write_all(b"\n")?;
        }
        *chunks_written += records.len();
        *next_result_id += 1;
    }
    Ok(())
}

fn worker_loop(
    receiver: Receiver<IngestTask>,
    sender: Sender<WorkerResult>,
    engine: Arc<EmbeddingEngine>,
    segmenter: Segmenter,
) {
    for task in receiver.iter() {
        let IngestTask { id, document } = task;
        let records = ingest_document(&engine, &segmenter, &document);
        if sender.send(Ok(TaskResult { id, records })).is_err() {
            break;
        }
    }
}

fn ingest_document(
    engine: &EmbeddingEngine,
    segmenter: &Segmenter,
    document: &IngestDocument,
) -> Vec<ChunkRecord> {
    let doc_id = document.doc_id();
    let chunks = segmenter.segment(&doc_id, &document.flatten());
    let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
    let vectors = engine.embed_batch(&texts);
    chunks
        .into_iter()
        .zip(vectors.into_iter())
        .map(|(chunk, embedding)| {
            let checksum = crc32fast::hash(chunk.text.as_bytes());
            ChunkRecord {
                chunk,
                jurisdiction: Some(document.metadata.jurisdiction.clone()),
                doc_type: Some(document.metadata.doc_type.clone()),
                checksum,
                embedding: Some(embedding),
                processed: true,
            }
        })
        .collect()
}

fn load_fingerprints(path: &PathBuf) -> Result<HashSet<String>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to open fingerprints {path:?}"))
        }
    };
    let reader = BufReader::new(file);
    let mut entries = HashSet::new();
    for line in reader.lines() {
        let line = line.context("failed to read fingerprint line")?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            entries.insert(trimmed.to_string());
        }
    }
    Ok(entries)
}

fn append_fingerprints(path: &PathBuf, fingerprints: &[String]) -> Result<()> {
    if fingerprints.is_empty() {
        return Ok(());
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open fingerprints {path:?}"))?;
    for fingerprint in fingerprints {
        writeln!(file, "{fingerprint}")?;
    }
    Ok(())
}

struct IngestTask {
    id: usize,
    document: IngestDocument,
}

struct TaskResult {
    id: usize,
    records: Vec<ChunkRecord>,
}

type WorkerResult = Result<TaskResult>;
