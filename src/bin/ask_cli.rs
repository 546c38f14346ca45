use anyhow::{bail, Context, Result};
use clap::Parser;
use lexrag::{Answer, QueryOutcome, QueryRequest, ScopeFilter};
use reqwest::blocking::Client;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "lexrag-ask",
    about = "Ask a legal question against a running lexrag-api instance"
)]
struct AskCli {
    /// Question to ask
    #[arg(long)]
    question: String,

    /// Answer service endpoint
    #[arg(
        long,
        env = "LEXRAG_API_URL",
        default_value = "http://127.0.0.1:8080/v1/ask"
    )]
    api_url: String,

    /// Number of passages requested
    #[arg(long)]
    top_k: Option<usize>,

    /// Restrict retrieval to one document identifier
    #[arg(long)]
    source: Option<String>,

    /// Restrict retrieval to one jurisdiction
    #[arg(long)]
    jurisdiction: Option<String>,

    /// Restrict retrieval to one document type
    #[arg(long)]
    doc_type: Option<String>,

    /// User label recorded in the audit trail
    #[arg(long, env = "LEXRAG_USER")]
    user: Option<String>,

    /// Seconds before the request times out
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Only print the cited sources (skip the answer body)
    #[arg(long, default_value_t = false)]
    sources_only: bool,
}

fn main() -> Result<()> {
    let cli = AskCli::parse();
    let client = Client::builder()
        .timeout(Duration::from_secs(cli.timeout_secs.max(1)))
        .build()
        .context("failed to build HTTP client")?;

    let request = QueryRequest {
        question: cli.question.clone(),
        user: cli.user.clone(),
        top_k: cli.top_k,
        scope: ScopeFilter {
            source_id: cli.source.clone(),
            jurisdiction: cli.jurisdiction.clone(),
            doc_type: cli.doc_type.clone(),
        },
    };
    let resp = client
        .post(&cli.api_url)
        .json(&request)
        .send()
        .with_context(|| format!("failed to call answer service at {}", cli.api_url))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp
            .text()
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        bail!("answer service returned {}: {}", status, body);
    }
    let answer: Answer = resp.json().context("failed to parse answer")?;

    println!("--- Sources ---\n{}", render_sources(&answer));
    if !cli.sources_only {
        let label = match answer.outcome {
            QueryOutcome::Answered => "Answer",
            QueryOutcome::Degraded => "Answer (degraded)",
            QueryOutcome::Failed => "No answer",
        };
        println!("--- {label} ---\n{}", answer.text);
    }
    println!(
        "({} ms, embedding model {}, outcome {:?})",
        answer.latency_ms, answer.model_id, answer.outcome
    );
    Ok(())
}

fn render_sources(answer: &Answer) -> String {
    if answer.sources.is_empty() {
        return String::from("(none)");
    }
    let mut out = String::new();
    for (rank, source) in answer.sources.iter().enumerate() {
        out.push_str(&format!(
            "[{}] {} (chunk {}, score {:.3})",
            rank + 1,
            source.doc_id,
            source.chunk_id,
            source.scores.combined_score
        ));
        if let Some(article) = source.article_no {
            out.push_str(&format!(", article {article}"));
        }
        if let Some(section) = &source.section_title {
            out.push_str(&format!(", {section}"));
        }
        out.push('\n');
        out.push_str(&format!("    {}\n", source.snippet.trim()));
    }
    out
}
