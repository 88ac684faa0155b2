use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use ragcache_rag::{route_section, RagChain, RagConfig, SectionFilter};

const DEFAULT_CONFIG: &str = "ragcache.toml";

#[derive(Parser, Debug)]
#[command(name = "ragcache", version, about = "Cached retrieval-augmented answering")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides `persistence_dir` from the config file.
    #[arg(long = "data-dir", global = true)]
    data_dir: Option<PathBuf>,
    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Chunk, embed and index a document.
    Ingest {
        /// File to read; use --text to pass the document inline.
        input: Option<PathBuf>,
        #[arg(long, conflicts_with = "input")]
        text: Option<String>,
        /// Defaults to the input file stem.
        #[arg(long = "doc-id")]
        doc_id: Option<String>,
        #[arg(long, default_value = "summary")]
        section: String,
    },
    /// Answer a question from the indexed documents.
    Ask {
        question: String,
        /// Section to search, or "all". Routed from the question when omitted.
        #[arg(long)]
        section: Option<String>,
        #[arg(long = "no-cache", action = ArgAction::SetTrue)]
        no_cache: bool,
    },
    /// Show index size, readiness and the current cache version.
    Status,
    /// Forget the stored conversation for the configured chat id.
    ResetHistory,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let mut config = RagConfig::load(&config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))?;
    if let Some(dir) = &cli.data_dir {
        config.persistence_dir = dir.clone();
    }
    debug!(
        config = %config_path.display(),
        dir = %config.persistence_dir.display(),
        "resolved configuration"
    );
    let chain = RagChain::from_config(config).context("failed to open rag chain")?;

    match cli.command {
        Commands::Ingest {
            input,
            text,
            doc_id,
            section,
        } => {
            let (body, doc_id) = resolve_document(input.as_deref(), text, doc_id)?;
            let report = chain.ingest(&body, &doc_id, &section)?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "[ragcache] Indexed {} chunks for '{}' (section {})",
                    report.chunks, report.doc_id, report.section
                );
                println!("[ragcache] Cache version:  {}", report.version);
            }
        }
        Commands::Ask {
            question,
            section,
            no_cache,
        } => {
            let filter = match section {
                Some(section) => SectionFilter::parse(&section),
                None => route_section(&question),
            };
            let answer = chain.query(&question, &filter, !no_cache);
            if cli.json {
                print_json(&answer)?;
            } else {
                println!("[ragcache] Section:   {}", filter);
                println!("[ragcache] Document:  {}", answer.doc_id);
                println!("[ragcache] Source:    {}", answer.source.as_str());
                println!();
                println!("{}", answer.answer);
            }
        }
        Commands::Status => {
            let status = chain.status();
            if cli.json {
                print_json(&status)?;
            } else {
                println!("[ragcache] Chunks:     {}", status.document_count);
                println!("[ragcache] Dimension:  {}", status.dimension);
                println!("[ragcache] Trained:    {}", status.index_trained);
                println!("[ragcache] Ready:      {}", status.ready);
                println!("[ragcache] Version:    {}", status.version);
            }
        }
        Commands::ResetHistory => {
            chain.reset_history()?;
            if !cli.json {
                println!(
                    "[ragcache] Cleared history for '{}'",
                    chain.config().chat_id
                );
            }
        }
    }
    chain.shutdown()?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn resolve_document(
    input: Option<&Path>,
    text: Option<String>,
    doc_id: Option<String>,
) -> Result<(String, String)> {
    match (input, text) {
        (Some(path), None) => {
            let body = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let doc_id = match doc_id {
                Some(id) => id,
                None => path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().to_string())
                    .ok_or_else(|| anyhow!("cannot derive a doc id from {}", path.display()))?,
            };
            Ok((body, doc_id))
        }
        (None, Some(text)) => {
            let doc_id = doc_id.ok_or_else(|| anyhow!("--doc-id is required with --text"))?;
            Ok((text, doc_id))
        }
        _ => bail!("pass either a file or --text"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
