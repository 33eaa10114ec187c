//! CLI command implementations.
//!
//! Each `run_*` function is one `labeler` subcommand. Results go to stdout;
//! progress and diagnostics go through `tracing` to stderr.

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::export::{format_summary, write_outputs};
use crate::index::{InMemoryIndex, VectorIndex};
use crate::ingest::{index_is_stale, index_library, load_library, save_library, SampleIngestor};
use crate::input::{load_conversations, load_rows};
use crate::llm::OpenAiChatBackend;
use crate::models::SampleLibrary;
use crate::orchestrator::LabelingOrchestrator;
use crate::redact;
use crate::retrieval::SimilarityRetriever;

pub const LIBRARY_FILE: &str = "samples.json";
pub const INDEX_FILE: &str = "index.json";

fn output_dir(config: &Config, out: Option<&Path>) -> PathBuf {
    out.map(Path::to_path_buf)
        .unwrap_or_else(|| config.output.dir.clone())
}

/// Ingest a sample file into `samples.json` + `index.json`.
///
/// Unless `replace` is set, records already in `samples.json` are kept and
/// rows with the same `sample_id` overwrite them.
pub async fn run_ingest(
    config: &Config,
    samples: &Path,
    origin: Option<&str>,
    replace: bool,
    out: Option<&Path>,
) -> Result<()> {
    let dir = output_dir(config, out);
    let library_path = dir.join(LIBRARY_FILE);
    let rows = load_rows(samples)?;

    let base = if !replace && library_path.exists() {
        Some(load_library(&library_path)?)
    } else {
        None
    };

    let origin = origin
        .map(str::to_string)
        .or_else(|| samples.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "samples".to_string());

    let embedder = create_embedder(&config.embedding)?;
    let index = Arc::new(InMemoryIndex::new());
    let ingestor = SampleIngestor::new(
        embedder,
        index.clone(),
        config.retrieval.collection.clone(),
    );
    let report = ingestor.ingest(&rows, &origin, base.as_ref()).await?;

    save_library(&library_path, &report.library)?;
    index.save(&dir.join(INDEX_FILE))?;

    println!("Ingest samples: {}", samples.display());
    println!("  rows read:   {}", rows.len());
    println!("  library:     {} samples", report.library.len());
    println!("  embedded:    {}", report.embedded);
    println!("  skipped:     {}", report.skipped);
    for error in &report.errors {
        println!("    {}", error);
    }
    println!("  written to:  {}", dir.display());
    Ok(())
}

/// Sample library and index for a labeling or retrieval run.
async fn prepare_library(
    config: &Config,
    samples: Option<&Path>,
    dir: &Path,
) -> Result<(SampleLibrary, Arc<InMemoryIndex>)> {
    let embedder = create_embedder(&config.embedding)?;

    if let Some(path) = samples {
        let rows = load_rows(path)?;
        let index = Arc::new(InMemoryIndex::new());
        let ingestor =
            SampleIngestor::new(embedder, index.clone(), config.retrieval.collection.clone());
        let origin = path.display().to_string();
        let report = ingestor.ingest(&rows, &origin, None).await?;
        return Ok((report.library, index));
    }

    let library_path = dir.join(LIBRARY_FILE);
    if !library_path.exists() {
        warn!(
            path = %library_path.display(),
            "no sample library found; labeling zero-shot"
        );
        return Ok((SampleLibrary::new("empty"), Arc::new(InMemoryIndex::new())));
    }

    let library = load_library(&library_path)?;
    let index_path = dir.join(INDEX_FILE);
    let index = if index_path.exists() {
        InMemoryIndex::load(&index_path)?
    } else {
        InMemoryIndex::new()
    };

    // Vectors from another embedding model are not comparable.
    let collection = &config.retrieval.collection;
    if !embedder.is_corpus_relative()
        && index_is_stale(embedder.as_ref(), &index, collection, &library)
    {
        warn!(
            model = embedder.model_name(),
            "stored vectors do not match the embedder; rebuilding index"
        );
        index_library(embedder.as_ref(), &index, collection, &library).await?;
    }

    info!(samples = library.len(), vectors = index.count(collection), "loaded sample library");
    Ok((library, Arc::new(index)))
}

/// Label a conversation file and write every sink.
pub async fn run_label(
    config: &Config,
    conversations: &Path,
    samples: Option<&Path>,
    out: Option<&Path>,
) -> Result<()> {
    // Validate input before any network call.
    let conversations = load_conversations(conversations)?;
    let dir = output_dir(config, out);

    let (library, index) = prepare_library(config, samples, &dir).await?;
    let embedder = create_embedder(&config.embedding)?;
    let backend = Arc::new(OpenAiChatBackend::new(&config.llm)?);
    let orchestrator = LabelingOrchestrator::from_config(config, embedder, index, backend)?;

    let report = orchestrator.label_batch(&conversations, &library).await?;
    let paths = write_outputs(&dir, &report)?;

    print!("{}", format_summary(&report));
    println!();
    println!("Labels:  {}", paths.labels.display());
    println!("Skipped: {}", paths.skipped.display());
    println!("Failed:  {}", paths.failed.display());
    Ok(())
}

/// Print the nearest samples for each conversation as JSON lines.
pub async fn run_retrieve(
    config: &Config,
    conversations: &Path,
    samples: Option<&Path>,
    top_k: Option<usize>,
    out: Option<&Path>,
) -> Result<()> {
    let conversations = load_conversations(conversations)?;
    let dir = output_dir(config, out);
    let (library, index) = prepare_library(config, samples, &dir).await?;
    if library.is_empty() {
        bail!("No samples available. Run `labeler ingest` or pass --samples.");
    }

    let embedder = create_embedder(&config.embedding)?;
    let retriever = SimilarityRetriever::new(embedder, index, config.retrieval.collection.clone());
    let top_k = top_k.unwrap_or(config.retrieval.top_k);

    for convo in &conversations {
        let query = redact::mask(&convo.message_text());
        let matches = retriever
            .retrieve_text(&query, &library, top_k, config.retrieval.min_similarity)
            .await;
        let line = serde_json::json!({
            "conversation_id": convo.id,
            "matches": matches,
        });
        println!("{}", serde_json::to_string(&line)?);
    }
    Ok(())
}

/// Mask `text`, or stdin when no text is given.
pub fn run_mask(text: Option<&str>) -> Result<()> {
    let input = match text {
        Some(t) => t.to_string(),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };
    print!("{}", redact::mask(&input));
    if !input.ends_with('\n') {
        println!();
    }
    Ok(())
}
