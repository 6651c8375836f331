//! regmap CLI: index policy documents and query them with hybrid retrieval.
//!
//! ```bash
//! regmap index policies/
//! regmap query "Multi-factor authentication for remote access" --top-k 5
//! regmap query "log retention" --no-hyde --json
//! regmap stats
//! regmap entity control:MFA
//! ```

mod output;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use regmap_config::{Config, VectorBackend};
use regmap_index::qdrant::{QdrantConfig, QdrantStore};
use regmap_index::{
    ChatPassageGenerator, EmbeddingProvider, EntityRef, FlatVectorIndex, HttpEmbeddings,
    HybridRetriever, IndexStore, Indexer, IndexerConfig, JsonCorpusProvider, MarkdownProvider,
    PassageGenerator, SearchOptions, SectionProvider, VectorStore,
};

/// Map regulatory requirements to the policy sections that address them.
#[derive(Parser, Debug)]
#[command(name = "regmap", version, about)]
pub struct Cli {
    /// Config file (default: ~/.config/regmap/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Index directory, overriding the configured one
    #[arg(long, global = true)]
    index_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse policies and build the lexical index, graph and embeddings
    Index {
        /// Directory of annotated markdown policies
        #[arg(required_unless_present = "corpus_json")]
        dir: Option<PathBuf>,

        /// Load documents from a JSON corpus instead
        #[arg(long, conflicts_with = "dir")]
        corpus_json: Option<PathBuf>,

        /// Skip embedding computation
        #[arg(long)]
        no_embed: bool,
    },

    /// Find policy sections for a requirement
    Query {
        /// Requirement text
        requirement: String,

        /// Number of results
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        #[arg(long)]
        no_lexical: bool,

        #[arg(long)]
        no_vector: bool,

        #[arg(long)]
        no_hyde: bool,

        #[arg(long)]
        no_graph: bool,

        /// Maximum graph expansion hops
        #[arg(long)]
        hops: Option<usize>,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show graph statistics
    Stats,

    /// Show the graph neighbourhood of an entity, e.g. `control:MFA`
    Entity {
        entity: String,
    },

    /// Print the effective configuration
    Config,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;
    let index_dir = cli.index_dir.clone().unwrap_or_else(|| config.index_dir());

    match cli.command {
        Command::Index {
            dir,
            corpus_json,
            no_embed,
        } => {
            let provider: Box<dyn SectionProvider> = match (corpus_json, dir) {
                (Some(path), _) => Box::new(JsonCorpusProvider::new(path)),
                (None, Some(dir)) => Box::new(MarkdownProvider::new(dir)),
                (None, None) => bail!("Either a markdown directory or --corpus-json is required"),
            };
            run_index(&config, &index_dir, provider.as_ref(), !no_embed).await
        }
        Command::Query {
            requirement,
            top_k,
            no_lexical,
            no_vector,
            no_hyde,
            no_graph,
            hops,
            json,
        } => {
            let mut options = search_options(&config);
            options.use_lexical &= !no_lexical;
            options.use_vector &= !no_vector;
            options.use_hyde &= !no_hyde;
            options.use_graph &= !no_graph;
            if let Some(hops) = hops {
                options.graph_max_hops = hops;
            }
            let top_k = top_k.unwrap_or(config.retrieval.top_k);
            run_query(&config, &index_dir, &requirement, top_k, &options, json).await
        }
        Command::Stats => run_stats(&index_dir),
        Command::Entity { entity } => run_entity(&index_dir, &entity),
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("regmap=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("regmap=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn search_options(config: &Config) -> SearchOptions {
    let retrieval = &config.retrieval;
    SearchOptions {
        use_lexical: retrieval.use_lexical,
        use_vector: retrieval.use_vector,
        use_hyde: retrieval.use_hyde,
        use_graph: retrieval.use_graph,
        per_retriever_k: retrieval.per_retriever_k,
        graph_max_hops: retrieval.graph_max_hops,
        rrf_k: retrieval.rrf_k,
        graph_score_scale: retrieval.graph_score_scale,
        embed_timeout: Duration::from_secs(retrieval.embed_timeout_secs),
        generate_timeout: Duration::from_secs(retrieval.generate_timeout_secs),
    }
}

/// Embedding provider, if enabled and a key is available.
fn build_embedder(config: &Config) -> Option<Arc<dyn EmbeddingProvider>> {
    let settings = &config.embedding;
    if !settings.enabled {
        return None;
    }
    let Some(api_key) = settings.resolved_api_key() else {
        warn!(
            "No embedding API key (set embedding.api_key or {}); vector retrieval disabled",
            settings.api_key_env
        );
        return None;
    };
    Some(Arc::new(
        HttpEmbeddings::new(Some(api_key))
            .with_model(settings.model.clone(), settings.dimensions)
            .with_base_url(settings.base_url.clone()),
    ))
}

/// Passage generator for HyDE, if enabled and a key is available.
fn build_generator(config: &Config) -> Option<Arc<dyn PassageGenerator>> {
    let settings = &config.generation;
    if !settings.enabled {
        return None;
    }
    let api_key = settings.resolved_api_key()?;
    Some(Arc::new(
        ChatPassageGenerator::new(settings.base_url.clone(), settings.model.clone(), Some(api_key))
            .with_max_tokens(settings.max_tokens)
            .with_temperature(settings.temperature),
    ))
}

fn qdrant_config(config: &Config) -> QdrantConfig {
    QdrantConfig {
        url: config.vector.qdrant_url.clone(),
        api_key: config.vector.resolved_api_key(),
        collection_name: config.vector.collection.clone(),
        dimensions: config.embedding.dimensions,
    }
}

async fn run_index(
    config: &Config,
    index_dir: &Path,
    provider: &dyn SectionProvider,
    embed: bool,
) -> Result<()> {
    let store = IndexStore::open(index_dir)?;
    let mut indexer = Indexer::new(IndexerConfig {
        min_chunk_chars: config.index.min_chunk_chars,
        embed,
        parallel_graph: config.index.parallel_graph,
    });

    let flat = Arc::new(FlatVectorIndex::new());
    if embed {
        if let Some(embedder) = build_embedder(config) {
            let vectors: Arc<dyn VectorStore> = match config.vector.backend {
                VectorBackend::Flat => flat.clone() as Arc<dyn VectorStore>,
                VectorBackend::Qdrant => {
                    let qdrant = QdrantStore::from_config(&qdrant_config(config)).await?;
                    qdrant.reset_collection().await?;
                    Arc::new(qdrant)
                }
            };
            indexer = indexer.with_embeddings(embedder, vectors);
        }
    }

    let built = indexer.index(provider, &store).await?;
    if config.vector.backend == VectorBackend::Flat && built.stats.embedded_chunks > 0 {
        store.save_vectors(&flat).await?;
    }

    info!("Indexes written to {:?}", store.dir());
    println!("{}", output::format_index_stats(&built.stats));
    Ok(())
}

async fn run_query(
    config: &Config,
    index_dir: &Path,
    requirement: &str,
    top_k: usize,
    options: &SearchOptions,
    json: bool,
) -> Result<()> {
    let store = IndexStore::open(index_dir)?;
    if !store.has_lexical() {
        bail!(
            "No index found in {:?}. Run `regmap index <dir>` first.",
            index_dir
        );
    }

    let lexical = store.load_lexical()?;
    let mut retriever = HybridRetriever::new(Arc::new(lexical));

    if options.use_graph {
        if let Some(graph) = store.load_graph()? {
            retriever = retriever.with_graph(Arc::new(graph));
        }
    }

    if options.use_vector || options.use_hyde {
        if let Some(embedder) = build_embedder(config) {
            retriever = retriever.with_embedder(embedder);
            let vectors: Option<Arc<dyn VectorStore>> = match config.vector.backend {
                VectorBackend::Flat => store
                    .load_vectors()?
                    .map(|flat| Arc::new(flat) as Arc<dyn VectorStore>),
                VectorBackend::Qdrant => {
                    let qdrant = QdrantStore::from_config(&qdrant_config(config)).await?;
                    Some(Arc::new(qdrant) as Arc<dyn VectorStore>)
                }
            };
            if let Some(vectors) = vectors {
                retriever = retriever.with_vector_store(vectors);
            }
        }
        if options.use_hyde {
            if let Some(generator) = build_generator(config) {
                retriever = retriever.with_generator(generator);
            }
        }
    }

    let outcome = retriever
        .search_detailed(requirement, top_k, options)
        .await
        .context("Search failed")?;

    let rendered = if json {
        output::format_json(requirement, &outcome)?
    } else {
        output::format_human(requirement, &outcome)
    };
    println!("{}", rendered);
    Ok(())
}

fn run_stats(index_dir: &Path) -> Result<()> {
    let store = IndexStore::open(index_dir)?;
    let stats = match store.load_graph_stats()? {
        Some(stats) => stats,
        None => match store.load_graph()? {
            Some(graph) => graph.stats(),
            None => bail!("No graph found in {:?}. Run `regmap index <dir>` first.", index_dir),
        },
    };
    let chunks = if store.has_lexical() {
        Some(store.load_lexical()?.len())
    } else {
        None
    };
    println!("{}", output::format_graph_stats(&stats, chunks));
    Ok(())
}

fn run_entity(index_dir: &Path, entity: &str) -> Result<()> {
    let entity: EntityRef = entity
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))
        .context("Expected an entity as type:value, e.g. control:MFA")?;

    let store = IndexStore::open(index_dir)?;
    let Some(graph) = store.load_graph()? else {
        bail!("No graph found in {:?}. Run `regmap index <dir>` first.", index_dir);
    };

    let node_id = entity.node_id();
    let Some(context) = graph.entity_context(&node_id) else {
        bail!("Entity not found in graph: {}", node_id);
    };
    println!("{}", output::format_entity(&graph, &context));
    Ok(())
}
