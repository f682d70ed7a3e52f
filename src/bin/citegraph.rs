//! Citegraph CLI: run the ingestion pipeline and query the store.
//!
//! Usage:
//!   citegraph ingest --seed 2401.00001 --depth 1 --max-papers 100
//!   citegraph search "lattice gauge theory" --hybrid
//!   citegraph paper 2401.00001 --references
//!   citegraph stats

use anyhow::Context;
use citegraph::client::{
    ErrorCounters, FailoverAnalysis, HttpAnalysisClient, HttpMetadataClient, OfflineAnalysis,
    RateLimitedAnalysis, RateLimitedMetadata, RetryPolicy, TokenBucket,
};
use citegraph::config::{ProcessConfig, RunConfig};
use citegraph::model::PaperId;
use citegraph::pipeline::{PipelineCoordinator, RunState};
use citegraph::query::ReadFacade;
use citegraph::store::{
    GraphStore, SqliteGraphStore, SqliteVectorStore, StoreWriter, VectorFilter, VectorStore,
};
use citegraph::{AnalysisProvider, MetadataProvider};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "citegraph",
    version,
    about = "Citation-network knowledge base engine"
)]
struct Cli {
    /// Path to the graph database file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Path to the vector database file
    #[arg(long, global = true)]
    vectors: Option<PathBuf>,

    /// Use the heuristic offline analyzer instead of the LLM endpoint
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover, enrich, and persist papers starting from seed ids
    Ingest {
        /// Seed paper ids (repeatable)
        #[arg(long = "seed", required_unless_present = "resume")]
        seeds: Vec<String>,
        /// BFS depth bound
        #[arg(long, default_value_t = 1)]
        depth: u32,
        /// Total paper bound (0 = unbounded)
        #[arg(long, default_value_t = 100)]
        max_papers: usize,
        /// Neighbors enqueued per paper
        #[arg(long, default_value_t = 50)]
        fanout: usize,
        /// Skip LLM analysis (summaries, concepts, citation labels)
        #[arg(long)]
        no_analyze: bool,
        /// Skip embedding generation
        #[arg(long)]
        no_embed: bool,
        /// Also expand through incoming citations
        #[arg(long)]
        expand_citations: bool,
        /// Resume from the checkpoint file
        #[arg(long)]
        resume: bool,
        /// Checkpoint file location
        #[arg(long, default_value = "citegraph-checkpoint.json")]
        checkpoint: PathBuf,
    },
    /// Re-embed papers whose vector write was deferred
    Backfill,
    /// Semantic search over the vector store
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Re-rank by citation influence
        #[arg(long)]
        hybrid: bool,
        /// Filter by primary category
        #[arg(long)]
        category: Option<String>,
    },
    /// Show one paper
    Paper {
        id: String,
        /// Include incoming citation edges
        #[arg(long)]
        citations: bool,
        /// Include outgoing reference edges
        #[arg(long)]
        references: bool,
    },
    /// Papers with similar embeddings
    Similar {
        id: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Citation neighborhood around a paper
    Neighborhood {
        id: String,
        #[arg(long, default_value_t = 2)]
        depth: usize,
    },
    /// Communities in the citation graph
    Clusters {
        #[arg(long, default_value_t = 3)]
        min_size: usize,
    },
    /// Store statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = ProcessConfig::from_env();
    if let Some(db) = &cli.db {
        config.store.graph_path = db.clone();
    }
    if let Some(vectors) = &cli.vectors {
        config.store.vector_store_path = vectors.clone();
    }

    let filter = config
        .log_level
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".into());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let graph = Arc::new(
        SqliteGraphStore::open(&config.store.graph_path)
            .context("opening graph store")?,
    );
    let vector = Arc::new(
        SqliteVectorStore::open(&config.store.vector_store_path, config.store.embedding_dim)
            .context("opening vector store")?,
    );
    let writer = Arc::new(StoreWriter::new(graph.clone(), vector.clone()));
    let errors = Arc::new(ErrorCounters::new());

    let metadata: Arc<dyn MetadataProvider> = Arc::new(RateLimitedMetadata::new(
        HttpMetadataClient::new(
            &config.provider.metadata_base_url,
            config.provider.metadata_api_key.clone(),
        )?,
        Arc::new(TokenBucket::per_second(
            config.provider.metadata_rps,
            Duration::from_secs(120),
        )),
        RetryPolicy::default(),
        errors.clone(),
    ));

    let analysis: Arc<dyn AnalysisProvider> = if cli.offline {
        // Local heuristics: no endpoint, no rate budget to govern.
        Arc::new(OfflineAnalysis::new(config.store.embedding_dim))
    } else {
        let primary: Arc<dyn AnalysisProvider> = Arc::new(HttpAnalysisClient::new(
            &config.provider.analysis.primary,
            &config.provider.analysis_model,
            &config.provider.embedding_model,
        )?);
        let selected: Arc<dyn AnalysisProvider> = match &config.provider.analysis.fallback {
            Some(fallback_url) => Arc::new(FailoverAnalysis::new(
                primary,
                Arc::new(HttpAnalysisClient::new(
                    fallback_url,
                    &config.provider.analysis_model,
                    &config.provider.embedding_model,
                )?),
                Duration::from_secs(config.provider.analysis.budget_window_secs),
            )),
            None => primary,
        };
        Arc::new(RateLimitedAnalysis::new(
            selected,
            Arc::new(TokenBucket::per_minute(
                config.provider.analysis_rpm,
                Duration::from_secs(300),
            )),
            RetryPolicy::default(),
            errors.clone(),
        ))
    };

    match cli.command {
        Commands::Ingest {
            seeds,
            depth,
            max_papers,
            fanout,
            no_analyze,
            no_embed,
            expand_citations,
            resume,
            checkpoint,
        } => {
            let mut run = RunConfig::from_seeds(
                seeds.iter().map(|s| PaperId::from(s.as_str())).collect(),
            );
            run.max_depth = depth;
            run.max_papers = if max_papers == 0 { None } else { Some(max_papers) };
            run.max_fanout_per_paper = fanout;
            run.analyze_enabled = !no_analyze;
            run.embed_enabled = !no_embed;
            run.expand_citations = expand_citations;
            run.resume = resume;

            let coordinator = Arc::new(PipelineCoordinator::new(
                metadata,
                analysis,
                writer,
                errors,
                Some(checkpoint),
            ));
            coordinator.start(run).await?;

            // Ctrl-C requests a cooperative stop; the run quiesces and
            // writes a final checkpoint.
            let stopper = coordinator.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\nstopping...");
                    let _ = stopper.stop().await;
                }
            });

            let reporter = coordinator.clone();
            let progress = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    let status = reporter.status();
                    if !status.running {
                        break;
                    }
                    println!(
                        "discovered {:>5}  fetched {:>5}  analyzed {:>5}  persisted {:>5}  ({:.1}%)",
                        status.discovered,
                        status.fetched,
                        status.analyzed,
                        status.persisted,
                        status.progress_percentage
                    );
                }
            });

            let final_state = coordinator.wait().await;
            progress.abort();

            let status = coordinator.status();
            println!(
                "run {:?}: {} persisted, {} discovered",
                final_state, status.persisted, status.discovered
            );
            if !status.errors_by_kind.is_empty() {
                println!("errors:");
                for (kind, count) in &status.errors_by_kind {
                    println!("  {:<32} {}", kind, count);
                }
            }
            if final_state == RunState::Failed {
                anyhow::bail!("run failed");
            }
        }
        Commands::Backfill => {
            let coordinator =
                PipelineCoordinator::new(metadata, analysis, writer, errors, None);
            let filled = coordinator.backfill_embeddings().await?;
            println!("backfilled {} embeddings", filled);
        }
        Commands::Search {
            query,
            limit,
            hybrid,
            category,
        } => {
            let facade = ReadFacade::new(graph, vector, analysis);
            let hits = if hybrid {
                facade.hybrid_search(&query, limit).await?
            } else {
                let filter = category.map(|c| VectorFilter {
                    category: Some(c),
                    year: None,
                });
                facade.semantic_search(&query, limit, filter.as_ref()).await?
            };
            for hit in hits {
                println!(
                    "{:.3}  {}  {}",
                    hit.score,
                    hit.summary.id,
                    hit.summary.title.as_deref().unwrap_or("(unresolved)")
                );
            }
        }
        Commands::Paper {
            id,
            citations,
            references,
        } => {
            let facade = ReadFacade::new(graph, vector, analysis);
            match facade.get_paper(&PaperId::from(id.as_str()), citations, references)? {
                Some(detail) => println!("{}", serde_json::to_string_pretty(&detail)?),
                None => anyhow::bail!("paper {} not found", id),
            }
        }
        Commands::Similar { id, limit } => {
            let facade = ReadFacade::new(graph, vector, analysis);
            for hit in facade.similar_papers(&PaperId::from(id.as_str()), limit)? {
                println!(
                    "{:.3}  {}  {}",
                    hit.score,
                    hit.summary.id,
                    hit.summary.title.as_deref().unwrap_or("(unresolved)")
                );
            }
        }
        Commands::Neighborhood { id, depth } => {
            let facade = ReadFacade::new(graph, vector, analysis);
            let (papers, edges) =
                facade.citation_neighborhood(&PaperId::from(id.as_str()), depth)?;
            println!("{} papers, {} edges", papers.len(), edges.len());
            for edge in edges {
                println!("  {} -[{}]-> {}", edge.src, edge.intent.as_str(), edge.dst);
            }
        }
        Commands::Clusters { min_size } => {
            let facade = ReadFacade::new(graph, vector, analysis);
            for cluster in facade.clusters(min_size)? {
                println!(
                    "cluster {} ({}): {} members",
                    cluster.id,
                    cluster.label.as_deref().unwrap_or("unlabeled"),
                    cluster.members.len()
                );
            }
        }
        Commands::Stats => {
            let stats = graph.stats()?;
            println!("papers:    {} ({} stubs)", stats.papers, stats.stubs);
            println!("citations: {}", stats.citations);
            println!("concepts:  {}", stats.concepts);
            println!("mentions:  {}", stats.mentions);
            println!("vectors:   {}", vector.count()?);
        }
    }

    Ok(())
}
