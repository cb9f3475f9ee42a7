//! Commands module
//!
//! `run` drives a job through an in-process coordinator; `status`, `patterns`
//! and `config` are read-only.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use tracing::{info, warn};

use rhetor_core::coordinator::job_status;
use rhetor_core::engine::{HashingEmbedder, PatternEngine};
use rhetor_core::impls::{CatalogExplainer, InMemoryExemplarIndex, LocalMediaSource, SidecarTranscriber};
use rhetor_core::ports::StateStore;
use rhetor_core::store::{InMemoryStore, SqliteStore};
use rhetor_core::{Coordinator, CoordinatorBuilder, JobId, JobOutput, JobRequest, JobState, PipelineConfig, StageKind, WorkerPool};

#[derive(Subcommand)]
pub enum Commands {
    /// Run one job to completion and print its result
    Run(RunArgs),
    /// Show the status of a job stored in a database
    Status {
        /// Job id (`job-<ulid>` or bare ULID)
        job_id: String,

        /// SQLite database URL
        #[arg(long, env = "RHETOR_DB")]
        db: String,
    },
    /// List the pattern catalog
    Patterns,
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args)]
pub struct RunArgs {
    /// Media reference: a path under --media-root or a video URL / id
    #[arg(long, conflicts_with = "subject", required_unless_present = "subject")]
    media: Option<String>,

    /// Subject whose speech should be searched for
    #[arg(long)]
    subject: Option<String>,

    /// Directory the local media source reads from
    #[arg(long, env = "RHETOR_MEDIA_ROOT", default_value = ".")]
    media_root: PathBuf,

    /// SQLite database URL (in-memory when omitted)
    #[arg(long, env = "RHETOR_DB")]
    db: Option<String>,

    /// Number of stage workers
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Finish after this stage (ingest, transcribe)
    #[arg(long)]
    stop_after: Option<StageKind>,

    /// Free-form label echoed in status and output
    #[arg(long)]
    label: Option<String>,

    /// Give up waiting after this many seconds
    #[arg(long, default_value_t = 3600)]
    timeout_secs: u64,

    /// Print the full JSON output instead of a summary
    #[arg(long)]
    json: bool,
}

pub async fn handle_command(command: Commands, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    match command {
        Commands::Run(args) => run(args, config).await,
        Commands::Status { job_id, db } => status(&job_id, &db).await,
        Commands::Patterns => {
            for pattern in &config.engine.catalog {
                println!("{:<22} {:<22} {}", pattern.slug, pattern.name, pattern.description);
            }
            Ok(())
        }
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

async fn build_coordinator(args: &RunArgs, config: PipelineConfig) -> Result<Arc<Coordinator>> {
    let embedder = Arc::new(HashingEmbedder::new(config.engine.retrieval.dimensions));
    let index = InMemoryExemplarIndex::from_exemplars(&config.engine.exemplars, embedder.as_ref());
    let engine = PatternEngine::new(config.engine.clone(), embedder)
        .with_index(Arc::new(index))
        .with_explainer(Arc::new(CatalogExplainer));

    let builder = CoordinatorBuilder::new(config).standard_stages(
        Arc::new(LocalMediaSource::new(&args.media_root)),
        Arc::new(SidecarTranscriber::new()),
        Arc::new(engine),
    );
    let builder = match &args.db {
        Some(url) => {
            let store = SqliteStore::connect(url)
                .await
                .with_context(|| format!("failed to open database {url}"))?;
            builder.store(Arc::new(store))
        }
        None => builder.store(Arc::new(InMemoryStore::new())),
    };
    Ok(builder.build().await?)
}

async fn run(args: RunArgs, config: PipelineConfig) -> Result<()> {
    let mut request = match (&args.media, &args.subject) {
        (Some(media), _) => JobRequest::reference(media)?,
        (None, Some(subject)) => JobRequest::subject(subject.clone()),
        (None, None) => bail!("either --media or --subject is required"),
    };
    if let Some(stage) = args.stop_after {
        request = request.with_stop_after(stage);
    }
    if let Some(label) = &args.label {
        request = request.with_label(label.clone());
    }

    let coordinator = build_coordinator(&args, config).await?;
    let pool = WorkerPool::spawn(args.workers.max(1), coordinator.clone());

    let job_id = coordinator.submit(request).await?;
    info!(%job_id, "job submitted");

    let timeout = Duration::from_secs(args.timeout_secs);
    let status = tokio::select! {
        status = coordinator.wait_for_terminal(job_id, timeout) => status?,
        _ = tokio::signal::ctrl_c() => {
            warn!(%job_id, "interrupted, cancelling job");
            coordinator.cancel(job_id).await?
        }
    };
    pool.shutdown_and_join().await;

    if status.state != JobState::Done {
        println!("{}", serde_json::to_string_pretty(&status)?);
        bail!("job {job_id} ended in {}", status.state);
    }

    let output = coordinator.result(job_id).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_summary(&output);
    }
    Ok(())
}

fn print_summary(output: &JobOutput) {
    println!("job {}: {}", output.job_id, output.state);
    if let Some(transcript) = &output.transcript {
        println!(
            "transcript: {} words, {:.1}s ({})",
            transcript.word_count(),
            transcript.duration_secs(),
            transcript.engine
        );
    }
    println!(
        "patterns: {} found, {} suppressed",
        output.summary.total, output.summary.suppressed
    );
    for (pattern, count) in &output.summary.by_type {
        println!("  {pattern:<22} {count}");
    }
    for m in output.pattern_matches.iter().filter(|m| !m.suppressed) {
        println!(
            "[{:>7.1}s] {:<20} {:.2}  \"{}\"",
            m.start_time, m.pattern_type, m.confidence, m.text
        );
        if let Some(rationale) = &m.rationale {
            println!("           {rationale}");
        }
    }
    for failure in &output.provenance.partial_failures {
        println!("degraded: {:?}: {}", failure.layer, failure.message);
    }
}

async fn status(job_id: &str, db: &str) -> Result<()> {
    let job_id: JobId = job_id.parse()?;
    let store = SqliteStore::connect(db)
        .await
        .with_context(|| format!("failed to open database {db}"))?;
    let Some((job, tasks)) = store.load_job(job_id).await? else {
        bail!("job {job_id} not found");
    };
    println!("{}", serde_json::to_string_pretty(&job_status(&job, &tasks))?);
    Ok(())
}
