use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use skimmer_client::HttpExtractor;
use skimmer_core::job::{JobStatus, NewJob};
use skimmer_core::job_queue::JobQueue;
use skimmer_core::models::{NewContent, NewMedia};
use skimmer_core::traits::{ContentStore, Extractor};
use skimmer_core::util::domain_of;
use skimmer_core::{
    DomainPolicy, DomainPolicyTable, EventBus, JobDefaults, LimiterConfig, MaintenanceConfig,
    MaintenanceTask, PoolConfig, PoolLoad, RateLimiterService, TracingWorkerReporter, WorkerPool,
    system_clock,
};
use skimmer_db::{Backends, Database, DatabaseConfig, StoreBackend};

#[derive(Parser)]
#[command(name = "skimmer", version, about = "Rate-limited content extraction queue")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract a single page now, bypassing the queue
    Extract {
        /// Target URL
        #[arg(short, long)]
        url: String,

        /// Save content to the database (requires DATABASE_URL)
        #[arg(long, default_value_t = false)]
        save: bool,

        /// Allow private and loopback addresses
        #[arg(long, default_value_t = false)]
        allow_private: bool,
    },

    /// Queue extraction jobs
    Enqueue {
        /// Target URL (omit when using --file)
        #[arg(short, long, required_unless_present = "file")]
        url: Option<String>,

        /// CSV file with a `url` column and optional `type`, `scope`, `priority`
        #[arg(short, long, conflicts_with = "url")]
        file: Option<PathBuf>,

        /// Job type
        #[arg(long = "type")]
        kind: Option<String>,

        /// Policy sub-scope (e.g. proxy strategy)
        #[arg(long)]
        scope: Option<String>,

        /// Higher runs first
        #[arg(short, long)]
        priority: Option<i32>,

        /// Total attempts before the job fails
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Show one job
    Status {
        /// Job ID
        id: Uuid,
    },

    /// List jobs
    List {
        /// Filter by state (queued, active, delayed, completed, failed, cancelled)
        #[arg(short, long)]
        status: Option<String>,

        /// Number of jobs to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Cancel a queued or delayed job
    Cancel {
        /// Job ID
        id: Uuid,
    },

    /// Run a worker pool until interrupted
    Work {
        /// Number of workers (defaults to SKIMMER_WORKERS)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Skip the periodic maintenance task
        #[arg(long, default_value_t = false)]
        no_maintenance: bool,
    },

    /// Run one maintenance pass and print what it did
    Maintain,

    /// Show domain rate-limit policies
    Policies {
        /// Resolve the policy for this URL or domain
        #[arg(short, long)]
        domain: Option<String>,

        /// Sub-scope to resolve with --domain
        #[arg(short, long, requires = "domain")]
        scope: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("skimmer=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Extract {
            url,
            save,
            allow_private,
        } => {
            let db = if save { Some(connect_db().await?) } else { None };
            cmd_extract(&url, allow_private, db.as_ref()).await?;
        }
        Commands::Enqueue {
            url,
            file,
            kind,
            scope,
            priority,
            max_attempts,
        } => {
            let backends = connect_backends().await?;
            let template = JobTemplate {
                kind,
                scope,
                priority,
                max_attempts,
            };
            match (url, file) {
                (_, Some(file)) => cmd_enqueue_csv(&file, &template, &backends).await?,
                (Some(url), None) => cmd_enqueue(&url, &template, &backends).await?,
                (None, None) => anyhow::bail!("either --url or --file is required"),
            }
        }
        Commands::Status { id } => {
            let backends = connect_backends().await?;
            cmd_status(id, &backends).await?;
        }
        Commands::List { status, limit } => {
            let backends = connect_backends().await?;
            cmd_list(status.as_deref(), limit, &backends).await?;
        }
        Commands::Cancel { id } => {
            let backends = connect_backends().await?;
            cmd_cancel(id, &backends).await?;
        }
        Commands::Work {
            workers,
            no_maintenance,
        } => {
            let backends = connect_backends().await?;
            cmd_work(workers, !no_maintenance, backends).await?;
        }
        Commands::Maintain => {
            let backends = connect_backends().await?;
            cmd_maintain(backends).await?;
        }
        Commands::Policies { domain, scope } => {
            let table = DomainPolicyTable::from_env()?;
            cmd_policies(&table, domain.as_deref(), scope.as_deref())?;
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and run migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()
        .context("DATABASE_URL not set. Required for --save and queue commands.")?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(db)
}

/// Queue commands only make sense against a shared PostgreSQL queue.
async fn connect_backends() -> Result<Backends> {
    let db = connect_db().await?;
    Ok(Backends::postgres(db, JobDefaults::from_env()?))
}

fn build_limiter(backends: &Backends, load: PoolLoad) -> Result<RateLimiterService<StoreBackend>> {
    Ok(RateLimiterService::new(
        backends.store.clone(),
        DomainPolicyTable::from_env()?,
        Arc::new(load),
        system_clock(),
        LimiterConfig::from_env()?,
    ))
}

// ---------------------------------------------------------------------------
// Extract
// ---------------------------------------------------------------------------

async fn cmd_extract(url: &str, allow_private: bool, db: Option<&Database>) -> Result<()> {
    let mut extractor = HttpExtractor::new().context("Failed to create HTTP client")?;
    if allow_private {
        extractor = extractor.allow_private_urls();
    }

    tracing::info!("Extracting {}", url);
    let extracted = extractor.extract(url).await.map_err(|e| anyhow::anyhow!(e))?;

    tracing::info!(
        kind = %extracted.kind,
        media = extracted.media.len(),
        bytes = extracted.content.len(),
        success = extracted.success,
        "Extraction complete"
    );
    for problem in &extracted.errors {
        tracing::warn!("{problem}");
    }

    if let Some(db) = db {
        let repo = db.content_repo();
        let previous = repo.get_latest(url).await.map_err(|e| anyhow::anyhow!(e))?;

        let content = NewContent::from_extracted(Uuid::new_v4(), url, &extracted);
        let changed = match &previous {
            Some(prev) => prev.content_hash != content.content_hash,
            None => true,
        };

        let id = repo
            .save_content(content)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        for item in &extracted.media {
            repo.save_media(NewMedia::from_item(id, item))
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
        }

        match (changed, previous.is_some()) {
            (true, true) => tracing::info!(%id, "Content CHANGED, saved new snapshot"),
            (true, false) => tracing::info!(%id, "First extraction, saved"),
            (false, _) => tracing::info!(%id, "Content unchanged, saved snapshot"),
        }
    }

    println!("{}", serde_json::to_string_pretty(&extracted)?);

    Ok(())
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Options applied to every job from one `enqueue` invocation.
struct JobTemplate {
    kind: Option<String>,
    scope: Option<String>,
    priority: Option<i32>,
    max_attempts: Option<u32>,
}

impl JobTemplate {
    fn build(&self, row: CsvJob) -> NewJob {
        let mut job = NewJob::new(row.url);
        if let Some(kind) = row.kind.or_else(|| self.kind.clone()) {
            job = job.with_kind(kind);
        }
        if let Some(scope) = row.scope.or_else(|| self.scope.clone()) {
            job = job.with_scope(scope);
        }
        if let Some(priority) = row.priority.or(self.priority) {
            job = job.with_priority(priority);
        }
        if let Some(max) = self.max_attempts {
            job = job.with_max_attempts(max);
        }
        job
    }
}

#[derive(Debug, Deserialize)]
struct CsvJob {
    url: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    priority: Option<i32>,
}

impl CsvJob {
    fn from_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            kind: None,
            scope: None,
            priority: None,
        }
    }
}

async fn cmd_enqueue(url: &str, template: &JobTemplate, backends: &Backends) -> Result<()> {
    let job = backends
        .queue
        .enqueue(template.build(CsvJob::from_url(url)))
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    tracing::info!(job_id = %job.id, "Job queued");
    println!("{}", job.id);
    Ok(())
}

async fn cmd_enqueue_csv(path: &Path, template: &JobTemplate, backends: &Backends) -> Result<()> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;

    let mut queued = 0usize;
    let mut rejected = 0usize;
    for (line, row) in reader.deserialize::<CsvJob>().enumerate() {
        // Header is line 1.
        let line = line + 2;
        let row = row.with_context(|| format!("Invalid CSV row at line {line}"))?;
        let url = row.url.clone();
        match backends.queue.enqueue(template.build(row)).await {
            Ok(job) => {
                queued += 1;
                println!("{}\t{}", job.id, job.url);
            }
            Err(e @ skimmer_core::AppError::ValidationError(_)) => {
                rejected += 1;
                tracing::warn!(line, %url, error = %e, "Skipping row");
            }
            Err(e) => return Err(anyhow::anyhow!(e)),
        }
    }

    tracing::info!(queued, rejected, "CSV import finished");
    Ok(())
}

async fn cmd_status(id: Uuid, backends: &Backends) -> Result<()> {
    let job = backends
        .queue
        .get(id)
        .await
        .map_err(|e| anyhow::anyhow!(e))?
        .with_context(|| format!("Job not found: {id}"))?;

    println!("Job {}", job.id);
    println!("  url:       {}", job.url);
    println!("  type:      {}", job.kind);
    println!("  state:     {}", job.status);
    println!(
        "  progress:  {} ({}%)",
        job.progress.status, job.progress.percentage
    );
    println!("  attempts:  {}/{}", job.attempts, job.max_attempts);
    println!("  priority:  {}", job.priority);
    println!(
        "  created:   {}",
        job.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if job.status == JobStatus::Delayed {
        println!(
            "  next try:  {}",
            job.not_before.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(worker) = &job.worker_id {
        println!("  worker:    {worker}");
    }
    if let Some(result) = &job.result {
        println!("  content:   {}", result.content_id);
        if let Some(title) = &result.title {
            println!("  title:     {title}");
        }
    }
    if let Some(error) = &job.error {
        println!("  error:     {error}");
    }

    Ok(())
}

async fn cmd_list(status: Option<&str>, limit: usize, backends: &Backends) -> Result<()> {
    let status = status
        .map(|s| s.parse::<JobStatus>().map_err(|e| anyhow::anyhow!(e)))
        .transpose()?;

    let jobs = backends
        .queue
        .list(status, limit)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    for job in &jobs {
        println!(
            "  {} [{:>9}] {:>3}% {}/{} {}",
            job.id,
            job.status,
            job.progress.percentage,
            job.attempts,
            job.max_attempts,
            job.url,
        );
    }
    println!("\nTotal: {} jobs", jobs.len());

    Ok(())
}

async fn cmd_cancel(id: Uuid, backends: &Backends) -> Result<()> {
    let cancelled = backends
        .queue
        .cancel(id)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;

    if !cancelled {
        anyhow::bail!("Job {id} is active or finished and cannot be cancelled");
    }
    println!("Cancelled {id}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

async fn cmd_work(workers: Option<usize>, maintenance: bool, backends: Backends) -> Result<()> {
    let mut config = PoolConfig::from_env()?;
    if let Some(workers) = workers {
        config = config.with_workers(workers);
    }

    let load = PoolLoad::new(config.workers);
    let limiter = build_limiter(&backends, load.clone())?;
    let pool = WorkerPool::new(
        backends.queue.clone(),
        HttpExtractor::with_timeout(config.extract_timeout)?,
        backends.content.clone(),
        limiter.clone(),
        EventBus::default(),
        &config,
        load,
    );

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    tracing::info!(workers = pool.size(), "Starting worker pool, press Ctrl+C to stop");
    pool.spawn(&tracker, &cancel, TracingWorkerReporter);
    if maintenance {
        MaintenanceTask::new(backends.queue.clone(), limiter, MaintenanceConfig::from_env()?)
            .spawn(&tracker, &cancel);
    }
    tracker.close();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("Shutdown signal received, releasing jobs");
    cancel.cancel();
    tracker.wait().await;

    Ok(())
}

async fn cmd_maintain(backends: Backends) -> Result<()> {
    let limiter = build_limiter(&backends, PoolLoad::new(1))?;
    let task = MaintenanceTask::new(backends.queue, limiter, MaintenanceConfig::from_env()?);
    let report = task.run_once().await;

    println!("Orphaned jobs requeued: {}", report.orphans_requeued);
    println!("Terminal jobs purged:   {}", report.jobs_purged);
    println!("Buckets tracked:        {}", report.buckets_tracked);
    println!("Store entries purged:   {}", report.store_entries_purged);
    Ok(())
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

fn describe(policy: &DomainPolicy) -> String {
    let mut line = format!("{} req / {}s", policy.requests, policy.window.as_secs_f64());
    if let Some(burst) = policy.burst {
        line.push_str(&format!(
            ", burst +{burst}, penalty {}s",
            policy.burst_policy().map_or(0.0, |b| b.penalty_duration().as_secs_f64())
        ));
    }
    line
}

fn cmd_policies(table: &DomainPolicyTable, domain: Option<&str>, scope: Option<&str>) -> Result<()> {
    if let Some(raw) = domain {
        // Accept full URLs as well as bare domains.
        let domain = domain_of(raw).unwrap_or_else(|| raw.to_lowercase());
        let policy = table.resolve(&domain, scope);
        match scope {
            Some(scope) => println!("{domain} @ {scope}: {}", describe(policy)),
            None => println!("{domain}: {}", describe(policy)),
        }
        return Ok(());
    }

    println!("default: {}", describe(table.default_policy()));
    for (domain, scope, policy) in table.entries() {
        match scope {
            Some(scope) => println!("  {domain} @ {scope}: {}", describe(&policy)),
            None => println!("{domain}: {}", describe(&policy)),
        }
    }

    Ok(())
}
