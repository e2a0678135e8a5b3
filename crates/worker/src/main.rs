use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use applyflow_ai::build_generator;
use applyflow_core::{FeatureFlag, JobId, JobStatus, NewJob, PromptId, Stage};
use applyflow_events::EventLog;
use applyflow_infra::event_log::RedisStreamsEventLog;
use applyflow_infra::pipeline::{Launcher, PipelineContext, PipelineProducer, Role, Topology};
use applyflow_infra::store::{ensure_schema, FeatureStore, JobRecordStore, PostgresStore};
use applyflow_infra::{retry_with_backoff, PipelineConfig};

#[derive(Parser)]
#[command(name = "applyflow-worker")]
#[command(about = "Job-application enrichment pipeline: workers and request producers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one pipeline role (or all of them) until interrupted
    Run {
        #[arg(value_enum)]
        role: RoleArg,
    },

    /// Create tables and seed feature flags and default prompts
    Migrate,

    /// Request creation of a job record
    CreateJob {
        #[arg(long)]
        title: String,

        #[arg(long)]
        company: String,

        #[arg(long, default_value = "")]
        link: String,

        #[arg(long, default_value = "")]
        description: String,
    },

    /// Request (re)generation of one stage's output for a job
    Generate {
        #[arg(value_enum)]
        stage: StageArg,

        job_id: JobId,

        /// Stored prompt to use instead of the stage default
        #[arg(long)]
        prompt_id: Option<PromptId>,
    },

    /// Request a status change (open, applied, rejected, closed)
    SetStatus { job_id: JobId, status: JobStatus },

    /// List jobs, newest first
    ListJobs {
        #[arg(short, long)]
        status: Option<JobStatus>,
    },

    /// Show feature flags, or set one
    Feature {
        /// cvGeneration or scoreGeneration
        flag: Option<FeatureFlag>,

        value: Option<bool>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    JobService,
    PromptService,
    Cv,
    Cover,
    Score,
    Pdf,
    All,
}

impl RoleArg {
    fn roles(self) -> Vec<Role> {
        match self {
            RoleArg::JobService => vec![Role::JobService],
            RoleArg::PromptService => vec![Role::PromptService],
            RoleArg::Cv => vec![Role::Enrichment(Stage::Cv)],
            RoleArg::Cover => vec![Role::Enrichment(Stage::CoverLetter)],
            RoleArg::Score => vec![Role::Enrichment(Stage::Score)],
            RoleArg::Pdf => vec![Role::PdfSink],
            RoleArg::All => Role::ALL.to_vec(),
        }
    }

    fn needs_generator(self) -> bool {
        matches!(self, RoleArg::Cv | RoleArg::Cover | RoleArg::Score | RoleArg::All)
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StageArg {
    Cv,
    Cover,
    Score,
}

impl From<StageArg> for Stage {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::Cv => Stage::Cv,
            StageArg::Cover => Stage::CoverLetter,
            StageArg::Score => Stage::Score,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let service = match &cli.command {
        Commands::Run { role } => role
            .to_possible_value()
            .map(|v| format!("applyflow-{}", v.get_name()))
            .unwrap_or_else(|| "applyflow-worker".to_string()),
        _ => "applyflow-cli".to_string(),
    };
    applyflow_observability::init(&service);

    let config = PipelineConfig::from_env().context("invalid configuration")?;

    match cli.command {
        Commands::Run { role } => run(&config, role).await,
        Commands::Migrate => {
            let pool = connect_database(&config).await?;
            ensure_schema(&pool).await.context("schema bootstrap failed")?;
            tracing::info!("schema ready");
            Ok(())
        }
        Commands::CreateJob {
            title,
            company,
            link,
            description,
        } => {
            let producer = producer(&config).await?;
            let id = producer
                .request_job_creation(&NewJob::new(title, company, link, description))
                .await?;
            println!("queued job creation as message {id}");
            Ok(())
        }
        Commands::Generate {
            stage,
            job_id,
            prompt_id,
        } => {
            let producer = producer(&config).await?;
            let id = producer.request_generation(stage.into(), job_id, prompt_id).await?;
            println!("queued {:?} generation for job {job_id} as message {id}", stage);
            Ok(())
        }
        Commands::SetStatus { job_id, status } => {
            let producer = producer(&config).await?;
            let id = producer.request_status_update(job_id, status).await?;
            println!("queued status {} for job {job_id} as message {id}", status.as_str());
            Ok(())
        }
        Commands::ListJobs { status } => {
            let store = PostgresStore::new(connect_database(&config).await?);
            let jobs = store.list_jobs(status).await?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
            Ok(())
        }
        Commands::Feature { flag, value } => {
            let store = PostgresStore::new(connect_database(&config).await?);
            if let (Some(flag), Some(value)) = (flag, value) {
                store.set_feature(flag, value).await?;
            }
            for feature in store.list_features().await? {
                println!("{}\t{}", feature.name, feature.value);
            }
            Ok(())
        }
    }
}

async fn run(config: &PipelineConfig, role: RoleArg) -> Result<()> {
    config.warn_on_short_ack_wait();
    let roles = role.roles();

    let log = connect_log(config).await?;
    let pool = connect_database(config).await?;
    ensure_schema(&pool).await.context("schema bootstrap failed")?;

    let topology = Topology::from_config(config);
    topology
        .register(log.as_ref(), &roles, &config.connect_policy())
        .await
        .context("stream/consumer registration failed")?;

    let store = Arc::new(PostgresStore::new(pool));
    let ctx = PipelineContext::with_store(log, store);

    let mut launcher = Launcher::new(ctx, topology.stream_name(), config.redelivery_policy())
        .with_pdf_output_dir(config.pdf_output_dir.clone());
    if role.needs_generator() {
        let generator = build_generator(&config.generation).context("generator configuration")?;
        tracing::info!(generator = %generator.describe(), "generator ready");
        launcher = launcher.with_generator(generator);
    }

    let handles = launcher.spawn_all(&roles)?;
    tracing::info!(role = ?role, workers = handles.len(), "running; ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    for handle in handles {
        let name = handle.name().to_string();
        let stats = handle.stats();
        handle.shutdown().await;
        tracing::info!(worker = %name, stats = ?stats, "worker stopped");
    }
    Ok(())
}

async fn connect_log(config: &PipelineConfig) -> Result<Arc<dyn EventLog>> {
    let log = retry_with_backoff(&config.connect_policy(), "connect_redis", || {
        RedisStreamsEventLog::connect(&config.redis_url)
    })
    .await
    .with_context(|| format!("could not reach redis at {}", config.redis_url))?;
    Ok(Arc::new(log))
}

async fn connect_database(config: &PipelineConfig) -> Result<PgPool> {
    let url = config.database_url()?;
    let pool = retry_with_backoff(&config.connect_policy(), "connect_postgres", || {
        PgPoolOptions::new().max_connections(5).connect(url)
    })
    .await
    .context("could not reach postgres")?;
    Ok(pool)
}

async fn producer(config: &PipelineConfig) -> Result<PipelineProducer> {
    Ok(PipelineProducer::new(connect_log(config).await?))
}
