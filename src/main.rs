use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{TimeDelta, Utc};
use clap::Parser;
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tracing::{info, warn};

use lessonforge::anthropic::AnthropicClient;
use lessonforge::cli::{Cli, Command};
use lessonforge::collaborators::{AnthropicModel, Collaborators, DisabledSearch, SqliteContentRepository};
use lessonforge::config::ForgeConfig;
use lessonforge::dispatcher::Dispatcher;
use lessonforge::enqueue::JobQueue;
use lessonforge::state_machine::{JobId, JobOwner};
use lessonforge::status::StatusService;
use lessonforge::store::{JobStore, SqliteJobStore, open_pool};
use lessonforge::workflow::WorkflowRegistry;
use lessonforge::workflows::default_registry;
use lessonforge::{telemetry, ui};

/// Intervalo entre consultas de status para `--wait` e `--watch`.
const WATCH_INTERVAL: Duration = Duration::from_millis(500);

/// Store aberto para todos os comandos. O registry (e com ele o cliente
/// Anthropic) só é montado por quem executa ou enfileira jobs.
struct App {
    config: ForgeConfig,
    pool: SqlitePool,
    store: Arc<dyn JobStore>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.verbose, cli.json_logs);

    let mut config = ForgeConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    let app = App::open(config).await?;
    match cli.command {
        Command::Worker {
            poll_interval_ms,
            max_attempts,
            workers,
        } => {
            let mut config = app.config.clone();
            if let Some(ms) = poll_interval_ms {
                config.worker.poll_interval_ms = ms;
            }
            if let Some(n) = max_attempts {
                config.retry.max_attempts = n;
            }
            if let Some(n) = workers {
                config.worker.workers = n;
            }
            run_worker(&app, &config).await
        }
        Command::Enqueue {
            kind,
            input,
            input_file,
            user,
            wait,
        } => {
            let input = read_input(input, input_file)?;
            let owner = user.map(JobOwner::user).unwrap_or_default();
            let queue = JobQueue::new(app.store.clone(), app.registry().await?);
            let id = queue
                .create_job(&kind, input, owner)
                .await
                .with_context(|| format!("failed to enqueue {kind} job"))?;
            println!("{id}");
            if wait {
                watch_job(&app, id).await?;
            }
            Ok(())
        }
        Command::Status { job_id, watch } => {
            let id: JobId = job_id.parse().with_context(|| format!("invalid job id: {job_id}"))?;
            if watch {
                watch_job(&app, id).await
            } else {
                let view = StatusService::new(app.store.clone()).status(id).await?;
                ui::print_json(&view)?;
                Ok(())
            }
        }
        Command::Metrics { window_hours } => {
            let metrics = StatusService::new(app.store.clone())
                .metrics(TimeDelta::hours(i64::from(window_hours)))
                .await?;
            ui::print_json(&metrics)?;
            Ok(())
        }
        Command::Sweep => {
            // A varredura só toca o store; nenhum workflow é executado.
            let dispatcher = app.dispatcher(&app.config, Arc::new(WorkflowRegistry::builder().build()));
            let swept = dispatcher.sweep(Utc::now()).await?;
            info!(count = swept.len(), "sweep finished");
            let ids: Vec<String> = swept.iter().map(|job| job.id.to_string()).collect();
            ui::print_json(&ids)?;
            Ok(())
        }
    }
}

impl App {
    async fn open(config: ForgeConfig) -> Result<Self> {
        let max_connections = u32::try_from(config.worker.workers + 1).unwrap_or(u32::MAX);
        let pool = open_pool(&config.database_url, max_connections)
            .await
            .with_context(|| format!("failed to open database {}", config.database_url))?;
        let store = SqliteJobStore::new(pool.clone()).await.context("failed to prepare job tables")?;

        Ok(Self {
            config,
            pool,
            store: Arc::new(store),
        })
    }

    async fn registry(&self) -> Result<Arc<WorkflowRegistry>> {
        let content = SqliteContentRepository::new(self.pool.clone())
            .await
            .context("failed to prepare content tables")?;

        let model_config = &self.config.model;
        let client = match &model_config.base_url {
            Some(url) => AnthropicClient::with_base_url(model_config.api_key.clone(), url.clone()),
            None => AnthropicClient::new(model_config.api_key.clone()),
        }
        .context("failed to build Anthropic client")?;
        let model = AnthropicModel::new(
            client,
            model_config.fast_model.clone(),
            model_config.large_model.clone(),
            model_config.max_tokens,
        );
        let collaborators = Collaborators {
            model: Arc::new(model),
            search: Arc::new(DisabledSearch),
            content: Arc::new(content),
        };
        let registry = default_registry(collaborators, self.config.workflows).context("invalid workflow graph")?;
        Ok(Arc::new(registry))
    }

    fn dispatcher(&self, config: &ForgeConfig, registry: Arc<WorkflowRegistry>) -> Dispatcher {
        Dispatcher::new(self.store.clone(), registry)
            .with_engine(config.engine())
            .with_retry(config.retry_policy())
            .with_config(config.dispatcher_config())
    }
}

async fn run_worker(app: &App, config: &ForgeConfig) -> Result<()> {
    if config.model.api_key.is_empty() {
        bail!("ANTHROPIC_API_KEY is not set; workers cannot call the language model");
    }

    let dispatcher = Arc::new(app.dispatcher(config, app.registry().await?));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(dispatcher.run(shutdown_rx));

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    warn!("shutdown requested, waiting for in-flight jobs");
    let _ = shutdown_tx.send(true);
    handle.await.context("dispatcher task failed")?;
    Ok(())
}

fn read_input(input: Option<String>, input_file: Option<std::path::PathBuf>) -> Result<Value> {
    let raw = match (input, input_file) {
        (Some(raw), _) => raw,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read input file {}", path.display()))?,
        (None, None) => bail!("either --input or --input-file is required"),
    };
    serde_json::from_str(&raw).context("job input is not valid JSON")
}

/// Acompanha o job com um spinner até um estado terminal e imprime o status final.
async fn watch_job(app: &App, id: JobId) -> Result<()> {
    let service = StatusService::new(app.store.clone());
    let progress = ui::JobProgress::start(&id.to_string());
    loop {
        let view = service.status(id).await?;
        if view.status.is_terminal() {
            progress.finish(&view);
            ui::print_json(&view)?;
            return Ok(());
        }
        progress.update(&view);
        tokio::time::sleep(WATCH_INTERVAL).await;
    }
}
