//! Recipe Worker Service
//!
//! Drains the five job-pipeline queues the recipe-import workflow is
//! built from and runs their composed action pipelines:
//!
//! ```text
//! note          -> CLEAN_HTML -> PARSE_HTML -> PERSIST_NOTE -> FANOUT_LINES
//! ingredient    -> PARSE_INGREDIENT_LINE -> SAVE_INGREDIENT_LINE -> TRACK_PATTERN -> CHECK_INGREDIENT_COMPLETION
//! instruction   -> FORMAT_INSTRUCTION -> SAVE_INSTRUCTION -> CHECK_INSTRUCTION_COMPLETION
//! categorization -> DETERMINE_CATEGORY -> SAVE_CATEGORY -> DETERMINE_TAGS -> SAVE_TAGS
//! pattern       -> TRACK_PATTERN (standalone)
//! ```
//!
//! Every queue shares one in-memory broker, one completion tracker, and
//! one status broadcaster; each is processed by its own `Worker` so a
//! slow stage can't starve the others.

use std::sync::Arc;

use axum::Router;
use completion_tracker::CompletionTracker;
use core_config::{app_info, Environment};
use domain_recipes::collaborators::{NaiveHtmlCleaner, NaiveIngredientLineParser};
use domain_recipes::pipelines::categorization::CategorizationProcessor;
use domain_recipes::pipelines::ingredient::IngredientProcessor;
use domain_recipes::pipelines::instruction::InstructionProcessor;
use domain_recipes::pipelines::note::NoteProcessor;
use domain_recipes::pipelines::pattern::PatternProcessor;
use domain_recipes::repository::{
    InMemoryCategoryRepository, InMemoryIngredientRepository, InMemoryInstructionRepository,
    InMemoryNoteRepository, InMemoryTagRepository,
};
use eyre::{Result, WrapErr};
use job_events::StatusBroadcaster;
use job_health::{router, HealthState, SystemMonitor};
use job_queue::{AlwaysHealthy, Broker, Dependencies, InMemoryBroker, Worker, WorkerConfig};
use pattern_tracker::InMemoryPatternRepository;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Starts the `/health` + `/metrics/*` HTTP surface.
async fn start_health_server(state: HealthState, port: u16) -> Result<()> {
    let app: Router = router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {addr}"))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, app).await.wrap_err("Health server failed")?;

    Ok(())
}

/// Runs the recipe worker service: wires the in-memory broker, repositories
/// and completion tracker, spawns one `Worker` per queue, and blocks until
/// a shutdown signal is received.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let monitor = SystemMonitor::global();
    monitor.init_prometheus();

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting recipe worker service");
    info!("Environment: {:?}", environment);

    let health_port: u16 = std::env::var("RECIPE_WORKER_HEALTH_PORT")
        .or_else(|_| std::env::var("HEALTH_PORT"))
        .unwrap_or_else(|_| "8083".to_string())
        .parse()
        .unwrap_or(8083);

    let note_repo = Arc::new(InMemoryNoteRepository::new());
    let category_repo = Arc::new(InMemoryCategoryRepository::new());
    let tag_repo = Arc::new(InMemoryTagRepository::new());
    let ingredient_repo = Arc::new(InMemoryIngredientRepository::new());
    let instruction_repo = Arc::new(InMemoryInstructionRepository::new());
    let pattern_repo = Arc::new(InMemoryPatternRepository::new());
    let tracker = Arc::new(CompletionTracker::new());

    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let broadcaster = Arc::new(StatusBroadcaster::new());
    let deps = Dependencies::new().with_status_broadcaster(broadcaster);

    let note_processor = Arc::new(NoteProcessor::new(
        Arc::new(NaiveHtmlCleaner),
        note_repo.clone(),
        tracker.clone(),
        ingredient_repo.clone(),
        instruction_repo.clone(),
    ));
    let ingredient_processor = Arc::new(IngredientProcessor::new(
        Arc::new(NaiveIngredientLineParser),
        ingredient_repo.clone(),
        pattern_repo.clone(),
        tracker.clone(),
    ));
    let instruction_processor = Arc::new(InstructionProcessor::new(instruction_repo.clone(), tracker.clone()));
    let categorization_processor = Arc::new(CategorizationProcessor::new(
        note_repo.clone(),
        category_repo.clone(),
        tag_repo.clone(),
    ));
    let pattern_processor = Arc::new(PatternProcessor::new(pattern_repo.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(err) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", err);
        }
        let _ = shutdown_tx.send(true);
    });

    let health_state = HealthState {
        monitor,
        app_info,
    };
    let health_shutdown = health_state.clone();
    tokio::spawn(async move {
        if let Err(err) = start_health_server(health_shutdown, health_port).await {
            error!(error = %err, "Health server failed");
        }
    });

    let note_worker = Arc::new(Worker::new(
        "recipe-worker-note",
        "note",
        broker.clone(),
        note_processor,
        deps.clone(),
        Arc::new(AlwaysHealthy),
        WorkerConfig::default(),
    ));
    let ingredient_worker = Arc::new(Worker::new(
        "recipe-worker-ingredient",
        "ingredient",
        broker.clone(),
        ingredient_processor,
        deps.clone(),
        Arc::new(AlwaysHealthy),
        WorkerConfig::default(),
    ));
    let instruction_worker = Arc::new(Worker::new(
        "recipe-worker-instruction",
        "instruction",
        broker.clone(),
        instruction_processor,
        deps.clone(),
        Arc::new(AlwaysHealthy),
        WorkerConfig::default(),
    ));
    let categorization_worker = Arc::new(Worker::new(
        "recipe-worker-categorization",
        "categorization",
        broker.clone(),
        categorization_processor,
        deps.clone(),
        Arc::new(AlwaysHealthy),
        WorkerConfig::default(),
    ));
    let pattern_worker = Arc::new(Worker::new(
        "recipe-worker-pattern",
        "pattern",
        broker.clone(),
        pattern_processor,
        deps,
        Arc::new(AlwaysHealthy),
        WorkerConfig::default(),
    ));

    info!("Starting note/ingredient/instruction/categorization/pattern workers...");
    tokio::join!(
        note_worker.run(shutdown_rx.clone()),
        ingredient_worker.run(shutdown_rx.clone()),
        instruction_worker.run(shutdown_rx.clone()),
        categorization_worker.run(shutdown_rx.clone()),
        pattern_worker.run(shutdown_rx),
    );

    info!("Recipe worker service stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
