//! Action contract, `BaseAction` template-method wrapper, and the
//! per-worker-kind action registry.
//!
//! Grounded on the dispatch-by-variant pattern in `TaskProcessor::process`
//! (match over a command payload enum, one handler method per variant),
//! generalized here into an explicit before/after status-hook wrapper per
//! the "coroutine-style status hooks -> BaseAction template method" design
//! note, and a constructor registry per the "dynamic dispatch by action
//! name -> discriminated variant + registry" design note.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use job_errors::JobError;
use job_events::{JobStatus, StatusBroadcaster, StatusEvent};
use tracing::warn;

/// Closed set of pipeline steps. One variant per action named across every
/// stage's pipeline (categorization, ingredient, instruction, note,
/// pattern).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionName {
    DetermineCategory,
    SaveCategory,
    DetermineTags,
    SaveTags,
    CheckInstructionCompletion,
    CheckIngredientCompletion,
    TrackPattern,
    ParseHtml,
    CleanHtml,
    ParseIngredientLine,
    SaveIngredientLine,
    FormatInstruction,
    SaveInstruction,
    PersistNote,
    FanoutLines,
    ScheduleCategorization,
}

impl ActionName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DetermineCategory => "DETERMINE_CATEGORY",
            Self::SaveCategory => "SAVE_CATEGORY",
            Self::DetermineTags => "DETERMINE_TAGS",
            Self::SaveTags => "SAVE_TAGS",
            Self::CheckInstructionCompletion => "CHECK_INSTRUCTION_COMPLETION",
            Self::CheckIngredientCompletion => "CHECK_INGREDIENT_COMPLETION",
            Self::TrackPattern => "TRACK_PATTERN",
            Self::ParseHtml => "PARSE_HTML",
            Self::CleanHtml => "CLEAN_HTML",
            Self::ParseIngredientLine => "PARSE_INGREDIENT_LINE",
            Self::SaveIngredientLine => "SAVE_INGREDIENT_LINE",
            Self::FormatInstruction => "FORMAT_INSTRUCTION",
            Self::SaveInstruction => "SAVE_INSTRUCTION",
            Self::PersistNote => "PERSIST_NOTE",
            Self::FanoutLines => "FANOUT_LINES",
            Self::ScheduleCategorization => "SCHEDULE_CATEGORIZATION",
        }
    }
}

impl std::fmt::Display for ActionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-execution context threaded through an action pipeline.
///
/// Extends the context fields named in the data model (`jobId`,
/// `attemptNumber`, `retryCount`, `queueName`, `workerName`, `startTime`,
/// `operation`) with the import/note scoping the status broadcaster needs
/// to address its events; every action pipeline in this engine runs against
/// a single note/import, so carrying that here avoids threading it through
/// every payload type separately.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub job_id: String,
    pub attempt_number: u32,
    pub retry_count: u32,
    pub queue_name: String,
    pub worker_name: String,
    pub start_time: DateTime<Utc>,
    pub operation: String,
    pub import_id: String,
    pub note_id: Option<String>,
}

impl ActionContext {
    pub fn new(
        job_id: impl Into<String>,
        queue_name: impl Into<String>,
        worker_name: impl Into<String>,
        operation: impl Into<String>,
        import_id: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            attempt_number: 1,
            retry_count: 0,
            queue_name: queue_name.into(),
            worker_name: worker_name.into(),
            start_time: Utc::now(),
            operation: operation.into(),
            import_id: import_id.into(),
            note_id: None,
        }
    }

    pub fn with_note_id(mut self, note_id: impl Into<String>) -> Self {
        self.note_id = Some(note_id.into());
        self
    }

    pub fn with_attempt(mut self, attempt_number: u32) -> Self {
        self.retry_count = attempt_number.saturating_sub(1);
        self.attempt_number = attempt_number;
        self
    }
}

/// Per-worker-type injected capabilities. Constructed once per worker and
/// shared across every job it processes.
#[derive(Clone)]
pub struct Dependencies {
    pub status_broadcaster: Option<Arc<StatusBroadcaster>>,
}

impl Dependencies {
    pub fn new() -> Self {
        Self {
            status_broadcaster: None,
        }
    }

    pub fn with_status_broadcaster(mut self, broadcaster: Arc<StatusBroadcaster>) -> Self {
        self.status_broadcaster = Some(broadcaster);
        self
    }
}

impl Default for Dependencies {
    fn default() -> Self {
        Self::new()
    }
}

/// A single named pipeline step. `Payload` is fixed per worker kind (every
/// action chained within one worker's pipeline shares a payload type: each
/// action's output becomes the next action's input).
#[async_trait]
pub trait Action: Send + Sync {
    type Payload: Send + Sync;

    fn name(&self) -> ActionName;

    /// Default accepts everything; override to reject malformed input
    /// before any side effect runs.
    fn validate_input(&self, _payload: &Self::Payload) -> Result<(), JobError> {
        Ok(())
    }

    async fn execute(
        &self,
        payload: Self::Payload,
        deps: &Dependencies,
        ctx: &ActionContext,
    ) -> Result<Self::Payload, JobError>;
}

/// Whether `BaseAction` broadcasts start/completion status events around a
/// wrapped action's `execute`. Most actions want this; a few (e.g.
/// determine-tags) declare that broadcaster failures must propagate as job
/// failures rather than being swallowed, so they broadcast inline instead
/// and opt out of the wrapper's own broadcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBroadcastMode {
    Enabled,
    Disabled,
}

/// Template-method wrapper: validate, optionally broadcast a start event,
/// execute, optionally broadcast a completion event, return the result
/// unchanged. Broadcaster failures at this boundary are logged and
/// swallowed — observability must not kill the pipeline.
pub struct BaseAction<A: Action> {
    inner: A,
    broadcast_mode: StatusBroadcastMode,
}

impl<A: Action> BaseAction<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            broadcast_mode: StatusBroadcastMode::Enabled,
        }
    }

    pub fn without_status_broadcast(mut self) -> Self {
        self.broadcast_mode = StatusBroadcastMode::Disabled;
        self
    }

    fn broadcast(&self, deps: &Dependencies, ctx: &ActionContext, status: JobStatus, message: String) {
        if self.broadcast_mode == StatusBroadcastMode::Disabled {
            return;
        }
        let Some(broadcaster) = &deps.status_broadcaster else {
            return;
        };
        let mut event = StatusEvent::new(ctx.import_id.clone(), status, message, ctx.operation.clone());
        if let Some(note_id) = &ctx.note_id {
            event = event.with_note_id(note_id.clone());
        }
        if let Err(err) = broadcaster.add_status_event_and_broadcast(event) {
            warn!(error = %err, action = %self.inner.name(), "status broadcast failed, continuing");
        }
    }

    pub async fn run(
        &self,
        payload: A::Payload,
        deps: &Dependencies,
        ctx: &ActionContext,
    ) -> Result<A::Payload, JobError> {
        self.inner.validate_input(&payload)?;

        self.broadcast(
            deps,
            ctx,
            JobStatus::Processing,
            format!("Starting {}", self.inner.name()),
        );

        let result = self.inner.execute(payload, deps, ctx).await?;

        self.broadcast(
            deps,
            ctx,
            JobStatus::Completed,
            format!("Completed {}", self.inner.name()),
        );

        Ok(result)
    }
}

type ActionConstructor<P> = Box<dyn Fn() -> Box<dyn Action<Payload = P>> + Send + Sync>;

/// Registry mapping action names to constructors, for one worker kind's
/// payload type `P`. Registration order is preserved and is what defines
/// pipeline composition (see the per-stage pipelines that build themselves
/// from a factory).
pub struct ActionFactory<P> {
    order: Vec<ActionName>,
    constructors: HashMap<ActionName, ActionConstructor<P>>,
}

impl<P> ActionFactory<P> {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            constructors: HashMap::new(),
        }
    }

    /// Registers `name` with `constructor`. Re-registering a name replaces
    /// its constructor in place without disturbing registration order.
    pub fn register<F>(&mut self, name: ActionName, constructor: F)
    where
        F: Fn() -> Box<dyn Action<Payload = P>> + Send + Sync + 'static,
    {
        if !self.constructors.contains_key(&name) {
            self.order.push(name);
        }
        self.constructors.insert(name, Box::new(constructor));
    }

    pub fn create(&self, name: ActionName) -> Option<Box<dyn Action<Payload = P>>> {
        self.constructors.get(&name).map(|ctor| ctor())
    }

    /// Names in registration order — this is pipeline composition order.
    pub fn registered_order(&self) -> &[ActionName] {
        &self.order
    }
}

impl<P> Default for ActionFactory<P> {
    fn default() -> Self {
        Self::new()
    }
}
