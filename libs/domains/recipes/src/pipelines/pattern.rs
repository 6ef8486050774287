//! Pattern pipeline: `TRACK_PATTERN` alone (spec §4.11), bound to its own
//! `pattern` queue. Distinct from the `TRACK_PATTERN` step embedded in the
//! ingredient pipeline — this is the standalone entry point for
//! pattern-tracking jobs raised independently of a line parse (e.g.
//! reprocessing, admin-triggered backfill).

use std::sync::Arc;

use async_trait::async_trait;
use job_actions::{Action, ActionContext, ActionFactory, ActionName, Dependencies};
use job_errors::{ErrorContext, JobError};
use job_queue::{Dependencies as QueueDependencies, JobProcessor, ProcessOutcome};
use pattern_tracker::{track_pattern, PatternRepository, TrackPatternInput};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::run_pipeline;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternPayload {
    #[serde(default)]
    pub pattern_rules: Vec<String>,
    #[serde(default)]
    pub example_line: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

fn ctx_error(ctx: &ActionContext, message: impl Into<String>) -> JobError {
    JobError::classify(
        message,
        ErrorContext {
            job_id: Some(ctx.job_id.clone()),
            queue_name: Some(ctx.queue_name.clone()),
            ..Default::default()
        },
    )
}

pub struct TrackPatternStandaloneAction {
    pattern_repo: Arc<dyn PatternRepository>,
}

#[async_trait]
impl Action for TrackPatternStandaloneAction {
    type Payload = PatternPayload;

    fn name(&self) -> ActionName {
        ActionName::TrackPattern
    }

    async fn execute(
        &self,
        payload: PatternPayload,
        _deps: &Dependencies,
        ctx: &ActionContext,
    ) -> Result<PatternPayload, JobError> {
        let mut input = TrackPatternInput::new(ctx.job_id.clone(), payload.pattern_rules.clone());
        input.example_line = payload.example_line.clone();
        input.metadata = payload.metadata.clone();

        let output = track_pattern(self.pattern_repo.as_ref(), None, input).await;
        Ok(PatternPayload {
            pattern_rules: payload.pattern_rules,
            example_line: payload.example_line,
            metadata: output.metadata,
        })
    }
}

pub fn register_pattern_actions(pattern_repo: Arc<dyn PatternRepository>) -> ActionFactory<PatternPayload> {
    let mut factory = ActionFactory::new();
    factory.register(ActionName::TrackPattern, move || {
        Box::new(TrackPatternStandaloneAction { pattern_repo: pattern_repo.clone() })
    });
    factory
}

pub struct PatternProcessor {
    factory: ActionFactory<PatternPayload>,
}

impl PatternProcessor {
    pub fn new(pattern_repo: Arc<dyn PatternRepository>) -> Self {
        Self {
            factory: register_pattern_actions(pattern_repo),
        }
    }
}

#[async_trait]
impl JobProcessor for PatternProcessor {
    fn required_fields(&self) -> &'static [&'static str] {
        &["patternRules"]
    }

    async fn execute(
        &self,
        payload: Value,
        deps: &QueueDependencies,
        ctx: &ActionContext,
    ) -> Result<ProcessOutcome, JobError> {
        let input: PatternPayload = serde_json::from_value(payload)
            .map_err(|err| ctx_error(ctx, format!("invalid pattern payload: {err}")))?;

        let result = run_pipeline(&self.factory, input, deps, ctx).await?;
        Ok(ProcessOutcome::new(serde_json::to_value(result).expect("serializable payload")))
    }
}
