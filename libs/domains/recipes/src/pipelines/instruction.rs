//! Instruction pipeline: `FORMAT_INSTRUCTION → SAVE_INSTRUCTION →
//! CHECK_INSTRUCTION_COMPLETION` (spec §4.11). `CHECK_INSTRUCTION_COMPLETION`
//! is the full-expected-set call site: once ingredient, instruction, and
//! note legs have all completed for a note, this emits the final COMPLETED
//! status event and invokes the tracker's cleanup hook.

use std::sync::Arc;

use async_trait::async_trait;
use completion_tracker::{CompletionTracker, WorkerKind};
use job_actions::{Action, ActionContext, ActionFactory, ActionName, Dependencies};
use job_errors::{ErrorContext, JobError};
use job_events::{JobStatus, StatusEvent};
use job_queue::{Dependencies as QueueDependencies, JobProcessor, ProcessOutcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::repository::InstructionRepository;

use super::run_pipeline;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionPayload {
    pub note_id: String,
    pub import_id: String,
    pub line_index: usize,
    pub raw_text: String,
    #[serde(default)]
    pub formatted_text: Option<String>,
    #[serde(default)]
    pub instruction_line_id: Option<String>,
    #[serde(default)]
    pub note_completed: bool,
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

/// Capitalizes the first letter and ensures the line ends with a period —
/// a minimal, deterministic stand-in for real instruction-text formatting.
pub struct FormatInstructionAction;

#[async_trait]
impl Action for FormatInstructionAction {
    type Payload = InstructionPayload;

    fn name(&self) -> ActionName {
        ActionName::FormatInstruction
    }

    fn validate_input(&self, payload: &InstructionPayload) -> Result<(), JobError> {
        if payload.raw_text.trim().is_empty() {
            return Err(JobError::validation("rawText must not be empty", ErrorContext::default()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        mut payload: InstructionPayload,
        _deps: &Dependencies,
        _ctx: &ActionContext,
    ) -> Result<InstructionPayload, JobError> {
        let trimmed = payload.raw_text.trim();
        let mut formatted = String::with_capacity(trimmed.len() + 1);
        let mut chars = trimmed.chars();
        if let Some(first) = chars.next() {
            formatted.extend(first.to_uppercase());
            formatted.push_str(chars.as_str());
        }
        if !formatted.ends_with('.') && !formatted.ends_with('!') && !formatted.ends_with('?') {
            formatted.push('.');
        }
        payload.formatted_text = Some(formatted);
        Ok(payload)
    }
}

pub struct SaveInstructionAction {
    repo: Arc<dyn InstructionRepository>,
}

#[async_trait]
impl Action for SaveInstructionAction {
    type Payload = InstructionPayload;

    fn name(&self) -> ActionName {
        ActionName::SaveInstruction
    }

    fn validate_input(&self, payload: &InstructionPayload) -> Result<(), JobError> {
        if payload.formatted_text.is_none() {
            return Err(JobError::validation(
                "formattedText missing before SAVE_INSTRUCTION",
                ErrorContext::default(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        mut payload: InstructionPayload,
        _deps: &Dependencies,
        _ctx: &ActionContext,
    ) -> Result<InstructionPayload, JobError> {
        let formatted = payload.formatted_text.clone().expect("validated above");
        let id = self
            .repo
            .save_instruction_line(&payload.note_id, payload.line_index, &formatted)
            .await?;
        payload.instruction_line_id = Some(id);
        Ok(payload)
    }
}

pub struct CheckInstructionCompletionAction {
    tracker: Arc<CompletionTracker>,
    repo: Arc<dyn InstructionRepository>,
}

#[async_trait]
impl Action for CheckInstructionCompletionAction {
    type Payload = InstructionPayload;

    fn name(&self) -> ActionName {
        ActionName::CheckInstructionCompletion
    }

    async fn execute(
        &self,
        mut payload: InstructionPayload,
        deps: &Dependencies,
        ctx: &ActionContext,
    ) -> Result<InstructionPayload, JobError> {
        let status = self.repo.get_instruction_completion_status(&payload.note_id).await?;

        if status.is_complete {
            let expected = [WorkerKind::Ingredient, WorkerKind::Instruction, WorkerKind::Note];
            let all_complete =
                self.tracker.mark_worker_completed(&payload.note_id, WorkerKind::Instruction, &expected);
            payload.note_completed = all_complete;

            if all_complete {
                if let Some(broadcaster) = &deps.status_broadcaster {
                    let event = StatusEvent::new(
                        ctx.import_id.clone(),
                        JobStatus::Completed,
                        "Note processing complete",
                        "note_complete",
                    )
                    .with_note_id(payload.note_id.clone());
                    if let Err(err) = broadcaster.add_status_event_and_broadcast(event) {
                        warn!(note_id = %payload.note_id, error = %err, "status broadcast failed, continuing");
                    }
                }
                self.tracker.cleanup(&payload.note_id);
            }
        }
        Ok(payload)
    }
}

pub fn register_instruction_actions(
    instruction_repo: Arc<dyn InstructionRepository>,
    tracker: Arc<CompletionTracker>,
) -> ActionFactory<InstructionPayload> {
    let mut factory = ActionFactory::new();
    factory.register(ActionName::FormatInstruction, || Box::new(FormatInstructionAction));
    factory.register(ActionName::SaveInstruction, {
        let instruction_repo = instruction_repo.clone();
        move || Box::new(SaveInstructionAction { repo: instruction_repo.clone() })
    });
    factory.register(ActionName::CheckInstructionCompletion, {
        move || {
            Box::new(CheckInstructionCompletionAction {
                tracker: tracker.clone(),
                repo: instruction_repo.clone(),
            })
        }
    });
    factory
}

pub struct InstructionProcessor {
    factory: ActionFactory<InstructionPayload>,
    tracker: Arc<CompletionTracker>,
}

impl InstructionProcessor {
    pub fn new(instruction_repo: Arc<dyn InstructionRepository>, tracker: Arc<CompletionTracker>) -> Self {
        Self {
            factory: register_instruction_actions(instruction_repo, tracker.clone()),
            tracker,
        }
    }
}

#[async_trait]
impl JobProcessor for InstructionProcessor {
    fn required_fields(&self) -> &'static [&'static str] {
        &["noteId", "importId", "rawText"]
    }

    async fn execute(
        &self,
        payload: Value,
        deps: &QueueDependencies,
        ctx: &ActionContext,
    ) -> Result<ProcessOutcome, JobError> {
        let input: InstructionPayload = serde_json::from_value(payload)
            .map_err(|err| ctx_error(ctx, format!("invalid instruction payload: {err}")))?;

        // Bump the per-note job fan-in counter before running the pipeline:
        // CHECK_INSTRUCTION_COMPLETION may clean up all tracker state for
        // this note once every expected worker has reported in, and that
        // cleanup must win over this job's own counter bump.
        self.tracker.increment(&input.note_id);
        let result = run_pipeline(&self.factory, input, deps, ctx).await?;

        Ok(ProcessOutcome::new(serde_json::to_value(result).expect("serializable payload")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryInstructionRepository;
    use job_events::StatusBroadcaster;
    use serde_json::json;

    fn ctx() -> ActionContext {
        ActionContext::new("job-1", "instruction", "instruction-worker", "format_instruction", "import-1")
            .with_note_id("note-1")
    }

    #[tokio::test]
    async fn formats_capitalizes_and_adds_trailing_period() {
        let repo = Arc::new(InMemoryInstructionRepository::new());
        repo.set_expected_total("note-1", 1);
        let tracker = Arc::new(CompletionTracker::new());
        let processor = InstructionProcessor::new(repo, tracker);

        let outcome = processor
            .execute(
                json!({"noteId": "note-1", "importId": "import-1", "lineIndex": 0, "rawText": "simmer for 20 minutes"}),
                &Dependencies::new(),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.payload["formattedText"], "Simmer for 20 minutes.");
    }

    #[tokio::test]
    async fn completing_full_expected_set_cleans_up_tracker_and_broadcasts() {
        let repo = Arc::new(InMemoryInstructionRepository::new());
        repo.set_expected_total("note-1", 1);
        let tracker = Arc::new(CompletionTracker::new());
        tracker.create("note-1", 1);
        let expected = [WorkerKind::Ingredient, WorkerKind::Instruction, WorkerKind::Note];
        tracker.mark_worker_completed("note-1", WorkerKind::Ingredient, &expected);
        tracker.mark_worker_completed("note-1", WorkerKind::Note, &expected);

        let processor = InstructionProcessor::new(repo, tracker.clone());
        let broadcaster = Arc::new(StatusBroadcaster::new());
        let deps = Dependencies::new().with_status_broadcaster(broadcaster.clone());

        let outcome = processor
            .execute(
                json!({"noteId": "note-1", "importId": "import-1", "lineIndex": 0, "rawText": "simmer"}),
                &deps,
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.payload["noteCompleted"], true);
        assert_eq!(tracker.status("note-1").total_jobs, 0, "cleanup removes tracker state");
        let events = broadcaster.events_for_import("import-1");
        assert!(events.iter().any(|e| e.context == "note_complete"));
    }
}
