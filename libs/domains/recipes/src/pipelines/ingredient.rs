//! Ingredient pipeline: `PARSE_INGREDIENT_LINE → SAVE_INGREDIENT_LINE →
//! TRACK_PATTERN → CHECK_INGREDIENT_COMPLETION` (spec §4.11), with
//! `CHECK_INGREDIENT_COMPLETION` setting the hook flag the
//! `JobProcessor` reads to schedule categorization once every ingredient
//! line for a note has landed.

use std::sync::Arc;

use async_trait::async_trait;
use completion_tracker::{CompletionTracker, WorkerKind};
use job_actions::{Action, ActionContext, ActionFactory, ActionName, Dependencies};
use job_errors::{ErrorContext, JobError};
use job_queue::{Dependencies as QueueDependencies, JobProcessor, ProcessOutcome};
use pattern_tracker::{track_pattern, IngredientLineLinker, PatternRepository, TrackPatternInput};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::collaborators::IngredientLineParser;
use crate::repository::IngredientRepository;

use super::run_pipeline;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngredientPayload {
    pub note_id: String,
    pub import_id: String,
    pub line_index: usize,
    pub raw_text: String,
    #[serde(default)]
    pub rule_ids: Vec<String>,
    #[serde(default)]
    pub ingredient_line_id: Option<String>,
    #[serde(default)]
    pub pattern_metadata: Value,
    #[serde(default)]
    pub should_schedule_categorization: bool,
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

pub struct ParseIngredientLineAction {
    parser: Arc<dyn IngredientLineParser>,
}

#[async_trait]
impl Action for ParseIngredientLineAction {
    type Payload = IngredientPayload;

    fn name(&self) -> ActionName {
        ActionName::ParseIngredientLine
    }

    fn validate_input(&self, payload: &IngredientPayload) -> Result<(), JobError> {
        if payload.raw_text.trim().is_empty() {
            return Err(JobError::validation("rawText must not be empty", ErrorContext::default()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        mut payload: IngredientPayload,
        _deps: &Dependencies,
        _ctx: &ActionContext,
    ) -> Result<IngredientPayload, JobError> {
        let segments = self.parser.parse(&payload.raw_text);
        payload.rule_ids = segments.into_iter().map(|s| s.rule_id).collect();
        Ok(payload)
    }
}

pub struct SaveIngredientLineAction {
    repo: Arc<dyn IngredientRepository>,
}

#[async_trait]
impl Action for SaveIngredientLineAction {
    type Payload = IngredientPayload;

    fn name(&self) -> ActionName {
        ActionName::SaveIngredientLine
    }

    async fn execute(
        &self,
        mut payload: IngredientPayload,
        _deps: &Dependencies,
        _ctx: &ActionContext,
    ) -> Result<IngredientPayload, JobError> {
        let id = self
            .repo
            .save_ingredient_line(&payload.note_id, payload.line_index, &payload.raw_text)
            .await?;
        payload.ingredient_line_id = Some(id);
        Ok(payload)
    }
}

struct RepoLinker {
    repo: Arc<dyn IngredientRepository>,
}

#[async_trait]
impl IngredientLineLinker for RepoLinker {
    async fn link_pattern(&self, ingredient_line_id: &str, pattern_id: &str) -> Result<(), JobError> {
        self.repo.link_pattern(ingredient_line_id, pattern_id).await
    }
}

pub struct TrackPatternAction {
    pattern_repo: Arc<dyn PatternRepository>,
    ingredient_repo: Arc<dyn IngredientRepository>,
}

#[async_trait]
impl Action for TrackPatternAction {
    type Payload = IngredientPayload;

    fn name(&self) -> ActionName {
        ActionName::TrackPattern
    }

    async fn execute(
        &self,
        mut payload: IngredientPayload,
        _deps: &Dependencies,
        ctx: &ActionContext,
    ) -> Result<IngredientPayload, JobError> {
        let mut input = TrackPatternInput::new(ctx.job_id.clone(), payload.rule_ids.clone());
        input.example_line = Some(payload.raw_text.clone());
        if let Some(line_id) = &payload.ingredient_line_id {
            input.metadata = json!({ "ingredientLineId": line_id });
        }

        let linker = RepoLinker { repo: self.ingredient_repo.clone() };
        let output = track_pattern(self.pattern_repo.as_ref(), Some(&linker), input).await;
        payload.pattern_metadata = output.metadata;
        Ok(payload)
    }
}

/// Reads the repository's ingredient completion status (authoritative
/// over the tracker, per spec §3) and marks this worker's narrow
/// `{Ingredient}` expected set as completed; if that was the only
/// outstanding leg, sets `should_schedule_categorization` for the
/// `JobProcessor` to act on after the pipeline returns.
pub struct CheckIngredientCompletionAction {
    tracker: Arc<CompletionTracker>,
    repo: Arc<dyn IngredientRepository>,
}

#[async_trait]
impl Action for CheckIngredientCompletionAction {
    type Payload = IngredientPayload;

    fn name(&self) -> ActionName {
        ActionName::CheckIngredientCompletion
    }

    async fn execute(
        &self,
        mut payload: IngredientPayload,
        _deps: &Dependencies,
        _ctx: &ActionContext,
    ) -> Result<IngredientPayload, JobError> {
        let status = self.repo.get_ingredient_completion_status(&payload.note_id).await?;
        self.tracker.update_ingredient_status(&payload.note_id, status.completed_ingredients, status.total_ingredients);

        if status.is_complete {
            let still_outstanding =
                !self.tracker.mark_worker_completed(&payload.note_id, WorkerKind::Ingredient, &[WorkerKind::Ingredient]);
            payload.should_schedule_categorization = !still_outstanding;
        }
        Ok(payload)
    }
}

pub fn register_ingredient_actions(
    parser: Arc<dyn IngredientLineParser>,
    ingredient_repo: Arc<dyn IngredientRepository>,
    pattern_repo: Arc<dyn PatternRepository>,
    tracker: Arc<CompletionTracker>,
) -> ActionFactory<IngredientPayload> {
    let mut factory = ActionFactory::new();
    factory.register(ActionName::ParseIngredientLine, {
        let parser = parser.clone();
        move || Box::new(ParseIngredientLineAction { parser: parser.clone() })
    });
    factory.register(ActionName::SaveIngredientLine, {
        let ingredient_repo = ingredient_repo.clone();
        move || Box::new(SaveIngredientLineAction { repo: ingredient_repo.clone() })
    });
    factory.register(ActionName::TrackPattern, {
        let ingredient_repo = ingredient_repo.clone();
        let pattern_repo = pattern_repo.clone();
        move || {
            Box::new(TrackPatternAction {
                pattern_repo: pattern_repo.clone(),
                ingredient_repo: ingredient_repo.clone(),
            })
        }
    });
    factory.register(ActionName::CheckIngredientCompletion, {
        move || {
            Box::new(CheckIngredientCompletionAction {
                tracker: tracker.clone(),
                repo: ingredient_repo.clone(),
            })
        }
    });
    factory
}

pub struct IngredientProcessor {
    factory: ActionFactory<IngredientPayload>,
    tracker: Arc<CompletionTracker>,
}

impl IngredientProcessor {
    pub fn new(
        parser: Arc<dyn IngredientLineParser>,
        ingredient_repo: Arc<dyn IngredientRepository>,
        pattern_repo: Arc<dyn PatternRepository>,
        tracker: Arc<CompletionTracker>,
    ) -> Self {
        Self {
            factory: register_ingredient_actions(parser, ingredient_repo, pattern_repo, tracker.clone()),
            tracker,
        }
    }
}

#[async_trait]
impl JobProcessor for IngredientProcessor {
    fn required_fields(&self) -> &'static [&'static str] {
        &["noteId", "importId", "rawText"]
    }

    async fn execute(
        &self,
        payload: Value,
        deps: &QueueDependencies,
        ctx: &ActionContext,
    ) -> Result<ProcessOutcome, JobError> {
        let input: IngredientPayload = serde_json::from_value(payload)
            .map_err(|err| ctx_error(ctx, format!("invalid ingredient payload: {err}")))?;

        // Bump the per-note job fan-in counter before running the pipeline,
        // for the same reason as the instruction processor: completion
        // bookkeeping inside the pipeline must not be undone by this bump.
        self.tracker.increment(&input.note_id);
        let result = run_pipeline(&self.factory, input, deps, ctx).await?;

        let follow_on = if result.should_schedule_categorization {
            scheduler::build_categorization_follow_on(
                &self.tracker,
                &result.note_id,
                &result.import_id,
                deps.status_broadcaster.as_deref(),
                Some(ctx.job_id.clone()),
            )
            .into_iter()
            .collect()
        } else {
            Vec::new()
        };

        let outcome = ProcessOutcome::new(serde_json::to_value(result).expect("serializable payload"))
            .with_follow_on(follow_on);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NaiveIngredientLineParser;
    use crate::repository::InMemoryIngredientRepository;
    use pattern_tracker::InMemoryPatternRepository;
    use serde_json::json;

    fn ctx() -> ActionContext {
        ActionContext::new("job-1", "ingredient", "ingredient-worker", "parse_ingredient", "import-1")
            .with_note_id("note-1")
    }

    #[tokio::test]
    async fn last_line_schedules_categorization() {
        let tracker = Arc::new(CompletionTracker::new());
        let ingredient_repo = Arc::new(InMemoryIngredientRepository::new());
        ingredient_repo.set_expected_total("note-1", 1);
        let pattern_repo = Arc::new(InMemoryPatternRepository::new());
        let processor = IngredientProcessor::new(
            Arc::new(NaiveIngredientLineParser),
            ingredient_repo,
            pattern_repo,
            tracker,
        );

        let outcome = processor
            .execute(
                json!({"noteId": "note-1", "importId": "import-1", "lineIndex": 0, "rawText": "2 cups flour"}),
                &Dependencies::new(),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.payload["shouldScheduleCategorization"], true);
        assert_eq!(outcome.follow_on.len(), 1);
        assert_eq!(outcome.follow_on[0].queue_name, "categorization");
    }

    #[tokio::test]
    async fn incomplete_lines_do_not_schedule() {
        let tracker = Arc::new(CompletionTracker::new());
        let ingredient_repo = Arc::new(InMemoryIngredientRepository::new());
        ingredient_repo.set_expected_total("note-1", 2);
        let pattern_repo = Arc::new(InMemoryPatternRepository::new());
        let processor = IngredientProcessor::new(
            Arc::new(NaiveIngredientLineParser),
            ingredient_repo,
            pattern_repo,
            tracker,
        );

        let outcome = processor
            .execute(
                json!({"noteId": "note-1", "importId": "import-1", "lineIndex": 0, "rawText": "2 cups flour"}),
                &Dependencies::new(),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.payload["shouldScheduleCategorization"], false);
        assert!(outcome.follow_on.is_empty());
    }

    #[tokio::test]
    async fn tracks_pattern_and_links_ingredient_line() {
        let tracker = Arc::new(CompletionTracker::new());
        let ingredient_repo = Arc::new(InMemoryIngredientRepository::new());
        ingredient_repo.set_expected_total("note-1", 5);
        let pattern_repo = Arc::new(InMemoryPatternRepository::new());
        let processor = IngredientProcessor::new(
            Arc::new(NaiveIngredientLineParser),
            ingredient_repo,
            pattern_repo,
            tracker,
        );

        let outcome = processor
            .execute(
                json!({"noteId": "note-1", "importId": "import-1", "lineIndex": 0, "rawText": "2 cups flour"}),
                &Dependencies::new(),
                &ctx(),
            )
            .await
            .unwrap();

        assert!(outcome.payload["patternMetadata"]["patternId"].is_string());
        assert_eq!(outcome.payload["patternMetadata"]["linkedToIngredientLine"], true);
    }
}
