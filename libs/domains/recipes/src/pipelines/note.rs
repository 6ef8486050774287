//! Note pipeline: `CLEAN_HTML → PARSE_HTML → PERSIST_NOTE → FANOUT_LINES`
//! (spec §4.11). Entry point of the import: a raw Evernote export note
//! enters here and leaves as one job per ingredient/instruction line.

use std::sync::Arc;

use async_trait::async_trait;
use job_actions::{Action, ActionContext, ActionFactory, ActionName, Dependencies};
use job_errors::{ErrorContext, JobError};
use job_queue::{Dependencies as QueueDependencies, FollowOnJob, JobProcessor, ProcessOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::collaborators::HtmlCleaner;
use crate::repository::{IngredientRepository, InstructionRepository, NoteRepository};
use completion_tracker::{CompletionTracker, WorkerKind};

use super::run_pipeline;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotePayload {
    pub import_id: String,
    #[serde(default)]
    pub note_id: Option<String>,
    pub raw_html: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub cleaned_text: Option<String>,
    #[serde(default)]
    pub ingredient_lines: Vec<String>,
    #[serde(default)]
    pub instruction_lines: Vec<String>,
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

pub struct CleanHtmlAction {
    cleaner: Arc<dyn HtmlCleaner>,
}

#[async_trait]
impl Action for CleanHtmlAction {
    type Payload = NotePayload;

    fn name(&self) -> ActionName {
        ActionName::CleanHtml
    }

    fn validate_input(&self, payload: &NotePayload) -> Result<(), JobError> {
        if payload.raw_html.trim().is_empty() {
            return Err(JobError::validation("rawHtml must not be empty", ErrorContext::default()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        mut payload: NotePayload,
        _deps: &Dependencies,
        _ctx: &ActionContext,
    ) -> Result<NotePayload, JobError> {
        payload.cleaned_text = Some(self.cleaner.clean(&payload.raw_html));
        Ok(payload)
    }
}

/// Heuristic section splitting: first non-empty line is the title, a line
/// equal to (case-insensitively) "ingredients" or "instructions" switches
/// the section the following lines fall into. A real parser would use a
/// dedicated recipe grammar; the shape here is enough to exercise the
/// pipeline end to end.
pub struct ParseHtmlAction;

#[async_trait]
impl Action for ParseHtmlAction {
    type Payload = NotePayload;

    fn name(&self) -> ActionName {
        ActionName::ParseHtml
    }

    fn validate_input(&self, payload: &NotePayload) -> Result<(), JobError> {
        if payload.cleaned_text.is_none() {
            return Err(JobError::validation(
                "cleanedText missing before PARSE_HTML",
                ErrorContext::default(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        mut payload: NotePayload,
        _deps: &Dependencies,
        _ctx: &ActionContext,
    ) -> Result<NotePayload, JobError> {
        let text = payload.cleaned_text.clone().expect("validated above");
        let mut lines = text.lines();

        payload.title = lines.next().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string);

        #[derive(PartialEq)]
        enum Section {
            None,
            Ingredients,
            Instructions,
        }
        let mut section = Section::None;
        let mut ingredient_lines = Vec::new();
        let mut instruction_lines = Vec::new();

        for line in lines {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match trimmed.to_lowercase().as_str() {
                "ingredients" => {
                    section = Section::Ingredients;
                    continue;
                }
                "instructions" | "directions" => {
                    section = Section::Instructions;
                    continue;
                }
                _ => {}
            }
            match section {
                Section::Ingredients => ingredient_lines.push(trimmed.to_string()),
                Section::Instructions => instruction_lines.push(trimmed.to_string()),
                Section::None => {}
            }
        }

        payload.ingredient_lines = ingredient_lines;
        payload.instruction_lines = instruction_lines;
        Ok(payload)
    }
}

pub struct PersistNoteAction {
    note_repo: Arc<dyn NoteRepository>,
}

#[async_trait]
impl Action for PersistNoteAction {
    type Payload = NotePayload;

    fn name(&self) -> ActionName {
        ActionName::PersistNote
    }

    async fn execute(
        &self,
        mut payload: NotePayload,
        _deps: &Dependencies,
        _ctx: &ActionContext,
    ) -> Result<NotePayload, JobError> {
        let title = payload.title.clone().unwrap_or_else(|| "Untitled".to_string());
        let cleaned_text = payload.cleaned_text.clone().unwrap_or_default();
        let note = self
            .note_repo
            .create_note(&payload.import_id, &title, &cleaned_text, payload.raw_html.len())
            .await?;
        payload.note_id = Some(note.id);
        Ok(payload)
    }
}

/// Seeds the completion tracker with the note's total fan-out job count,
/// tells the ingredient/instruction repositories how many lines to expect,
/// and marks this note's own `WorkerKind::Note` leg of the full
/// expected-worker set (spec §4.11's "(schedules ingredient/instruction
/// jobs)").
pub struct FanoutLinesAction {
    tracker: Arc<CompletionTracker>,
    ingredient_repo: Arc<dyn IngredientRepository>,
    instruction_repo: Arc<dyn InstructionRepository>,
}

#[async_trait]
impl Action for FanoutLinesAction {
    type Payload = NotePayload;

    fn name(&self) -> ActionName {
        ActionName::FanoutLines
    }

    fn validate_input(&self, payload: &NotePayload) -> Result<(), JobError> {
        if payload.note_id.is_none() {
            return Err(JobError::validation(
                "noteId missing before FANOUT_LINES",
                ErrorContext::default(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        payload: NotePayload,
        _deps: &Dependencies,
        ctx: &ActionContext,
    ) -> Result<NotePayload, JobError> {
        let note_id = payload.note_id.clone().expect("validated above");
        let total_jobs = (payload.ingredient_lines.len() + payload.instruction_lines.len()) as u64;
        self.tracker.create(&note_id, total_jobs);
        self.ingredient_repo.set_expected_total(&note_id, payload.ingredient_lines.len() as u64);
        self.instruction_repo.set_expected_total(&note_id, payload.instruction_lines.len() as u64);

        let expected = [WorkerKind::Ingredient, WorkerKind::Instruction, WorkerKind::Note];
        self.tracker.mark_worker_completed(&note_id, WorkerKind::Note, &expected);
        let _ = ctx;
        Ok(payload)
    }
}

pub fn register_note_actions(
    cleaner: Arc<dyn HtmlCleaner>,
    note_repo: Arc<dyn NoteRepository>,
    tracker: Arc<CompletionTracker>,
    ingredient_repo: Arc<dyn IngredientRepository>,
    instruction_repo: Arc<dyn InstructionRepository>,
) -> ActionFactory<NotePayload> {
    let mut factory = ActionFactory::new();
    factory.register(ActionName::CleanHtml, {
        let cleaner = cleaner.clone();
        move || Box::new(CleanHtmlAction { cleaner: cleaner.clone() })
    });
    factory.register(ActionName::ParseHtml, || Box::new(ParseHtmlAction));
    factory.register(ActionName::PersistNote, {
        let note_repo = note_repo.clone();
        move || Box::new(PersistNoteAction { note_repo: note_repo.clone() })
    });
    factory.register(ActionName::FanoutLines, {
        move || {
            Box::new(FanoutLinesAction {
                tracker: tracker.clone(),
                ingredient_repo: ingredient_repo.clone(),
                instruction_repo: instruction_repo.clone(),
            })
        }
    });
    factory
}

pub struct NoteProcessor {
    factory: ActionFactory<NotePayload>,
}

impl NoteProcessor {
    pub fn new(
        cleaner: Arc<dyn HtmlCleaner>,
        note_repo: Arc<dyn NoteRepository>,
        tracker: Arc<CompletionTracker>,
        ingredient_repo: Arc<dyn IngredientRepository>,
        instruction_repo: Arc<dyn InstructionRepository>,
    ) -> Self {
        Self {
            factory: register_note_actions(cleaner, note_repo, tracker, ingredient_repo, instruction_repo),
        }
    }
}

#[async_trait]
impl JobProcessor for NoteProcessor {
    fn required_fields(&self) -> &'static [&'static str] {
        &["importId", "rawHtml"]
    }

    async fn execute(
        &self,
        payload: Value,
        deps: &QueueDependencies,
        ctx: &ActionContext,
    ) -> Result<ProcessOutcome, JobError> {
        let input: NotePayload = serde_json::from_value(payload)
            .map_err(|err| ctx_error(ctx, format!("invalid note payload: {err}")))?;

        let result = run_pipeline(&self.factory, input, deps, ctx).await?;
        let note_id = result.note_id.clone().unwrap_or_default();

        let mut follow_on = Vec::with_capacity(result.ingredient_lines.len() + result.instruction_lines.len());
        for (index, raw_text) in result.ingredient_lines.iter().enumerate() {
            follow_on.push(FollowOnJob::new(
                "ingredient",
                json!({
                    "noteId": note_id,
                    "importId": result.import_id,
                    "lineIndex": index,
                    "rawText": raw_text,
                }),
            ));
        }
        for (index, raw_text) in result.instruction_lines.iter().enumerate() {
            follow_on.push(FollowOnJob::new(
                "instruction",
                json!({
                    "noteId": note_id,
                    "importId": result.import_id,
                    "lineIndex": index,
                    "rawText": raw_text,
                }),
            ));
        }

        let outcome = ProcessOutcome::new(serde_json::to_value(result).expect("serializable payload"))
            .with_follow_on(follow_on);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NaiveHtmlCleaner;
    use crate::repository::{InMemoryIngredientRepository, InMemoryInstructionRepository, InMemoryNoteRepository};
    use serde_json::json;

    fn ctx() -> ActionContext {
        ActionContext::new("job-1", "note", "note-worker", "parse_note", "import-1")
    }

    fn processor() -> NoteProcessor {
        NoteProcessor::new(
            Arc::new(NaiveHtmlCleaner),
            Arc::new(InMemoryNoteRepository::new()),
            Arc::new(CompletionTracker::new()),
            Arc::new(InMemoryIngredientRepository::new()),
            Arc::new(InMemoryInstructionRepository::new()),
        )
    }

    #[tokio::test]
    async fn fans_out_one_follow_on_job_per_line() {
        let processor = processor();
        let raw_html = "<h1>Tomato Soup</h1><p>Ingredients</p><p>2 cups tomato</p><p>1 onion</p><p>Instructions</p><p>Simmer for 20 minutes</p>";

        let outcome = processor
            .execute(
                json!({"importId": "import-1", "rawHtml": raw_html}),
                &Dependencies::new(),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.follow_on.len(), 3);
        assert_eq!(outcome.follow_on[0].queue_name, "ingredient");
        assert_eq!(outcome.follow_on[2].queue_name, "instruction");
        assert!(outcome.payload["noteId"].is_string());
    }

    #[tokio::test]
    async fn rejects_empty_raw_html() {
        let processor = processor();
        let err = processor
            .execute(json!({"importId": "import-1", "rawHtml": "   "}), &Dependencies::new(), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind, job_errors::JobErrorKind::ValidationError);
    }
}
