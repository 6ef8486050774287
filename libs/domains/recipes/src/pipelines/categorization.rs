//! Categorization pipeline: `DETERMINE_CATEGORY → SAVE_CATEGORY →
//! DETERMINE_TAGS → SAVE_TAGS` (spec §4.11).

use std::sync::Arc;

use async_trait::async_trait;
use job_actions::{Action, ActionContext, ActionFactory, ActionName, Dependencies};
use job_errors::{ErrorContext, JobError};
use job_events::{JobStatus, StatusEvent};
use job_queue::{Dependencies as QueueDependencies, JobProcessor, ProcessOutcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::repository::{CategoryRepository, NoteRepository, TagRepository};

use super::run_pipeline;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorizationPayload {
    pub note_id: String,
    pub import_id: String,
    #[serde(default)]
    pub determined_category: Option<String>,
    #[serde(default)]
    pub saved_category_id: Option<String>,
    #[serde(default)]
    pub determined_tags: Vec<String>,
    #[serde(default)]
    pub tag_determination_reason: Option<String>,
    #[serde(default)]
    pub saved_tag_ids: Vec<String>,
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

pub struct DetermineCategoryAction {
    note_repo: Arc<dyn NoteRepository>,
}

#[async_trait]
impl Action for DetermineCategoryAction {
    type Payload = CategorizationPayload;

    fn name(&self) -> ActionName {
        ActionName::DetermineCategory
    }

    async fn execute(
        &self,
        mut payload: CategorizationPayload,
        _deps: &Dependencies,
        ctx: &ActionContext,
    ) -> Result<CategorizationPayload, JobError> {
        let (note, _) = self
            .note_repo
            .get_note_with_evernote_metadata(&payload.note_id)
            .await?
            .ok_or_else(|| ctx_error(ctx, format!("note {} not found", payload.note_id)))?;

        // A real categorizer would classify `note.cleaned_text`; this
        // engine's concern is the pipeline shape, not recipe taxonomy, so
        // the heuristic here is a placeholder: first line, else "Uncategorized".
        let category = note
            .cleaned_text
            .lines()
            .next()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .unwrap_or("Uncategorized")
            .to_string();
        payload.determined_category = Some(category);
        Ok(payload)
    }
}

pub struct SaveCategoryAction {
    category_repo: Arc<dyn CategoryRepository>,
}

#[async_trait]
impl Action for SaveCategoryAction {
    type Payload = CategorizationPayload;

    fn name(&self) -> ActionName {
        ActionName::SaveCategory
    }

    fn validate_input(&self, payload: &CategorizationPayload) -> Result<(), JobError> {
        if payload.determined_category.is_none() {
            return Err(JobError::validation(
                "determined_category missing before SAVE_CATEGORY",
                ErrorContext::default(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        mut payload: CategorizationPayload,
        _deps: &Dependencies,
        _ctx: &ActionContext,
    ) -> Result<CategorizationPayload, JobError> {
        let name = payload.determined_category.clone().expect("validated above");
        let category = self.category_repo.save_category_to_note(&payload.note_id, &name).await?;
        payload.saved_category_id = Some(category.id);
        Ok(payload)
    }
}

/// The one action whose contract requires broadcaster failures to
/// propagate as job failures rather than being swallowed at the
/// `BaseAction` boundary (spec §4.3 exception) — it broadcasts inline.
pub struct DetermineTagsAction {
    note_repo: Arc<dyn NoteRepository>,
}

#[async_trait]
impl Action for DetermineTagsAction {
    type Payload = CategorizationPayload;

    fn name(&self) -> ActionName {
        ActionName::DetermineTags
    }

    async fn execute(
        &self,
        mut payload: CategorizationPayload,
        deps: &Dependencies,
        ctx: &ActionContext,
    ) -> Result<CategorizationPayload, JobError> {
        if let Some(broadcaster) = &deps.status_broadcaster {
            let event = StatusEvent::new(
                ctx.import_id.clone(),
                JobStatus::Processing,
                "Determining tags...",
                "determine_tags",
            )
            .with_note_id(ctx.note_id.clone().unwrap_or_default());
            broadcaster
                .add_status_event_and_broadcast(event)
                .map_err(|err| ctx_error(ctx, format!("status broadcast failed: {err}")))?;
        }

        let (_, metadata) = self
            .note_repo
            .get_note_with_evernote_metadata(&payload.note_id)
            .await?
            .ok_or_else(|| ctx_error(ctx, format!("note {} not found", payload.note_id)))?;

        match metadata.tags {
            Some(tags) if !tags.is_empty() => {
                payload.determined_tags = tags;
                payload.tag_determination_reason = None;
            }
            _ => {
                payload.determined_tags = Vec::new();
                payload.tag_determination_reason = Some("No Evernote tags metadata".to_string());
            }
        }
        Ok(payload)
    }
}

pub struct SaveTagsAction {
    tag_repo: Arc<dyn TagRepository>,
}

#[async_trait]
impl Action for SaveTagsAction {
    type Payload = CategorizationPayload;

    fn name(&self) -> ActionName {
        ActionName::SaveTags
    }

    async fn execute(
        &self,
        mut payload: CategorizationPayload,
        _deps: &Dependencies,
        _ctx: &ActionContext,
    ) -> Result<CategorizationPayload, JobError> {
        if payload.determined_tags.is_empty() {
            payload.saved_tag_ids = Vec::new();
            return Ok(payload);
        }
        let tags = self.tag_repo.save_tags_to_note(&payload.note_id, &payload.determined_tags).await?;
        payload.saved_tag_ids = tags.into_iter().map(|t| t.id).collect();
        Ok(payload)
    }
}

pub fn register_categorization_actions(
    note_repo: Arc<dyn NoteRepository>,
    category_repo: Arc<dyn CategoryRepository>,
    tag_repo: Arc<dyn TagRepository>,
) -> ActionFactory<CategorizationPayload> {
    let mut factory = ActionFactory::new();
    factory.register(ActionName::DetermineCategory, {
        let note_repo = note_repo.clone();
        move || Box::new(DetermineCategoryAction { note_repo: note_repo.clone() })
    });
    factory.register(ActionName::SaveCategory, {
        move || Box::new(SaveCategoryAction { category_repo: category_repo.clone() })
    });
    factory.register(ActionName::DetermineTags, {
        move || Box::new(DetermineTagsAction { note_repo: note_repo.clone() })
    });
    factory.register(ActionName::SaveTags, {
        move || Box::new(SaveTagsAction { tag_repo: tag_repo.clone() })
    });
    factory
}

/// Binds the categorization pipeline to a queue as a `JobProcessor`.
pub struct CategorizationProcessor {
    factory: ActionFactory<CategorizationPayload>,
}

impl CategorizationProcessor {
    pub fn new(
        note_repo: Arc<dyn NoteRepository>,
        category_repo: Arc<dyn CategoryRepository>,
        tag_repo: Arc<dyn TagRepository>,
    ) -> Self {
        Self {
            factory: register_categorization_actions(note_repo, category_repo, tag_repo),
        }
    }
}

#[async_trait]
impl JobProcessor for CategorizationProcessor {
    fn required_fields(&self) -> &'static [&'static str] {
        &["noteId", "importId"]
    }

    async fn execute(
        &self,
        payload: Value,
        deps: &QueueDependencies,
        ctx: &ActionContext,
    ) -> Result<ProcessOutcome, JobError> {
        let note_id = payload["noteId"].as_str().unwrap_or_default().to_string();
        let import_id = payload["importId"].as_str().unwrap_or_default().to_string();
        let input = CategorizationPayload {
            note_id,
            import_id,
            ..Default::default()
        };

        let result = run_pipeline(&self.factory, input, deps, ctx).await?;
        Ok(ProcessOutcome::new(serde_json::to_value(result).expect("serializable payload")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EvernoteMetadata;
    use crate::repository::{InMemoryCategoryRepository, InMemoryNoteRepository, InMemoryTagRepository};
    use job_events::StatusBroadcaster;
    use serde_json::json;

    fn ctx() -> ActionContext {
        ActionContext::new("job-1", "categorization", "categorization-worker", "categorize", "import-1")
            .with_note_id("note-1")
    }

    async fn seeded_note(tags: Option<Vec<String>>) -> (Arc<InMemoryNoteRepository>, String) {
        let repo = Arc::new(InMemoryNoteRepository::new());
        let note = repo.create_note("import-1", "Tomato Soup", "Tomato Soup\nServes 4", 200).await.unwrap();
        repo.seed_evernote_metadata(&note.id, EvernoteMetadata { tags });
        (repo, note.id)
    }

    #[tokio::test]
    async fn full_pipeline_saves_category_and_tags() {
        let (note_repo, note_id) = seeded_note(Some(vec!["soup".into(), "dinner".into()])).await;
        let category_repo = Arc::new(InMemoryCategoryRepository::new());
        let tag_repo = Arc::new(InMemoryTagRepository::new());
        let processor = CategorizationProcessor::new(note_repo, category_repo, tag_repo);

        let outcome = processor
            .execute(
                json!({"noteId": note_id, "importId": "import-1"}),
                &Dependencies::new(),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.payload["determinedCategory"], "Tomato Soup");
        assert!(outcome.payload["savedCategoryId"].is_string());
        assert_eq!(outcome.payload["savedTagIds"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_evernote_tags_yields_documented_reason() {
        let (note_repo, note_id) = seeded_note(Some(vec![])).await;
        let category_repo = Arc::new(InMemoryCategoryRepository::new());
        let tag_repo = Arc::new(InMemoryTagRepository::new());
        let processor = CategorizationProcessor::new(note_repo, category_repo, tag_repo);

        let outcome = processor
            .execute(
                json!({"noteId": note_id, "importId": "import-1"}),
                &Dependencies::new(),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.payload["determinedTags"].as_array().unwrap().len(), 0);
        assert_eq!(outcome.payload["tagDeterminationReason"], "No Evernote tags metadata");
    }

    #[tokio::test]
    async fn missing_evernote_tags_field_yields_same_reason() {
        let (note_repo, note_id) = seeded_note(None).await;
        let category_repo = Arc::new(InMemoryCategoryRepository::new());
        let tag_repo = Arc::new(InMemoryTagRepository::new());
        let processor = CategorizationProcessor::new(note_repo, category_repo, tag_repo);

        let outcome = processor
            .execute(
                json!({"noteId": note_id, "importId": "import-1"}),
                &Dependencies::new(),
                &ctx(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.payload["tagDeterminationReason"], "No Evernote tags metadata");
    }

    #[tokio::test]
    async fn determine_tags_broadcasts_inline_and_propagates_failures() {
        let (note_repo, note_id) = seeded_note(Some(vec!["soup".into()])).await;
        let category_repo = Arc::new(InMemoryCategoryRepository::new());
        let tag_repo = Arc::new(InMemoryTagRepository::new());
        let processor = CategorizationProcessor::new(note_repo, category_repo, tag_repo);

        let broadcaster = Arc::new(StatusBroadcaster::new());
        let deps = Dependencies::new().with_status_broadcaster(broadcaster.clone());

        processor
            .execute(json!({"noteId": note_id, "importId": "import-1"}), &deps, &ctx())
            .await
            .unwrap();

        let events = broadcaster.events_for_import("import-1");
        assert!(events.iter().any(|e| e.context == "determine_tags"));
        // DETERMINE_TAGS opts out of BaseAction's own start/completion
        // broadcasting, so only its one inline event (plus the other three
        // actions' two events each) should appear — not three for this action.
        let determine_tags_events = events.iter().filter(|e| e.context == "determine_tags").count();
        assert_eq!(determine_tags_events, 1);
    }
}
