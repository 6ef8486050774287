//! Repository contract (spec §6.3, excerpt) plus the §6.7 in-memory
//! implementations. Grounded in `domain_tasks::TaskRepository`'s
//! `#[cfg_attr(test, mockall::automock)]` async-trait shape, split by
//! aggregate the way the spec's excerpt implies (notes, categories, tags,
//! per-stage completion reads) rather than one monolithic trait.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use job_errors::JobError;
use uuid::Uuid;

use crate::models::{
    Category, EvernoteMetadata, IngredientCompletionStatus, InstructionCompletionStatus, RecipeNote, Tag,
};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NoteRepository: Send + Sync {
    async fn create_note(&self, import_id: &str, title: &str, cleaned_text: &str, raw_html_len: usize) -> Result<RecipeNote, JobError>;

    async fn get_note_with_evernote_metadata(&self, note_id: &str) -> Result<Option<(RecipeNote, EvernoteMetadata)>, JobError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CategoryRepository: Send + Sync {
    async fn save_category_to_note(&self, note_id: &str, category_name: &str) -> Result<Category, JobError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TagRepository: Send + Sync {
    async fn save_tags_to_note(&self, note_id: &str, tag_names: &[String]) -> Result<Vec<Tag>, JobError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IngredientRepository: Send + Sync {
    async fn save_ingredient_line(&self, note_id: &str, line_index: usize, raw_text: &str) -> Result<String, JobError>;

    async fn link_pattern(&self, ingredient_line_id: &str, pattern_id: &str) -> Result<(), JobError>;

    async fn get_ingredient_completion_status(&self, note_id: &str) -> Result<IngredientCompletionStatus, JobError>;

    /// Tells the repository how many ingredient lines to expect for
    /// `note_id`, set by `FANOUT_LINES` once a note's lines are known.
    fn set_expected_total(&self, note_id: &str, total: u64);
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InstructionRepository: Send + Sync {
    async fn save_instruction_line(&self, note_id: &str, line_index: usize, formatted_text: &str) -> Result<String, JobError>;

    async fn get_instruction_completion_status(&self, note_id: &str) -> Result<InstructionCompletionStatus, JobError>;

    /// Tells the repository how many instruction lines to expect for
    /// `note_id`, set by `FANOUT_LINES` once a note's lines are known.
    fn set_expected_total(&self, note_id: &str, total: u64);
}

#[derive(Default)]
struct NoteState {
    notes: HashMap<String, RecipeNote>,
    evernote_metadata: HashMap<String, EvernoteMetadata>,
}

/// Single-process note repository (§6.7: a real, minimal implementation,
/// not a stand-in for missing functionality).
#[derive(Default)]
pub struct InMemoryNoteRepository {
    state: Mutex<NoteState>,
}

impl InMemoryNoteRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds Evernote metadata for a note created later via `create_note`
    /// — test/deployment setup helper, not part of the repository contract.
    pub fn seed_evernote_metadata(&self, note_id: &str, metadata: EvernoteMetadata) {
        self.state
            .lock()
            .expect("note repository lock poisoned")
            .evernote_metadata
            .insert(note_id.to_string(), metadata);
    }
}

#[async_trait]
impl NoteRepository for InMemoryNoteRepository {
    async fn create_note(&self, import_id: &str, title: &str, cleaned_text: &str, raw_html_len: usize) -> Result<RecipeNote, JobError> {
        let note = RecipeNote {
            id: Uuid::new_v4().to_string(),
            import_id: import_id.to_string(),
            title: title.to_string(),
            cleaned_text: cleaned_text.to_string(),
            raw_html_len,
            created_at: chrono::Utc::now(),
        };
        let mut state = self.state.lock().expect("note repository lock poisoned");
        state.notes.insert(note.id.clone(), note.clone());
        Ok(note)
    }

    async fn get_note_with_evernote_metadata(&self, note_id: &str) -> Result<Option<(RecipeNote, EvernoteMetadata)>, JobError> {
        let state = self.state.lock().expect("note repository lock poisoned");
        Ok(state.notes.get(note_id).map(|note| {
            let metadata = state.evernote_metadata.get(note_id).cloned().unwrap_or_default();
            (note.clone(), metadata)
        }))
    }
}

#[derive(Default)]
pub struct InMemoryCategoryRepository {
    categories: Mutex<HashMap<String, Category>>,
}

impl InMemoryCategoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CategoryRepository for InMemoryCategoryRepository {
    async fn save_category_to_note(&self, note_id: &str, category_name: &str) -> Result<Category, JobError> {
        let mut categories = self.categories.lock().expect("category repository lock poisoned");
        // Idempotent w.r.t. duplicate names, per spec §5: a second save with
        // the same name returns the existing category rather than a new id.
        if let Some(existing) = categories.get(note_id) {
            if existing.name == category_name {
                return Ok(existing.clone());
            }
        }
        let category = Category {
            id: Uuid::new_v4().to_string(),
            name: category_name.to_string(),
        };
        categories.insert(note_id.to_string(), category.clone());
        Ok(category)
    }
}

#[derive(Default)]
pub struct InMemoryTagRepository {
    tags: Mutex<HashMap<String, Vec<Tag>>>,
}

impl InMemoryTagRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TagRepository for InMemoryTagRepository {
    async fn save_tags_to_note(&self, note_id: &str, tag_names: &[String]) -> Result<Vec<Tag>, JobError> {
        let tags: Vec<Tag> = tag_names
            .iter()
            .map(|name| Tag {
                id: Uuid::new_v4().to_string(),
                name: name.clone(),
            })
            .collect();
        self.tags
            .lock()
            .expect("tag repository lock poisoned")
            .insert(note_id.to_string(), tags.clone());
        Ok(tags)
    }
}

#[derive(Default)]
struct IngredientState {
    lines: HashMap<String, (String, usize)>,
    links: HashMap<String, String>,
    totals: HashMap<String, u64>,
}

/// Ground truth for `CHECK_INGREDIENT_COMPLETION`'s repository read (spec
/// §3: the engine treats a repository read as authoritative over the
/// in-memory tracker). Completion here is derived from how many lines
/// have been saved against `total` set via `set_expected_total`.
#[derive(Default)]
pub struct InMemoryIngredientRepository {
    state: Mutex<IngredientState>,
}

impl InMemoryIngredientRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IngredientRepository for InMemoryIngredientRepository {
    fn set_expected_total(&self, note_id: &str, total: u64) {
        self.state
            .lock()
            .expect("ingredient repository lock poisoned")
            .totals
            .insert(note_id.to_string(), total);
    }

    async fn save_ingredient_line(&self, note_id: &str, line_index: usize, raw_text: &str) -> Result<String, JobError> {
        let _ = raw_text;
        let id = Uuid::new_v4().to_string();
        self.state
            .lock()
            .expect("ingredient repository lock poisoned")
            .lines
            .insert(id.clone(), (note_id.to_string(), line_index));
        Ok(id)
    }

    async fn link_pattern(&self, ingredient_line_id: &str, pattern_id: &str) -> Result<(), JobError> {
        self.state
            .lock()
            .expect("ingredient repository lock poisoned")
            .links
            .insert(ingredient_line_id.to_string(), pattern_id.to_string());
        Ok(())
    }

    async fn get_ingredient_completion_status(&self, note_id: &str) -> Result<IngredientCompletionStatus, JobError> {
        let state = self.state.lock().expect("ingredient repository lock poisoned");
        let completed = state.lines.values().filter(|(id, _)| id == note_id).count() as u64;
        let total = state.totals.get(note_id).copied().unwrap_or(completed);
        Ok(IngredientCompletionStatus {
            completed_ingredients: completed,
            total_ingredients: total,
            is_complete: total > 0 && completed == total,
        })
    }
}

#[derive(Default)]
struct InstructionState {
    lines: HashMap<String, (String, usize)>,
    totals: HashMap<String, u64>,
}

#[derive(Default)]
pub struct InMemoryInstructionRepository {
    state: Mutex<InstructionState>,
}

impl InMemoryInstructionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstructionRepository for InMemoryInstructionRepository {
    fn set_expected_total(&self, note_id: &str, total: u64) {
        self.state
            .lock()
            .expect("instruction repository lock poisoned")
            .totals
            .insert(note_id.to_string(), total);
    }

    async fn save_instruction_line(&self, note_id: &str, line_index: usize, formatted_text: &str) -> Result<String, JobError> {
        let _ = formatted_text;
        let id = Uuid::new_v4().to_string();
        self.state
            .lock()
            .expect("instruction repository lock poisoned")
            .lines
            .insert(id.clone(), (note_id.to_string(), line_index));
        Ok(id)
    }

    async fn get_instruction_completion_status(&self, note_id: &str) -> Result<InstructionCompletionStatus, JobError> {
        let state = self.state.lock().expect("instruction repository lock poisoned");
        let completed = state.lines.values().filter(|(id, _)| id == note_id).count() as u64;
        let total = state.totals.get(note_id).copied().unwrap_or(completed);
        Ok(InstructionCompletionStatus {
            completed_instructions: completed,
            total_instructions: total,
            is_complete: total > 0 && completed == total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn note_round_trips_with_seeded_evernote_metadata() {
        let repo = InMemoryNoteRepository::new();
        let note = repo.create_note("import-1", "Soup", "clean text", 120).await.unwrap();
        repo.seed_evernote_metadata(
            &note.id,
            EvernoteMetadata {
                tags: Some(vec!["dinner".into()]),
            },
        );

        let (fetched, metadata) = repo.get_note_with_evernote_metadata(&note.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "Soup");
        assert_eq!(metadata.tags.unwrap(), vec!["dinner".to_string()]);
    }

    #[tokio::test]
    async fn saving_same_category_name_twice_is_idempotent() {
        let repo = InMemoryCategoryRepository::new();
        let first = repo.save_category_to_note("n1", "Soups").await.unwrap();
        let second = repo.save_category_to_note("n1", "Soups").await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn ingredient_completion_status_reflects_saved_lines_against_total() {
        let repo = InMemoryIngredientRepository::new();
        repo.set_expected_total("n1", 3);
        repo.save_ingredient_line("n1", 0, "1 cup flour").await.unwrap();
        repo.save_ingredient_line("n1", 1, "2 eggs").await.unwrap();

        let status = repo.get_ingredient_completion_status("n1").await.unwrap();
        assert_eq!(status.completed_ingredients, 2);
        assert!(!status.is_complete);

        repo.save_ingredient_line("n1", 2, "1 tsp salt").await.unwrap();
        let status = repo.get_ingredient_completion_status("n1").await.unwrap();
        assert!(status.is_complete);
    }
}
