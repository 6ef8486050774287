//! Supplemental entities (SPEC_FULL.md §3.1): the minimal record shapes
//! needed to drive note parsing and per-line fan-out. The full recipe
//! schema is explicitly a non-goal; these carry only what the pipelines
//! read or write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The parsed note record persisted by `PERSIST_NOTE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeNote {
    pub id: String,
    pub import_id: String,
    pub title: String,
    pub cleaned_text: String,
    pub raw_html_len: usize,
    pub created_at: DateTime<Utc>,
}

/// Evernote-sourced metadata carried alongside a note, consulted by
/// `DETERMINE_TAGS` (spec example 4: empty/missing tags yields a specific
/// determination reason rather than an empty-vec no-op).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvernoteMetadata {
    pub tags: Option<Vec<String>>,
}

/// Per-line record produced by `FANOUT_LINES` for the ingredient queue.
/// `unique_line_pattern_id` is set by the pattern-tracker link step
/// (§4.7) once `TRACK_PATTERN` resolves a pattern for this line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngredientLine {
    pub id: String,
    pub note_id: String,
    pub line_index: usize,
    pub raw_text: String,
    pub unique_line_pattern_id: Option<String>,
}

/// Per-line record produced by `FANOUT_LINES` for the instruction queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionLine {
    pub id: String,
    pub note_id: String,
    pub line_index: usize,
    pub raw_text: String,
    pub formatted_text: Option<String>,
}

/// A category saved against a note by `SAVE_CATEGORY`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
}

/// A tag saved against a note by `SAVE_TAGS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
}

/// `{completedInstructions, totalInstructions, progress: "N/M", isComplete}`
/// per the repository contract (§6.3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InstructionCompletionStatus {
    pub completed_instructions: u64,
    pub total_instructions: u64,
    pub is_complete: bool,
}

impl InstructionCompletionStatus {
    pub fn progress(&self) -> String {
        format!("{}/{}", self.completed_instructions, self.total_instructions)
    }
}

/// `{completedIngredients, totalIngredients, isComplete}` per the
/// repository contract (§6.3). The engine treats this as ground truth
/// over the in-memory tracker when a repository read is consulted
/// (spec §3: "IngredientCompletionStatus... derived either from tracker
/// state or from a repository read").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IngredientCompletionStatus {
    pub completed_ingredients: u64,
    pub total_ingredients: u64,
    pub is_complete: bool,
}
