//! Pattern tracking write path: upserts an occurrence-counted pattern
//! record keyed by an ordered rule-id sequence, optionally links it to an
//! ingredient line, and never throws — failures are recorded in the
//! returned metadata instead of propagating, per the call-site contract
//! actions rely on.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use job_errors::JobError;
use serde_json::{json, Value};
use tracing::warn;

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// A tracked pattern, keyed by its ordered rule-id sequence.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub id: String,
    pub rule_ids: Vec<String>,
    pub occurrence_count: u64,
    pub example_line: Option<String>,
}

/// Transactional upsert backend (spec §6.3: "transactional pattern
/// upsert: keyed on ruleIds; supports increment on occurrenceCount").
#[async_trait]
pub trait PatternRepository: Send + Sync {
    async fn upsert_pattern(&self, rule_ids: &[String], example_line: Option<&str>) -> Result<Pattern, JobError>;
}

/// Links a parsed ingredient line to the pattern that matched it.
#[async_trait]
pub trait IngredientLineLinker: Send + Sync {
    async fn link_pattern(&self, ingredient_line_id: &str, pattern_id: &str) -> Result<(), JobError>;
}

#[derive(Default)]
pub struct InMemoryPatternRepository {
    patterns: Mutex<HashMap<Vec<String>, Pattern>>,
}

impl InMemoryPatternRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PatternRepository for InMemoryPatternRepository {
    async fn upsert_pattern(&self, rule_ids: &[String], example_line: Option<&str>) -> Result<Pattern, JobError> {
        let mut patterns = self.patterns.lock().expect("pattern repository lock poisoned");
        let key = rule_ids.to_vec();
        let pattern = patterns.entry(key).or_insert_with(|| Pattern {
            id: uuid::Uuid::new_v4().to_string(),
            rule_ids: rule_ids.to_vec(),
            occurrence_count: 0,
            example_line: None,
        });
        pattern.occurrence_count += 1;
        if let Some(line) = example_line {
            pattern.example_line = Some(line.to_string());
        }
        Ok(pattern.clone())
    }
}

/// Input to `track_pattern`: the fields an action passes in, plus
/// whatever metadata it already carries forward.
#[derive(Debug, Clone)]
pub struct TrackPatternInput {
    pub job_id: String,
    pub pattern_rules: Vec<String>,
    pub example_line: Option<String>,
    pub metadata: Value,
}

impl TrackPatternInput {
    pub fn new(job_id: impl Into<String>, pattern_rules: Vec<String>) -> Self {
        Self {
            job_id: job_id.into(),
            pattern_rules,
            example_line: None,
            metadata: json!({}),
        }
    }
}

/// Runs the pattern-tracking write path. Never returns `Err` — failures
/// after exhausting retries are recorded in the output's metadata.
pub async fn track_pattern(
    repository: &dyn PatternRepository,
    linker: Option<&dyn IngredientLineLinker>,
    input: TrackPatternInput,
) -> TrackPatternInput {
    if input.pattern_rules.is_empty() {
        return input;
    }

    let mut attempt = 0;
    let pattern = loop {
        match repository
            .upsert_pattern(&input.pattern_rules, input.example_line.as_deref())
            .await
        {
            Ok(pattern) => break Some(pattern),
            Err(err) if attempt + 1 < MAX_RETRIES => {
                attempt += 1;
                warn!(job_id = %input.job_id, attempt, error = %err, "pattern upsert conflict, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(err) => {
                err.log();
                break None;
            }
        }
    };

    let mut output = input;
    let Some(pattern) = pattern else {
        let mut metadata = output.metadata.as_object().cloned().unwrap_or_default();
        metadata.insert("error".to_string(), json!("pattern upsert failed after retries"));
        metadata.insert("errorTimestamp".to_string(), json!(Utc::now().to_rfc3339()));
        output.metadata = Value::Object(metadata);
        return output;
    };

    let mut linked_to_ingredient_line = false;
    if let Some(linker) = linker {
        if let Some(line_id) = output.metadata.get("ingredientLineId").and_then(Value::as_str) {
            match linker.link_pattern(line_id, &pattern.id).await {
                Ok(()) => linked_to_ingredient_line = true,
                Err(err) => warn!(job_id = %output.job_id, error = %err, "pattern-to-ingredient-line link failed"),
            }
        }
    }

    let mut metadata = output.metadata.as_object().cloned().unwrap_or_default();
    metadata.insert("patternId".to_string(), json!(pattern.id));
    metadata.insert("trackedAt".to_string(), json!(Utc::now().to_rfc3339()));
    metadata.insert("linkedToIngredientLine".to_string(), json!(linked_to_ingredient_line));
    output.metadata = Value::Object(metadata);
    output
}
