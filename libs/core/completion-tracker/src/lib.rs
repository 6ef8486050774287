//! Per-note fan-in completion accounting.
//!
//! State is shared across workers and mutated only through the operations
//! below; every mutation serializes per `noteId` (one `Mutex` per tracker
//! row), matching the per-key locking pattern in
//! `stream_worker::resilience::CircuitBreaker` (an `RwLock`-guarded state
//! machine mutated only through its own methods).

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use job_errors::{JobError, JobErrorKind, Severity};

/// Which worker kind reported completion for a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Note,
    Image,
    Ingredient,
    Instruction,
    Categorization,
}

#[derive(Debug, Default)]
struct NoteTracker {
    total_jobs: u64,
    completed_jobs: u64,
    completed_workers: HashSet<WorkerKind>,
    scheduled: Option<Instant>,
}

/// Snapshot returned by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionStatus {
    pub completed_jobs: u64,
    pub total_jobs: u64,
    pub is_complete: bool,
}

/// Snapshot of the per-line ingredient sub-tracker for one note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngredientStatus {
    pub completed: u64,
    pub total: u64,
    pub is_complete: bool,
}

/// Per-note fan-in counters, plus the parallel ingredient-line sub-tracker
/// and the scheduling-dedup flag the cross-stage scheduler consults.
pub struct CompletionTracker {
    trackers: RwLock<HashMap<String, Mutex<NoteTracker>>>,
    ingredient_status: RwLock<HashMap<String, Mutex<(u64, u64)>>>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self {
            trackers: RwLock::new(HashMap::new()),
            ingredient_status: RwLock::new(HashMap::new()),
        }
    }

    fn with_tracker_mut<R>(&self, note_id: &str, f: impl FnOnce(&mut NoteTracker) -> R) -> R {
        {
            let trackers = self.trackers.read().expect("tracker map lock poisoned");
            if let Some(tracker) = trackers.get(note_id) {
                return f(&mut tracker.lock().expect("tracker row lock poisoned"));
            }
        }
        let mut trackers = self.trackers.write().expect("tracker map lock poisoned");
        let tracker = trackers
            .entry(note_id.to_string())
            .or_insert_with(|| Mutex::new(NoteTracker::default()));
        f(&mut tracker.lock().expect("tracker row lock poisoned"))
    }

    /// Creates or resets the tracker for `note_id`. Idempotent when called
    /// repeatedly with the same `total_jobs`; a conflicting `total_jobs`
    /// overrides (and resets `completed_jobs`/`completed_workers`, since the
    /// scope of work for the note has changed).
    pub fn create(&self, note_id: &str, total_jobs: u64) {
        self.with_tracker_mut(note_id, |tracker| {
            if tracker.total_jobs == total_jobs && (tracker.total_jobs > 0 || tracker.completed_jobs > 0)
            {
                return;
            }
            tracker.total_jobs = total_jobs;
            tracker.completed_jobs = 0;
            tracker.completed_workers.clear();
        });
    }

    /// Sets the absolute completed count. If no tracker exists yet, creates
    /// a fallback `{total_jobs: completed_jobs, completed_jobs}` — an
    /// intentional fast path that treats an untracked bulk-completion
    /// signal as immediately complete.
    pub fn update(&self, note_id: &str, completed_jobs: u64) {
        self.with_tracker_mut(note_id, |tracker| {
            if tracker.total_jobs == 0 && tracker.completed_jobs == 0 {
                tracker.total_jobs = completed_jobs;
            }
            tracker.completed_jobs = completed_jobs;
        });
    }

    /// Atomic `+1`, ceilinged at `total_jobs`. Creates a fallback `{1, 1}`
    /// tracker if absent.
    pub fn increment(&self, note_id: &str) {
        self.with_tracker_mut(note_id, |tracker| {
            if tracker.total_jobs == 0 && tracker.completed_jobs == 0 {
                tracker.total_jobs = 1;
                tracker.completed_jobs = 1;
                return;
            }
            tracker.completed_jobs = (tracker.completed_jobs + 1).min(tracker.total_jobs);
        });
    }

    /// Current completion status. Absence of a tracker is treated as
    /// trivially complete (`{0, 0, true}`) — relied on by callers signaling
    /// "no work" for a note.
    pub fn status(&self, note_id: &str) -> CompletionStatus {
        let trackers = self.trackers.read().expect("tracker map lock poisoned");
        let Some(tracker) = trackers.get(note_id) else {
            return CompletionStatus {
                completed_jobs: 0,
                total_jobs: 0,
                is_complete: true,
            };
        };
        let tracker = tracker.lock().expect("tracker row lock poisoned");
        CompletionStatus {
            completed_jobs: tracker.completed_jobs,
            total_jobs: tracker.total_jobs,
            is_complete: tracker.total_jobs > 0 && tracker.completed_jobs == tracker.total_jobs,
        }
    }

    /// Adds `worker_kind` to the note's completed-workers set; if the set
    /// now covers every kind in `expected_workers`, returns `true` so the
    /// caller can emit a final COMPLETED status and invoke its
    /// all-workers-complete hook. The expected set is a parameter (not a
    /// fixed constant) because different call sites use different subsets
    /// (`{Ingredient}` alone vs `{Ingredient, Instruction, Note}`).
    pub fn mark_worker_completed(
        &self,
        note_id: &str,
        worker_kind: WorkerKind,
        expected_workers: &[WorkerKind],
    ) -> bool {
        self.with_tracker_mut(note_id, |tracker| {
            tracker.completed_workers.insert(worker_kind);
            expected_workers
                .iter()
                .all(|kind| tracker.completed_workers.contains(kind))
        })
    }

    /// Marks the note as having had categorization scheduled, returning
    /// whether it was already scheduled (`true` means the caller should
    /// skip re-scheduling).
    pub fn mark_scheduled(&self, note_id: &str) -> bool {
        self.with_tracker_mut(note_id, |tracker| {
            let already = tracker.scheduled.is_some();
            tracker.scheduled.get_or_insert_with(Instant::now);
            already
        })
    }

    pub fn was_scheduled(&self, note_id: &str) -> bool {
        let trackers = self.trackers.read().expect("tracker map lock poisoned");
        trackers
            .get(note_id)
            .map(|t| t.lock().expect("tracker row lock poisoned").scheduled.is_some())
            .unwrap_or(false)
    }

    /// Updates the per-line ingredient sub-tracker for `note_id`.
    pub fn update_ingredient_status(&self, note_id: &str, completed: u64, total: u64) {
        {
            let map = self.ingredient_status.read().expect("ingredient map lock poisoned");
            if let Some(slot) = map.get(note_id) {
                *slot.lock().expect("ingredient row lock poisoned") = (completed, total);
                return;
            }
        }
        let mut map = self.ingredient_status.write().expect("ingredient map lock poisoned");
        map.insert(note_id.to_string(), Mutex::new((completed, total)));
    }

    pub fn ingredient_status(&self, note_id: &str) -> Option<IngredientStatus> {
        let map = self.ingredient_status.read().expect("ingredient map lock poisoned");
        map.get(note_id).map(|slot| {
            let (completed, total) = *slot.lock().expect("ingredient row lock poisoned");
            IngredientStatus {
                completed,
                total,
                is_complete: total > 0 && completed == total,
            }
        })
    }

    /// Removes all tracking state for `note_id`. The only way tracker rows
    /// are removed — trackers otherwise persist for the process lifetime.
    pub fn cleanup(&self, note_id: &str) {
        self.trackers
            .write()
            .expect("tracker map lock poisoned")
            .remove(note_id);
        self.ingredient_status
            .write()
            .expect("ingredient map lock poisoned")
            .remove(note_id);
    }
}

impl Default for CompletionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the terminal `JobError` for a note that never reached ingredient
/// completion after the bounded retry budget `CHECK_INGREDIENT_COMPLETION`
/// allows (default 3 attempts, 1s apart) — callers await
/// `wait_for_ingredient_completion` and construct this on timeout.
pub fn mark_note_as_failed(note_id: &str, reason: impl Into<String>, code: &str) -> JobError {
    JobError {
        kind: JobErrorKind::WorkerError,
        severity: Severity::High,
        message: reason.into(),
        code: Some(code.to_string()),
        context: None,
        original_error: None,
        timestamp: chrono::Utc::now(),
        job_id: None,
        queue_name: None,
        retry_count: None,
    }
    .tap_note(note_id)
}

trait TapNote {
    fn tap_note(self, note_id: &str) -> Self;
}

impl TapNote for JobError {
    fn tap_note(mut self, note_id: &str) -> Self {
        self.context = Some(serde_json::json!({ "noteId": note_id }));
        self
    }
}

/// Default retry budget for `CHECK_INGREDIENT_COMPLETION`'s
/// tracker-visibility-skew tolerance.
pub const DEFAULT_COMPLETION_CHECK_RETRIES: u32 = 3;
pub const DEFAULT_COMPLETION_CHECK_DELAY_MS: u64 = 1000;

/// Polls `tracker` for ingredient completion on `note_id`, retrying up to
/// `max_retries` times with `delay` between attempts to absorb
/// tracker-write/visibility skew across workers. Returns the last observed
/// status; callers decide whether to call `mark_note_as_failed` if it is
/// still incomplete.
pub async fn wait_for_ingredient_completion(
    tracker: &CompletionTracker,
    note_id: &str,
    max_retries: u32,
    delay: std::time::Duration,
) -> Option<IngredientStatus> {
    for attempt in 0..=max_retries {
        if let Some(status) = tracker.ingredient_status(note_id) {
            if status.is_complete {
                return Some(status);
            }
            if attempt == max_retries {
                return Some(status);
            }
        } else if attempt == max_retries {
            return None;
        }
        tokio::time::sleep(delay).await;
    }
    tracker.ingredient_status(note_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn absence_implies_complete() {
        let tracker = CompletionTracker::new();
        let status = tracker.status("missing-note");
        assert_eq!(
            status,
            CompletionStatus {
                completed_jobs: 0,
                total_jobs: 0,
                is_complete: true,
            }
        );
    }

    #[test]
    fn create_is_idempotent_for_same_total() {
        let tracker = CompletionTracker::new();
        tracker.create("n1", 5);
        tracker.increment("n1");
        tracker.create("n1", 5);
        assert_eq!(tracker.status("n1").completed_jobs, 1);
    }

    #[test]
    fn create_with_conflicting_total_resets() {
        let tracker = CompletionTracker::new();
        tracker.create("n1", 5);
        tracker.increment("n1");
        tracker.create("n1", 10);
        let status = tracker.status("n1");
        assert_eq!(status.total_jobs, 10);
        assert_eq!(status.completed_jobs, 0);
    }

    #[test]
    fn increment_ceilings_at_total() {
        let tracker = CompletionTracker::new();
        tracker.create("n1", 2);
        tracker.increment("n1");
        tracker.increment("n1");
        tracker.increment("n1");
        let status = tracker.status("n1");
        assert_eq!(status.completed_jobs, 2);
        assert!(status.is_complete);
    }

    #[test]
    fn increment_without_create_falls_back_to_one_of_one() {
        let tracker = CompletionTracker::new();
        tracker.increment("n1");
        let status = tracker.status("n1");
        assert_eq!(status, CompletionStatus { completed_jobs: 1, total_jobs: 1, is_complete: true });
    }

    #[test]
    fn update_without_tracker_is_immediately_complete() {
        let tracker = CompletionTracker::new();
        tracker.update("n1", 7);
        let status = tracker.status("n1");
        assert_eq!(status, CompletionStatus { completed_jobs: 7, total_jobs: 7, is_complete: true });
    }

    #[test]
    fn counters_are_monotone_non_decreasing_under_normal_usage() {
        let tracker = CompletionTracker::new();
        tracker.create("n1", 10);
        let mut last = 0;
        for _ in 0..5 {
            tracker.increment("n1");
            let current = tracker.status("n1").completed_jobs;
            assert!(current >= last);
            last = current;
        }
        assert_eq!(last, 5);
    }

    #[test]
    fn mark_worker_completed_with_ingredient_only_expected_set() {
        let tracker = CompletionTracker::new();
        let complete = tracker.mark_worker_completed("n1", WorkerKind::Ingredient, &[WorkerKind::Ingredient]);
        assert!(complete);
    }

    #[test]
    fn mark_worker_completed_with_full_expected_set() {
        let tracker = CompletionTracker::new();
        let expected = [WorkerKind::Ingredient, WorkerKind::Instruction, WorkerKind::Note];
        assert!(!tracker.mark_worker_completed("n1", WorkerKind::Ingredient, &expected));
        assert!(!tracker.mark_worker_completed("n1", WorkerKind::Instruction, &expected));
        assert!(tracker.mark_worker_completed("n1", WorkerKind::Note, &expected));
    }

    #[test]
    fn scheduled_flag_resolves_dedup() {
        let tracker = CompletionTracker::new();
        assert!(!tracker.was_scheduled("n1"));
        let already = tracker.mark_scheduled("n1");
        assert!(!already);
        assert!(tracker.was_scheduled("n1"));
        let already_again = tracker.mark_scheduled("n1");
        assert!(already_again);
    }

    #[test]
    fn ingredient_sub_tracker_reports_completion() {
        let tracker = CompletionTracker::new();
        assert!(tracker.ingredient_status("n1").is_none());
        tracker.update_ingredient_status("n1", 2, 5);
        assert_eq!(tracker.ingredient_status("n1").unwrap().is_complete, false);
        tracker.update_ingredient_status("n1", 5, 5);
        assert!(tracker.ingredient_status("n1").unwrap().is_complete);
    }

    #[test]
    fn cleanup_removes_all_state_for_note() {
        let tracker = CompletionTracker::new();
        tracker.create("n1", 3);
        tracker.update_ingredient_status("n1", 1, 3);
        tracker.cleanup("n1");
        assert_eq!(tracker.status("n1"), CompletionStatus { completed_jobs: 0, total_jobs: 0, is_complete: true });
        assert!(tracker.ingredient_status("n1").is_none());
    }

    #[tokio::test]
    async fn wait_for_ingredient_completion_retries_then_succeeds() {
        let tracker = std::sync::Arc::new(CompletionTracker::new());
        tracker.update_ingredient_status("n1", 1, 3);

        let writer = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.update_ingredient_status("n1", 3, 3);
        });

        let status = wait_for_ingredient_completion(&tracker, "n1", 5, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(status.is_complete);
    }

    #[tokio::test]
    async fn wait_for_ingredient_completion_exhausts_retries() {
        let tracker = CompletionTracker::new();
        tracker.update_ingredient_status("n1", 1, 3);

        let status = wait_for_ingredient_completion(&tracker, "n1", 2, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(!status.is_complete);
    }

    #[test]
    fn mark_note_as_failed_builds_worker_error() {
        let err = mark_note_as_failed("n1", "ingredient completion timed out", "INGREDIENT_TIMEOUT");
        assert_eq!(err.kind, JobErrorKind::WorkerError);
        assert_eq!(err.severity, Severity::High);
        assert_eq!(err.context.unwrap()["noteId"], "n1");
    }
}
