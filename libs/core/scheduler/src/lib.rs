//! Cross-stage scheduling: fires the categorization job once a note's
//! ingredient and instruction fan-out has completed. Dedup is resolved via
//! `completion_tracker::CompletionTracker::mark_scheduled` rather than left
//! to callers, per the open question in the original design notes.

use chrono::Utc;
use completion_tracker::CompletionTracker;
use job_errors::{ErrorContext, JobError};
use job_events::{JobStatus, StatusBroadcaster, StatusEvent};
use job_queue::{Backoff, Broker, EnqueueOptions, FollowOnJob};
use rand::RngExt;
use serde_json::json;
use tracing::{info, warn};

pub const CATEGORIZATION_QUEUE: &str = "categorization";

/// Builds the categorization job's `FollowOnJob`, unless one was already
/// scheduled for `note_id` (per `tracker`). This is the piece a worker's
/// `JobProcessor` calls directly so the resulting job rides out through the
/// same `ProcessOutcome::follow_on` path as every other fan-out, rather than
/// reaching for a broker of its own.
pub fn build_categorization_follow_on(
    tracker: &CompletionTracker,
    note_id: &str,
    import_id: &str,
    status_broadcaster: Option<&StatusBroadcaster>,
    original_job_id: Option<String>,
) -> Option<FollowOnJob> {
    if tracker.mark_scheduled(note_id) {
        info!(note_id, "categorization already scheduled, skipping");
        return None;
    }

    if let Some(broadcaster) = status_broadcaster {
        let event = StatusEvent::new(
            import_id,
            JobStatus::Processing,
            "Scheduling categorization...",
            "schedule_categorization_job",
        )
        .with_note_id(note_id);
        if let Err(err) = broadcaster.add_status_event_and_broadcast(event) {
            warn!(note_id, error = %err, "status broadcast failed, continuing");
        }
    }

    let jitter_ms: i64 = rand::rng().random_range(0..1000);
    let timestamp_with_jitter = Utc::now().timestamp_millis() + jitter_ms;
    let job_id = format!("categorization-{note_id}-{timestamp_with_jitter}");

    let payload = json!({
        "noteId": note_id,
        "importId": import_id,
        "jobId": job_id,
        "metadata": {
            "originalJobId": original_job_id,
            "triggeredBy": "ingredient_completion",
            "scheduledAt": Utc::now().to_rfc3339(),
        },
    });

    let opts = EnqueueOptions {
        remove_on_complete: Some(100),
        remove_on_fail: Some(50),
        attempts: 3,
        backoff: Some(Backoff { delay_ms: 2000 }),
    };

    Some(FollowOnJob {
        queue_name: CATEGORIZATION_QUEUE.to_string(),
        payload,
        opts,
    })
}

/// Schedules the categorization job for `note_id` against a broker directly,
/// unless it was already scheduled for this note (per `tracker`). Returns
/// the enqueued job id, or `None` if scheduling was skipped as a duplicate.
/// Workers driven by `job_queue::Worker` should prefer
/// `build_categorization_follow_on` instead; this entry point is for callers
/// with no worker/processor of their own (e.g. a one-shot admin trigger).
pub async fn schedule_categorization_job(
    tracker: &CompletionTracker,
    broker: &dyn Broker,
    note_id: &str,
    import_id: &str,
    status_broadcaster: Option<&StatusBroadcaster>,
    original_job_id: Option<String>,
) -> Result<Option<String>, JobError> {
    let Some(follow_on) = build_categorization_follow_on(tracker, note_id, import_id, status_broadcaster, original_job_id)
    else {
        return Ok(None);
    };

    let job_id = follow_on
        .payload
        .get("jobId")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_default();

    match broker.enqueue(&follow_on.queue_name, follow_on.payload, follow_on.opts).await {
        Ok(_) => Ok(Some(job_id)),
        Err(err) => {
            let err = JobError::classify(
                format!("failed to schedule categorization job: {}", err.message),
                ErrorContext {
                    job_id: Some(job_id),
                    queue_name: Some(CATEGORIZATION_QUEUE.to_string()),
                    ..Default::default()
                },
            );
            err.log();
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use job_queue::InMemoryBroker;

    #[test]
    fn build_follow_on_dedups_and_carries_note_id() {
        let tracker = CompletionTracker::new();

        let first = build_categorization_follow_on(&tracker, "n1", "i1", None, None).unwrap();
        assert_eq!(first.queue_name, CATEGORIZATION_QUEUE);
        assert_eq!(first.opts.attempts, 3);
        assert_eq!(first.payload["noteId"], "n1");

        assert!(build_categorization_follow_on(&tracker, "n1", "i1", None, None).is_none());
    }

    #[tokio::test]
    async fn schedules_categorization_job_once() {
        let tracker = CompletionTracker::new();
        let broker = InMemoryBroker::new();

        let first = schedule_categorization_job(&tracker, &broker, "n1", "i1", None, None)
            .await
            .unwrap();
        assert!(first.is_some());

        let second = schedule_categorization_job(&tracker, &broker, "n1", "i1", None, None)
            .await
            .unwrap();
        assert!(second.is_none(), "duplicate scheduling must be skipped");

        assert_eq!(broker.queue_len(CATEGORIZATION_QUEUE), 1);
    }

    #[tokio::test]
    async fn different_notes_schedule_independently() {
        let tracker = CompletionTracker::new();
        let broker = InMemoryBroker::new();

        schedule_categorization_job(&tracker, &broker, "n1", "i1", None, None)
            .await
            .unwrap();
        schedule_categorization_job(&tracker, &broker, "n2", "i1", None, None)
            .await
            .unwrap();

        assert_eq!(broker.queue_len(CATEGORIZATION_QUEUE), 2);
    }

    #[tokio::test]
    async fn job_id_embeds_note_id_and_is_unique_across_rapid_calls() {
        let tracker = CompletionTracker::new();
        let broker = InMemoryBroker::new();

        let mut ids = Vec::new();
        for i in 0..5 {
            let note_id = format!("n{i}");
            let job_id = schedule_categorization_job(&tracker, &broker, &note_id, "i1", None, None)
                .await
                .unwrap()
                .unwrap();
            ids.push(job_id);
        }

        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }
}
