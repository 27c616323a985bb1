//! Condition and error-history bookkeeping on the source status.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

use mirra_api::{MirrorSourceStatus, ReconcileError};

/// Upsert a condition. `lastTransitionTime` moves only when the status
/// value actually flips; `observedGeneration` always reflects the
/// generation evaluated. Returns whether anything changed, so callers can
/// skip the status write entirely on a steady-state pass.
pub fn set_condition(
    status: &mut MirrorSourceStatus,
    cond_type: &str,
    value: &str,
    reason: &str,
    message: &str,
    observed_generation: i64,
    now: DateTime<Utc>,
) -> bool {
    if let Some(existing) = status.conditions.iter_mut().find(|c| c.type_ == cond_type) {
        let mut changed = false;
        if existing.status != value {
            existing.status = value.to_string();
            existing.last_transition_time = Time(now);
            changed = true;
        }
        if existing.reason != reason {
            existing.reason = reason.to_string();
            changed = true;
        }
        if existing.message != message {
            existing.message = message.to_string();
            changed = true;
        }
        if existing.observed_generation != Some(observed_generation) {
            existing.observed_generation = Some(observed_generation);
            changed = true;
        }
        changed
    } else {
        status.conditions.push(Condition {
            last_transition_time: Time(now),
            message: message.to_string(),
            observed_generation: Some(observed_generation),
            reason: reason.to_string(),
            status: value.to_string(),
            type_: cond_type.to_string(),
        });
        true
    }
}

/// Drop history entries older than the retention window. Returns whether
/// anything was pruned.
pub fn prune_errors(
    status: &mut MirrorSourceStatus,
    now: DateTime<Utc>,
    retention: chrono::Duration,
) -> bool {
    let before = status.latest_errors.len();
    status
        .latest_errors
        .retain(|e| now.signed_duration_since(e.date_time.0) <= retention);
    status.latest_errors.len() != before
}

/// Append a recoverable failure to the history, pruning stale entries
/// first so the list stays bounded by the retention window.
pub fn record_error(
    status: &mut MirrorSourceStatus,
    namespace: Option<&str>,
    error: &str,
    now: DateTime<Utc>,
    retention: chrono::Duration,
) {
    prune_errors(status, now, retention);
    status.latest_errors.push(ReconcileError {
        date_time: Time(now),
        namespace: namespace.map(|s| s.to_string()),
        error: error.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mirra_core::labels::CONDITION_READY;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn transition_time_moves_only_on_value_change() {
        let mut status = MirrorSourceStatus::default();
        assert!(set_condition(&mut status, CONDITION_READY, "True", "Ok", "fine", 1, at(0)));
        let t0 = status.conditions[0].last_transition_time.clone();

        // Same value, later time, different message: no transition bump.
        assert!(set_condition(&mut status, CONDITION_READY, "True", "Ok", "still fine", 1, at(60)));
        assert_eq!(status.conditions[0].last_transition_time, t0);

        // Value flips: transition bump.
        assert!(set_condition(&mut status, CONDITION_READY, "False", "Broken", "x", 1, at(120)));
        assert_eq!(status.conditions[0].last_transition_time, Time(at(120)));
    }

    #[test]
    fn identical_set_reports_no_change() {
        let mut status = MirrorSourceStatus::default();
        set_condition(&mut status, CONDITION_READY, "True", "Ok", "fine", 2, at(0));
        assert!(!set_condition(&mut status, CONDITION_READY, "True", "Ok", "fine", 2, at(60)));
    }

    #[test]
    fn observed_generation_tracks_evaluation() {
        let mut status = MirrorSourceStatus::default();
        set_condition(&mut status, CONDITION_READY, "True", "Ok", "fine", 1, at(0));
        assert!(set_condition(&mut status, CONDITION_READY, "True", "Ok", "fine", 2, at(10)));
        assert_eq!(status.conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn history_is_bounded_by_the_retention_window() {
        let retention = chrono::Duration::minutes(15);
        let mut status = MirrorSourceStatus::default();
        record_error(&mut status, Some("ns1"), "old", at(0), retention);
        record_error(&mut status, None, "recent", at(14 * 60), retention);
        // 16 minutes after the first entry: it falls out on the next append.
        record_error(&mut status, Some("ns2"), "new", at(16 * 60), retention);
        let messages: Vec<&str> = status.latest_errors.iter().map(|e| e.error.as_str()).collect();
        assert_eq!(messages, vec!["recent", "new"]);
    }
}
