use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod imports;
pub mod managedclusteraddons;
pub mod managedclusters;
pub mod manifestworks;

/// Status condition shared by the CRDs this operator manages and consumes
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: Option<Time>,
    /// Human readable message indicating details about last transition.
    pub message: Option<String>,
    /// Unique, one-word, CamelCase reason for the condition's last transition.
    pub reason: Option<String>,
    /// Status of the condition, one of True, False, Unknown.
    pub status: String,
    /// Type of the condition.
    pub r#type: String,
}

impl Condition {
    pub fn new(r#type: &str, status: &str, reason: &str, message: &str) -> Self {
        Condition {
            last_transition_time: None,
            message: Some(message.to_string()),
            reason: Some(reason.to_string()),
            status: status.to_string(),
            r#type: r#type.to_string(),
        }
    }
}

/// Merge a condition into a condition list.
///
/// The transition time only moves when the status actually flips; reason and
/// message updates keep the old timestamp. Returns whether anything changed,
/// so callers can skip no-op status patches.
pub fn set_status_condition(conditions: &mut Vec<Condition>, mut new: Condition, now: Time) -> bool {
    match conditions.iter_mut().find(|c| c.r#type == new.r#type) {
        None => {
            new.last_transition_time = Some(now);
            conditions.push(new);
            true
        }
        Some(existing) => {
            if existing.status != new.status {
                new.last_transition_time = Some(now);
                *existing = new;
                return true;
            }
            if existing.reason != new.reason || existing.message != new.message {
                new.last_transition_time = existing.last_transition_time.clone();
                *existing = new;
                return true;
            }
            false
        }
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], r#type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == r#type)
}

pub fn is_condition_true(conditions: &[Condition], r#type: &str) -> bool {
    find_condition(conditions, r#type).map(|c| c.status == "True") == Some(true)
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> Time {
        Time(Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[test]
    fn transition_time_set_on_first_insert() {
        let mut conditions = vec![];
        let changed = set_status_condition(
            &mut conditions,
            Condition::new("Ready", "False", "Pending", "waiting"),
            at(100),
        );
        assert!(changed);
        assert_eq!(conditions[0].last_transition_time, Some(at(100)));
    }

    #[test]
    fn transition_time_moves_only_on_status_flip() {
        let mut conditions = vec![];
        set_status_condition(
            &mut conditions,
            Condition::new("Ready", "False", "Pending", "waiting"),
            at(100),
        );

        // same status, new message: timestamp stays
        let changed = set_status_condition(
            &mut conditions,
            Condition::new("Ready", "False", "Pending", "still waiting"),
            at(200),
        );
        assert!(changed);
        assert_eq!(conditions[0].last_transition_time, Some(at(100)));
        assert_eq!(conditions[0].message.as_deref(), Some("still waiting"));

        // status flip: timestamp moves
        let changed = set_status_condition(
            &mut conditions,
            Condition::new("Ready", "True", "Done", "done"),
            at(300),
        );
        assert!(changed);
        assert_eq!(conditions[0].last_transition_time, Some(at(300)));
    }

    #[test]
    fn identical_condition_is_a_noop() {
        let mut conditions = vec![];
        set_status_condition(
            &mut conditions,
            Condition::new("Ready", "True", "Done", "done"),
            at(100),
        );
        let changed = set_status_condition(
            &mut conditions,
            Condition::new("Ready", "True", "Done", "done"),
            at(200),
        );
        assert!(!changed);
        assert_eq!(conditions[0].last_transition_time, Some(at(100)));
    }
}
