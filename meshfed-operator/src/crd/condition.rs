//! Status conditions shared by the federation resources.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type reported on a member Cluster.
pub const CONDITION_MANAGED: &str = "Managed";
/// Condition type reported on a ServiceExport by its owners.
pub const CONDITION_VALID: &str = "Valid";
/// Condition type set when a ServiceExport is rejected by admission.
pub const CONDITION_CONFLICT: &str = "Conflict";

/// Reason used when a member joined the federation.
pub const REASON_SUCCESS: &str = "Success";
/// Reason used when a member failed to join.
pub const REASON_FAILED: &str = "Failed";
/// Reason used on rejected exports.
pub const REASON_CONFLICT: &str = "Conflict";

/// Condition status value.
pub const STATUS_TRUE: &str = "True";
/// Condition status value.
pub const STATUS_FALSE: &str = "False";

/// A single observed condition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (Managed, Valid, Conflict).
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, Unknown).
    pub status: String,

    /// Generation of the object the condition was computed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time the status flipped (RFC 3339).
    #[serde(default)]
    pub last_transition_time: String,

    /// Machine-readable reason.
    #[serde(default)]
    pub reason: String,

    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

impl Condition {
    /// Build a condition stamped with the current time.
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: impl Into<String>,
        observed_generation: Option<i64>,
    ) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: if status { STATUS_TRUE } else { STATUS_FALSE }.to_string(),
            observed_generation,
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    /// Whether the status is `True`.
    pub fn is_true(&self) -> bool {
        self.status == STATUS_TRUE
    }

    /// Whether the status is `False`.
    pub fn is_false(&self) -> bool {
        self.status == STATUS_FALSE
    }
}

/// Insert or update `new` in `conditions`, keeping one entry per type.
///
/// `lastTransitionTime` is carried over from the existing entry unless the
/// status changes. Returns whether anything changed.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) -> bool {
    let Some(index) = conditions
        .iter()
        .position(|c| c.condition_type == new.condition_type)
    else {
        let mut new = new;
        if new.last_transition_time.is_empty() {
            new.last_transition_time = chrono::Utc::now().to_rfc3339();
        }
        conditions.push(new);
        return true;
    };

    let existing = &mut conditions[index];
    let mut changed = false;
    if existing.status != new.status {
        existing.status = new.status;
        existing.last_transition_time = if new.last_transition_time.is_empty() {
            chrono::Utc::now().to_rfc3339()
        } else {
            new.last_transition_time
        };
        changed = true;
    }
    if existing.reason != new.reason {
        existing.reason = new.reason;
        changed = true;
    }
    if existing.message != new.message {
        existing.message = new.message;
        changed = true;
    }
    if existing.observed_generation != new.observed_generation {
        existing.observed_generation = new.observed_generation;
        changed = true;
    }
    changed
}

/// Find the condition of the given type.
pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}
