use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::entities::RideStatus;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEventType {
    StatusChange,
    Bargain,
    Assignment,
    Cancellation,
    Completion,
    Expiry,
}

/// Append-only audit record of one committed transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RideHistoryEntry {
    pub ride_id: Uuid,
    /// Commit order within the ride, starting at 0 for creation.
    pub seq: u64,
    pub event_type: HistoryEventType,
    pub previous_status: Option<RideStatus>,
    pub new_status: RideStatus,
    pub actor_id: Option<Uuid>,
    /// Driver involved in the transition, kept even after the ride drops it.
    pub driver_id: Option<Uuid>,
    pub payload: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Returns true when the entries form a walk of the ride state graph that
/// starts at creation.
pub fn is_valid_walk(entries: &[RideHistoryEntry]) -> bool {
    let mut previous: Option<RideStatus> = None;

    for (index, entry) in entries.iter().enumerate() {
        if entry.seq != index as u64 || entry.previous_status != previous {
            return false;
        }

        match previous {
            None if entry.new_status != RideStatus::Requested => return false,
            Some(from) if !from.can_transition_to(entry.new_status) => return false,
            _ => {}
        }

        previous = Some(entry.new_status);
    }

    true
}

#[test]
fn walk_must_follow_the_graph() {
    let ride_id = Uuid::new_v4();
    let entry = |seq, previous_status, new_status| RideHistoryEntry {
        ride_id,
        seq,
        event_type: HistoryEventType::StatusChange,
        previous_status,
        new_status,
        actor_id: None,
        driver_id: None,
        payload: None,
        timestamp: Utc::now(),
    };

    let valid = vec![
        entry(0, None, RideStatus::Requested),
        entry(1, Some(RideStatus::Requested), RideStatus::Searching),
        entry(2, Some(RideStatus::Searching), RideStatus::Expired),
    ];
    assert!(is_valid_walk(&valid));

    let skipped = vec![
        entry(0, None, RideStatus::Requested),
        entry(1, Some(RideStatus::Requested), RideStatus::InProgress),
    ];
    assert!(!is_valid_walk(&skipped));

    let reordered = vec![
        entry(0, None, RideStatus::Requested),
        entry(2, Some(RideStatus::Requested), RideStatus::Searching),
    ];
    assert!(!is_valid_walk(&reordered));
}
