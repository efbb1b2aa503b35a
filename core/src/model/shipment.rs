//! Shipment: a parcel's end-to-end movement, with a status derived from its steps.

use crate::aggregate::aggregate;
use crate::ids::{JourneyId, LocationId, MissionId, ParcelId, ShipmentId, StepId, UserId};
use crate::model::StepState;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Derived shipment status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShipmentStatus {
    /// No step has been accepted yet.
    #[default]
    Pending,
    /// Legs are accepted but the parcel has not started moving.
    Initialized,
    /// The parcel is moving.
    InTransit,
    /// Every leg is delivered.
    Delivered,
    /// A leg failed and nothing later overrides it.
    Aborted,
}

impl ShipmentStatus {
    /// Wire name (`IN_TRANSIT`, ...).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Initialized => "INITIALIZED",
            Self::InTransit => "IN_TRANSIT",
            Self::Delivered => "DELIVERED",
            Self::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one step as seen by its shipment.
///
/// `version` is the step record's store version; merging keeps the highest
/// version per step so late-arriving snapshots cannot roll state back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRef {
    /// Step id.
    pub step_id: StepId,
    /// Position within the shipment.
    pub index: u32,
    /// State at `version`.
    pub state: StepState,
    /// Store version of the step record.
    pub version: u64,
}

/// A parcel's end-to-end movement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shipment {
    /// Shipment id.
    pub id: ShipmentId,
    /// Sender.
    pub sender_id: UserId,
    /// Parcel being moved.
    pub parcel_id: ParcelId,
    /// Origin.
    pub from_location: LocationId,
    /// Destination.
    pub to_location: LocationId,
    /// Attached journey.
    pub journey_id: Option<JourneyId>,
    /// Attached mission.
    pub mission_id: Option<MissionId>,
    /// Derived status.
    pub status: ShipmentStatus,
    /// Step snapshots, ordered by index.
    #[serde(default)]
    pub steps: Vec<StepRef>,
}

impl Shipment {
    /// Step states in leg order.
    #[must_use]
    pub fn step_states(&self) -> Vec<StepState> {
        self.steps.iter().map(|step| step.state).collect()
    }

    /// Merge step snapshots, keeping the highest version of each step.
    ///
    /// Returns `true` if any snapshot was added or replaced.
    pub fn merge_steps<'a>(&mut self, snapshots: impl IntoIterator<Item = &'a StepRef>) -> bool {
        let mut changed = false;
        for snapshot in snapshots {
            match self
                .steps
                .iter_mut()
                .find(|known| known.step_id == snapshot.step_id)
            {
                Some(known) if known.version < snapshot.version => {
                    *known = snapshot.clone();
                    changed = true;
                }
                Some(_) => {}
                None => {
                    self.steps.push(snapshot.clone());
                    changed = true;
                }
            }
        }
        if changed {
            self.steps
                .sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.step_id.cmp(&b.step_id)));
        }
        changed
    }

    /// Recompute the derived status.
    ///
    /// Returns `Some((previous, current))` if the status changed.
    pub fn recompute_status(&mut self) -> Option<(ShipmentStatus, ShipmentStatus)> {
        let next = aggregate(&self.step_states());
        if next == self.status {
            None
        } else {
            let previous = std::mem::replace(&mut self.status, next);
            Some((previous, next))
        }
    }
}
