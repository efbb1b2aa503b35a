//! Mission: a curated bundle of journeys.

use crate::error::ValidationError;
use crate::ids::{JourneyId, MissionId, UserId};
use crate::model::Itinerary;
use crate::routing::EntityType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mission status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionStatus {
    /// Being assembled.
    Draft,
    /// Published.
    Active,
    /// Retired; no longer editable.
    Archived,
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Draft => "DRAFT",
            Self::Active => "ACTIVE",
            Self::Archived => "ARCHIVED",
        })
    }
}

/// A curated bundle of journeys. References journeys, never owns their lifecycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mission {
    /// Mission id.
    pub id: MissionId,
    /// Curator.
    pub curator_id: UserId,
    /// Overall route.
    pub route: Itinerary,
    /// Ordered, unique journey ids.
    #[serde(default)]
    pub journey_ids: Vec<JourneyId>,
    /// Status.
    pub status: MissionStatus,
}

impl Mission {
    fn ensure_editable(&self) -> Result<(), ValidationError> {
        if self.status == MissionStatus::Archived {
            return Err(ValidationError::InvalidStatusChange {
                entity: EntityType::Mission,
                id: self.id.to_string(),
                reason: "archived missions cannot be edited".to_string(),
            });
        }
        Ok(())
    }

    /// Append `journey` if not already present. Returns `false` on a duplicate.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidStatusChange`] for archived missions.
    pub fn add_journey(&mut self, journey: &JourneyId) -> Result<bool, ValidationError> {
        self.ensure_editable()?;
        if self.journey_ids.contains(journey) {
            return Ok(false);
        }
        self.journey_ids.push(journey.clone());
        Ok(true)
    }

    /// Remove `journey` if present. Returns `false` if it was absent.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidStatusChange`] for archived missions.
    pub fn remove_journey(&mut self, journey: &JourneyId) -> Result<bool, ValidationError> {
        self.ensure_editable()?;
        let before = self.journey_ids.len();
        self.journey_ids.retain(|known| known != journey);
        Ok(self.journey_ids.len() != before)
    }

    /// Hand the mission to `replacement` if `deleted` curates it, forcing `DRAFT`.
    ///
    /// Returns `false` when the mission is curated by someone else or was
    /// already reassigned.
    pub fn reassign_curator(&mut self, deleted: &UserId, replacement: &UserId) -> bool {
        if &self.curator_id != deleted || deleted == replacement {
            return false;
        }
        self.curator_id = replacement.clone();
        self.status = MissionStatus::Draft;
        true
    }
}
