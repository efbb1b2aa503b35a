//! Mission choreographer.
//!
//! Keeps each mission's journey set and hands missions of deleted curators
//! to the system curator.

use crate::environment::Environment;
use async_trait::async_trait;
use courier_core::decision::Decision;
use courier_core::error::CoordinationError;
use courier_core::ids::{CorrelationId, JourneyId, MissionId, UserId};
use courier_core::messages::{
    AddJourneyToMission, CuratorDeleted, MissionCuratorReassigned, MissionJourneyAdded,
    MissionJourneyRemoved, RemoveJourneyFromMission,
};
use courier_core::model::{Journey, Mission};
use courier_core::routing::EntityType;
use courier_core::store::{EntityStore, Record};
use courier_runtime::consumer::{Handles, MessageContext};
use courier_runtime::runner::Runner;
use std::sync::Arc;

/// Decide adding `journey_id` to the mission. A journey already present
/// decides nothing.
///
/// # Errors
///
/// - [`CoordinationError::NotFound`] if the mission does not exist
/// - [`CoordinationError::Validation`] if the mission is archived
pub fn decide_add_journey(
    record: Option<&Record<Mission>>,
    mission_id: &MissionId,
    journey_id: &JourneyId,
    correlation: &CorrelationId,
) -> Result<Decision<Mission>, CoordinationError> {
    let record = record.ok_or_else(|| CoordinationError::not_found(EntityType::Mission, mission_id))?;
    let mut mission = record.entity.clone();
    if !mission.add_journey(journey_id)? {
        tracing::warn!(mission_id = %mission_id, journey_id = %journey_id, "Journey already in mission");
        return Ok(Decision::unchanged());
    }
    let added = MissionJourneyAdded {
        mission_id: mission.id.clone(),
        journey_id: journey_id.clone(),
    };
    Ok(Decision::update(mission).with_event(&added, correlation)?)
}

/// Decide removing `journey_id` from the mission. An absent journey
/// decides nothing.
///
/// # Errors
///
/// - [`CoordinationError::NotFound`] if the mission does not exist
/// - [`CoordinationError::Validation`] if the mission is archived
pub fn decide_remove_journey(
    record: Option<&Record<Mission>>,
    mission_id: &MissionId,
    journey_id: &JourneyId,
    correlation: &CorrelationId,
) -> Result<Decision<Mission>, CoordinationError> {
    let record = record.ok_or_else(|| CoordinationError::not_found(EntityType::Mission, mission_id))?;
    let mut mission = record.entity.clone();
    if !mission.remove_journey(journey_id)? {
        tracing::warn!(mission_id = %mission_id, journey_id = %journey_id, "Journey not in mission");
        return Ok(Decision::unchanged());
    }
    let removed = MissionJourneyRemoved {
        mission_id: mission.id.clone(),
        journey_id: journey_id.clone(),
    };
    Ok(Decision::update(mission).with_event(&removed, correlation)?)
}

/// Decide handing the mission from `deleted` to `replacement`.
///
/// # Errors
///
/// Returns [`CoordinationError::NotFound`] if the mission does not exist.
pub fn decide_reassignment(
    record: Option<&Record<Mission>>,
    mission_id: &MissionId,
    deleted: &UserId,
    replacement: &UserId,
    correlation: &CorrelationId,
) -> Result<Decision<Mission>, CoordinationError> {
    let record = record.ok_or_else(|| CoordinationError::not_found(EntityType::Mission, mission_id))?;
    let mut mission = record.entity.clone();
    if !mission.reassign_curator(deleted, replacement) {
        return Ok(Decision::unchanged());
    }
    let reassigned = MissionCuratorReassigned {
        mission_id: mission.id.clone(),
        previous_curator_id: deleted.clone(),
        curator_id: replacement.clone(),
    };
    Ok(Decision::update(mission).with_event(&reassigned, correlation)?)
}

/// Owns the mission store; reads journeys to validate additions.
#[derive(Clone)]
pub struct MissionChoreographer {
    missions: Runner<Mission>,
    journeys: Arc<dyn EntityStore<Journey>>,
    system_curator: UserId,
}

impl MissionChoreographer {
    /// Choreographer over the environment's mission store. Missions of
    /// deleted curators go to `system_curator`.
    #[must_use]
    pub fn new(env: &Environment, system_curator: UserId) -> Self {
        Self {
            missions: env.runner(&env.stores.missions),
            journeys: Arc::clone(&env.stores.journeys),
            system_curator,
        }
    }

    /// Add a journey to a mission.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::NotFound`] if the mission or journey
    /// does not exist; see [`decide_add_journey`].
    pub async fn add_journey(
        &self,
        command: &AddJourneyToMission,
        correlation: &CorrelationId,
    ) -> Result<Mission, CoordinationError> {
        if self.journeys.get(command.journey_id.as_str()).await?.is_none() {
            return Err(CoordinationError::not_found(EntityType::Journey, &command.journey_id));
        }
        let applied = self
            .missions
            .apply(command.mission_id.as_str(), |record| {
                decide_add_journey(record, &command.mission_id, &command.journey_id, correlation)
            })
            .await?;
        if applied.changed {
            tracing::info!(mission_id = %command.mission_id, journey_id = %command.journey_id, "Journey added to mission");
        }
        applied
            .current
            .map(|record| record.entity)
            .ok_or_else(|| CoordinationError::not_found(EntityType::Mission, &command.mission_id))
    }

    /// Remove a journey from a mission.
    ///
    /// # Errors
    ///
    /// See [`decide_remove_journey`].
    pub async fn remove_journey(
        &self,
        command: &RemoveJourneyFromMission,
        correlation: &CorrelationId,
    ) -> Result<Mission, CoordinationError> {
        let applied = self
            .missions
            .apply(command.mission_id.as_str(), |record| {
                decide_remove_journey(record, &command.mission_id, &command.journey_id, correlation)
            })
            .await?;
        if applied.changed {
            tracing::info!(mission_id = %command.mission_id, journey_id = %command.journey_id, "Journey removed from mission");
        }
        applied
            .current
            .map(|record| record.entity)
            .ok_or_else(|| CoordinationError::not_found(EntityType::Mission, &command.mission_id))
    }

    /// Reassign every mission of a deleted curator. Returns how many changed.
    ///
    /// # Errors
    ///
    /// Returns the first failure after attempting every mission.
    pub async fn curator_deleted(
        &self,
        event: &CuratorDeleted,
        correlation: &CorrelationId,
    ) -> Result<usize, CoordinationError> {
        let mission_ids: Vec<MissionId> = self
            .missions
            .store()
            .all()
            .await?
            .into_iter()
            .filter(|record| record.entity.curator_id == event.curator_id)
            .map(|record| record.entity.id)
            .collect();

        let mut changed = 0;
        let mut first_error = None;
        for mission_id in &mission_ids {
            let applied = self
                .missions
                .apply(mission_id.as_str(), |record| {
                    decide_reassignment(record, mission_id, &event.curator_id, &self.system_curator, correlation)
                })
                .await;
            match applied {
                Ok(applied) if applied.changed => changed += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(mission_id = %mission_id, error = %e, "Failed to reassign mission");
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::info!(
            curator_id = %event.curator_id,
            replacement = %self.system_curator,
            changed,
            "Missions of deleted curator reassigned"
        );
        first_error.map_or(Ok(changed), Err)
    }

    /// Load a mission.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::Transient`] if the store is unavailable.
    pub async fn get(&self, mission_id: &str) -> Result<Option<Mission>, CoordinationError> {
        Ok(self.missions.load(mission_id).await?.map(|record| record.entity))
    }
}

#[async_trait]
impl Handles<CuratorDeleted> for MissionChoreographer {
    async fn handle(&self, event: CuratorDeleted, context: &MessageContext) -> Result<(), CoordinationError> {
        self.curator_deleted(&event, &context.correlation_id).await?;
        Ok(())
    }
}

#[async_trait]
impl Handles<AddJourneyToMission> for MissionChoreographer {
    async fn handle(
        &self,
        command: AddJourneyToMission,
        context: &MessageContext,
    ) -> Result<(), CoordinationError> {
        self.add_journey(&command, &context.correlation_id).await?;
        Ok(())
    }
}

#[async_trait]
impl Handles<RemoveJourneyFromMission> for MissionChoreographer {
    async fn handle(
        &self,
        command: RemoveJourneyFromMission,
        context: &MessageContext,
    ) -> Result<(), CoordinationError> {
        self.remove_journey(&command, &context.correlation_id).await?;
        Ok(())
    }
}
