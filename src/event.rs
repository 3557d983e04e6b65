use crate::disease::DiseaseState;
use crate::environment::EnvId;
use crate::person::PersonId;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// What caused a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cause {
    /// Scheduled progression of the disease.
    Progression,
    /// Infection through a contact inside an environment.
    Exposure { environment: EnvId, infector: PersonId },
    /// Initial infection placed before the daily loop.
    Seeded,
    /// Immunization forced from outside the infection path.
    Immunization,
}

/// Record of a state transition of one person.
///
/// Records are appended to the event log of a run and never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub date: NaiveDate,
    pub person: PersonId,
    pub from: DiseaseState,
    pub to: DiseaseState,
    pub cause: Cause,
}

impl Event {
    pub fn new(
        date: NaiveDate,
        person: PersonId,
        from: DiseaseState,
        to: DiseaseState,
        cause: Cause,
    ) -> Self {
        Self {
            date,
            person,
            from,
            to,
            cause,
        }
    }

    /// Whether this event marks a new infection.
    pub fn is_infection(&self) -> bool {
        matches!(self.cause, Cause::Exposure { .. } | Cause::Seeded)
    }
}
