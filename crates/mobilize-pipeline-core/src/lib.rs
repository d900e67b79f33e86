use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PipelineError {
    #[error("{entity} {id} does not exist")]
    NotFound { entity: &'static str, id: i64 },
    #[error("stage {stage_id} does not belong to pipeline {pipeline_id}")]
    StageNotFound { stage_id: i64, pipeline_id: i64 },
    #[error("contact type '{contact_type}' is not compatible with pipeline type '{pipeline_type}'")]
    ContactTypeMismatch {
        contact_type: ContactType,
        pipeline_type: PipelineType,
    },
    #[error("assignment was changed by a concurrent writer")]
    ConcurrentModification,
    #[error("storage operation timed out")]
    Timeout,
    #[error("required column {table}.{column} is absent from the persisted schema")]
    SchemaDrift { table: String, column: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl PipelineError {
    /// Stable machine-readable tag for the error envelope. Never includes
    /// driver-level text.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::StageNotFound { .. } => "stage_not_found",
            Self::ContactTypeMismatch { .. } => "contact_type_mismatch",
            Self::ConcurrentModification => "concurrent_modification",
            Self::Timeout => "timeout",
            Self::SchemaDrift { .. } => "schema_drift",
            Self::Validation(_) => "validation",
            Self::Configuration(_) => "configuration",
            Self::Storage(_) => "storage",
        }
    }

    /// Only lost read-modify-write races are worth re-executing; caller
    /// errors never are.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContactType {
    Person,
    Church,
}

impl ContactType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Church => "church",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "person" => Some(Self::Person),
            "church" => Some(Self::Church),
            _ => None,
        }
    }
}

impl Display for ContactType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Historically a distinct vocabulary from ContactType ('people' vs
// 'person'); the two are related only through TypeCompatibility.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    People,
    Church,
}

impl PipelineType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::People => "people",
            Self::Church => "church",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "people" => Some(Self::People),
            "church" => Some(Self::Church),
            _ => None,
        }
    }
}

impl Display for PipelineType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable contact-type to pipeline-type mapping. Loaded once at process
/// start and handed to the store by value; a naive string-equality join
/// between the two vocabularies undercounts.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct TypeCompatibility {
    map: BTreeMap<ContactType, PipelineType>,
}

impl TypeCompatibility {
    /// Builds a compatibility table from an explicit mapping.
    ///
    /// # Errors
    /// Returns [`PipelineError::Configuration`] when the mapping is empty.
    pub fn new(map: BTreeMap<ContactType, PipelineType>) -> Result<Self, PipelineError> {
        if map.is_empty() {
            return Err(PipelineError::Configuration(
                "compatibility table MUST map at least one contact type".to_string(),
            ));
        }
        Ok(Self { map })
    }

    #[must_use]
    pub fn standard() -> Self {
        let mut map = BTreeMap::new();
        map.insert(ContactType::Person, PipelineType::People);
        map.insert(ContactType::Church, PipelineType::Church);
        Self { map }
    }

    /// Decodes a compatibility table from a JSON configuration artifact.
    ///
    /// # Errors
    /// Returns [`PipelineError::Configuration`] when decoding fails or the
    /// decoded table is empty.
    pub fn from_json(value: &Value) -> Result<Self, PipelineError> {
        let map: BTreeMap<ContactType, PipelineType> = serde_json::from_value(value.clone())
            .map_err(|err| {
                PipelineError::Configuration(format!("invalid compatibility JSON: {err}"))
            })?;
        Self::new(map)
    }

    #[must_use]
    pub fn pipeline_type_for(&self, contact_type: ContactType) -> Option<PipelineType> {
        self.map.get(&contact_type).copied()
    }

    /// Many-to-one fan-in used by count joins: every contact type that maps
    /// onto the given pipeline type.
    #[must_use]
    pub fn contact_types_for(&self, pipeline_type: PipelineType) -> Vec<ContactType> {
        self.map
            .iter()
            .filter(|(_, mapped)| **mapped == pipeline_type)
            .map(|(contact_type, _)| *contact_type)
            .collect()
    }

    #[must_use]
    pub fn contact_types(&self) -> Vec<ContactType> {
        self.map.keys().copied().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub contact_id: i64,
    pub contact_type: ContactType,
    pub owner: String,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pipeline {
    pub pipeline_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub pipeline_type: PipelineType,
    pub is_main_pipeline: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stage {
    pub stage_id: i64,
    pub pipeline_id: i64,
    pub name: String,
    pub ordinal: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineContact {
    pub pipeline_contact_id: i64,
    pub pipeline_id: i64,
    pub contact_id: i64,
    pub current_stage_id: i64,
    pub entered_at: OffsetDateTime,
    pub last_updated: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageHistoryRecord {
    pub history_seq: i64,
    pub record_id: Ulid,
    pub pipeline_id: i64,
    pub contact_id: i64,
    pub from_stage_id: Option<i64>,
    pub to_stage_id: i64,
    pub moved_by: String,
    pub notes: Option<String>,
    pub moved_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageAssignmentInput {
    pub contact_id: i64,
    pub pipeline_id: i64,
    pub target_stage_id: i64,
    pub moved_by: String,
    pub notes: Option<String>,
    pub moved_at: Option<OffsetDateTime>,
}

impl StageAssignmentInput {
    /// Validates an assignment request before the storage transaction runs.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] when identifiers or the mover
    /// are malformed.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.contact_id < 1 {
            return Err(PipelineError::Validation(
                "contact_id MUST be >= 1".to_string(),
            ));
        }

        if self.pipeline_id < 1 {
            return Err(PipelineError::Validation(
                "pipeline_id MUST be >= 1".to_string(),
            ));
        }

        if self.target_stage_id < 1 {
            return Err(PipelineError::Validation(
                "target_stage_id MUST be >= 1".to_string(),
            ));
        }

        if self.moved_by.trim().is_empty() {
            return Err(PipelineError::Validation(
                "moved_by MUST be provided for every assignment".to_string(),
            ));
        }

        if let Some(moved_at) = self.moved_at {
            if moved_at.offset() != UtcOffset::UTC {
                return Err(PipelineError::Validation(
                    "moved_at MUST be UTC (offset Z)".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentTransition {
    Entered,
    Moved,
    Unchanged,
}

impl AssignmentTransition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entered => "entered",
            Self::Moved => "moved",
            Self::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageAssignment {
    pub pipeline_contact: PipelineContact,
    pub transition: AssignmentTransition,
    /// None for idempotent re-assignment to the current stage.
    pub history_seq: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageCount {
    pub stage_id: i64,
    pub name: String,
    pub ordinal: i64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageCountReport {
    pub pipeline_id: i64,
    pub pipeline_name: String,
    pub total: u64,
    pub stages: Vec<StageCount>,
}

impl StageCountReport {
    /// Chart payload for the rendering layer: every stage present, zeros
    /// included, in stage order.
    #[must_use]
    pub fn by_stage_name(&self) -> BTreeMap<&str, u64> {
        self.stages
            .iter()
            .map(|stage| (stage.name.as_str(), stage.count))
            .collect()
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`PipelineError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, PipelineError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| PipelineError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(PipelineError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`PipelineError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, PipelineError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            PipelineError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn standard_table_maps_person_to_people() {
        let table = TypeCompatibility::standard();
        assert_eq!(
            table.pipeline_type_for(ContactType::Person),
            Some(PipelineType::People)
        );
        assert_eq!(
            table.pipeline_type_for(ContactType::Church),
            Some(PipelineType::Church)
        );
    }

    #[test]
    fn contact_types_for_inverts_the_mapping() {
        let table = TypeCompatibility::standard();
        assert_eq!(
            table.contact_types_for(PipelineType::People),
            vec![ContactType::Person]
        );
        assert_eq!(
            table.contact_types_for(PipelineType::Church),
            vec![ContactType::Church]
        );
    }

    #[test]
    fn empty_table_is_a_configuration_error() {
        let result = TypeCompatibility::new(BTreeMap::new());
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn compatibility_loads_from_json_artifact() {
        let value = serde_json::json!({"person": "people", "church": "church"});
        let table = must_ok(TypeCompatibility::from_json(&value));
        assert_eq!(table, TypeCompatibility::standard());
    }

    #[test]
    fn type_vocabularies_stay_distinct() {
        assert_eq!(ContactType::Person.as_str(), "person");
        assert_eq!(PipelineType::People.as_str(), "people");
        assert!(ContactType::parse("people").is_none());
        assert!(PipelineType::parse("person").is_none());
    }

    #[test]
    fn assignment_input_requires_a_mover() {
        let input = StageAssignmentInput {
            contact_id: 1,
            pipeline_id: 1,
            target_stage_id: 1,
            moved_by: "  ".to_string(),
            notes: None,
            moved_at: None,
        };
        assert!(matches!(
            input.validate(),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn assignment_input_rejects_non_utc_timestamps() {
        let offset = match UtcOffset::from_hms(2, 0, 0) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture offset: {err}"),
        };
        let input = StageAssignmentInput {
            contact_id: 1,
            pipeline_id: 1,
            target_stage_id: 1,
            moved_by: "tester".to_string(),
            notes: None,
            moved_at: Some(must_ok(parse_rfc3339_utc("2026-03-01T09:00:00Z")).to_offset(offset)),
        };
        assert!(matches!(
            input.validate(),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn error_kinds_are_stable_tags() {
        assert_eq!(
            PipelineError::NotFound {
                entity: "contact",
                id: 9
            }
            .kind(),
            "not_found"
        );
        assert_eq!(
            PipelineError::StageNotFound {
                stage_id: 2,
                pipeline_id: 1
            }
            .kind(),
            "stage_not_found"
        );
        assert_eq!(
            PipelineError::ConcurrentModification.kind(),
            "concurrent_modification"
        );
        assert!(PipelineError::ConcurrentModification.is_retryable());
        assert!(!PipelineError::Timeout.is_retryable());
    }

    #[test]
    fn count_report_exposes_chart_mapping() {
        let report = StageCountReport {
            pipeline_id: 1,
            pipeline_name: "People Pipeline".to_string(),
            total: 1,
            stages: vec![
                StageCount {
                    stage_id: 10,
                    name: "Intake".to_string(),
                    ordinal: 1,
                    count: 1,
                },
                StageCount {
                    stage_id: 11,
                    name: "Engaged".to_string(),
                    ordinal: 2,
                    count: 0,
                },
            ],
        };

        let chart = report.by_stage_name();
        assert_eq!(chart.get("Intake"), Some(&1));
        assert_eq!(chart.get("Engaged"), Some(&0));
    }

    #[test]
    fn rfc3339_requires_utc() {
        assert!(parse_rfc3339_utc("2026-03-01T09:00:00Z").is_ok());
        assert!(parse_rfc3339_utc("2026-03-01T09:00:00+02:00").is_err());
    }
}
