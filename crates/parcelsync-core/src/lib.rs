//! Canonical property model, merge plan and error taxonomy for parcelsync.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "parcelsync-core";

/// NZGD2000 / New Zealand Transverse Mercator. Requests ask upstream for this
/// output reference and the durable table stores geometry in it.
pub const TARGET_SRID: i32 = 2193;

/// One parcel as written to the durable table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub object_id: i64,
    pub property_no: Option<String>,
    pub physical_address: Option<String>,
    pub street: Option<String>,
    pub locality: Option<String>,
    pub postcode: Option<String>,
    pub land_value: Option<f64>,
    pub capital_value: Option<f64>,
    pub improvements_value: Option<f64>,
    pub land_use_description: Option<String>,
    pub property_type_description: Option<String>,
    pub survey_area: Option<f64>,
    pub calculated_area: Option<f64>,
    pub valuation_date: Option<NaiveDate>,
    pub last_updated: DateTime<Utc>,
    pub district: Option<String>,
    /// Polygon well-known text, parsed into a spatial type only by the store.
    pub geometry_wkt: Option<String>,
}

impl PropertyRecord {
    /// A record carrying only its identifier and write stamp.
    pub fn bare(object_id: i64, last_updated: DateTime<Utc>) -> Self {
        Self {
            object_id,
            property_no: None,
            physical_address: None,
            street: None,
            locality: None,
            postcode: None,
            land_value: None,
            capital_value: None,
            improvements_value: None,
            land_use_description: None,
            property_type_description: None,
            survey_area: None,
            calculated_area: None,
            valuation_date: None,
            last_updated,
            district: None,
            geometry_wkt: None,
        }
    }

    fn value_of(&self, column: Column) -> ColumnValue<'_> {
        match column {
            Column::PropertyNo => ColumnValue::Text(self.property_no.as_deref()),
            Column::PhysicalAddress => ColumnValue::Text(self.physical_address.as_deref()),
            Column::Street => ColumnValue::Text(self.street.as_deref()),
            Column::Locality => ColumnValue::Text(self.locality.as_deref()),
            Column::Postcode => ColumnValue::Text(self.postcode.as_deref()),
            Column::LandValue => ColumnValue::Number(self.land_value),
            Column::CapitalValue => ColumnValue::Number(self.capital_value),
            Column::ImprovementsValue => ColumnValue::Number(self.improvements_value),
            Column::LandUseDescription => ColumnValue::Text(self.land_use_description.as_deref()),
            Column::PropertyTypeDescription => {
                ColumnValue::Text(self.property_type_description.as_deref())
            }
            Column::SurveyArea => ColumnValue::Number(self.survey_area),
            Column::CalculatedArea => ColumnValue::Number(self.calculated_area),
            Column::ValuationDate => ColumnValue::Date(self.valuation_date),
            Column::LastUpdated => ColumnValue::Timestamp(Some(self.last_updated)),
            Column::District => ColumnValue::Text(self.district.as_deref()),
            Column::Geometry => ColumnValue::Text(self.geometry_wkt.as_deref()),
        }
    }

    fn copy_column_from(&mut self, other: &PropertyRecord, column: Column) {
        match column {
            Column::PropertyNo => self.property_no = other.property_no.clone(),
            Column::PhysicalAddress => self.physical_address = other.physical_address.clone(),
            Column::Street => self.street = other.street.clone(),
            Column::Locality => self.locality = other.locality.clone(),
            Column::Postcode => self.postcode = other.postcode.clone(),
            Column::LandValue => self.land_value = other.land_value,
            Column::CapitalValue => self.capital_value = other.capital_value,
            Column::ImprovementsValue => self.improvements_value = other.improvements_value,
            Column::LandUseDescription => {
                self.land_use_description = other.land_use_description.clone()
            }
            Column::PropertyTypeDescription => {
                self.property_type_description = other.property_type_description.clone()
            }
            Column::SurveyArea => self.survey_area = other.survey_area,
            Column::CalculatedArea => self.calculated_area = other.calculated_area,
            Column::ValuationDate => self.valuation_date = other.valuation_date,
            Column::LastUpdated => self.last_updated = other.last_updated,
            Column::District => self.district = other.district.clone(),
            Column::Geometry => self.geometry_wkt = other.geometry_wkt.clone(),
        }
    }
}

#[derive(Debug, PartialEq)]
enum ColumnValue<'a> {
    Text(Option<&'a str>),
    Number(Option<f64>),
    Date(Option<NaiveDate>),
    Timestamp(Option<DateTime<Utc>>),
}

impl ColumnValue<'_> {
    /// Null-aware inequality: two nulls are equal, a null and a value are not.
    fn is_distinct_from(&self, other: &Self) -> bool {
        self != other
    }
}

/// Mutable columns of the durable table. `object_id` is the conflict key and
/// never appears here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    PropertyNo,
    PhysicalAddress,
    Street,
    Locality,
    Postcode,
    LandValue,
    CapitalValue,
    ImprovementsValue,
    LandUseDescription,
    PropertyTypeDescription,
    SurveyArea,
    CalculatedArea,
    ValuationDate,
    LastUpdated,
    District,
    Geometry,
}

impl Column {
    pub const ALL: [Column; 16] = [
        Column::PropertyNo,
        Column::PhysicalAddress,
        Column::Street,
        Column::Locality,
        Column::Postcode,
        Column::LandValue,
        Column::CapitalValue,
        Column::ImprovementsValue,
        Column::LandUseDescription,
        Column::PropertyTypeDescription,
        Column::SurveyArea,
        Column::CalculatedArea,
        Column::ValuationDate,
        Column::LastUpdated,
        Column::District,
        Column::Geometry,
    ];

    /// Column name in the durable table.
    pub fn name(self) -> &'static str {
        match self {
            Column::PropertyNo => "property_no",
            Column::PhysicalAddress => "physical_address",
            Column::Street => "street",
            Column::Locality => "locality",
            Column::Postcode => "postcode",
            Column::LandValue => "land_value",
            Column::CapitalValue => "capital_value",
            Column::ImprovementsValue => "improvements_value",
            Column::LandUseDescription => "land_use_description",
            Column::PropertyTypeDescription => "property_type_description",
            Column::SurveyArea => "survey_area",
            Column::CalculatedArea => "calculated_area",
            Column::ValuationDate => "valuation_date",
            Column::LastUpdated => "last_updated",
            Column::District => "district",
            Column::Geometry => "geom",
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which columns an upsert overwrites on conflict, and which columns decide
/// whether the overwrite happens at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePlan {
    #[serde(default = "MergePlan::default_update_columns")]
    pub update_columns: Vec<Column>,
    #[serde(default = "MergePlan::default_change_columns")]
    pub change_columns: Vec<Column>,
}

impl Default for MergePlan {
    fn default() -> Self {
        Self {
            update_columns: Self::default_update_columns(),
            change_columns: Self::default_change_columns(),
        }
    }
}

impl MergePlan {
    pub fn default_update_columns() -> Vec<Column> {
        vec![
            Column::PhysicalAddress,
            Column::Street,
            Column::Locality,
            Column::Postcode,
            Column::LandValue,
            Column::CapitalValue,
            Column::ImprovementsValue,
            Column::SurveyArea,
            Column::CalculatedArea,
            Column::ValuationDate,
            Column::LastUpdated,
            Column::Geometry,
        ]
    }

    pub fn default_change_columns() -> Vec<Column> {
        vec![Column::CapitalValue, Column::PhysicalAddress]
    }

    /// Default plan plus extra overwritable columns.
    pub fn with_extra_updates(extra: &[Column]) -> Self {
        let mut plan = Self::default();
        for column in extra {
            if !plan.update_columns.contains(column) {
                plan.update_columns.push(*column);
            }
        }
        plan
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if !self.update_columns.contains(&Column::LastUpdated) {
            return Err(SyncError::InvalidConfiguration(
                "merge plan must overwrite last_updated".to_string(),
            ));
        }
        if self.change_columns.is_empty() {
            return Err(SyncError::InvalidConfiguration(
                "merge plan needs at least one change column".to_string(),
            ));
        }
        if self.change_columns.contains(&Column::LastUpdated) {
            return Err(SyncError::InvalidConfiguration(
                "last_updated cannot gate its own update".to_string(),
            ));
        }
        Ok(())
    }

    /// True when any change column of `incoming` is distinct from `existing`.
    pub fn should_update(&self, existing: &PropertyRecord, incoming: &PropertyRecord) -> bool {
        self.change_columns.iter().any(|column| {
            existing
                .value_of(*column)
                .is_distinct_from(&incoming.value_of(*column))
        })
    }

    /// Copies the update columns of `incoming` onto `existing`.
    pub fn apply(&self, existing: &mut PropertyRecord, incoming: &PropertyRecord) {
        for column in &self.update_columns {
            existing.copy_column_from(incoming, *column);
        }
    }
}

/// Fatal failures of a sync run. Per-record problems are not errors; they are
/// reported as record issues by the normalizer.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl SyncError {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::ConfigurationMissing(_) => "configuration_missing",
            SyncError::InvalidConfiguration(_) => "invalid_configuration",
            SyncError::UpstreamUnavailable(_) => "upstream_unavailable",
            SyncError::UpstreamProtocol(_) => "upstream_protocol",
            SyncError::Persistence(_) => "persistence",
        }
    }
}

/// Externally visible phase of one source run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    CountFetched,
    Paging,
    Draining,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::Idle => "idle",
            RunState::CountFetched => "count_fetched",
            RunState::Paging => "paging",
            RunState::Draining => "draining",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stamp(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 1, hour, 0, 0).single().unwrap()
    }

    fn record(capital: Option<f64>, address: Option<&str>, hour: u32) -> PropertyRecord {
        PropertyRecord {
            capital_value: capital,
            physical_address: address.map(str::to_string),
            ..PropertyRecord::bare(101, stamp(hour))
        }
    }

    #[test]
    fn identical_tracked_fields_do_not_trigger_update() {
        let plan = MergePlan::default();
        let existing = record(Some(950_000.0), Some("7 Ward Street"), 1);
        let incoming = record(Some(950_000.0), Some("7 Ward Street"), 2);
        assert!(!plan.should_update(&existing, &incoming));
    }

    #[test]
    fn null_on_one_side_counts_as_change() {
        let plan = MergePlan::default();
        let existing = record(None, Some("7 Ward Street"), 1);
        let incoming = record(Some(950_000.0), Some("7 Ward Street"), 2);
        assert!(plan.should_update(&existing, &incoming));
        assert!(plan.should_update(&incoming, &existing));
    }

    #[test]
    fn null_on_both_sides_is_not_a_change() {
        let plan = MergePlan::default();
        let existing = record(None, None, 1);
        let incoming = record(None, None, 2);
        assert!(!plan.should_update(&existing, &incoming));
    }

    #[test]
    fn untracked_difference_is_ignored() {
        let plan = MergePlan::default();
        let existing = record(Some(1.0), Some("a"), 1);
        let mut incoming = record(Some(1.0), Some("a"), 2);
        incoming.land_value = Some(5.0);
        assert!(!plan.should_update(&existing, &incoming));
    }

    #[test]
    fn apply_overwrites_only_update_columns() {
        let plan = MergePlan::default();
        let mut existing = record(Some(1.0), Some("old"), 1);
        existing.land_use_description = Some("Residential".into());
        existing.property_no = Some("A-1".into());
        let mut incoming = record(Some(2.0), Some("new"), 2);
        incoming.land_use_description = Some("Commercial".into());
        incoming.property_no = Some("B-2".into());

        plan.apply(&mut existing, &incoming);

        assert_eq!(existing.capital_value, Some(2.0));
        assert_eq!(existing.physical_address.as_deref(), Some("new"));
        assert_eq!(existing.last_updated, stamp(2));
        assert_eq!(existing.land_use_description.as_deref(), Some("Residential"));
        assert_eq!(existing.property_no.as_deref(), Some("A-1"));
    }

    #[test]
    fn extra_updates_are_appended_once() {
        let plan = MergePlan::with_extra_updates(&[Column::District, Column::Street]);
        assert!(plan.update_columns.contains(&Column::District));
        assert_eq!(
            plan.update_columns
                .iter()
                .filter(|c| **c == Column::Street)
                .count(),
            1
        );
    }

    #[test]
    fn plan_validation_rejects_ungated_or_unstamped_plans() {
        let mut plan = MergePlan::default();
        plan.update_columns.retain(|c| *c != Column::LastUpdated);
        assert!(plan.validate().is_err());

        let plan = MergePlan {
            update_columns: MergePlan::default_update_columns(),
            change_columns: vec![Column::LastUpdated],
        };
        assert!(plan.validate().is_err());

        assert!(MergePlan::default().validate().is_ok());
    }

    #[test]
    fn merge_plan_deserializes_with_defaults() {
        let plan: MergePlan =
            serde_json::from_str(r#"{"change_columns": ["capital_value"]}"#).expect("plan");
        assert_eq!(plan.change_columns, vec![Column::CapitalValue]);
        assert_eq!(plan.update_columns, MergePlan::default_update_columns());
    }
}
