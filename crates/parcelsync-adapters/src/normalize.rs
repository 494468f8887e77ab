//! Raw feature → canonical [`PropertyRecord`].
//!
//! Normalization never fails. A feature without a usable identifier is
//! skipped; any other malformed attribute becomes null and is reported as a
//! [`RecordIssue::FieldDegraded`].

use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use parcelsync_core::PropertyRecord;
use regex::Regex;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::geometry::encode_feature_geometry;
use crate::{AddressRule, RawFeature, SourceProfile};

static NUMERIC_SUBSTRING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9]+\.?[0-9]*").expect("numeric pattern compiles"));

static TRAILING_POSTCODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^0-9])([0-9]{4})$").expect("postcode pattern compiles"));

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordIssue {
    #[error("record skipped: {reason}")]
    RecordSkipped { reason: String },
    #[error("object {object_id}: field {field} degraded to null ({detail})")]
    FieldDegraded {
        object_id: i64,
        field: &'static str,
        detail: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalization {
    pub record: Option<PropertyRecord>,
    pub issues: Vec<RecordIssue>,
}

impl Normalization {
    pub fn is_skipped(&self) -> bool {
        self.record.is_none()
    }

    pub fn degraded_fields(&self) -> usize {
        self.issues
            .iter()
            .filter(|issue| matches!(issue, RecordIssue::FieldDegraded { .. }))
            .count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressParts {
    pub street: Option<String>,
    pub locality: Option<String>,
    pub postcode: Option<String>,
}

/// Splits a multi-line address into street, locality and postcode.
///
/// The first non-blank line is the street. With two or more lines, the last
/// line supplies the locality and, when it ends in a run of exactly four
/// digits, the postcode. The run need not follow a space (`"Auckland2120"`
/// splits into `"Auckland"` and `"2120"`), but a longer digit run such as
/// `"12345"` is not a postcode. The locality is whatever precedes the
/// postcode, trimmed, so a last line holding only a postcode gives an empty
/// locality rather than null.
pub fn decompose_address(address: &str) -> AddressParts {
    let lines: Vec<&str> = address
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let mut parts = AddressParts {
        street: lines.first().map(|line| line.to_string()),
        ..AddressParts::default()
    };

    if lines.len() > 1 {
        let last = lines[lines.len() - 1];
        match TRAILING_POSTCODE.captures(last).and_then(|caps| caps.get(1)) {
            Some(code) => {
                parts.postcode = Some(code.as_str().to_string());
                parts.locality = Some(last[..code.start()].trim().to_string());
            }
            None => parts.locality = Some(last.to_string()),
        }
    }

    parts
}

/// First integer or decimal substring of a label such as `"1234 m2"`.
pub fn parse_area_label(label: &str) -> Option<f64> {
    NUMERIC_SUBSTRING
        .find(label)
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Area from either a bare JSON number or a decorated label string.
pub fn parse_area_value(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => parse_area_label(s),
        _ => None,
    }
}

/// Epoch milliseconds (UTC) truncated to a calendar date.
pub fn date_from_epoch_millis(millis: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp_millis(millis).map(|ts| ts.date_naive())
}

/// Dates arrive either as epoch milliseconds or as strings in the profile's
/// pattern. Anything else is `None`.
pub fn parse_date_value(value: &JsonValue, date_format: Option<&str>) -> Option<NaiveDate> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .and_then(date_from_epoch_millis),
        JsonValue::String(s) => {
            let s = s.trim();
            date_format
                .and_then(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
                .or_else(|| s.parse::<i64>().ok().and_then(date_from_epoch_millis))
        }
        _ => None,
    }
}

fn parse_object_id(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

struct FieldReader<'a> {
    feature: &'a RawFeature,
    object_id: i64,
    issues: Vec<RecordIssue>,
}

impl<'a> FieldReader<'a> {
    fn raw(&self, key: Option<&str>) -> Option<&'a JsonValue> {
        key.and_then(|k| self.feature.attributes.get(k))
            .filter(|v| !v.is_null())
    }

    fn degrade(&mut self, field: &'static str, value: &JsonValue) {
        self.issues.push(RecordIssue::FieldDegraded {
            object_id: self.object_id,
            field,
            detail: format!("unusable value {value}"),
        });
    }

    fn text(&mut self, field: &'static str, key: Option<&str>) -> Option<String> {
        let value = self.raw(key)?;
        match value {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            other => {
                self.degrade(field, other);
                None
            }
        }
    }

    fn amount(&mut self, field: &'static str, key: Option<&str>) -> Option<f64> {
        let value = self.raw(key)?;
        let parsed = match value {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
            _ => None,
        };
        if parsed.is_none() {
            self.degrade(field, value);
        }
        parsed
    }

    fn area(&mut self, field: &'static str, key: Option<&str>) -> Option<f64> {
        let value = self.raw(key)?;
        let parsed = parse_area_value(value);
        if parsed.is_none() {
            self.degrade(field, value);
        }
        parsed
    }

    fn date(
        &mut self,
        field: &'static str,
        key: Option<&str>,
        fmt: Option<&str>,
    ) -> Option<NaiveDate> {
        let value = self.raw(key)?;
        let parsed = parse_date_value(value, fmt);
        if parsed.is_none() {
            self.degrade(field, value);
        }
        parsed
    }
}

/// Maps one raw feature onto the canonical record using `profile`.
pub fn normalize(
    feature: &RawFeature,
    profile: &SourceProfile,
    now: DateTime<Utc>,
) -> Normalization {
    let fields = &profile.fields;
    let object_id = match feature
        .attributes
        .get(&fields.object_id)
        .filter(|v| !v.is_null())
    {
        None => {
            return Normalization {
                record: None,
                issues: vec![RecordIssue::RecordSkipped {
                    reason: format!("missing identifier {}", fields.object_id),
                }],
            }
        }
        Some(raw) => match parse_object_id(raw) {
            Some(id) => id,
            None => {
                return Normalization {
                    record: None,
                    issues: vec![RecordIssue::RecordSkipped {
                        reason: format!("unusable identifier {}={raw}", fields.object_id),
                    }],
                }
            }
        },
    };

    let mut reader = FieldReader {
        feature,
        object_id,
        issues: Vec::new(),
    };

    let physical_address = reader.text("physical_address", fields.physical_address.as_deref());
    let address = match profile.address {
        AddressRule::Multiline => physical_address
            .as_deref()
            .map(decompose_address)
            .unwrap_or_default(),
        AddressRule::Discrete => AddressParts {
            street: reader.text("street", fields.street.as_deref()),
            locality: reader.text("locality", fields.locality.as_deref()),
            postcode: reader.text("postcode", fields.postcode.as_deref()),
        },
    };

    let date_format = profile.date_format.as_deref();
    let mut record = PropertyRecord {
        property_no: reader.text("property_no", fields.property_no.as_deref()),
        physical_address,
        street: address.street,
        locality: address.locality,
        postcode: address.postcode,
        land_value: reader.amount("land_value", fields.land_value.as_deref()),
        capital_value: reader.amount("capital_value", fields.capital_value.as_deref()),
        improvements_value: reader.amount(
            "improvements_value",
            fields.improvements_value.as_deref(),
        ),
        land_use_description: reader.text(
            "land_use_description",
            fields.land_use_description.as_deref(),
        ),
        property_type_description: reader.text(
            "property_type_description",
            fields.property_type_description.as_deref(),
        ),
        survey_area: reader.area("survey_area", fields.survey_area.as_deref()),
        calculated_area: reader.area("calculated_area", fields.calculated_area.as_deref()),
        valuation_date: reader.date(
            "valuation_date",
            fields.valuation_date.as_deref(),
            date_format,
        ),
        district: profile.district.clone(),
        ..PropertyRecord::bare(object_id, now)
    };

    let encoded = match &feature.geometry_issue {
        Some(issue) => Err(issue.clone()),
        None => encode_feature_geometry(feature.geometry.as_ref()).map_err(|err| err.to_string()),
    };
    match encoded {
        Ok(wkt) => record.geometry_wkt = wkt,
        Err(detail) => reader.issues.push(RecordIssue::FieldDegraded {
            object_id,
            field: "geometry",
            detail,
        }),
    }

    Normalization {
        record: Some(record),
        issues: reader.issues,
    }
}
