//! Source profiles and the feature-service client contract.
//!
//! Every upstream municipality is described by a [`SourceProfile`] value; the
//! same client and normalizer serve all of them.

pub mod geometry;
pub mod normalize;

use async_trait::async_trait;
use parcelsync_core::{Column, MergePlan, SyncError, TARGET_SRID};
use parcelsync_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;
use uuid::Uuid;

pub use geometry::{encode_feature_geometry, encode_ring, GeometryError};
pub use normalize::{
    decompose_address, normalize, parse_area_label, parse_area_value, parse_date_value,
    AddressParts, Normalization, RecordIssue,
};

pub const CRATE_NAME: &str = "parcelsync-adapters";

/// How a source tells the client that another page may follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSignal {
    /// More pages while `exceededTransferLimit` is set or the page is full.
    #[default]
    TransferLimitFlag,
    /// More pages only while the page is full.
    ShortPage,
    /// Always ask again; the run ends on the first empty page.
    EmptyPage,
}

impl PageSignal {
    pub fn more_available(
        self,
        exceeded_transfer_limit: Option<bool>,
        returned: usize,
        page_size: u32,
    ) -> bool {
        let full = returned >= page_size as usize;
        match self {
            PageSignal::TransferLimitFlag => exceeded_transfer_limit.unwrap_or(false) || full,
            PageSignal::ShortPage => full,
            PageSignal::EmptyPage => returned > 0,
        }
    }
}

/// Where the street/locality/postcode come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressRule {
    /// Mapped attribute per component.
    #[default]
    Discrete,
    /// Decomposed from the multi-line physical address.
    Multiline,
}

/// Upstream attribute name for each canonical field. Unmapped fields stay null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMap {
    #[serde(default = "FieldMap::default_object_id")]
    pub object_id: String,
    #[serde(default)]
    pub property_no: Option<String>,
    #[serde(default)]
    pub physical_address: Option<String>,
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub locality: Option<String>,
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub land_value: Option<String>,
    #[serde(default)]
    pub capital_value: Option<String>,
    #[serde(default)]
    pub improvements_value: Option<String>,
    #[serde(default)]
    pub land_use_description: Option<String>,
    #[serde(default)]
    pub property_type_description: Option<String>,
    #[serde(default)]
    pub survey_area: Option<String>,
    #[serde(default)]
    pub calculated_area: Option<String>,
    #[serde(default)]
    pub valuation_date: Option<String>,
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            object_id: Self::default_object_id(),
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
        }
    }
}

impl FieldMap {
    fn default_object_id() -> String {
        "OBJECTID".to_string()
    }

    /// Attribute names to request, identifier first, without duplicates.
    pub fn out_fields(&self) -> Vec<&str> {
        let mapped = [
            &self.property_no,
            &self.physical_address,
            &self.street,
            &self.locality,
            &self.postcode,
            &self.land_value,
            &self.capital_value,
            &self.improvements_value,
            &self.land_use_description,
            &self.property_type_description,
            &self.survey_area,
            &self.calculated_area,
            &self.valuation_date,
        ];
        let mut fields = vec![self.object_id.as_str()];
        for name in mapped.into_iter().flatten() {
            if !fields.contains(&name.as_str()) {
                fields.push(name.as_str());
            }
        }
        fields
    }
}

/// Everything that distinguishes one upstream feed from another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceProfile {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub query_url: String,
    pub filter: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_out_sr")]
    pub out_sr: i32,
    #[serde(default)]
    pub page_signal: PageSignal,
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
    #[serde(default)]
    pub district: Option<String>,
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(default)]
    pub address: AddressRule,
    #[serde(default)]
    pub date_format: Option<String>,
    #[serde(default)]
    pub merge: MergePlan,
}

fn default_enabled() -> bool {
    true
}

fn default_page_size() -> u32 {
    1000
}

fn default_out_sr() -> i32 {
    TARGET_SRID
}

fn default_pacing_ms() -> u64 {
    500
}

impl SourceProfile {
    pub fn validate(&self, store_srid: i32) -> Result<(), SyncError> {
        let invalid = |msg: String| Err(SyncError::InvalidConfiguration(msg));
        if self.source_id.trim().is_empty() {
            return invalid("source profile with empty source_id".to_string());
        }
        if self.query_url.trim().is_empty() {
            return invalid(format!("{}: query_url is empty", self.source_id));
        }
        if self.filter.trim().is_empty() {
            return invalid(format!("{}: filter is empty", self.source_id));
        }
        if self.page_size == 0 {
            return invalid(format!("{}: page_size must be positive", self.source_id));
        }
        if self.out_sr != store_srid {
            return invalid(format!(
                "{}: out_sr {} does not match store SRID {store_srid}",
                self.source_id, self.out_sr
            ));
        }
        self.merge
            .validate()
            .map_err(|err| SyncError::InvalidConfiguration(format!("{}: {err}", self.source_id)))
    }
}

/// Profiles for the feeds parcelsync ships with.
pub fn builtin_profiles() -> Vec<SourceProfile> {
    vec![
        SourceProfile {
            source_id: "auckland".to_string(),
            display_name: "Auckland Council".to_string(),
            enabled: true,
            query_url: "https://mapspublic.aklc.govt.nz/arcgis/rest/services/Applications/ACWebsite/MapServer/3/query".to_string(),
            filter: "LCV > 0".to_string(),
            page_size: 1000,
            out_sr: TARGET_SRID,
            page_signal: PageSignal::TransferLimitFlag,
            pacing_ms: 500,
            district: None,
            fields: FieldMap {
                property_no: Some("RATESASSESSMENTNUM".into()),
                physical_address: Some("FORMATTEDADDRESS".into()),
                land_value: Some("LLV".into()),
                capital_value: Some("LCV".into()),
                improvements_value: Some("LIV".into()),
                land_use_description: Some("LANDUSEDESCRIPTION".into()),
                property_type_description: Some("IMPROVEMENT".into()),
                calculated_area: Some("AREALABEL".into()),
                valuation_date: Some("LATESTVALUATIONDATE".into()),
                ..FieldMap::default()
            },
            address: AddressRule::Multiline,
            date_format: None,
            merge: MergePlan::with_extra_updates(&[Column::PropertyNo]),
        },
        SourceProfile {
            source_id: "wellington".to_string(),
            display_name: "Wellington City Council".to_string(),
            enabled: true,
            query_url: "https://gis.wcc.govt.nz/arcgis/rest/services/PropertyAndBoundaries/Property/MapServer/0/query".to_string(),
            filter: "CapitalValue > 0".to_string(),
            page_size: 1000,
            out_sr: TARGET_SRID,
            page_signal: PageSignal::EmptyPage,
            pacing_ms: 250,
            district: Some("Wellington".to_string()),
            fields: FieldMap {
                property_no: Some("AssessmentNumber".into()),
                physical_address: Some("FullAddress".into()),
                street: Some("StreetName".into()),
                locality: Some("Suburb".into()),
                postcode: Some("PostCode".into()),
                land_value: Some("LandValue".into()),
                capital_value: Some("CapitalValue".into()),
                improvements_value: Some("ImprovementsValue".into()),
                land_use_description: Some("LegalDescription".into()),
                property_type_description: Some("Title".into()),
                survey_area: Some("LandArea".into()),
                valuation_date: Some("ValuationDate".into()),
                ..FieldMap::default()
            },
            address: AddressRule::Discrete,
            date_format: Some("%d/%m/%Y".to_string()),
            merge: MergePlan::with_extra_updates(&[Column::District]),
        },
        SourceProfile {
            source_id: "qldc".to_string(),
            display_name: "Queenstown Lakes District Council".to_string(),
            enabled: true,
            query_url: "https://services1.arcgis.com/9YyqaQtDdDR8tupG/arcgis/rest/services/Land_Parcels_and_Properties_Data/FeatureServer/0/query".to_string(),
            filter: "CAPITAL_VALUE > 0 AND PHYSADDRESS IS NOT NULL".to_string(),
            page_size: 1000,
            out_sr: TARGET_SRID,
            page_signal: PageSignal::ShortPage,
            pacing_ms: 500,
            district: None,
            fields: FieldMap {
                property_no: Some("PROPERTY_NO".into()),
                physical_address: Some("PHYSADDRESS".into()),
                street: Some("STREET".into()),
                locality: Some("LOCALITY".into()),
                postcode: Some("POSTCODE".into()),
                land_value: Some("LAND_VALUE".into()),
                capital_value: Some("CAPITAL_VALUE".into()),
                improvements_value: Some("IMPROVEMENTS_VALUE".into()),
                land_use_description: Some("LANDUSEDESCRIPTION".into()),
                property_type_description: Some("PROPERTY_TYPE_DESC".into()),
                survey_area: Some("survey_area".into()),
                calculated_area: Some("calc_area".into()),
                ..FieldMap::default()
            },
            address: AddressRule::Discrete,
            date_format: None,
            merge: MergePlan::with_extra_updates(&[Column::PropertyNo]),
        },
    ]
}

/// One upstream feature: attributes plus optional ring geometry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawFeature {
    #[serde(default)]
    pub attributes: Map<String, JsonValue>,
    #[serde(default)]
    pub geometry: Option<FeatureGeometry>,
    /// Why a geometry present on the wire could not be read.
    #[serde(skip)]
    pub geometry_issue: Option<String>,
}

impl RawFeature {
    /// Reads one element of a query response's `features` array.
    ///
    /// Never fails: a non-object element or non-object `attributes` yields no
    /// attributes, and a geometry that is not a ring list is dropped with the
    /// reason kept in `geometry_issue`.
    pub fn from_json(value: JsonValue) -> Self {
        let JsonValue::Object(mut object) = value else {
            return Self::default();
        };
        let attributes = match object.remove("attributes") {
            Some(JsonValue::Object(attributes)) => attributes,
            _ => Map::new(),
        };
        let (geometry, geometry_issue) = match object.remove("geometry") {
            None | Some(JsonValue::Null) => (None, None),
            Some(raw) => match serde_json::from_value::<FeatureGeometry>(raw) {
                Ok(geometry) => (Some(geometry), None),
                Err(err) => (None, Some(err.to_string())),
            },
        };
        Self {
            attributes,
            geometry,
            geometry_issue,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureGeometry {
    #[serde(default)]
    pub rings: Vec<Vec<Vec<f64>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeaturePage {
    pub features: Vec<RawFeature>,
    pub more_available: bool,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Vec<String>,
}

impl ServiceError {
    fn into_sync_error(self) -> SyncError {
        let mut msg = format!(
            "service error {}: {}",
            self.code.map(|c| c.to_string()).unwrap_or_else(|| "?".into()),
            self.message.unwrap_or_default()
        );
        if !self.details.is_empty() {
            msg.push_str(&format!(" ({})", self.details.join("; ")));
        }
        SyncError::UpstreamUnavailable(msg)
    }
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    #[serde(default)]
    count: Option<u64>,
    #[serde(default)]
    error: Option<ServiceError>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    features: Option<JsonValue>,
    #[serde(default, rename = "exceededTransferLimit")]
    exceeded_transfer_limit: Option<JsonValue>,
    #[serde(default)]
    error: Option<ServiceError>,
}

/// Read access to a paged feature-query endpoint.
#[async_trait]
pub trait FeatureSource: Send + Sync {
    /// Number of features matching the profile's filter. Used for progress
    /// only; the page signal decides when paging stops.
    async fn count(&self, profile: &SourceProfile) -> Result<u64, SyncError>;

    /// Up to `profile.page_size` features starting at `offset`.
    async fn fetch_page(
        &self,
        profile: &SourceProfile,
        offset: u64,
    ) -> Result<FeaturePage, SyncError>;
}

/// [`FeatureSource`] over an ArcGIS REST `query` endpoint.
#[derive(Debug, Clone)]
pub struct FeatureServiceClient {
    http: HttpFetcher,
    run_id: Uuid,
}

impl FeatureServiceClient {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    async fn get(
        &self,
        profile: &SourceProfile,
        query: &[(&str, String)],
    ) -> Result<Vec<u8>, SyncError> {
        self.http
            .fetch_bytes(self.run_id, &profile.source_id, &profile.query_url, query)
            .await
            .map(|resp| resp.body)
            .map_err(|err| upstream_unavailable(&profile.source_id, err))
    }
}

fn upstream_unavailable(source_id: &str, err: FetchError) -> SyncError {
    let detail = if err.is_timeout() {
        format!("timed out: {err}")
    } else {
        err.to_string()
    };
    SyncError::UpstreamUnavailable(format!("{source_id}: {detail}"))
}

fn protocol_error(source_id: &str, detail: impl std::fmt::Display) -> SyncError {
    SyncError::UpstreamProtocol(format!("{source_id}: {detail}"))
}

#[async_trait]
impl FeatureSource for FeatureServiceClient {
    async fn count(&self, profile: &SourceProfile) -> Result<u64, SyncError> {
        let query = [
            ("where", profile.filter.clone()),
            ("returnCountOnly", "true".to_string()),
            ("f", "json".to_string()),
        ];
        let body = self.get(profile, &query).await?;
        let parsed: CountResponse = serde_json::from_slice(&body)
            .map_err(|err| protocol_error(&profile.source_id, format!("count response: {err}")))?;
        if let Some(error) = parsed.error {
            return Err(error.into_sync_error());
        }
        parsed
            .count
            .ok_or_else(|| protocol_error(&profile.source_id, "count response without count"))
    }

    async fn fetch_page(
        &self,
        profile: &SourceProfile,
        offset: u64,
    ) -> Result<FeaturePage, SyncError> {
        let query = [
            ("where", profile.filter.clone()),
            ("outFields", profile.fields.out_fields().join(",")),
            ("returnGeometry", "true".to_string()),
            ("outSR", profile.out_sr.to_string()),
            ("resultOffset", offset.to_string()),
            ("resultRecordCount", profile.page_size.to_string()),
            ("f", "json".to_string()),
        ];
        let body = self.get(profile, &query).await?;
        let parsed: QueryResponse = serde_json::from_slice(&body)
            .map_err(|err| protocol_error(&profile.source_id, format!("query response: {err}")))?;
        if let Some(error) = parsed.error {
            return Err(error.into_sync_error());
        }
        let source_id = profile.source_id.as_str();
        let features: Vec<RawFeature> = match parsed.features {
            Some(JsonValue::Array(items)) => items.into_iter().map(RawFeature::from_json).collect(),
            Some(_) => return Err(protocol_error(source_id, "features is not an array")),
            None => return Err(protocol_error(source_id, "query response without features")),
        };
        let unreadable = features
            .iter()
            .filter(|f| f.geometry_issue.is_some())
            .count();
        debug!(
            source_id,
            offset,
            returned = features.len(),
            unreadable_geometries = unreadable,
            "page parsed"
        );

        let more_available = profile.page_signal.more_available(
            parsed.exceeded_transfer_limit.as_ref().and_then(JsonValue::as_bool),
            features.len(),
            profile.page_size,
        );
        Ok(FeaturePage {
            features,
            more_available,
        })
    }
}
