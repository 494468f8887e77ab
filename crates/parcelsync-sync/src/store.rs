//! Durable property stores.
//!
//! Every batch is merged in its own transaction: rows land in a session-local
//! staging table first, then one `INSERT .. ON CONFLICT` statement moves them
//! into the durable table. An existing row is only rewritten when one of the
//! plan's change columns differs.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parcelsync_core::{Column, MergePlan, PropertyRecord, SyncError, TARGET_SRID};
use sqlx::{Connection, PgConnection};
use tracing::debug;

const STAGING_TABLE: &str = "staging_properties";

/// Columns written on insert, in staging and durable-table order.
const INSERT_COLUMNS: [Column; 16] = Column::ALL;

#[async_trait]
pub trait PropertyStore: Send {
    /// Merges one batch and returns the number of inserted or rewritten rows.
    /// A failed batch leaves the store as it was before the call.
    async fn merge_batch(
        &mut self,
        records: &[PropertyRecord],
        plan: &MergePlan,
    ) -> Result<u64, SyncError>;

    async fn close(&mut self) -> Result<(), SyncError>;
}

/// Accepts plain lower-case SQL identifiers only; table names are spliced
/// into statements.
pub fn validate_table_name(name: &str) -> Result<(), SyncError> {
    let mut chars = name.chars();
    let valid = name.len() <= 63
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SyncError::InvalidConfiguration(format!(
            "table name {name:?} is not a plain identifier"
        )))
    }
}

pub fn staging_table_sql() -> String {
    format!(
        "CREATE TEMP TABLE {STAGING_TABLE} (
            object_id BIGINT NOT NULL,
            property_no TEXT,
            physical_address TEXT,
            street TEXT,
            locality TEXT,
            postcode TEXT,
            land_value NUMERIC,
            capital_value NUMERIC,
            improvements_value NUMERIC,
            land_use_description TEXT,
            property_type_description TEXT,
            survey_area DOUBLE PRECISION,
            calculated_area DOUBLE PRECISION,
            valuation_date DATE,
            last_updated TIMESTAMPTZ NOT NULL,
            district TEXT,
            geometry_wkt TEXT
        ) ON COMMIT DROP"
    )
}

fn staging_insert_sql() -> String {
    format!(
        "INSERT INTO {STAGING_TABLE} (
            object_id, property_no, physical_address, street, locality, postcode,
            land_value, capital_value, improvements_value,
            land_use_description, property_type_description,
            survey_area, calculated_area, valuation_date, last_updated, district, geometry_wkt
        )
        SELECT * FROM UNNEST(
            $1::bigint[], $2::text[], $3::text[], $4::text[], $5::text[], $6::text[],
            $7::float8[], $8::float8[], $9::float8[],
            $10::text[], $11::text[],
            $12::float8[], $13::float8[], $14::date[], $15::timestamptz[], $16::text[], $17::text[]
        )"
    )
}

/// The merge statement for `table` under `plan`.
pub fn upsert_sql(table: &str, plan: &MergePlan, srid: i32) -> String {
    let mut insert_columns = vec!["object_id"];
    let mut select_columns = vec!["object_id".to_string()];
    for column in INSERT_COLUMNS {
        insert_columns.push(column.name());
        select_columns.push(match column {
            Column::Geometry => format!("ST_GeomFromText(geometry_wkt, {srid})"),
            other => other.name().to_string(),
        });
    }

    let assignments = plan
        .update_columns
        .iter()
        .map(|c| format!("{0} = EXCLUDED.{0}", c.name()))
        .collect::<Vec<_>>()
        .join(", ");
    let predicate = plan
        .change_columns
        .iter()
        .map(|c| format!("{table}.{0} IS DISTINCT FROM EXCLUDED.{0}", c.name()))
        .collect::<Vec<_>>()
        .join(" OR ");

    format!(
        "INSERT INTO {table} ({}) SELECT {} FROM {STAGING_TABLE} \
         ON CONFLICT (object_id) DO UPDATE SET {assignments} WHERE {predicate}",
        insert_columns.join(", "),
        select_columns.join(", "),
    )
}

/// Drops `table` together with dependent views and constraints.
pub fn drop_table_sql(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {table} CASCADE")
}

/// DDL for a durable table named `table`.
pub fn create_table_sql(table: &str, srid: i32) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            object_id BIGINT PRIMARY KEY,
            property_no TEXT,
            physical_address TEXT,
            street TEXT,
            locality TEXT,
            postcode TEXT,
            land_value NUMERIC,
            capital_value NUMERIC,
            improvements_value NUMERIC,
            land_use_description TEXT,
            property_type_description TEXT,
            survey_area DOUBLE PRECISION,
            calculated_area DOUBLE PRECISION,
            valuation_date DATE,
            last_updated TIMESTAMPTZ NOT NULL,
            district TEXT,
            geom GEOMETRY(POLYGON, {srid})
        )"
    )
}

fn persistence(context: &'static str) -> impl FnOnce(sqlx::Error) -> SyncError {
    move |err| SyncError::Persistence(format!("{context}: {err}"))
}

#[derive(Default)]
struct StagingColumns {
    object_id: Vec<i64>,
    property_no: Vec<Option<String>>,
    physical_address: Vec<Option<String>>,
    street: Vec<Option<String>>,
    locality: Vec<Option<String>>,
    postcode: Vec<Option<String>>,
    land_value: Vec<Option<f64>>,
    capital_value: Vec<Option<f64>>,
    improvements_value: Vec<Option<f64>>,
    land_use_description: Vec<Option<String>>,
    property_type_description: Vec<Option<String>>,
    survey_area: Vec<Option<f64>>,
    calculated_area: Vec<Option<f64>>,
    valuation_date: Vec<Option<NaiveDate>>,
    last_updated: Vec<DateTime<Utc>>,
    district: Vec<Option<String>>,
    geometry_wkt: Vec<Option<String>>,
}

impl StagingColumns {
    fn from_records(records: &[PropertyRecord]) -> Self {
        let mut cols = Self::default();
        for r in records {
            cols.object_id.push(r.object_id);
            cols.property_no.push(r.property_no.clone());
            cols.physical_address.push(r.physical_address.clone());
            cols.street.push(r.street.clone());
            cols.locality.push(r.locality.clone());
            cols.postcode.push(r.postcode.clone());
            cols.land_value.push(r.land_value);
            cols.capital_value.push(r.capital_value);
            cols.improvements_value.push(r.improvements_value);
            cols.land_use_description.push(r.land_use_description.clone());
            cols.property_type_description
                .push(r.property_type_description.clone());
            cols.survey_area.push(r.survey_area);
            cols.calculated_area.push(r.calculated_area);
            cols.valuation_date.push(r.valuation_date);
            cols.last_updated.push(r.last_updated);
            cols.district.push(r.district.clone());
            cols.geometry_wkt.push(r.geometry_wkt.clone());
        }
        cols
    }
}

/// PostGIS-backed store holding one connection for the duration of a source run.
pub struct PgPropertyStore {
    conn: Option<PgConnection>,
    table: String,
    srid: i32,
}

impl PgPropertyStore {
    pub async fn connect(database_url: &str, table: &str) -> Result<Self, SyncError> {
        validate_table_name(table)?;
        let conn = PgConnection::connect(database_url)
            .await
            .map_err(persistence("connecting to database"))?;
        Ok(Self {
            conn: Some(conn),
            table: table.to_string(),
            srid: TARGET_SRID,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl PropertyStore for PgPropertyStore {
    async fn merge_batch(
        &mut self,
        records: &[PropertyRecord],
        plan: &MergePlan,
    ) -> Result<u64, SyncError> {
        if records.is_empty() {
            return Ok(0);
        }
        let upsert = upsert_sql(&self.table, plan, self.srid);
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| SyncError::Persistence("store already closed".to_string()))?;

        let mut tx = conn.begin().await.map_err(persistence("beginning batch"))?;

        sqlx::query(&format!("DROP TABLE IF EXISTS pg_temp.{STAGING_TABLE}"))
            .execute(&mut *tx)
            .await
            .map_err(persistence("dropping staging table"))?;
        sqlx::query(&staging_table_sql())
            .execute(&mut *tx)
            .await
            .map_err(persistence("creating staging table"))?;

        let cols = StagingColumns::from_records(records);
        sqlx::query(&staging_insert_sql())
            .bind(&cols.object_id)
            .bind(&cols.property_no)
            .bind(&cols.physical_address)
            .bind(&cols.street)
            .bind(&cols.locality)
            .bind(&cols.postcode)
            .bind(&cols.land_value)
            .bind(&cols.capital_value)
            .bind(&cols.improvements_value)
            .bind(&cols.land_use_description)
            .bind(&cols.property_type_description)
            .bind(&cols.survey_area)
            .bind(&cols.calculated_area)
            .bind(&cols.valuation_date)
            .bind(&cols.last_updated)
            .bind(&cols.district)
            .bind(&cols.geometry_wkt)
            .execute(&mut *tx)
            .await
            .map_err(persistence("loading staging table"))?;

        let affected = sqlx::query(&upsert)
            .execute(&mut *tx)
            .await
            .map_err(persistence("merging staged rows"))?
            .rows_affected();

        tx.commit().await.map_err(persistence("committing batch"))?;
        debug!(table = %self.table, staged = records.len(), affected, "batch merged");
        Ok(affected)
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        match self.conn.take() {
            Some(conn) => conn.close().await.map_err(persistence("closing connection")),
            None => Ok(()),
        }
    }
}

/// In-memory store with the same merge semantics as [`PgPropertyStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryPropertyStore {
    rows: BTreeMap<i64, PropertyRecord>,
    merge_calls: usize,
    close_calls: usize,
}

impl MemoryPropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, object_id: i64) -> Option<&PropertyRecord> {
        self.rows.get(&object_id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn merge_calls(&self) -> usize {
        self.merge_calls
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls
    }
}

#[async_trait]
impl PropertyStore for MemoryPropertyStore {
    async fn merge_batch(
        &mut self,
        records: &[PropertyRecord],
        plan: &MergePlan,
    ) -> Result<u64, SyncError> {
        self.merge_calls += 1;

        let mut seen = HashSet::with_capacity(records.len());
        if let Some(dup) = records.iter().find(|r| !seen.insert(r.object_id)) {
            return Err(SyncError::Persistence(format!(
                "object {} appears twice in one batch",
                dup.object_id
            )));
        }

        // The duplicate check above is the only way a batch can fail, so rows
        // are merged in place.
        let mut affected = 0u64;
        for incoming in records {
            match self.rows.get_mut(&incoming.object_id) {
                None => {
                    self.rows.insert(incoming.object_id, incoming.clone());
                    affected += 1;
                }
                Some(existing) if plan.should_update(existing, incoming) => {
                    plan.apply(existing, incoming);
                    affected += 1;
                }
                Some(_) => {}
            }
        }
        Ok(affected)
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        self.close_calls += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stamp(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 1, 3, minute, 0).single().unwrap()
    }

    fn record(id: i64, capital: f64, minute: u32) -> PropertyRecord {
        PropertyRecord {
            capital_value: Some(capital),
            physical_address: Some(format!("{id} Ward Street")),
            ..PropertyRecord::bare(id, stamp(minute))
        }
    }

    #[test]
    fn table_names_must_be_plain_identifiers() {
        assert!(validate_table_name("properties").is_ok());
        assert!(validate_table_name("_props_2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("2props").is_err());
        assert!(validate_table_name("props; DROP TABLE x").is_err());
        assert!(validate_table_name("Properties").is_err());
        assert!(validate_table_name(&"p".repeat(64)).is_err());
    }

    #[test]
    fn upsert_statement_follows_the_plan() {
        let sql = upsert_sql("properties", &MergePlan::default(), TARGET_SRID);
        assert!(sql.starts_with("INSERT INTO properties (object_id, property_no,"));
        assert!(sql.contains("ST_GeomFromText(geometry_wkt, 2193)"));
        assert!(sql.contains(
            "ON CONFLICT (object_id) DO UPDATE SET physical_address = EXCLUDED.physical_address"
        ));
        assert!(sql.contains("geom = EXCLUDED.geom"));
        assert!(!sql.contains("property_no = EXCLUDED.property_no"));
        assert!(sql.ends_with(
            "WHERE properties.capital_value IS DISTINCT FROM EXCLUDED.capital_value \
             OR properties.physical_address IS DISTINCT FROM EXCLUDED.physical_address"
        ));
    }

    #[test]
    fn dropping_a_table_cascades_to_dependents() {
        assert_eq!(
            drop_table_sql("properties"),
            "DROP TABLE IF EXISTS properties CASCADE"
        );
    }

    #[test]
    fn staging_load_binds_one_array_per_column() {
        let sql = staging_insert_sql();
        assert!(sql.contains("$17::text[]"));
        assert!(!sql.contains("$18"));
    }

    #[tokio::test]
    async fn remerging_an_unchanged_batch_touches_nothing() {
        let mut store = MemoryPropertyStore::new();
        let plan = MergePlan::default();
        let first = vec![record(1, 100.0, 0), record(2, 200.0, 0)];
        let again = vec![record(1, 100.0, 5), record(2, 200.0, 5)];

        assert_eq!(store.merge_batch(&first, &plan).await.unwrap(), 2);
        assert_eq!(store.merge_batch(&again, &plan).await.unwrap(), 0);
        assert_eq!(store.get(1).unwrap().last_updated, stamp(0));
    }

    #[tokio::test]
    async fn changed_capital_value_rewrites_the_row() {
        let mut store = MemoryPropertyStore::new();
        let plan = MergePlan::default();
        store
            .merge_batch(&[record(1, 100.0, 0)], &plan)
            .await
            .unwrap();

        let affected = store
            .merge_batch(&[record(1, 150.0, 5), record(3, 10.0, 5)], &plan)
            .await
            .unwrap();

        assert_eq!(affected, 2);
        let row = store.get(1).unwrap();
        assert_eq!(row.capital_value, Some(150.0));
        assert_eq!(row.last_updated, stamp(5));
    }

    #[tokio::test]
    async fn duplicate_ids_fail_the_whole_batch() {
        let mut store = MemoryPropertyStore::new();
        let plan = MergePlan::default();
        let err = store
            .merge_batch(&[record(1, 1.0, 0), record(2, 1.0, 0), record(1, 2.0, 0)], &plan)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "persistence");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn rejected_batch_keeps_rows_from_earlier_batches() {
        let mut store = MemoryPropertyStore::new();
        let plan = MergePlan::default();
        store
            .merge_batch(&[record(1, 100.0, 0), record(2, 200.0, 0)], &plan)
            .await
            .unwrap();

        let err = store
            .merge_batch(&[record(1, 999.0, 5), record(3, 1.0, 5), record(3, 2.0, 5)], &plan)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "persistence");
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(1).unwrap().capital_value, Some(100.0));
        assert!(store.get(3).is_none());
    }

    #[tokio::test]
    async fn many_batches_accumulate_in_one_store() {
        let mut store = MemoryPropertyStore::new();
        let plan = MergePlan::default();
        let mut affected = 0;
        for page in 0..50i64 {
            let batch: Vec<_> = (0..20)
                .map(|i| record(page * 20 + i, (page * 20 + i) as f64, 0))
                .collect();
            affected += store.merge_batch(&batch, &plan).await.unwrap();
        }
        let rerun = store
            .merge_batch(&[record(0, 0.0, 9), record(999, 999.0, 9)], &plan)
            .await
            .unwrap();

        assert_eq!(affected, 1000);
        assert_eq!(rerun, 0);
        assert_eq!(store.len(), 1000);
        assert_eq!(store.merge_calls(), 51);
    }
}
