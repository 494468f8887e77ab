//! Per-source sync state machine.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use parcelsync_adapters::{normalize, FeatureSource, RawFeature, RecordIssue, SourceProfile};
use parcelsync_core::{PropertyRecord, RunState, SyncError};
use serde::{Serialize, Serializer};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::store::PropertyStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounters {
    pub total_expected: u64,
    pub processed: u64,
    pub upserted: u64,
    pub skipped: u64,
    pub degraded: u64,
    pub duplicates: u64,
    pub pages: u64,
}

/// Outcome of one source run.
#[derive(Debug, Serialize)]
pub struct SourceSyncReport {
    pub source_id: String,
    pub state: RunState,
    #[serde(flatten)]
    pub counters: SyncCounters,
    pub elapsed_ms: u64,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<SyncError>,
}

fn serialize_error<S: Serializer>(error: &Option<SyncError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(err) => s.serialize_some(&serde_json::json!({
            "kind": err.kind(),
            "message": err.to_string(),
        })),
        None => s.serialize_none(),
    }
}

impl SourceSyncReport {
    pub fn failed(source_id: &str, error: SyncError) -> Self {
        Self {
            source_id: source_id.to_string(),
            state: RunState::Failed,
            counters: SyncCounters::default(),
            elapsed_ms: 0,
            error: Some(error),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Done
    }

    /// One-line human summary.
    pub fn summary_line(&self) -> String {
        let c = &self.counters;
        let mut line = format!(
            "{}: {} processed={}/{} upserted={} skipped={} degraded={} pages={} elapsed={}ms",
            self.source_id,
            self.state,
            c.processed,
            c.total_expected,
            c.upserted,
            c.skipped,
            c.degraded,
            c.pages,
            self.elapsed_ms
        );
        if let Some(err) = &self.error {
            line.push_str(&format!(" error={err}"));
        }
        line
    }
}

enum Phase {
    Idle,
    CountFetched,
    Paging { offset: u64 },
    Draining(Vec<RawFeature>),
    Done,
    Failed(SyncError),
}

impl Phase {
    fn run_state(&self) -> RunState {
        match self {
            Phase::Idle => RunState::Idle,
            Phase::CountFetched => RunState::CountFetched,
            Phase::Paging { .. } => RunState::Paging,
            Phase::Draining(_) => RunState::Draining,
            Phase::Done => RunState::Done,
            Phase::Failed(_) => RunState::Failed,
        }
    }
}

/// Drives one source profile through count, paging and merge.
pub struct SyncEngine<'a> {
    source: &'a dyn FeatureSource,
    run_id: Uuid,
}

impl<'a> SyncEngine<'a> {
    pub fn new(source: &'a dyn FeatureSource, run_id: Uuid) -> Self {
        Self { source, run_id }
    }

    /// Runs `profile` to completion. The store is closed on every exit path;
    /// failures end up in the report, never as an `Err`.
    pub async fn run(
        &self,
        profile: &SourceProfile,
        store: &mut dyn PropertyStore,
    ) -> SourceSyncReport {
        let span = info_span!("source_sync", run_id = %self.run_id, source_id = %profile.source_id);
        self.run_inner(profile, store).instrument(span).await
    }

    async fn run_inner(
        &self,
        profile: &SourceProfile,
        store: &mut dyn PropertyStore,
    ) -> SourceSyncReport {
        let started = Instant::now();
        let mut counters = SyncCounters::default();
        let mut phase = Phase::Idle;

        while !matches!(phase, Phase::Done | Phase::Failed(_)) {
            debug!(state = %phase.run_state(), "state");
            phase = match phase {
                Phase::Idle => match self.source.count(profile).await {
                    Ok(0) => {
                        info!("source reports no features");
                        Phase::Done
                    }
                    Ok(total) => {
                        info!(total, "feature count fetched");
                        counters.total_expected = total;
                        Phase::CountFetched
                    }
                    Err(err) => Phase::Failed(err),
                },
                Phase::CountFetched => Phase::Paging { offset: 0 },
                Phase::Paging { offset } => match self.source.fetch_page(profile, offset).await {
                    Err(err) => Phase::Failed(err),
                    Ok(page) if page.features.is_empty() => Phase::Done,
                    Ok(page) if !page.more_available => Phase::Draining(page.features),
                    Ok(page) => {
                        let returned = page.features.len() as u64;
                        let merged = self
                            .merge_page(profile, &page.features, store, &mut counters)
                            .await;
                        match merged {
                            Ok(()) => {
                                pace(profile).await;
                                Phase::Paging {
                                    offset: offset + returned,
                                }
                            }
                            Err(err) => Phase::Failed(err),
                        }
                    }
                },
                Phase::Draining(features) => {
                    match self.merge_page(profile, &features, store, &mut counters).await {
                        Ok(()) => Phase::Done,
                        Err(err) => Phase::Failed(err),
                    }
                }
                terminal => terminal,
            };
        }

        let mut error = match phase {
            Phase::Failed(err) => Some(err),
            _ => None,
        };
        if let Err(close_err) = store.close().await {
            warn!(error = %close_err, "closing store failed");
            error.get_or_insert(close_err);
        }

        let report = SourceSyncReport {
            source_id: profile.source_id.clone(),
            state: if error.is_some() {
                RunState::Failed
            } else {
                RunState::Done
            },
            counters,
            elapsed_ms: started.elapsed().as_millis() as u64,
            error,
        };
        match &report.error {
            Some(err) => error!(kind = err.kind(), error = %err, "source sync failed"),
            None => info!(
                processed = report.counters.processed,
                upserted = report.counters.upserted,
                skipped = report.counters.skipped,
                "source sync complete"
            ),
        }
        report
    }

    async fn merge_page(
        &self,
        profile: &SourceProfile,
        features: &[RawFeature],
        store: &mut dyn PropertyStore,
        counters: &mut SyncCounters,
    ) -> Result<(), SyncError> {
        let now = Utc::now();
        let mut records: Vec<PropertyRecord> = Vec::with_capacity(features.len());
        let mut positions: HashMap<i64, usize> = HashMap::with_capacity(features.len());
        let mut skipped = 0u64;

        for feature in features {
            let normalized = normalize(feature, profile, now);
            counters.degraded += normalized.degraded_fields() as u64;
            for issue in &normalized.issues {
                match issue {
                    RecordIssue::RecordSkipped { reason } => debug!(%reason, "record skipped"),
                    degraded => debug!(issue = %degraded, "field degraded"),
                }
            }
            let Some(record) = normalized.record else {
                skipped += 1;
                continue;
            };
            match positions.get(&record.object_id) {
                Some(&at) => {
                    warn!(
                        object_id = record.object_id,
                        "duplicate object id in page; keeping the later one"
                    );
                    counters.duplicates += 1;
                    records[at] = record;
                }
                None => {
                    positions.insert(record.object_id, records.len());
                    records.push(record);
                }
            }
        }

        if skipped > 0 {
            warn!(skipped, "records without a usable identifier were skipped");
        }

        let upserted = if records.is_empty() {
            0
        } else {
            store.merge_batch(&records, &profile.merge).await?
        };

        counters.pages += 1;
        counters.processed += features.len() as u64;
        counters.skipped += skipped;
        counters.upserted += upserted;

        let percent = if counters.total_expected > 0 {
            counters.processed as f64 * 100.0 / counters.total_expected as f64
        } else {
            0.0
        };
        info!(
            page = counters.pages,
            processed = counters.processed,
            total = counters.total_expected,
            percent = %format!("{percent:.1}"),
            upserted,
            "page merged"
        );
        Ok(())
    }
}

/// Sleeps the profile's pause between page requests.
async fn pace(profile: &SourceProfile) {
    if profile.pacing_ms > 0 {
        tokio::time::sleep(Duration::from_millis(profile.pacing_ms)).await;
    }
}
