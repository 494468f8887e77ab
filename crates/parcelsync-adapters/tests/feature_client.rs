use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use chrono::{TimeZone, Utc};
use parcelsync_adapters::{
    builtin_profiles, normalize, FeatureServiceClient, FeatureSource, PageSignal, RecordIssue,
    SourceProfile,
};
use parcelsync_core::SyncError;
use parcelsync_storage::{HttpClientConfig, HttpFetcher};
use serde_json::{json, Value};

type Seen = Arc<Mutex<Vec<HashMap<String, String>>>>;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

type Params = Query<HashMap<String, String>>;

fn square() -> Value {
    json!({"rings": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]})
}

/// Answers count queries with 3 and page queries with the page at `resultOffset`.
fn arcgis_app(seen: Seen) -> Router {
    let handler = |State(seen): State<Seen>, Query(params): Params| async move {
        seen.lock().unwrap().push(params.clone());
        if params.get("returnCountOnly").map(String::as_str) == Some("true") {
            return json!({"count": 3}).to_string();
        }
        match params.get("resultOffset").map(String::as_str) {
            Some("0") => json!({
                "exceededTransferLimit": true,
                "features": [
                    {"attributes": {"OBJECTID": 1, "LCV": 100}, "geometry": square()},
                    {"attributes": {"OBJECTID": 2, "LCV": 200}}
                ]
            })
            .to_string(),
            _ => json!({"features": [{"attributes": {"OBJECTID": 3}}]}).to_string(),
        }
    };
    Router::new()
        .route("/query", get(handler))
        .with_state(seen)
}

/// Serves one fixed page body for every query.
async fn serve_page(body: Value) -> String {
    let app = Router::new().route("/query", get(move || async move { body.to_string() }));
    serve(app).await
}

fn profile_for(base: &str, signal: PageSignal) -> SourceProfile {
    let mut profile = builtin_profiles()
        .into_iter()
        .find(|p| p.source_id == "auckland")
        .expect("auckland");
    profile.query_url = format!("{base}/query");
    profile.page_size = 2;
    profile.page_signal = signal;
    profile
}

fn client() -> FeatureServiceClient {
    FeatureServiceClient::new(HttpFetcher::new(HttpClientConfig::default()).expect("fetcher"))
}

#[tokio::test]
async fn count_and_pages_use_the_query_protocol() {
    let seen: Seen = Arc::default();
    let base = serve(arcgis_app(seen.clone())).await;
    let profile = profile_for(&base, PageSignal::TransferLimitFlag);
    let client = client();

    assert_eq!(client.count(&profile).await.expect("count"), 3);
    let first = client.fetch_page(&profile, 0).await.expect("page 1");
    let second = client.fetch_page(&profile, 2).await.expect("page 2");

    assert_eq!(first.features.len(), 2);
    assert!(first.more_available);
    assert_eq!(first.features[0].geometry.as_ref().map(|g| g.rings.len()), Some(1));
    assert_eq!(second.features.len(), 1);
    assert!(!second.more_available);

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].get("where").map(String::as_str), Some("LCV > 0"));
    assert_eq!(seen[0].get("f").map(String::as_str), Some("json"));
    let page = &seen[1];
    assert_eq!(page.get("returnGeometry").map(String::as_str), Some("true"));
    assert_eq!(page.get("outSR").map(String::as_str), Some("2193"));
    assert_eq!(page.get("resultRecordCount").map(String::as_str), Some("2"));
    assert!(page
        .get("outFields")
        .is_some_and(|f| f.starts_with("OBJECTID,RATESASSESSMENTNUM")));
}

#[tokio::test]
async fn empty_page_signal_keeps_asking_after_short_pages() {
    let base = serve(arcgis_app(Seen::default())).await;
    let profile = profile_for(&base, PageSignal::EmptyPage);

    let short = client().fetch_page(&profile, 2).await.expect("page");
    assert!(short.more_available);
}

#[tokio::test]
async fn service_error_body_is_upstream_unavailable() {
    let app = Router::new().route(
        "/query",
        get(|| async {
            json!({"error": {"code": 498, "message": "Invalid token.", "details": []}}).to_string()
        }),
    );
    let base = serve(app).await;
    let profile = profile_for(&base, PageSignal::ShortPage);

    let err = client().count(&profile).await.expect_err("service error");
    assert!(matches!(err, SyncError::UpstreamUnavailable(ref msg) if msg.contains("498")));
}

#[tokio::test]
async fn unexpected_bodies_are_protocol_errors() {
    let app = Router::new().route(
        "/query",
        get(|Query(params): Query<HashMap<String, String>>| async move {
            if params.contains_key("returnCountOnly") {
                "<html>maintenance</html>".to_string()
            } else {
                json!({"objectIdFieldName": "OBJECTID"}).to_string()
            }
        }),
    );
    let base = serve(app).await;
    let profile = profile_for(&base, PageSignal::ShortPage);
    let client = client();

    assert!(matches!(
        client.count(&profile).await,
        Err(SyncError::UpstreamProtocol(_))
    ));
    assert!(matches!(
        client.fetch_page(&profile, 0).await,
        Err(SyncError::UpstreamProtocol(_))
    ));
}

#[tokio::test]
async fn server_failure_is_upstream_unavailable() {
    let app = Router::new().route(
        "/query",
        get(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }),
    );
    let base = serve(app).await;
    let profile = profile_for(&base, PageSignal::ShortPage);

    assert!(matches!(
        client().fetch_page(&profile, 0).await,
        Err(SyncError::UpstreamUnavailable(_))
    ));
}

#[tokio::test]
async fn one_malformed_feature_does_not_cost_the_page() {
    let good = json!({"attributes": {"OBJECTID": 1, "LCV": 100}, "geometry": square()});
    let malformed = [
        json!({
            "attributes": {"OBJECTID": 2, "LCV": 200},
            "geometry": {"rings": [[[0.0, 0.0], [1.0, null], [1.0, 1.0], [0.0, 0.0]]]}
        }),
        json!({"attributes": {"OBJECTID": 2, "LCV": 200}, "geometry": {"rings": null}}),
        json!({"attributes": null, "geometry": square()}),
    ];
    let now = Utc.with_ymd_and_hms(2025, 7, 1, 3, 0, 0).single().unwrap();

    for bad in malformed {
        let base = serve_page(json!({"features": [good.clone(), bad.clone()]})).await;
        let profile = profile_for(&base, PageSignal::ShortPage);

        let page = client()
            .fetch_page(&profile, 0)
            .await
            .unwrap_or_else(|err| panic!("page with {bad} failed: {err}"));

        assert_eq!(page.features.len(), 2, "{bad}");
        let kept = normalize(&page.features[0], &profile, now);
        let record = kept.record.expect("good feature normalizes");
        assert_eq!(record.object_id, 1);
        assert_eq!(
            record.geometry_wkt.as_deref(),
            Some("POLYGON((0 0, 1 0, 1 1, 0 0))")
        );
        assert!(kept.issues.is_empty());

        let other = normalize(&page.features[1], &profile, now);
        match other.record {
            Some(record) => {
                assert_eq!(record.object_id, 2);
                assert_eq!(record.capital_value, Some(200.0));
                assert_eq!(record.geometry_wkt, None);
                assert!(matches!(
                    other.issues.as_slice(),
                    [RecordIssue::FieldDegraded { field: "geometry", .. }]
                ));
            }
            None => assert!(matches!(
                other.issues.as_slice(),
                [RecordIssue::RecordSkipped { .. }]
            )),
        }
    }
}

#[tokio::test]
async fn non_array_features_are_a_protocol_error() {
    let base = serve_page(json!({"features": {"OBJECTID": 1}})).await;
    let profile = profile_for(&base, PageSignal::ShortPage);

    assert!(matches!(
        client().fetch_page(&profile, 0).await,
        Err(SyncError::UpstreamProtocol(msg)) if msg.contains("not an array")
    ));
}

#[test]
fn profiles_load_from_yaml() {
    let yaml = r#"
source_id: nelson
display_name: Nelson City Council
query_url: https://example.org/arcgis/rest/services/Parcels/FeatureServer/0/query
filter: "CAPITAL_VALUE > 0"
page_signal: empty_page
address: multiline
date_format: "%Y-%m-%d"
fields:
  object_id: FID
  physical_address: ADDRESS
  capital_value: CAPITAL_VALUE
merge:
  update_columns: [capital_value, last_updated]
  change_columns: [capital_value]
"#;
    let profile: SourceProfile = serde_yaml::from_str(yaml).expect("profile");
    assert_eq!(profile.fields.object_id, "FID");
    assert_eq!(profile.page_size, 1000);
    assert_eq!(profile.page_signal, PageSignal::EmptyPage);
    assert!(profile.enabled);
    assert!(profile.validate(parcelsync_core::TARGET_SRID).is_ok());
    assert_eq!(profile.fields.out_fields(), vec!["FID", "ADDRESS", "CAPITAL_VALUE"]);
}
