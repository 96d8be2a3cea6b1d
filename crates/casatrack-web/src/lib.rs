//! JSON API over the canonical listing store.
//!
//! Read-only: the fold pipeline owns all writes, the API re-reads the
//! persisted state file on every request. Listing rows are flattened from
//! the canonical model (status and days-live are derived fields, member
//! detail rides along for per-portal drill-down).

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use casatrack_core::{CanonicalListing, ListingStatus, Member, MemberState};
use casatrack_storage::CanonicalStore;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "casatrack-web";

#[derive(Clone)]
pub struct AppState {
    pub state_path: PathBuf,
}

impl AppState {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
        }
    }
}

/// One canonical listing as served over the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebListing {
    pub id: Uuid,
    pub status: String,
    pub title: Option<String>,
    pub price: Option<i64>,
    pub surface_sqm: Option<u32>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub rooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub portals: Vec<String>,
    pub first_seen: NaiveDate,
    pub last_seen: NaiveDate,
    pub is_sold: bool,
    pub days_live: Option<i64>,
    pub members: Vec<WebMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebMember {
    pub portal: String,
    pub native_id: String,
    pub url: Option<String>,
    pub state: String,
    pub missed_snapshots: u32,
    pub first_seen: NaiveDate,
    pub last_seen: NaiveDate,
}

impl WebListing {
    fn from_canonical(listing: &CanonicalListing) -> Self {
        let status = listing.status();
        Self {
            id: listing.id,
            status: status.as_str().to_string(),
            title: listing.attributes.title.clone(),
            price: listing.attributes.price,
            surface_sqm: listing.attributes.surface_sqm,
            latitude: listing.attributes.coords.map(|c| c.lat),
            longitude: listing.attributes.coords.map(|c| c.lon),
            rooms: listing.attributes.rooms,
            bathrooms: listing.attributes.bathrooms,
            portals: {
                let portals: std::collections::BTreeSet<String> =
                    listing.members.iter().map(|m| m.portal.clone()).collect();
                portals.into_iter().collect()
            },
            first_seen: listing.first_seen,
            last_seen: listing.last_confirmed_presence(),
            is_sold: status == ListingStatus::Sold,
            days_live: listing.days_live,
            members: listing.members.iter().map(WebMember::from_member).collect(),
        }
    }
}

impl WebMember {
    fn from_member(member: &Member) -> Self {
        let (state, missed_snapshots) = match member.state {
            MemberState::New => ("new", 0),
            MemberState::Active => ("active", 0),
            MemberState::PendingVanish { missed } => ("pending_vanish", missed),
            MemberState::Vanished => ("vanished", 0),
        };
        Self {
            portal: member.portal.clone(),
            native_id: member.native_id.clone(),
            url: member.url.clone(),
            state: state.to_string(),
            missed_snapshots,
            first_seen: member.first_seen,
            last_seen: member.last_seen,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ListingsQuery {
    status: Option<String>,
    portal: Option<String>,
    /// Sold listings are hidden unless asked for: the common consumer is a
    /// live-market view.
    include_sold: Option<bool>,
    sold_only: Option<bool>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListingsResponse {
    pub total: usize,
    pub page: usize,
    pub total_pages: usize,
    pub listings: Vec<WebListing>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub listings_total: usize,
    pub active: usize,
    pub sold: usize,
    pub removed_by_portal: usize,
    pub portals: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/listings", get(listings_handler))
        .route("/api/listings/{id}", get(listing_detail_handler))
        .route("/api/lookup/{portal}/{native_id}", get(lookup_handler))
        .route("/api/stats", get(stats_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("CASATRACK_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state_path = std::env::var("CASATRACK_STATE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data/state/canonical.json"));
    let state = AppState::new(state_path);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving listing API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn listings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListingsQuery>,
) -> Response {
    let store = match CanonicalStore::load_or_default(&state.state_path).await {
        Ok(store) => store,
        Err(err) => return server_error(err),
    };

    let status_filter = match query.status.as_deref() {
        Some(raw) => match ListingStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                return bad_request(format!(
                    "unknown status {raw:?}, expected active, sold or removed_by_portal"
                ))
            }
        },
        None => None,
    };

    let mut rows: Vec<WebListing> = store
        .iter()
        .filter(|listing| {
            let status = listing.status();
            if let Some(wanted) = status_filter {
                return status == wanted;
            }
            if query.sold_only.unwrap_or(false) {
                return status == ListingStatus::Sold;
            }
            if status == ListingStatus::Sold {
                return query.include_sold.unwrap_or(false);
            }
            true
        })
        .filter(|listing| match &query.portal {
            Some(portal) => listing.members.iter().any(|m| &m.portal == portal),
            None => true,
        })
        .map(WebListing::from_canonical)
        .collect();
    // Sold views order by the inferred sale date (last confirmed presence),
    // most recent sales first; live views order by listing age.
    if query.sold_only.unwrap_or(false) || status_filter == Some(ListingStatus::Sold) {
        rows.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.id.cmp(&b.id)));
    } else {
        rows.sort_by(|a, b| b.first_seen.cmp(&a.first_seen).then(a.id.cmp(&b.id)));
    }

    let total = rows.len();
    let per_page = query.per_page.unwrap_or(100).max(1);
    let total_pages = total.max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let listings = rows
        .into_iter()
        .skip((page - 1) * per_page)
        .take(per_page)
        .collect();

    Json(ListingsResponse {
        total,
        page,
        total_pages,
        listings,
    })
    .into_response()
}

async fn listing_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let Ok(id) = id.parse::<Uuid>() else {
        return bad_request(format!("{id:?} is not a listing id"));
    };
    let store = match CanonicalStore::load_or_default(&state.state_path).await {
        Ok(store) => store,
        Err(err) => return server_error(err),
    };
    match store.get(id) {
        Some(listing) => Json(WebListing::from_canonical(listing)).into_response(),
        None => not_found(format!("no listing {id}")),
    }
}

async fn lookup_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((portal, native_id)): AxumPath<(String, String)>,
) -> Response {
    let store = match CanonicalStore::load_or_default(&state.state_path).await {
        Ok(store) => store,
        Err(err) => return server_error(err),
    };
    let listing = store
        .lookup_by_portal_id(&portal, &native_id)
        .and_then(|id| store.get(id));
    match listing {
        Some(listing) => Json(WebListing::from_canonical(listing)).into_response(),
        None => not_found(format!("no listing tracked for {portal}:{native_id}")),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    let store = match CanonicalStore::load_or_default(&state.state_path).await {
        Ok(store) => store,
        Err(err) => return server_error(err),
    };
    let counts = store.counts_by_status();
    let portals: Vec<String> = store
        .state()
        .ledgers
        .keys()
        .cloned()
        .collect();
    Json(StatsResponse {
        listings_total: store.len(),
        active: counts.get(&ListingStatus::Active).copied().unwrap_or(0),
        sold: counts.get(&ListingStatus::Sold).copied().unwrap_or(0),
        removed_by_portal: counts
            .get(&ListingStatus::RemovedByPortal)
            .copied()
            .unwrap_or(0),
        portals,
    })
    .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { error: message })).into_response()
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorBody { error: message })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use casatrack_core::NormalizedListing;
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn listing(portal: &str, native_id: &str, price: i64) -> NormalizedListing {
        NormalizedListing {
            portal: portal.to_string(),
            native_id: native_id.to_string(),
            url: Some(format!("https://{portal}.example/{native_id}")),
            title: Some(format!("Listing {native_id}")),
            price: Some(price),
            surface_sqm: Some(80),
            coords: Some(casatrack_core::GeoPoint {
                lat: 44.5,
                lon: 11.34,
            }),
            rooms: Some(3),
            bathrooms: Some(1),
            features: vec![],
        }
    }

    async fn seeded_state(dir: &std::path::Path) -> PathBuf {
        let mut store = CanonicalStore::new();

        // One active listing.
        store.upsert(CanonicalListing::new(
            &listing("immobiliare", "1", 300_000),
            "2026-01-01".parse().unwrap(),
        ));

        // One sold listing: confirmed in a later snapshot, then vanished.
        let mut sold = CanonicalListing::new(
            &listing("idealista", "9", 450_000),
            "2026-01-01".parse().unwrap(),
        );
        sold.members[0].last_seen = "2026-01-08".parse().unwrap();
        sold.members[0].reached_active = true;
        sold.members[0].state = MemberState::Vanished;
        sold.recompute_days_live();
        store.upsert(sold);

        store.commit_snapshot(
            "immobiliare",
            "2026-01-01".parse().unwrap(),
            ["1".to_string()].into(),
        );

        let path = dir.join("canonical.json");
        store.persist(&path).await.unwrap();
        path
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap();
        (status, value)
    }

    #[tokio::test]
    async fn listings_hide_sold_by_default() {
        let dir = tempdir().unwrap();
        let state = AppState::new(seeded_state(dir.path()).await);

        let (status, body) = get_json(app(state.clone()), "/api/listings").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["listings"][0]["status"], "active");

        let (_, with_sold) =
            get_json(app(state.clone()), "/api/listings?include_sold=true").await;
        assert_eq!(with_sold["total"], 2);

        let (_, sold_only) = get_json(app(state), "/api/listings?sold_only=true").await;
        assert_eq!(sold_only["total"], 1);
        assert_eq!(sold_only["listings"][0]["is_sold"], true);
        assert_eq!(sold_only["listings"][0]["days_live"], 7);
    }

    #[tokio::test]
    async fn listings_filter_by_status_and_portal() {
        let dir = tempdir().unwrap();
        let state = AppState::new(seeded_state(dir.path()).await);

        let (status, body) = get_json(app(state.clone()), "/api/listings?status=sold").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);

        let (_, by_portal) =
            get_json(app(state.clone()), "/api/listings?portal=immobiliare").await;
        assert_eq!(by_portal["total"], 1);
        assert_eq!(by_portal["listings"][0]["portals"][0], "immobiliare");

        let (bad, _) = get_json(app(state), "/api/listings?status=gone").await;
        assert_eq!(bad, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn detail_and_lookup_resolve_the_same_listing() {
        let dir = tempdir().unwrap();
        let state = AppState::new(seeded_state(dir.path()).await);

        let (status, found) =
            get_json(app(state.clone()), "/api/lookup/immobiliare/1").await;
        assert_eq!(status, StatusCode::OK);
        let id = found["id"].as_str().unwrap().to_string();

        let (status, detail) = get_json(app(state.clone()), &format!("/api/listings/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["id"], found["id"]);
        assert_eq!(detail["members"][0]["state"], "new");

        let (missing, _) = get_json(app(state.clone()), "/api/lookup/immobiliare/404").await;
        assert_eq!(missing, StatusCode::NOT_FOUND);

        let (bad, _) = get_json(app(state), "/api/listings/not-a-uuid").await;
        assert_eq!(bad, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stats_report_derived_counts_and_portals() {
        let dir = tempdir().unwrap();
        let state = AppState::new(seeded_state(dir.path()).await);

        let (status, body) = get_json(app(state), "/api/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["listings_total"], 2);
        assert_eq!(body["active"], 1);
        assert_eq!(body["sold"], 1);
        assert_eq!(body["removed_by_portal"], 0);
        assert_eq!(body["portals"][0], "immobiliare");
    }

    #[tokio::test]
    async fn missing_state_file_serves_an_empty_market() {
        let dir = tempdir().unwrap();
        let state = AppState::new(dir.path().join("nope.json"));

        let (status, body) = get_json(app(state), "/api/listings").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 0);
    }
}
