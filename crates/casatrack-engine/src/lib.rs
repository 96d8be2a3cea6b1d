//! The cross-portal matching and lifecycle-inference engine.
//!
//! Snapshots are folded strictly in chronological order per portal. Each
//! batch runs a presence pass (refresh tracked members, match-or-create the
//! rest against live canonicals on other portals) and an absence pass
//! (advance the debounced vanish state machine for members missing from the
//! snapshot), then commits the snapshot to the portal ledger. Every step is
//! a deterministic function of (previous canonical state, next snapshot),
//! so a replayed batch no-ops and a crashed run resumes from the last
//! persisted state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray, UInt32Array,
};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use casatrack_core::{
    CanonicalListing, GeoPoint, ListingAttributes, ListingKey, ListingStatus, Member, MemberState,
    NormalizedListing,
};
use casatrack_ingest::{
    discover_snapshot_files, normalize, parse_snapshot_batch, PortalRegistry, SnapshotBatch,
};
use casatrack_storage::{CanonicalStore, SnapshotArchive, StoreError};
use chrono::{DateTime, NaiveDate, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "casatrack-engine";

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(
        "out-of-order snapshot for {portal}: {date} arrived after {last_processed} was already folded; sort input before folding"
    )]
    OutOfOrderSnapshot {
        portal: String,
        date: NaiveDate,
        last_processed: NaiveDate,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Great-circle distance in meters.
pub fn haversine_distance(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lon.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lon.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_METERS * c
}

/// The cross-portal same-unit predicate.
///
/// Deliberately strict: prices and surfaces must be known and exactly equal
/// (list prices are round numbers repeated verbatim across portals, and any
/// tolerance produces false merges), and both coordinate pairs must be known
/// and within `max_distance_meters`. Any unknown field on either side means
/// no match — a duplicate canonical listing is recoverable, a wrong merge is
/// not.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPolicy {
    pub max_distance_meters: f64,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            max_distance_meters: 100.0,
        }
    }
}

impl MatchPolicy {
    pub fn same_unit(&self, a: &ListingAttributes, b: &ListingAttributes) -> bool {
        let (Some(price_a), Some(price_b)) = (a.price, b.price) else {
            return false;
        };
        let (Some(surface_a), Some(surface_b)) = (a.surface_sqm, b.surface_sqm) else {
            return false;
        };
        let (Some(coords_a), Some(coords_b)) = (a.coords, b.coords) else {
            return false;
        };
        price_a == price_b
            && surface_a == surface_b
            && haversine_distance(coords_a, coords_b) <= self.max_distance_meters
    }
}

/// Partition of two adjacent same-portal snapshots' native-id sets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapshotDiff {
    pub new: BTreeSet<String>,
    pub persisting: BTreeSet<String>,
    pub vanished: BTreeSet<String>,
}

/// Pure set partition: new = current − previous, persisting = current ∩
/// previous, vanished = previous − current. Only meaningful for two
/// chronologically adjacent snapshots of the same portal.
pub fn diff(previous: &BTreeSet<String>, current: &BTreeSet<String>) -> SnapshotDiff {
    SnapshotDiff {
        new: current.difference(previous).cloned().collect(),
        persisting: current.intersection(previous).cloned().collect(),
        vanished: previous.difference(current).cloned().collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Consecutive missed snapshots before a member is declared vanished.
    /// The default of 2 absorbs a single missed scrape: one absence parks
    /// the member in pending-vanish, only a second consecutive absence
    /// commits it. A policy choice, not a logical necessity — revisit it if
    /// the scrape cadence turns irregular.
    pub vanish_after_misses: u32,
    pub match_policy: MatchPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            vanish_after_misses: 2,
            match_policy: MatchPolicy::default(),
        }
    }
}

/// What one folded batch did to the canonical store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub portal: String,
    pub date: NaiveDate,
    pub new_ids: usize,
    pub persisting_ids: usize,
    pub vanished_ids: usize,
    pub created_canonicals: usize,
    pub attached_members: usize,
    pub refreshed_members: usize,
    pub skipped_duplicate: bool,
}

impl BatchOutcome {
    fn skipped(portal: &str, date: NaiveDate) -> Self {
        Self {
            portal: portal.to_string(),
            date,
            new_ids: 0,
            persisting_ids: 0,
            vanished_ids: 0,
            created_canonicals: 0,
            attached_members: 0,
            refreshed_members: 0,
            skipped_duplicate: true,
        }
    }
}

/// Folds snapshot batches into the canonical store.
#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    config: EngineConfig,
}

impl MergeEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Fold one (portal, date) batch. Replays of an already committed
    /// snapshot no-op; anything older than the portal's last committed
    /// snapshot is rejected as an input-contract violation, never silently
    /// reordered — reordering would corrupt the vanish debounce.
    pub fn apply_batch(
        &self,
        store: &mut CanonicalStore,
        batch: &SnapshotBatch,
    ) -> Result<BatchOutcome, EngineError> {
        let portal = batch.portal.as_str();
        if store.is_processed(portal, batch.date) {
            info!(portal, date = %batch.date, "snapshot already folded, skipping replay");
            return Ok(BatchOutcome::skipped(portal, batch.date));
        }
        if let Some(last_processed) = store.last_processed(portal) {
            if batch.date < last_processed {
                return Err(EngineError::OutOfOrderSnapshot {
                    portal: portal.to_string(),
                    date: batch.date,
                    last_processed,
                });
            }
        }

        // Normalize, dropping same-batch repeats (portals repeat cards
        // across result pages).
        let mut current_ids = BTreeSet::new();
        let mut listings = Vec::new();
        for raw in &batch.listings {
            let normalized = normalize(raw);
            if current_ids.insert(normalized.native_id.clone()) {
                listings.push(normalized);
            }
        }

        let previous_ids = store.last_id_set(portal);
        let id_diff = diff(&previous_ids, &current_ids);
        let mut outcome = BatchOutcome {
            portal: portal.to_string(),
            date: batch.date,
            new_ids: id_diff.new.len(),
            persisting_ids: id_diff.persisting.len(),
            vanished_ids: id_diff.vanished.len(),
            created_canonicals: 0,
            attached_members: 0,
            refreshed_members: 0,
            skipped_duplicate: false,
        };

        // Presence pass. Candidate buckets are built once per batch; the
        // listings this batch creates are same-portal and thus never
        // candidates for its own records.
        let buckets = PriceBuckets::build(store);
        for listing in &listings {
            let tracked_live = store.lookup_by_portal_id(portal, &listing.native_id).filter(|id| {
                store
                    .get(*id)
                    .and_then(|c| c.member(&listing.key()))
                    .is_some_and(Member::is_live)
            });
            match tracked_live {
                Some(canonical_id) => {
                    self.refresh_member(store, canonical_id, listing, batch.date);
                    outcome.refreshed_members += 1;
                }
                None => match self.find_cross_portal_match(store, &buckets, listing) {
                    Some(canonical_id) => {
                        self.attach_member(store, canonical_id, listing, batch.date)?;
                        outcome.attached_members += 1;
                    }
                    None => {
                        store.upsert(CanonicalListing::new(listing, batch.date));
                        outcome.created_canonicals += 1;
                    }
                },
            }
        }

        // Absence pass: every live member on this portal missing from the
        // current id set takes one debounce step. This covers both fresh
        // disappearances (the diff's vanished set) and members already
        // pending, which dropped out of the diff baseline a snapshot ago.
        let absent: Vec<(Uuid, ListingKey)> = store
            .iter()
            .flat_map(|canonical| {
                canonical
                    .members
                    .iter()
                    .filter(|m| {
                        m.portal == portal && m.is_live() && !current_ids.contains(&m.native_id)
                    })
                    .map(move |m| (canonical.id, m.key()))
            })
            .collect();
        for (canonical_id, key) in absent {
            self.record_absence(store, canonical_id, &key);
        }

        store.commit_snapshot(portal, batch.date, current_ids);
        Ok(outcome)
    }

    fn refresh_member(
        &self,
        store: &mut CanonicalStore,
        canonical_id: Uuid,
        listing: &NormalizedListing,
        date: NaiveDate,
    ) {
        let Some(canonical) = store.get_mut(canonical_id) else {
            return;
        };
        if let Some(member) = canonical.member_mut(&listing.key()) {
            member.last_seen = date;
            member.state = MemberState::Active;
            member.reached_active = true;
            if listing.url.is_some() {
                member.url = listing.url.clone();
            }
            member.attributes.refresh_from(listing);
        }
        canonical.attributes.refresh_from(listing);
        canonical.recompute_days_live();
    }

    fn attach_member(
        &self,
        store: &mut CanonicalStore,
        canonical_id: Uuid,
        listing: &NormalizedListing,
        date: NaiveDate,
    ) -> Result<(), StoreError> {
        let member = Member {
            portal: listing.portal.clone(),
            native_id: listing.native_id.clone(),
            url: listing.url.clone(),
            first_seen: date,
            last_seen: date,
            state: MemberState::New,
            reached_active: false,
            attributes: ListingAttributes::from_listing(listing),
        };
        store.upsert_member(canonical_id, member)?;
        if let Some(canonical) = store.get_mut(canonical_id) {
            canonical.attributes.refresh_from(listing);
            canonical.recompute_days_live();
        }
        Ok(())
    }

    /// Find the one canonical listing this record may merge into.
    ///
    /// The incoming record must match every live member of the candidate —
    /// groups form only through full pairwise confirmation, never by
    /// chaining A-matches-B and B-matches-C into A-C. Vanished members are
    /// not candidates (a sold listing cannot newly match a fresh one), and a
    /// candidate with a live member on the incoming portal is excluded, as
    /// is one that ever tracked this exact key: a republished native id must
    /// start a fresh epoch, never overwrite its own terminal member record.
    /// More than one confirmed candidate is ambiguous: no merge.
    fn find_cross_portal_match(
        &self,
        store: &CanonicalStore,
        buckets: &PriceBuckets,
        listing: &NormalizedListing,
    ) -> Option<Uuid> {
        let price = listing.price?;
        listing.surface_sqm?;
        listing.coords?;
        let incoming = ListingAttributes::from_listing(listing);
        let incoming_key = listing.key();

        let mut confirmed: Option<Uuid> = None;
        for &canonical_id in buckets.candidates(price) {
            let Some(canonical) = store.get(canonical_id) else {
                continue;
            };
            if canonical.live_member_for_portal(&listing.portal).is_some() {
                continue;
            }
            if canonical.member(&incoming_key).is_some() {
                continue;
            }
            let mut live_members = canonical.live_members().peekable();
            if live_members.peek().is_none() {
                continue;
            }
            if !live_members.all(|m| self.config.match_policy.same_unit(&incoming, &m.attributes)) {
                continue;
            }
            match confirmed {
                None => confirmed = Some(canonical_id),
                Some(other) => {
                    warn!(
                        listing = %listing.key(),
                        first = %other,
                        second = %canonical_id,
                        "ambiguous cross-portal match, keeping listings separate"
                    );
                    return None;
                }
            }
        }
        confirmed
    }

    fn record_absence(&self, store: &mut CanonicalStore, canonical_id: Uuid, key: &ListingKey) {
        let Some(canonical) = store.get_mut(canonical_id) else {
            return;
        };
        let Some(member) = canonical.member_mut(key) else {
            return;
        };
        let missed = match member.state {
            MemberState::New | MemberState::Active => 1,
            MemberState::PendingVanish { missed } => missed + 1,
            MemberState::Vanished => return,
        };
        member.state = if missed >= self.config.vanish_after_misses {
            MemberState::Vanished
        } else {
            MemberState::PendingVanish { missed }
        };
        canonical.recompute_days_live();
    }
}

/// Per-batch candidate index: live members' known prices -> canonical ids.
/// An optimization only; the full predicate re-confirms every candidate.
struct PriceBuckets {
    by_price: HashMap<i64, Vec<Uuid>>,
}

impl PriceBuckets {
    fn build(store: &CanonicalStore) -> Self {
        let mut by_price: HashMap<i64, Vec<Uuid>> = HashMap::new();
        for canonical in store.iter() {
            for member in canonical.live_members() {
                if let Some(price) = member.attributes.price {
                    let bucket = by_price.entry(price).or_default();
                    if !bucket.contains(&canonical.id) {
                        bucket.push(canonical.id);
                    }
                }
            }
        }
        Self { by_price }
    }

    fn candidates(&self, price: i64) -> impl Iterator<Item = &Uuid> {
        self.by_price.get(&price).into_iter().flatten()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub snapshots_dir: PathBuf,
    pub state_path: PathBuf,
    pub archive_dir: PathBuf,
    pub export_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub portals_file: PathBuf,
    pub engine: EngineConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("CASATRACK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let mut engine = EngineConfig::default();
        if let Some(misses) = std::env::var("CASATRACK_VANISH_MISSES")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            engine.vanish_after_misses = misses;
        }
        if let Some(radius) = std::env::var("CASATRACK_MATCH_RADIUS_M")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            engine.match_policy.max_distance_meters = radius;
        }
        Self {
            portals_file: std::env::var("CASATRACK_PORTALS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./portals.yaml")),
            engine,
            ..Self::from_data_dir(data_dir)
        }
    }

    pub fn from_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            snapshots_dir: data_dir.join("snapshots"),
            state_path: data_dir.join("state").join("canonical.json"),
            archive_dir: data_dir.join("archive"),
            export_dir: data_dir.join("processed"),
            reports_dir: data_dir.join("reports"),
            portals_file: data_dir.join("portals.yaml"),
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FoldRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub batches_processed: usize,
    pub batches_skipped: usize,
    pub listings_total: usize,
    pub active: usize,
    pub sold: usize,
    pub removed_by_portal: usize,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// One batch-oriented fold over everything in the snapshot directory:
/// archive raw bytes, fold each batch chronologically, persist the store,
/// export the canonical table as parquet, write run reports.
pub struct Pipeline {
    config: PipelineConfig,
    archive: SnapshotArchive,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let archive = SnapshotArchive::new(config.archive_dir.clone());
        Self { config, archive }
    }

    pub async fn run_once(&self) -> Result<FoldRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let registry = match PortalRegistry::load(&self.config.portals_file) {
            Ok(registry) => Some(registry),
            Err(err) => {
                warn!(
                    path = %self.config.portals_file.display(),
                    %err,
                    "no portal registry, folding every discovered portal"
                );
                None
            }
        };

        let mut store = CanonicalStore::load_or_default(&self.config.state_path).await?;
        let files = discover_snapshot_files(&self.config.snapshots_dir)?;
        let engine = MergeEngine::new(self.config.engine.clone());

        let mut outcomes = Vec::new();
        let mut batches_processed = 0usize;
        let mut batches_skipped = 0usize;
        for file in &files {
            if let Some(registry) = &registry {
                if !registry.is_enabled(&file.portal) {
                    warn!(portal = %file.portal, "portal disabled in registry, skipping batch");
                    continue;
                }
            }
            let bytes = fs::read(&file.path)
                .await
                .with_context(|| format!("reading {}", file.path.display()))?;
            self.archive
                .store_bytes(file.date, &file.portal, &bytes)
                .await?;
            let batch = parse_snapshot_batch(file, &bytes)?;
            let outcome = engine.apply_batch(&mut store, &batch)?;
            if outcome.skipped_duplicate {
                batches_skipped += 1;
            } else {
                batches_processed += 1;
            }
            outcomes.push(outcome);
        }

        store.persist(&self.config.state_path).await?;
        let manifest_path = self.export_parquet(&store).await?;

        let counts = store.counts_by_status();
        let finished_at = Utc::now();
        let reports_dir = self
            .write_reports(run_id, started_at, finished_at, &outcomes, &store)
            .await?;

        Ok(FoldRunSummary {
            run_id,
            started_at,
            finished_at,
            batches_processed,
            batches_skipped,
            listings_total: store.len(),
            active: counts.get(&ListingStatus::Active).copied().unwrap_or(0),
            sold: counts.get(&ListingStatus::Sold).copied().unwrap_or(0),
            removed_by_portal: counts
                .get(&ListingStatus::RemovedByPortal)
                .copied()
                .unwrap_or(0),
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        })
    }

    async fn export_parquet(&self, store: &CanonicalStore) -> Result<PathBuf> {
        fs::create_dir_all(&self.config.export_dir)
            .await
            .with_context(|| format!("creating {}", self.config.export_dir.display()))?;

        let listings_path = self.config.export_dir.join("listings.parquet");
        let members_path = self.config.export_dir.join("members.parquet");
        write_listings_parquet(&listings_path, store)?;
        write_members_parquet(&members_path, store)?;

        let manifest = ParquetManifest {
            schema_version: 1,
            files: vec![
                manifest_entry("listings", &self.config.export_dir, &listings_path)?,
                manifest_entry("members", &self.config.export_dir, &members_path)?,
            ],
        };
        let manifest_path = self.config.export_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;
        Ok(manifest_path)
    }

    async fn write_reports(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcomes: &[BatchOutcome],
        store: &CanonicalStore,
    ) -> Result<PathBuf> {
        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let counts = store.counts_by_status();
        let mut per_portal: BTreeMap<String, usize> = BTreeMap::new();
        for outcome in outcomes.iter().filter(|o| !o.skipped_duplicate) {
            *per_portal.entry(outcome.portal.clone()).or_default() += 1;
        }

        let brief = format!(
            "# casatrack Fold Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Batches folded: {}\n- Canonical listings: {}\n- Active: {} / Sold: {} / Removed by portal: {}\n\n## Batches per portal\n{}\n",
            run_id,
            started_at,
            finished_at,
            outcomes.iter().filter(|o| !o.skipped_duplicate).count(),
            store.len(),
            counts.get(&ListingStatus::Active).copied().unwrap_or(0),
            counts.get(&ListingStatus::Sold).copied().unwrap_or(0),
            counts.get(&ListingStatus::RemovedByPortal).copied().unwrap_or(0),
            per_portal
                .iter()
                .map(|(portal, n)| format!("- {portal}: {n}"))
                .collect::<Vec<_>>()
                .join("\n")
        );
        fs::write(reports_dir.join("fold_brief.md"), brief)
            .await
            .context("writing fold_brief.md")?;

        let outcomes_json = serde_json::to_vec_pretty(&serde_json::json!({
            "run_id": run_id,
            "started_at": started_at,
            "finished_at": finished_at,
            "outcomes": outcomes,
        }))
        .context("serializing fold outcomes")?;
        fs::write(reports_dir.join("fold_outcomes.json"), outcomes_json)
            .await
            .context("writing fold_outcomes.json")?;

        Ok(reports_dir)
    }
}

/// Run one fold with environment-derived configuration.
pub async fn run_fold_once_from_env() -> Result<FoldRunSummary> {
    let pipeline = Pipeline::new(PipelineConfig::from_env());
    pipeline.run_once().await
}

/// Markdown digest of the most recent fold runs, for the CLI `report`
/// command.
pub fn report_recent_markdown(runs: usize, reports_root: impl AsRef<Path>) -> Result<String> {
    let reports_root = reports_root.as_ref();
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# casatrack Recent Folds".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let outcomes_path = dir.path().join("fold_outcomes.json");
        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&outcomes_path)
                .with_context(|| format!("reading {}", outcomes_path.display()))?,
        )
        .with_context(|| format!("parsing {}", outcomes_path.display()))?;
        let outcomes = value
            .get("outcomes")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let folded = outcomes
            .iter()
            .filter(|o| o.get("skipped_duplicate") == Some(&serde_json::Value::Bool(false)))
            .count();
        let created: u64 = outcomes
            .iter()
            .filter_map(|o| o.get("created_canonicals").and_then(|v| v.as_u64()))
            .sum();

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- batches folded: {folded}"));
        lines.push(format!("- canonical listings created: {created}"));
        lines.push(format!("- outcomes: `{}`", outcomes_path.display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

fn member_state_label(state: MemberState) -> &'static str {
    match state {
        MemberState::New => "new",
        MemberState::Active => "active",
        MemberState::PendingVanish { .. } => "pending_vanish",
        MemberState::Vanished => "vanished",
    }
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_listings_parquet(path: &Path, store: &CanonicalStore) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, true),
        ArrowField::new("price", DataType::Int64, true),
        ArrowField::new("surface_sqm", DataType::UInt32, true),
        ArrowField::new("latitude", DataType::Float64, true),
        ArrowField::new("longitude", DataType::Float64, true),
        ArrowField::new("rooms", DataType::UInt32, true),
        ArrowField::new("bathrooms", DataType::UInt32, true),
        ArrowField::new("portals", DataType::Utf8, false),
        ArrowField::new("first_seen", DataType::Utf8, false),
        ArrowField::new("last_seen", DataType::Utf8, false),
        ArrowField::new("is_sold", DataType::Boolean, false),
        ArrowField::new("days_live", DataType::Int64, true),
    ]));

    let rows: Vec<&CanonicalListing> = store.iter().collect();
    let ids = StringArray::from(rows.iter().map(|l| Some(l.id.to_string())).collect::<Vec<_>>());
    let statuses = StringArray::from(
        rows.iter()
            .map(|l| Some(l.status().as_str()))
            .collect::<Vec<_>>(),
    );
    let titles = StringArray::from(
        rows.iter()
            .map(|l| l.attributes.title.as_deref())
            .collect::<Vec<_>>(),
    );
    let prices = Int64Array::from(rows.iter().map(|l| l.attributes.price).collect::<Vec<_>>());
    let surfaces = UInt32Array::from(
        rows.iter()
            .map(|l| l.attributes.surface_sqm)
            .collect::<Vec<_>>(),
    );
    let latitudes = Float64Array::from(
        rows.iter()
            .map(|l| l.attributes.coords.map(|c| c.lat))
            .collect::<Vec<_>>(),
    );
    let longitudes = Float64Array::from(
        rows.iter()
            .map(|l| l.attributes.coords.map(|c| c.lon))
            .collect::<Vec<_>>(),
    );
    let rooms = UInt32Array::from(rows.iter().map(|l| l.attributes.rooms).collect::<Vec<_>>());
    let bathrooms = UInt32Array::from(
        rows.iter()
            .map(|l| l.attributes.bathrooms)
            .collect::<Vec<_>>(),
    );
    let portals = StringArray::from(
        rows.iter()
            .map(|l| {
                let names: BTreeSet<&str> =
                    l.members.iter().map(|m| m.portal.as_str()).collect();
                Some(names.into_iter().collect::<Vec<_>>().join(","))
            })
            .collect::<Vec<_>>(),
    );
    let first_seen = StringArray::from(
        rows.iter()
            .map(|l| Some(l.first_seen.to_string()))
            .collect::<Vec<_>>(),
    );
    let last_seen = StringArray::from(
        rows.iter()
            .map(|l| Some(l.last_confirmed_presence().to_string()))
            .collect::<Vec<_>>(),
    );
    let is_sold = BooleanArray::from(
        rows.iter()
            .map(|l| l.status() == ListingStatus::Sold)
            .collect::<Vec<_>>(),
    );
    let days_live = Int64Array::from(rows.iter().map(|l| l.days_live).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(statuses),
            Arc::new(titles),
            Arc::new(prices),
            Arc::new(surfaces),
            Arc::new(latitudes),
            Arc::new(longitudes),
            Arc::new(rooms),
            Arc::new(bathrooms),
            Arc::new(portals),
            Arc::new(first_seen),
            Arc::new(last_seen),
            Arc::new(is_sold),
            Arc::new(days_live),
        ],
    )
    .context("building listings record batch")?;
    write_parquet(path, batch)
}

fn write_members_parquet(path: &Path, store: &CanonicalStore) -> Result<()> {
    let rows: Vec<(Uuid, &Member)> = store
        .iter()
        .flat_map(|l| l.members.iter().map(move |m| (l.id, m)))
        .collect();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("canonical_id", DataType::Utf8, false),
        ArrowField::new("portal", DataType::Utf8, false),
        ArrowField::new("native_id", DataType::Utf8, false),
        ArrowField::new("state", DataType::Utf8, false),
        ArrowField::new("first_seen", DataType::Utf8, false),
        ArrowField::new("last_seen", DataType::Utf8, false),
        ArrowField::new("reached_active", DataType::Boolean, false),
    ]));

    let canonical_ids = StringArray::from(
        rows.iter()
            .map(|(id, _)| Some(id.to_string()))
            .collect::<Vec<_>>(),
    );
    let portals = StringArray::from(
        rows.iter()
            .map(|(_, m)| Some(m.portal.as_str()))
            .collect::<Vec<_>>(),
    );
    let native_ids = StringArray::from(
        rows.iter()
            .map(|(_, m)| Some(m.native_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let states = StringArray::from(
        rows.iter()
            .map(|(_, m)| Some(member_state_label(m.state)))
            .collect::<Vec<_>>(),
    );
    let first_seen = StringArray::from(
        rows.iter()
            .map(|(_, m)| Some(m.first_seen.to_string()))
            .collect::<Vec<_>>(),
    );
    let last_seen = StringArray::from(
        rows.iter()
            .map(|(_, m)| Some(m.last_seen.to_string()))
            .collect::<Vec<_>>(),
    );
    let reached_active =
        BooleanArray::from(rows.iter().map(|(_, m)| m.reached_active).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(canonical_ids),
            Arc::new(portals),
            Arc::new(native_ids),
            Arc::new(states),
            Arc::new(first_seen),
            Arc::new(last_seen),
            Arc::new(reached_active),
        ],
    )
    .context("building members record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, export_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(export_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
