//! Durable state for casatrack: the canonical listing store with its
//! per-portal snapshot ledger, plus an immutable hash-addressed archive of
//! raw snapshot files.
//!
//! Writes are append-or-update only. Replaying an already committed
//! (portal, date) snapshot is detected through the ledger and must no-op at
//! the engine level; nothing here ever deletes a canonical listing.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::Context;
use casatrack_core::{CanonicalListing, ListingKey, ListingStatus, Member, MemberState};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "casatrack-storage";

pub const STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("canonical listing {0} not found")]
    UnknownCanonical(Uuid),
    #[error("canonical listing {canonical_id} already has a live member on portal {portal}")]
    LivePortalMemberExists { canonical_id: Uuid, portal: String },
    #[error("member {key} of canonical listing {canonical_id} is vanished; its record is immutable")]
    VanishedMemberReplaced {
        canonical_id: Uuid,
        key: ListingKey,
    },
}

/// Per-portal fold bookkeeping: which snapshot dates have been committed and
/// the native-id set of the most recent one (the baseline for the next diff).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortalLedger {
    pub processed: BTreeSet<NaiveDate>,
    pub last_ids: BTreeSet<String>,
}

impl PortalLedger {
    pub fn last_processed(&self) -> Option<NaiveDate> {
        self.processed.iter().next_back().copied()
    }
}

/// The serialized shape of the store, written as a single JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    pub schema_version: u32,
    pub listings: BTreeMap<Uuid, CanonicalListing>,
    pub ledgers: BTreeMap<String, PortalLedger>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            listings: BTreeMap::new(),
            ledgers: BTreeMap::new(),
        }
    }
}

/// In-memory canonical store with a (portal, native id) -> canonical id
/// index. The index is rebuilt from the member sets on load; when the same
/// key appears in several canonicals (a portal re-listed a vanished id), the
/// membership with the latest first-seen date wins.
#[derive(Debug, Default)]
pub struct CanonicalStore {
    state: StoreState,
    index: HashMap<ListingKey, Uuid>,
}

impl CanonicalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: StoreState) -> Self {
        let index = build_index(&state.listings);
        Self { state, index }
    }

    /// Load the store from its JSON state file; a missing file yields an
    /// empty store so first runs need no setup step.
    pub async fn load_or_default(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking state file {}", path.display()))?
        {
            return Ok(Self::new());
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading state file {}", path.display()))?;
        let state: StoreState = serde_json::from_str(&text)
            .with_context(|| format!("parsing state file {}", path.display()))?;
        Ok(Self::from_state(state))
    }

    /// Persist the full state atomically so a crash mid-write leaves the
    /// previous state file intact.
    pub async fn persist(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let bytes =
            serde_json::to_vec_pretty(&self.state).context("serializing canonical store state")?;
        write_atomic(path, &bytes).await?;
        info!(path = %path.display(), listings = self.state.listings.len(), "persisted canonical store");
        Ok(())
    }

    pub fn state(&self) -> &StoreState {
        &self.state
    }

    pub fn len(&self) -> usize {
        self.state.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.listings.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&CanonicalListing> {
        self.state.listings.get(&id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut CanonicalListing> {
        self.state.listings.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CanonicalListing> {
        self.state.listings.values()
    }

    /// Insert or replace a canonical listing and point the index at its
    /// members. Existing index entries for the same keys are overwritten;
    /// the caller inserting a newer membership epoch wins by construction.
    pub fn upsert(&mut self, listing: CanonicalListing) {
        for member in &listing.members {
            self.index.insert(member.key(), listing.id);
        }
        self.state.listings.insert(listing.id, listing);
    }

    /// Attach a member to an existing canonical listing. Enforces the
    /// at-most-one-live-member-per-portal invariant; a member that reached
    /// `Vanished` is a closed historical record and is never replaced.
    pub fn upsert_member(&mut self, canonical_id: Uuid, member: Member) -> Result<(), StoreError> {
        let listing = self
            .state
            .listings
            .get_mut(&canonical_id)
            .ok_or(StoreError::UnknownCanonical(canonical_id))?;
        let key = member.key();
        if listing.member(&key).is_none()
            && member.is_live()
            && listing.live_member_for_portal(&member.portal).is_some()
        {
            return Err(StoreError::LivePortalMemberExists {
                canonical_id,
                portal: member.portal.clone(),
            });
        }
        match listing.member_mut(&key) {
            Some(existing) if existing.state == MemberState::Vanished => {
                return Err(StoreError::VanishedMemberReplaced { canonical_id, key });
            }
            Some(existing) => *existing = member,
            None => listing.members.push(member),
        }
        self.index.insert(key, canonical_id);
        Ok(())
    }

    /// Resolve a portal-native id to the canonical listing currently
    /// tracking it (the newest membership epoch for that key).
    pub fn lookup_by_portal_id(&self, portal: &str, native_id: &str) -> Option<Uuid> {
        self.index
            .get(&ListingKey::new(portal, native_id))
            .copied()
    }

    pub fn list_by_status(&self, status: ListingStatus) -> Vec<&CanonicalListing> {
        self.state
            .listings
            .values()
            .filter(|l| l.status() == status)
            .collect()
    }

    pub fn counts_by_status(&self) -> BTreeMap<ListingStatus, usize> {
        let mut counts = BTreeMap::new();
        for listing in self.state.listings.values() {
            *counts.entry(listing.status()).or_default() += 1;
        }
        counts
    }

    pub fn is_processed(&self, portal: &str, date: NaiveDate) -> bool {
        self.state
            .ledgers
            .get(portal)
            .is_some_and(|l| l.processed.contains(&date))
    }

    pub fn last_processed(&self, portal: &str) -> Option<NaiveDate> {
        self.state.ledgers.get(portal).and_then(PortalLedger::last_processed)
    }

    /// Native ids observed in the portal's most recently committed snapshot.
    pub fn last_id_set(&self, portal: &str) -> BTreeSet<String> {
        self.state
            .ledgers
            .get(portal)
            .map(|l| l.last_ids.clone())
            .unwrap_or_default()
    }

    /// Record that a (portal, date) snapshot has been fully folded, making
    /// its id set the baseline for the next diff.
    pub fn commit_snapshot(&mut self, portal: &str, date: NaiveDate, ids: BTreeSet<String>) {
        let ledger = self.state.ledgers.entry(portal.to_string()).or_default();
        ledger.processed.insert(date);
        ledger.last_ids = ids;
    }
}

fn build_index(listings: &BTreeMap<Uuid, CanonicalListing>) -> HashMap<ListingKey, Uuid> {
    let mut newest: HashMap<ListingKey, (NaiveDate, Uuid)> = HashMap::new();
    for listing in listings.values() {
        for member in &listing.members {
            let key = member.key();
            match newest.get(&key) {
                Some((first_seen, _)) if *first_seen >= member.first_seen => {}
                _ => {
                    newest.insert(key, (member.first_seen, listing.id));
                }
            }
        }
    }
    newest.into_iter().map(|(k, (_, id))| (k, id)).collect()
}

#[derive(Debug, Clone)]
pub struct ArchivedSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable archive of raw snapshot files, addressed by content hash so a
/// re-run of the same scrape never stores a second copy.
#[derive(Debug, Clone)]
pub struct SnapshotArchive {
    root: PathBuf,
}

impl SnapshotArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn relative_path(date: NaiveDate, portal: &str, content_hash: &str) -> PathBuf {
        PathBuf::from(date.format("%Y-%m-%d").to_string())
            .join(portal)
            .join(format!("{content_hash}.json"))
    }

    /// Archive snapshot bytes under their hash path. An already archived
    /// hash is a dedup hit, not an error; a racing writer of the same hash
    /// lands byte-identical content, so overwrite order does not matter.
    pub async fn store_bytes(
        &self,
        date: NaiveDate,
        portal: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path(date, portal, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomic(&absolute_path, bytes).await?;
        }

        Ok(ArchivedSnapshot {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Write through a uniquely named temp file in the target's directory, then
/// rename into place. The temp file shares the target's filesystem, keeping
/// the rename atomic; it is removed again if the rename fails.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let temp_path = path.with_extension(format!("tmp.{}", Uuid::new_v4()));
    fs::write(&temp_path, bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err)
            .with_context(|| format!("renaming {} -> {}", temp_path.display(), path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use casatrack_core::{GeoPoint, ListingAttributes, MemberState, NormalizedListing};
    use tempfile::tempdir;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn normalized(portal: &str, native_id: &str) -> NormalizedListing {
        NormalizedListing {
            portal: portal.to_string(),
            native_id: native_id.to_string(),
            url: None,
            title: Some("Bilocale".to_string()),
            price: Some(250_000),
            surface_sqm: Some(60),
            coords: Some(GeoPoint {
                lat: 44.49,
                lon: 11.35,
            }),
            rooms: Some(2),
            bathrooms: Some(1),
            features: vec![],
        }
    }

    fn canonical(portal: &str, native_id: &str, first_seen: &str) -> CanonicalListing {
        CanonicalListing::new(&normalized(portal, native_id), date(first_seen))
    }

    #[test]
    fn upsert_and_lookup_by_portal_id() {
        let mut store = CanonicalStore::new();
        let listing = canonical("immobiliare", "123", "2026-01-18");
        let id = listing.id;
        store.upsert(listing);

        assert_eq!(store.lookup_by_portal_id("immobiliare", "123"), Some(id));
        assert_eq!(store.lookup_by_portal_id("idealista", "123"), None);
        assert_eq!(store.list_by_status(ListingStatus::Active).len(), 1);
    }

    #[test]
    fn upsert_member_rejects_second_live_member_per_portal() {
        let mut store = CanonicalStore::new();
        let listing = canonical("immobiliare", "123", "2026-01-18");
        let id = listing.id;
        store.upsert(listing);

        let clash = Member {
            portal: "immobiliare".to_string(),
            native_id: "456".to_string(),
            url: None,
            first_seen: date("2026-01-25"),
            last_seen: date("2026-01-25"),
            state: MemberState::New,
            reached_active: false,
            attributes: ListingAttributes::default(),
        };
        let err = store.upsert_member(id, clash).unwrap_err();
        assert!(matches!(err, StoreError::LivePortalMemberExists { .. }));

        let cross_portal = Member {
            portal: "idealista".to_string(),
            native_id: "987".to_string(),
            url: None,
            first_seen: date("2026-01-25"),
            last_seen: date("2026-01-25"),
            state: MemberState::New,
            reached_active: false,
            attributes: ListingAttributes::default(),
        };
        store.upsert_member(id, cross_portal).unwrap();
        assert_eq!(store.lookup_by_portal_id("idealista", "987"), Some(id));
        assert_eq!(store.get(id).unwrap().members.len(), 2);
    }

    #[test]
    fn upsert_member_never_replaces_a_vanished_member() {
        let mut store = CanonicalStore::new();
        let mut listing = canonical("immobiliare", "123", "2026-01-18");
        listing.members[0].last_seen = date("2026-01-25");
        listing.members[0].reached_active = true;
        listing.members[0].state = MemberState::Vanished;
        let id = listing.id;
        store.upsert(listing);

        // The portal republished the same native id; its closed record must
        // survive untouched.
        let relisted = Member {
            portal: "immobiliare".to_string(),
            native_id: "123".to_string(),
            url: None,
            first_seen: date("2026-03-01"),
            last_seen: date("2026-03-01"),
            state: MemberState::New,
            reached_active: false,
            attributes: ListingAttributes::default(),
        };
        let err = store.upsert_member(id, relisted).unwrap_err();
        assert!(matches!(err, StoreError::VanishedMemberReplaced { .. }));

        let member = &store.get(id).unwrap().members[0];
        assert_eq!(member.state, MemberState::Vanished);
        assert_eq!(member.first_seen, date("2026-01-18"));
        assert_eq!(member.last_seen, date("2026-01-25"));
        assert!(member.reached_active);
    }

    #[test]
    fn index_rebuild_prefers_newest_membership_epoch() {
        let mut old = canonical("immobiliare", "123", "2026-01-18");
        old.members[0].state = MemberState::Vanished;
        old.members[0].reached_active = true;
        let fresh = canonical("immobiliare", "123", "2026-03-01");
        let fresh_id = fresh.id;
        assert_ne!(old.id, fresh_id);

        let mut listings = BTreeMap::new();
        listings.insert(old.id, old);
        listings.insert(fresh_id, fresh);
        let store = CanonicalStore::from_state(StoreState {
            schema_version: STATE_SCHEMA_VERSION,
            listings,
            ledgers: BTreeMap::new(),
        });

        assert_eq!(store.lookup_by_portal_id("immobiliare", "123"), Some(fresh_id));
    }

    #[test]
    fn ledger_tracks_processed_dates_and_baseline_ids() {
        let mut store = CanonicalStore::new();
        assert!(!store.is_processed("immobiliare", date("2026-01-18")));
        assert_eq!(store.last_processed("immobiliare"), None);

        store.commit_snapshot(
            "immobiliare",
            date("2026-01-18"),
            ["1".to_string(), "2".to_string()].into(),
        );
        store.commit_snapshot("immobiliare", date("2026-01-25"), ["2".to_string()].into());

        assert!(store.is_processed("immobiliare", date("2026-01-18")));
        assert_eq!(store.last_processed("immobiliare"), Some(date("2026-01-25")));
        assert_eq!(store.last_id_set("immobiliare"), ["2".to_string()].into());
        // A different portal's ledger is untouched.
        assert!(!store.is_processed("idealista", date("2026-01-18")));
    }

    #[tokio::test]
    async fn persist_and_reload_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("canonical.json");

        let mut store = CanonicalStore::new();
        store.upsert(canonical("immobiliare", "123", "2026-01-18"));
        store.commit_snapshot("immobiliare", date("2026-01-18"), ["123".to_string()].into());
        store.persist(&path).await.unwrap();

        let reloaded = CanonicalStore::load_or_default(&path).await.unwrap();
        assert_eq!(reloaded.state(), store.state());
        assert_eq!(
            reloaded.lookup_by_portal_id("immobiliare", "123"),
            store.lookup_by_portal_id("immobiliare", "123")
        );
    }

    #[tokio::test]
    async fn missing_state_file_loads_empty_store() {
        let dir = tempdir().unwrap();
        let store = CanonicalStore::load_or_default(dir.path().join("nope.json"))
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn archive_deduplicates_by_content_hash() {
        let dir = tempdir().unwrap();
        let archive = SnapshotArchive::new(dir.path());

        let first = archive
            .store_bytes(date("2026-01-18"), "immobiliare", b"[{\"portal\":\"immobiliare\"}]")
            .await
            .unwrap();
        let second = archive
            .store_bytes(date("2026-01-18"), "immobiliare", b"[{\"portal\":\"immobiliare\"}]")
            .await
            .unwrap();

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }
}
