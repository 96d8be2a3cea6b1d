//! Core domain model for casatrack: raw and normalized listing records,
//! canonical listings with per-portal memberships, and status derivation.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "casatrack-core";

/// One listing as scraped from one portal on one snapshot date.
///
/// Fields are kept verbatim as the extraction layer produced them; price and
/// surface arrive as free text because portals format them inconsistently.
/// Immutable once captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub portal: String,
    pub native_id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub surface: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub rooms: Option<String>,
    #[serde(default)]
    pub bathrooms: Option<u32>,
    #[serde(default)]
    pub features: Vec<String>,
}

/// WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Canonical attribute tuple produced by the normalizer. `None` means the
/// field was missing or unparseable; such records stay in same-portal
/// tracking but are disqualified from cross-portal matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub portal: String,
    pub native_id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub price: Option<i64>,
    pub surface_sqm: Option<u32>,
    pub coords: Option<GeoPoint>,
    pub rooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub features: Vec<String>,
}

impl NormalizedListing {
    pub fn key(&self) -> ListingKey {
        ListingKey {
            portal: self.portal.clone(),
            native_id: self.native_id.clone(),
        }
    }
}

/// (portal, portal-native id) pair identifying one membership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListingKey {
    pub portal: String,
    pub native_id: String,
}

impl ListingKey {
    pub fn new(portal: impl Into<String>, native_id: impl Into<String>) -> Self {
        Self {
            portal: portal.into(),
            native_id: native_id.into(),
        }
    }
}

impl std::fmt::Display for ListingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.portal, self.native_id)
    }
}

/// Lifecycle state of a single (portal, native id) membership.
///
/// `Vanished` is terminal for the membership: a native id that later
/// reappears starts a fresh listing record, it never resurrects this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MemberState {
    New,
    Active,
    PendingVanish { missed: u32 },
    Vanished,
}

impl MemberState {
    pub fn is_live(self) -> bool {
        !matches!(self, MemberState::Vanished)
    }
}

/// One portal's appearance of a canonical listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub portal: String,
    pub native_id: String,
    pub url: Option<String>,
    pub first_seen: NaiveDate,
    pub last_seen: NaiveDate,
    pub state: MemberState,
    /// Whether this membership was ever confirmed live in a second snapshot.
    /// Distinguishes a true sale from a listing that blinked in and out.
    pub reached_active: bool,
    /// Latest attribute tuple observed for this member. Cross-portal
    /// matching confirms pairs against these, member by member.
    pub attributes: ListingAttributes,
}

impl Member {
    pub fn key(&self) -> ListingKey {
        ListingKey {
            portal: self.portal.clone(),
            native_id: self.native_id.clone(),
        }
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }
}

/// Aggregate status of a canonical listing, derived from member states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Active,
    Sold,
    RemovedByPortal,
}

impl ListingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ListingStatus::Active => "active",
            ListingStatus::Sold => "sold",
            ListingStatus::RemovedByPortal => "removed_by_portal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(ListingStatus::Active),
            "sold" => Some(ListingStatus::Sold),
            "removed" | "removed_by_portal" => Some(ListingStatus::RemovedByPortal),
            _ => None,
        }
    }
}

/// Best-known attributes of a canonical listing, taking the most recent
/// non-null value per field across all member observations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListingAttributes {
    pub title: Option<String>,
    pub price: Option<i64>,
    pub surface_sqm: Option<u32>,
    pub coords: Option<GeoPoint>,
    pub rooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub features: Vec<String>,
}

impl ListingAttributes {
    pub fn from_listing(listing: &NormalizedListing) -> Self {
        let mut attrs = Self::default();
        attrs.refresh_from(listing);
        attrs
    }

    /// Overlay a newer observation: known values win, `None` leaves the
    /// previously known value in place.
    pub fn refresh_from(&mut self, listing: &NormalizedListing) {
        if listing.title.is_some() {
            self.title = listing.title.clone();
        }
        if listing.price.is_some() {
            self.price = listing.price;
        }
        if listing.surface_sqm.is_some() {
            self.surface_sqm = listing.surface_sqm;
        }
        if listing.coords.is_some() {
            self.coords = listing.coords;
        }
        if listing.rooms.is_some() {
            self.rooms = listing.rooms;
        }
        if listing.bathrooms.is_some() {
            self.bathrooms = listing.bathrooms;
        }
        for feature in &listing.features {
            if !self.features.contains(feature) {
                self.features.push(feature.clone());
            }
        }
    }
}

/// The durable, portal-independent representation of one physical property.
///
/// Never destroyed: later snapshots only add members, refresh attributes, or
/// advance member states. The aggregate status is always recomputed from the
/// member set, never stored independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalListing {
    pub id: Uuid,
    pub members: Vec<Member>,
    pub attributes: ListingAttributes,
    pub first_seen: NaiveDate,
    /// Whole days between first sighting and last confirmed presence, set
    /// once the listing reaches a terminal status.
    pub days_live: Option<i64>,
}

impl CanonicalListing {
    /// Seed a new canonical listing from its first observed member.
    pub fn new(listing: &NormalizedListing, snapshot_date: NaiveDate) -> Self {
        let attributes = ListingAttributes::from_listing(listing);
        let member = Member {
            portal: listing.portal.clone(),
            native_id: listing.native_id.clone(),
            url: listing.url.clone(),
            first_seen: snapshot_date,
            last_seen: snapshot_date,
            state: MemberState::New,
            reached_active: false,
            attributes: attributes.clone(),
        };
        Self {
            id: canonical_id(&member.key(), snapshot_date),
            members: vec![member],
            attributes,
            first_seen: snapshot_date,
            days_live: None,
        }
    }

    /// Derived aggregate status.
    ///
    /// `Sold` requires every member vanished and at least one of them to
    /// have been confirmed active at some point; a listing whose members all
    /// vanished while still `New` is flagged `RemovedByPortal` instead,
    /// since it may be a scrape-time glitch rather than a true sale.
    pub fn status(&self) -> ListingStatus {
        if self.members.iter().any(Member::is_live) {
            return ListingStatus::Active;
        }
        if self.members.iter().any(|m| m.reached_active) {
            ListingStatus::Sold
        } else {
            ListingStatus::RemovedByPortal
        }
    }

    pub fn member(&self, key: &ListingKey) -> Option<&Member> {
        self.members
            .iter()
            .find(|m| m.portal == key.portal && m.native_id == key.native_id)
    }

    pub fn member_mut(&mut self, key: &ListingKey) -> Option<&mut Member> {
        self.members
            .iter_mut()
            .find(|m| m.portal == key.portal && m.native_id == key.native_id)
    }

    /// The live member on a given portal, if any. The member set holds at
    /// most one live entry per portal.
    pub fn live_member_for_portal(&self, portal: &str) -> Option<&Member> {
        self.members
            .iter()
            .find(|m| m.portal == portal && m.is_live())
    }

    pub fn live_members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.is_live())
    }

    /// Latest date any member was present in its portal's search results.
    pub fn last_confirmed_presence(&self) -> NaiveDate {
        self.members
            .iter()
            .map(|m| m.last_seen)
            .max()
            .unwrap_or(self.first_seen)
    }

    /// Freeze `days_live` when the listing reaches a terminal status; clear
    /// it again if a new member arrives and the listing comes back to life.
    pub fn recompute_days_live(&mut self) {
        self.days_live = match self.status() {
            ListingStatus::Active => None,
            ListingStatus::Sold | ListingStatus::RemovedByPortal => Some(
                (self.last_confirmed_presence() - self.first_seen).num_days(),
            ),
        };
    }
}

/// Deterministic canonical id, stable across re-folds of the same snapshot
/// sequence: v5 UUID over the seed member key and its first-seen date.
pub fn canonical_id(seed: &ListingKey, first_seen: NaiveDate) -> Uuid {
    let source = format!("{}:{}:{}", seed.portal, seed.native_id, first_seen);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes())
}
