//! Snapshot batch loading and the listing normalizer.
//!
//! A snapshot batch is one JSON file per (portal, date) holding the flat
//! records the extraction layer produced for that portal's search results.
//! Normalization turns each raw record into a canonical attribute tuple;
//! unparseable fields degrade to unknown, they never drop the record.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use casatrack_core::{GeoPoint, NormalizedListing, RawListing};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "casatrack-ingest";

/// All listings observed in one portal's search results on one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotBatch {
    pub portal: String,
    pub date: NaiveDate,
    pub listings: Vec<RawListing>,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("snapshot file name {0:?} does not match <portal>_<YYYY-MM-DD>.json")]
    FileName(String),
    #[error("listing {native_id} claims portal {listing_portal} inside batch for {batch_portal}")]
    PortalMismatch {
        batch_portal: String,
        listing_portal: String,
        native_id: String,
    },
}

/// Registry of known portals, loaded from `portals.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct PortalRegistry {
    pub portals: Vec<PortalConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalConfig {
    pub portal_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl PortalRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn is_enabled(&self, portal_id: &str) -> bool {
        self.portals
            .iter()
            .any(|p| p.portal_id == portal_id && p.enabled)
    }
}

/// A discovered snapshot file, identified by its `<portal>_<YYYY-MM-DD>.json`
/// name before the content is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub path: PathBuf,
    pub portal: String,
    pub date: NaiveDate,
}

impl SnapshotFile {
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, IngestError> {
        let path = path.into();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let Some(stem) = name.strip_suffix(".json") else {
            return Err(IngestError::FileName(name));
        };
        // Portal ids may themselves contain underscores; the date is always
        // the trailing 10 characters.
        let Some((portal, date_str)) = stem.rsplit_once('_') else {
            return Err(IngestError::FileName(name));
        };
        let date: NaiveDate = date_str
            .parse()
            .map_err(|_| IngestError::FileName(name.clone()))?;
        if portal.is_empty() {
            return Err(IngestError::FileName(name));
        }
        Ok(Self {
            path,
            portal: portal.to_string(),
            date,
        })
    }
}

/// Find snapshot files in a directory, ordered by date then portal so the
/// fold consumes them strictly chronologically.
pub fn discover_snapshot_files(dir: impl AsRef<Path>) -> Result<Vec<SnapshotFile>> {
    let dir = dir.as_ref();
    let mut files = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("reading snapshot dir {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("reading snapshot dir {}", dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match SnapshotFile::from_path(&path) {
            Ok(file) => files.push(file),
            Err(err) => warn!(path = %path.display(), %err, "skipping unrecognized snapshot file"),
        }
    }
    files.sort_by(|a, b| (a.date, &a.portal).cmp(&(b.date, &b.portal)));
    Ok(files)
}

/// Load and validate one snapshot batch. Every record must belong to the
/// portal named in the file; anything else is an input-contract violation.
pub fn load_snapshot_batch(file: &SnapshotFile) -> Result<SnapshotBatch> {
    let bytes =
        fs::read(&file.path).with_context(|| format!("reading {}", file.path.display()))?;
    parse_snapshot_batch(file, &bytes)
}

/// Parse already-read snapshot bytes against the file's portal/date claim.
pub fn parse_snapshot_batch(file: &SnapshotFile, bytes: &[u8]) -> Result<SnapshotBatch> {
    let listings: Vec<RawListing> = serde_json::from_slice(bytes)
        .with_context(|| format!("parsing {}", file.path.display()))?;
    for listing in &listings {
        if listing.portal != file.portal {
            return Err(IngestError::PortalMismatch {
                batch_portal: file.portal.clone(),
                listing_portal: listing.portal.clone(),
                native_id: listing.native_id.clone(),
            }
            .into());
        }
    }
    Ok(SnapshotBatch {
        portal: file.portal.clone(),
        date: file.date,
        listings,
    })
}

/// Normalize one raw record. Pure; never fails — fields that cannot be
/// parsed come out as `None`.
pub fn normalize(raw: &RawListing) -> NormalizedListing {
    NormalizedListing {
        portal: raw.portal.clone(),
        native_id: raw.native_id.clone(),
        url: raw.url.clone(),
        title: raw.title.clone(),
        price: raw.price.as_deref().and_then(parse_price),
        surface_sqm: raw.surface.as_deref().and_then(parse_surface),
        coords: parse_coords(raw.latitude, raw.longitude),
        rooms: raw.rooms.as_deref().and_then(parse_count),
        bathrooms: raw.bathrooms,
        features: raw.features.clone(),
    }
}

/// Parse a listing price out of portal-formatted text: "€ 300.000",
/// "300,000 €", "1.250.000". Dots and commas are grouping separators when
/// followed by three digits; a shorter trailing group is a decimal tail and
/// is dropped (list prices are whole euros). Zero means price-on-request on
/// both portals and is treated as unknown.
pub fn parse_price(text: &str) -> Option<i64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let run: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    let mut groups: Vec<&str> = run
        .split(['.', ','])
        .filter(|g| !g.is_empty())
        .collect();
    if groups.len() > 1 && groups.last().is_some_and(|g| g.len() != 3) {
        groups.pop();
    }
    let value: i64 = groups.concat().parse().ok()?;
    (value > 0).then_some(value)
}

/// Parse a surface in m² from text like "80 m²", "80mq" or "80,5 m²"
/// (fractional square meters are truncated to the integer part).
pub fn parse_surface(text: &str) -> Option<u32> {
    parse_count(text)
}

/// First integer run in the text: "3 locali" -> 3, "5+" -> 5.
pub fn parse_count(text: &str) -> Option<u32> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let digits: String = text[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    let value: u32 = digits.parse().ok()?;
    (value > 0).then_some(value)
}

fn parse_coords(lat: Option<f64>, lon: Option<f64>) -> Option<GeoPoint> {
    let (lat, lon) = (lat?, lon?);
    if !lat.is_finite() || !lon.is_finite() {
        return None;
    }
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    Some(GeoPoint { lat, lon })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn raw(portal: &str, native_id: &str) -> RawListing {
        RawListing {
            portal: portal.to_string(),
            native_id: native_id.to_string(),
            url: Some(format!("https://{portal}.example/{native_id}")),
            title: Some("Appartamento in centro".to_string()),
            price: Some("€ 300.000".to_string()),
            surface: Some("80 m²".to_string()),
            latitude: Some(44.50),
            longitude: Some(11.34),
            rooms: Some("3 locali".to_string()),
            bathrooms: Some(1),
            features: vec![],
        }
    }

    #[test]
    fn price_parsing_handles_portal_formats() {
        assert_eq!(parse_price("€ 300.000"), Some(300_000));
        assert_eq!(parse_price("528.000€"), Some(528_000));
        assert_eq!(parse_price("300,000"), Some(300_000));
        assert_eq!(parse_price("1.250.000"), Some(1_250_000));
        assert_eq!(parse_price("300000"), Some(300_000));
        assert_eq!(parse_price("1.234,56"), Some(1_234));
        assert_eq!(parse_price("Prezzo su richiesta"), None);
        assert_eq!(parse_price("€ 0"), None);
        assert_eq!(parse_price(""), None);
    }

    #[test]
    fn surface_parsing_takes_the_integer_part() {
        assert_eq!(parse_surface("80 m²"), Some(80));
        assert_eq!(parse_surface("80mq"), Some(80));
        assert_eq!(parse_surface("80,5 m²"), Some(80));
        assert_eq!(parse_surface("120"), Some(120));
        assert_eq!(parse_surface("n.d."), None);
    }

    #[test]
    fn room_counts_tolerate_suffixes() {
        assert_eq!(parse_count("3 locali"), Some(3));
        assert_eq!(parse_count("5+"), Some(5));
        assert_eq!(parse_count("monolocale"), None);
    }

    #[test]
    fn unparseable_fields_degrade_to_unknown() {
        let mut record = raw("immobiliare", "123");
        record.price = Some("trattativa riservata".to_string());
        record.surface = None;
        record.latitude = None;

        let normalized = normalize(&record);
        assert_eq!(normalized.price, None);
        assert_eq!(normalized.surface_sqm, None);
        assert_eq!(normalized.coords, None);
        // Record survives with identity and the fields that did parse.
        assert_eq!(normalized.native_id, "123");
        assert_eq!(normalized.rooms, Some(3));
    }

    #[test]
    fn out_of_range_coordinates_are_unknown() {
        assert_eq!(parse_coords(Some(91.0), Some(11.34)), None);
        assert_eq!(parse_coords(Some(44.5), Some(181.0)), None);
        assert_eq!(parse_coords(Some(f64::NAN), Some(11.34)), None);
        assert!(parse_coords(Some(44.5), Some(11.34)).is_some());
    }

    #[test]
    fn snapshot_file_names_parse_portal_and_date() {
        let file = SnapshotFile::from_path("/tmp/immobiliare_2026-01-18.json").unwrap();
        assert_eq!(file.portal, "immobiliare");
        assert_eq!(file.date, "2026-01-18".parse::<NaiveDate>().unwrap());

        let file = SnapshotFile::from_path("/tmp/casa_it_2026-01-18.json").unwrap();
        assert_eq!(file.portal, "casa_it");

        assert!(SnapshotFile::from_path("/tmp/notadate_immobiliare.json").is_err());
        assert!(SnapshotFile::from_path("/tmp/immobiliare_2026-01-18.html").is_err());
    }

    #[test]
    fn discovery_orders_batches_chronologically() {
        let dir = tempdir().unwrap();
        for name in [
            "idealista_2026-01-25.json",
            "immobiliare_2026-01-18.json",
            "idealista_2026-01-18.json",
            "notes.txt",
        ] {
            fs::write(dir.path().join(name), "[]").unwrap();
        }

        let files = discover_snapshot_files(dir.path()).unwrap();
        let order: Vec<_> = files
            .iter()
            .map(|f| (f.date.to_string(), f.portal.clone()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("2026-01-18".to_string(), "idealista".to_string()),
                ("2026-01-18".to_string(), "immobiliare".to_string()),
                ("2026-01-25".to_string(), "idealista".to_string()),
            ]
        );
    }

    #[test]
    fn batch_loading_rejects_portal_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("immobiliare_2026-01-18.json");
        let records = vec![raw("immobiliare", "1"), raw("idealista", "2")];
        fs::write(&path, serde_json::to_vec(&records).unwrap()).unwrap();

        let file = SnapshotFile::from_path(&path).unwrap();
        let err = load_snapshot_batch(&file).unwrap_err();
        assert!(err.to_string().contains("idealista"));
    }

    #[test]
    fn batch_loading_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("immobiliare_2026-01-18.json");
        let records = vec![raw("immobiliare", "1"), raw("immobiliare", "2")];
        fs::write(&path, serde_json::to_vec(&records).unwrap()).unwrap();

        let file = SnapshotFile::from_path(&path).unwrap();
        let batch = load_snapshot_batch(&file).unwrap();
        assert_eq!(batch.portal, "immobiliare");
        assert_eq!(batch.listings.len(), 2);
        assert_eq!(batch.listings[0].native_id, "1");
    }
}
