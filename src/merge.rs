// src/merge.rs
//! # Merge Store
//!
//! The deduplicated dataset. One row per listing identity, kept in memory
//! and mirrored to an append-only JSON-lines log.
//!
//! - Identity: canonical listing URL when usable, else a content fingerprint.
//! - Every merge appends the full current row; `open` folds the log and the
//!   last row per identity wins.
//! - Same-identity merges are serialized under the row's map entry; the log
//!   line is written before the in-memory row changes.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::adapter::SourceId;
use crate::error::StoreError;
use crate::metrics::{ensure_metrics_described, MERGE_TOTAL};
use crate::normalize::{Listing, ListingNature};
use crate::outcomes::{parent_dir, write_atomic};

/// Query parameters that only track the click, never identify the listing.
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid"];
const TRACKING_PREFIX: &str = "utm_";

/// `open` rewrites the log once it holds more lines than this per live row.
const COMPACT_LINES_PER_ROW: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRecord {
    pub identity: String,
    #[serde(flatten)]
    pub listing: Listing,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Unchanged,
}

impl MergeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeOutcome::Inserted => "inserted",
            MergeOutcome::Updated => "updated",
            MergeOutcome::Unchanged => "unchanged",
        }
    }
}

/// Dataset summary: row counts and value ranges.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatasetStats {
    pub rows: usize,
    pub by_source: BTreeMap<SourceId, usize>,
    pub by_nature: BTreeMap<String, usize>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
}

#[derive(Debug, Default)]
pub struct MergeStore {
    rows: DashMap<String, MergedRecord>,
    path: Option<PathBuf>,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl MergeStore {
    /// Volatile store; nothing touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Fold the log at `path` (created if missing) and open it for appends.
    ///
    /// Lines that do not decode, typically a torn tail after a crash, are
    /// skipped with a warning. A log holding more than
    /// `COMPACT_LINES_PER_ROW` lines per live row is compacted before use.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let dir = parent_dir(&path);
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

        let rows = DashMap::new();
        let mut lines = 0usize;
        let mut skipped = 0usize;
        match File::open(&path) {
            Ok(f) => {
                for (idx, line) in BufReader::new(f).split(b'\n').enumerate() {
                    let line = line.map_err(|e| StoreError::io(&path, e))?;
                    if line.trim_ascii().is_empty() {
                        continue;
                    }
                    lines += 1;
                    // Raw bytes: a tail cut inside a multi-byte character is
                    // just another undecodable line.
                    match serde_json::from_slice::<MergedRecord>(&line) {
                        Ok(row) => {
                            rows.insert(row.identity.clone(), row);
                        }
                        Err(e) => {
                            skipped += 1;
                            tracing::warn!(
                                target: "merge",
                                path = %path.display(),
                                line = idx + 1,
                                error = %e,
                                "skipping undecodable dataset line"
                            );
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&path, e)),
        }

        if lines > rows.len().saturating_mul(COMPACT_LINES_PER_ROW) {
            write_atomic(&path, &encode_rows(&path, &sorted_rows(&rows))?)?;
            tracing::info!(
                target: "merge",
                path = %path.display(),
                lines,
                rows = rows.len(),
                "dataset compacted on open"
            );
        }

        let file = open_append(&path)?;

        tracing::info!(
            target: "merge",
            path = %path.display(),
            rows = rows.len(),
            skipped,
            "dataset loaded"
        );

        Ok(Self {
            rows,
            writer: Mutex::new(Some(BufWriter::new(file))),
            path: Some(path),
        })
    }

    pub fn merge(&self, listing: Listing) -> Result<MergeOutcome, StoreError> {
        self.merge_at(listing, Utc::now())
    }

    pub fn merge_at(&self, listing: Listing, now: DateTime<Utc>) -> Result<MergeOutcome, StoreError> {
        ensure_metrics_described();
        let identity = identity_for(&listing);

        let entry = self.rows.entry(identity.clone());
        let (outcome, row) = match &entry {
            Entry::Occupied(o) => {
                let mut row = o.get().clone();
                let changed = refresh(&mut row.listing, listing);
                row.last_seen = now;
                let outcome = if changed {
                    MergeOutcome::Updated
                } else {
                    MergeOutcome::Unchanged
                };
                (outcome, row)
            }
            Entry::Vacant(_) => (
                MergeOutcome::Inserted,
                MergedRecord {
                    identity,
                    listing,
                    first_seen: now,
                    last_seen: now,
                },
            ),
        };

        self.append(&row)?;
        match entry {
            Entry::Occupied(mut o) => {
                o.insert(row);
            }
            Entry::Vacant(v) => {
                v.insert(row);
            }
        }

        counter!(MERGE_TOTAL, "outcome" => outcome.as_str()).increment(1);
        Ok(outcome)
    }

    fn append(&self, row: &MergedRecord) -> Result<(), StoreError> {
        let mut guard = self.writer.lock();
        let (Some(w), Some(path)) = (guard.as_mut(), self.path.as_ref()) else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(row).map_err(|source| StoreError::Encode {
            path: path.clone(),
            source,
        })?;
        line.push(b'\n');
        w.write_all(&line).map_err(|e| StoreError::io(path, e))
    }

    /// Flush buffered rows and fsync the log.
    pub fn sync(&self) -> Result<(), StoreError> {
        let mut guard = self.writer.lock();
        if let (Some(w), Some(path)) = (guard.as_mut(), self.path.as_ref()) {
            w.flush().map_err(|e| StoreError::io(path, e))?;
            w.get_ref()
                .sync_data()
                .map_err(|e| StoreError::io(path, e))?;
        }
        Ok(())
    }

    /// Rewrite the log to exactly one row per identity.
    pub fn compact(&mut self) -> Result<(), StoreError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        self.sync()?;
        let buf = encode_rows(&path, &self.rows())?;

        // Drop the old handle before the rename replaces the file under it.
        *self.writer.get_mut() = None;
        write_atomic(&path, &buf)?;
        *self.writer.get_mut() = Some(BufWriter::new(open_append(&path)?));

        tracing::info!(target: "merge", path = %path.display(), rows = self.rows.len(), "dataset compacted");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, identity: &str) -> Option<MergedRecord> {
        self.rows.get(identity).map(|r| r.value().clone())
    }

    /// All rows ordered by `first_seen`, then identity.
    pub fn rows(&self) -> Vec<MergedRecord> {
        sorted_rows(&self.rows)
    }

    pub fn stats(&self) -> DatasetStats {
        let mut stats = DatasetStats::default();
        for r in self.rows.iter() {
            let l = &r.listing;
            stats.rows += 1;
            *stats.by_source.entry(l.source.clone()).or_default() += 1;
            let nature = serde_json::to_value(l.listing_nature)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string());
            *stats.by_nature.entry(nature).or_default() += 1;
            stats.price_min = Some(stats.price_min.map_or(l.price, |p| p.min(l.price)));
            stats.price_max = Some(stats.price_max.map_or(l.price, |p| p.max(l.price)));
            stats.year_min = Some(stats.year_min.map_or(l.year, |y| y.min(l.year)));
            stats.year_max = Some(stats.year_max.map_or(l.year, |y| y.max(l.year)));
        }
        stats
    }
}

fn sorted_rows(rows: &DashMap<String, MergedRecord>) -> Vec<MergedRecord> {
    let mut out: Vec<MergedRecord> = rows.iter().map(|r| r.value().clone()).collect();
    out.sort_by(|a, b| {
        a.first_seen
            .cmp(&b.first_seen)
            .then_with(|| a.identity.cmp(&b.identity))
    });
    out
}

/// One JSON line per row.
fn encode_rows(path: &Path, rows: &[MergedRecord]) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut buf, row).map_err(|source| StoreError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Apply the mutable fields of a fresh observation; `true` if any differed.
/// Absent optional values in the new observation keep what is stored.
fn refresh(stored: &mut Listing, fresh: Listing) -> bool {
    let mut changed = false;

    if stored.price != fresh.price {
        stored.price = fresh.price;
        changed = true;
    }
    if fresh.description.is_some() && stored.description != fresh.description {
        stored.description = fresh.description;
        changed = true;
    }
    if fresh.image_url.is_some() && stored.image_url != fresh.image_url {
        stored.image_url = fresh.image_url;
        changed = true;
    }
    if fresh.listing_nature != ListingNature::Unknown
        && stored.listing_nature != fresh.listing_nature
    {
        stored.listing_nature = fresh.listing_nature;
        changed = true;
    }
    if fresh.vat_included.is_some() && stored.vat_included != fresh.vat_included {
        stored.vat_included = fresh.vat_included;
        changed = true;
    }

    stored.observed_at = fresh.observed_at;
    changed
}

/// Open for appends, first terminating a torn trailing line so the next row
/// starts on its own line.
fn open_append(path: &Path) -> Result<File, StoreError> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;

    let len = file.metadata().map_err(|e| StoreError::io(path, e))?.len();
    if len > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::Start(len - 1))
            .and_then(|_| file.read_exact(&mut last))
            .map_err(|e| StoreError::io(path, e))?;
        if last[0] != b'\n' {
            file.write_all(b"\n").map_err(|e| StoreError::io(path, e))?;
        }
    }
    Ok(file)
}

/// Stable identity: `url:<sha256>` of the canonical listing URL, or
/// `fp:<sha256>` of the content fingerprint when no usable URL exists.
pub fn identity_for(listing: &Listing) -> String {
    if let Some(url) = listing.listing_url.as_deref().and_then(canonical_url) {
        return format!("url:{}", sha256_hex(&url));
    }
    let fingerprint = format!(
        "{}|{:.2}|{}|{}|{}",
        fingerprint_title(&listing.title),
        listing.price,
        listing.mileage,
        listing.year,
        listing.source
    );
    format!("fp:{}", sha256_hex(&fingerprint))
}

/// Canonical form of an absolute http(s) URL, `None` for anything else.
///
/// Lowercase scheme and host, default port dropped, no fragment, tracking
/// parameters removed, remaining parameters sorted, no trailing slash.
pub fn canonical_url(raw: &str) -> Option<String> {
    let url = url::Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str().filter(|h| !h.is_empty())?;

    let mut out = format!("{}://{}", url.scheme(), host.to_ascii_lowercase());
    if let Some(port) = url.port() {
        out.push_str(&format!(":{port}"));
    }
    out.push_str(url.path().trim_end_matches('/'));

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| {
            let k = k.to_ascii_lowercase();
            !k.starts_with(TRACKING_PREFIX) && !TRACKING_PARAMS.contains(&k.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !params.is_empty() {
        params.sort();
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        out.push('?');
        out.push_str(&query);
    }
    Some(out)
}

fn fingerprint_title(title: &str) -> String {
    title
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn sha256_hex(text: &str) -> String {
    use std::fmt::Write as _;
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::TargetId;
    use chrono::TimeZone;

    fn listing(url: Option<&str>, price: f64) -> Listing {
        Listing {
            title: "Ford Transit Custom 2.0 TDCi".into(),
            year: 2019,
            mileage: 61_200,
            price,
            description: Some("Clean van".into()),
            image_url: None,
            listing_url: url.map(str::to_string),
            target: TargetId::new("M1"),
            source: SourceId::new("ebay"),
            observed_at: Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
            age: 6,
            listing_nature: ListingNature::FixedPrice,
            vat_included: None,
        }
    }

    fn t(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn merging_twice_inserts_then_leaves_unchanged() {
        let store = MergeStore::in_memory();
        let l = listing(Some("https://www.ebay.co.uk/itm/123"), 14_750.0);
        assert_eq!(store.merge_at(l.clone(), t(9)).unwrap(), MergeOutcome::Inserted);
        assert_eq!(store.merge_at(l, t(10)).unwrap(), MergeOutcome::Unchanged);
        assert_eq!(store.len(), 1);
        assert_eq!(store.rows()[0].last_seen, t(10));
    }

    #[test]
    fn price_change_updates_but_keeps_first_seen() {
        let store = MergeStore::in_memory();
        let url = "https://www.ebay.co.uk/itm/123";
        store.merge_at(listing(Some(url), 14_750.0), t(9)).unwrap();
        let out = store.merge_at(listing(Some(url), 13_995.0), t(11)).unwrap();
        assert_eq!(out, MergeOutcome::Updated);

        let row = &store.rows()[0];
        assert_eq!(row.first_seen, t(9));
        assert_eq!(row.last_seen, t(11));
        assert_eq!(row.listing.price, 13_995.0);
    }

    #[test]
    fn url_identity_wins_over_content() {
        let a = listing(Some("https://example.test/v/1?utm_source=x#photos"), 9_000.0);
        let mut b = listing(Some("HTTPS://Example.test/v/1/"), 9_500.0);
        b.title = "Completely different title".into();
        assert_eq!(identity_for(&a), identity_for(&b));
        assert!(identity_for(&a).starts_with("url:"));

        let c = listing(None, 9_000.0);
        assert!(identity_for(&c).starts_with("fp:"));
        let rel = listing(Some("/v/1"), 9_000.0);
        assert_eq!(identity_for(&rel), identity_for(&c));
    }

    #[test]
    fn canonical_url_rules() {
        assert_eq!(
            canonical_url("https://WWW.Example.test:443/a/b/?b=2&utm_medium=x&a=1&fbclid=z#frag")
                .as_deref(),
            Some("https://www.example.test/a/b?a=1&b=2")
        );
        assert_eq!(
            canonical_url("http://example.test:8080/").as_deref(),
            Some("http://example.test:8080")
        );
        assert_eq!(canonical_url("ftp://example.test/x"), None);
        assert_eq!(canonical_url("not a url"), None);
    }

    #[test]
    fn reopen_folds_log_and_skips_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.jsonl");
        {
            let store = MergeStore::open(&path).unwrap();
            store.merge_at(listing(Some("https://e.test/1"), 9_000.0), t(9)).unwrap();
            store.merge_at(listing(Some("https://e.test/1"), 8_500.0), t(10)).unwrap();
            store.merge_at(listing(Some("https://e.test/2"), 7_000.0), t(10)).unwrap();
            store.sync().unwrap();
        }
        // Simulate a crash mid-write.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(br#"{"identity":"url:dead","title":"Half"#).unwrap();
        drop(f);

        let store = MergeStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        let first = store.get(&identity_for(&listing(Some("https://e.test/1"), 0.0))).unwrap();
        assert_eq!(first.listing.price, 8_500.0);
        assert_eq!(first.first_seen, t(9));

        // Appends after a torn tail start on a fresh line.
        store.merge_at(listing(Some("https://e.test/3"), 6_000.0), t(11)).unwrap();
        store.sync().unwrap();
        drop(store);
        assert_eq!(MergeStore::open(&path).unwrap().len(), 3);
    }

    #[test]
    fn torn_tail_inside_a_multibyte_character_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.jsonl");
        {
            let store = MergeStore::open(&path).unwrap();
            store.merge_at(listing(Some("https://e.test/1"), 9_000.0), t(9)).unwrap();
            store.sync().unwrap();
        }
        let row = r#"{"identity":"url:beef","title":"Transit £"#.as_bytes();
        let cut = row.iter().position(|b| *b == 0xC2).unwrap() + 1;
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&row[..cut]).unwrap();
        drop(f);

        let store = MergeStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        store.merge_at(listing(Some("https://e.test/2"), 7_000.0), t(10)).unwrap();
        store.sync().unwrap();
        drop(store);
        assert_eq!(MergeStore::open(&path).unwrap().len(), 2);
    }

    #[test]
    fn reopening_bounds_the_log_of_repeated_observations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.jsonl");
        let urls = ["https://e.test/1", "https://e.test/2", "https://e.test/3"];
        for h in 0..8 {
            let store = MergeStore::open(&path).unwrap();
            for url in urls {
                store.merge_at(listing(Some(url), 9_000.0), t(h)).unwrap();
            }
            store.sync().unwrap();
        }
        let lines = fs::read_to_string(&path).unwrap().lines().count();
        assert!(lines <= (COMPACT_LINES_PER_ROW + 1) * urls.len(), "{lines} lines");

        let store = MergeStore::open(&path).unwrap();
        assert_eq!(store.len(), 3);
        assert!(store.rows().iter().all(|r| r.first_seen == t(0) && r.last_seen == t(7)));
    }

    #[test]
    fn compaction_leaves_one_line_per_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.jsonl");
        let mut store = MergeStore::open(&path).unwrap();
        for h in 0..5 {
            store
                .merge_at(listing(Some("https://e.test/1"), 9_000.0 + h as f64), t(h))
                .unwrap();
        }
        store.merge_at(listing(None, 5_000.0), t(6)).unwrap();
        store.sync().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 6);

        store.compact().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);

        store.merge_at(listing(None, 5_000.0), t(7)).unwrap();
        store.sync().unwrap();
        drop(store);
        let reopened = MergeStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn concurrent_merges_of_one_listing_insert_once() {
        let store = std::sync::Arc::new(MergeStore::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .merge_at(listing(Some("https://e.test/same"), 9_000.0), t(i))
                        .unwrap()
                })
            })
            .collect();
        let outcomes: Vec<MergeOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(store.len(), 1);
        assert_eq!(
            outcomes.iter().filter(|o| **o == MergeOutcome::Inserted).count(),
            1
        );
    }

    #[test]
    fn stats_cover_sources_and_ranges() {
        let store = MergeStore::in_memory();
        store.merge_at(listing(Some("https://e.test/1"), 9_000.0), t(9)).unwrap();
        let mut g = listing(Some("https://e.test/2"), 4_000.0);
        g.source = SourceId::new("gumtree");
        g.year = 2012;
        store.merge_at(g, t(9)).unwrap();

        let s = store.stats();
        assert_eq!(s.rows, 2);
        assert_eq!(s.by_source.get(&SourceId::new("gumtree")), Some(&1));
        assert_eq!(s.price_min, Some(4_000.0));
        assert_eq!(s.price_max, Some(9_000.0));
        assert_eq!((s.year_min, s.year_max), (Some(2012), Some(2019)));
        assert_eq!(s.by_nature.get("fixed-price"), Some(&2));
    }
}
