// src/normalize.rs
//! Raw marketplace record → validated [`Listing`].
//!
//! Prices, mileages and years arrive as marketplace text (`"£12,495"`,
//! `"84,000 miles"`, `"2017 (67 reg)"`). They are parsed, then checked
//! against the plausibility ranges below. A record failing any check is
//! rejected whole; partial rows never reach the merge store.

use chrono::{DateTime, Datelike, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

use crate::adapter::{RawRecord, SourceId};
use crate::geo::TargetId;

/// Plausible asking price in GBP.
pub const PRICE_RANGE: RangeInclusive<f64> = 500.0..=150_000.0;
/// Plausible odometer reading in miles.
pub const MILEAGE_RANGE: RangeInclusive<u32> = 0..=500_000;
/// Oldest plausible model year.
pub const YEAR_MIN: i32 = 1990;
/// Newest plausible model year relative to the reference year (next year's plates).
pub const YEAR_MAX_AHEAD: i32 = 1;

const TITLE_MAX_CHARS: usize = 300;
const DESCRIPTION_MAX_CHARS: usize = 1500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListingNature {
    Auction,
    FixedPrice,
    Dealer,
    Private,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Price,
    Mileage,
    Year,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Field::Price => "price",
            Field::Mileage => "mileage",
            Field::Year => "year",
        })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("missing title")]
    MissingTitle,
    #[error("missing or unparseable {0}")]
    Missing(Field),
    #[error("{field} out of range: {value}")]
    OutOfRange { field: Field, value: f64 },
}

impl Rejection {
    /// Stable key for counting rejections by reason.
    pub fn reason_key(&self) -> String {
        match self {
            Rejection::MissingTitle => "missing-title".to_string(),
            Rejection::Missing(f) => format!("missing-{f}"),
            Rejection::OutOfRange { field, .. } => format!("{field}-out-of-range"),
        }
    }
}

/// A validated, canonical listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub title: String,
    pub year: i32,
    pub mileage: u32,
    pub price: f64,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub listing_url: Option<String>,
    pub target: TargetId,
    pub source: SourceId,
    pub observed_at: DateTime<Utc>,
    pub age: u32,
    pub listing_nature: ListingNature,
    pub vat_included: Option<bool>,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordNormalizer {
    reference_year: i32,
}

impl Default for RecordNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordNormalizer {
    /// Uses the current calendar year for age and the year ceiling.
    pub fn new() -> Self {
        Self {
            reference_year: Utc::now().year(),
        }
    }

    pub fn with_reference_year(reference_year: i32) -> Self {
        Self { reference_year }
    }

    pub fn reference_year(&self) -> i32 {
        self.reference_year
    }

    pub fn year_range(&self) -> RangeInclusive<i32> {
        YEAR_MIN..=self.reference_year + YEAR_MAX_AHEAD
    }

    pub fn normalize(
        &self,
        raw: &RawRecord,
        target: &TargetId,
        source: &SourceId,
    ) -> Result<Listing, Rejection> {
        self.normalize_at(raw, target, source, Utc::now())
    }

    pub fn normalize_at(
        &self,
        raw: &RawRecord,
        target: &TargetId,
        source: &SourceId,
        observed_at: DateTime<Utc>,
    ) -> Result<Listing, Rejection> {
        let title = clean_text(&raw.title, TITLE_MAX_CHARS);
        if title.is_empty() {
            return Err(Rejection::MissingTitle);
        }

        let price = raw
            .price
            .as_deref()
            .and_then(parse_price)
            .ok_or(Rejection::Missing(Field::Price))?;
        if !PRICE_RANGE.contains(&price) {
            return Err(Rejection::OutOfRange {
                field: Field::Price,
                value: price,
            });
        }

        let mileage = raw
            .mileage
            .as_deref()
            .and_then(parse_mileage)
            .ok_or(Rejection::Missing(Field::Mileage))?;
        if !MILEAGE_RANGE.contains(&mileage) {
            return Err(Rejection::OutOfRange {
                field: Field::Mileage,
                value: mileage as f64,
            });
        }

        // Many marketplaces only carry the model year in the title.
        let year = raw
            .year
            .as_deref()
            .and_then(parse_year)
            .or_else(|| parse_year(&title))
            .ok_or(Rejection::Missing(Field::Year))?;
        if !self.year_range().contains(&year) {
            return Err(Rejection::OutOfRange {
                field: Field::Year,
                value: year as f64,
            });
        }

        let description = raw
            .description
            .as_deref()
            .map(|d| clean_text(d, DESCRIPTION_MAX_CHARS))
            .filter(|d| !d.is_empty());

        let signals = format!("{} {}", title, description.as_deref().unwrap_or_default());

        Ok(Listing {
            listing_nature: classify_nature(raw, &signals),
            vat_included: detect_vat(&signals),
            age: (self.reference_year - year).max(0) as u32,
            title,
            year,
            mileage,
            price,
            description,
            image_url: raw.image_url.as_deref().and_then(clean_url),
            listing_url: raw.listing_url.as_deref().and_then(clean_url),
            target: target.clone(),
            source: source.clone(),
            observed_at,
        })
    }
}

/// Decode entities, strip tags, straighten quotes, collapse whitespace, cap length.
pub fn clean_text(s: &str, max_chars: usize) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
    out = re_tags.replace_all(&out, " ").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    out = out.split_whitespace().collect::<Vec<_>>().join(" ");

    if out.chars().count() > max_chars {
        out = out.chars().take(max_chars).collect();
    }
    out
}

/// `"£12,495"` → 12495.0, `"Offers over £8.5k"` → 8500.0.
pub fn parse_price(text: &str) -> Option<f64> {
    static RE: OnceCell<Regex> = OnceCell::new();
    let re = RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)(k)?").expect("price regex"));

    let lowered = text.to_lowercase().replace([',', '£', '+'], "");
    let caps = re.captures(&lowered)?;
    let base: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some(if caps.get(2).is_some() { base * 1000.0 } else { base })
}

/// `"84,000 miles"` → 84000, `"62k miles"` → 62000.
pub fn parse_mileage(text: &str) -> Option<u32> {
    static RE: OnceCell<Regex> = OnceCell::new();
    let re = RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)\s*(?:(k)\b)?").expect("mileage regex"));

    let lowered = text.to_lowercase().replace(',', "");
    let caps = re.captures(&lowered)?;
    let base: f64 = caps.get(1)?.as_str().parse().ok()?;
    let miles = if caps.get(2).is_some() {
        base * 1000.0
    } else {
        base
    };
    (miles >= 0.0 && miles <= u32::MAX as f64).then_some(miles.round() as u32)
}

/// First four-digit 19xx/20xx token.
pub fn parse_year(text: &str) -> Option<i32> {
    static RE: OnceCell<Regex> = OnceCell::new();
    let re = RE.get_or_init(|| Regex::new(r"\b(?:19|20)\d{2}\b").expect("year regex"));
    re.find(text)?.as_str().parse().ok()
}

fn clean_url(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() || t.eq_ignore_ascii_case("n/a") {
        return None;
    }
    Some(t.to_string())
}

fn any_match(set: &'static OnceCell<Vec<Regex>>, patterns: &[&str], text: &str) -> bool {
    set.get_or_init(|| {
        patterns
            .iter()
            .map(|p| Regex::new(p).expect("nature regex"))
            .collect()
    })
    .iter()
    .any(|re| re.is_match(text))
}

/// Classify sale format / seller kind. Adapter hints win over text signals.
pub fn classify_nature(raw: &RawRecord, text: &str) -> ListingNature {
    static AUCTION: OnceCell<Vec<Regex>> = OnceCell::new();
    static FIXED: OnceCell<Vec<Regex>> = OnceCell::new();
    static DEALER: OnceCell<Vec<Regex>> = OnceCell::new();
    static PRIVATE: OnceCell<Vec<Regex>> = OnceCell::new();

    let auction_p = [
        r"\bauction\b",
        r"\bbidding\b",
        r"\bbids?\b",
        r"\btime\s*left\b",
        r"\bending\s*soon\b",
        r"\bhighest\s*bid\b",
    ];
    let fixed_p = [
        r"\bbuy\s*it\s*now\b",
        r"\bfixed\s*price\b",
        r"\bbuy\s*now\b",
        r"\bimmediate\s*purchase\b",
    ];
    let dealer_p = [
        r"\btrade\s*seller\b",
        r"\bdealer(ship)?\b",
        r"\bpart\s*ex(change)?\s*welcome\b",
        r"\bfinance\s*available\b",
    ];
    let private_p = [r"\bprivate\s*(seller|sale)\b", r"\bno\s*time\s*wasters\b"];

    let format = raw.listing_format.as_deref().unwrap_or_default().to_lowercase();
    let seller = raw.seller_type.as_deref().unwrap_or_default().to_lowercase();

    if any_match(&AUCTION, &auction_p, &format) {
        return ListingNature::Auction;
    }
    if seller.contains("trade") || seller.contains("dealer") || seller.contains("business") {
        return ListingNature::Dealer;
    }
    if seller.contains("private") {
        return ListingNature::Private;
    }
    if any_match(&FIXED, &fixed_p, &format) || format.contains("classified") {
        return ListingNature::FixedPrice;
    }

    let text = text.to_lowercase();
    if any_match(&AUCTION, &auction_p, &text) {
        ListingNature::Auction
    } else if any_match(&DEALER, &dealer_p, &text) {
        ListingNature::Dealer
    } else if any_match(&PRIVATE, &private_p, &text) {
        ListingNature::Private
    } else if any_match(&FIXED, &fixed_p, &text) {
        ListingNature::FixedPrice
    } else {
        ListingNature::Unknown
    }
}

/// `Some(false)` for explicit "no VAT / plus VAT", `Some(true)` for "inc VAT",
/// `None` when the text says nothing.
pub fn detect_vat(text: &str) -> Option<bool> {
    static EXCLUDED: OnceCell<Vec<Regex>> = OnceCell::new();
    static INCLUDED: OnceCell<Vec<Regex>> = OnceCell::new();

    let excluded_p = [
        r"\bno\s*vat\b",
        r"\bex\.?\s*vat\b",
        r"\bexcluding\s*vat\b",
        r"\bplus\s*vat\b",
        r"\+\s*vat\b",
        r"\bvat\s*exempt\b",
        r"\bvat\s*not\s*included\b",
    ];
    let included_p = [
        r"\binc\.?\s*vat\b",
        r"\bincluding\s*vat\b",
        r"\bvat\s*included\b",
        r"\bwith\s*vat\b",
    ];

    let text = text.to_lowercase();
    if any_match(&EXCLUDED, &excluded_p, &text) {
        Some(false)
    } else if any_match(&INCLUDED, &included_p, &text) {
        Some(true)
    } else {
        None
    }
}
