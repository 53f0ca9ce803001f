// src/geo.rs
//! # Geo Index
//!
//! Static reference table of search targets (UK postcode areas) with
//! coordinates, region and two coarse classes used for ranking.
//!
//! - Immutable after construction; share it behind an `Arc` and read freely.
//! - Built-in table covers the major cities, commercial hubs and regional
//!   centres the harvester has historically searched.
//! - Haversine distance with a fixed Earth radius.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Mean Earth radius used for great-circle distances.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Identifier of a target (postcode area code, e.g. `"M1"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Three-step class shared by population density and commercial activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    Medium,
    High,
}

impl Level {
    /// Normalise to `[0.0, 1.0]` for scoring.
    pub fn normalized(self) -> f64 {
        match self {
            Level::Low => 0.0,
            Level::Medium => 0.5,
            Level::High => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Great-circle distance in kilometres (haversine).
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        haversine_km(*self, *other)
    }
}

/// Haversine distance between two coordinates, in kilometres.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    // Clamp guards asin against rounding slightly above 1.0 for antipodes.
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// A geographic search anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub name: String,
    pub region: String,
    pub density: Level,
    pub activity: Level,
    pub location: GeoPoint,
}

impl Target {
    pub fn new(
        code: &str,
        name: &str,
        region: &str,
        density: Level,
        activity: Level,
        lat: f64,
        lon: f64,
    ) -> Self {
        Self {
            id: TargetId::new(code),
            name: name.to_string(),
            region: region.to_string(),
            density,
            activity,
            location: GeoPoint::new(lat, lon),
        }
    }
}

/// Read-only lookup table of targets, ordered by id.
#[derive(Debug, Clone, Default)]
pub struct GeoIndex {
    targets: BTreeMap<TargetId, Target>,
}

impl GeoIndex {
    /// Build from an arbitrary list. Later duplicates replace earlier ones.
    pub fn from_targets(targets: impl IntoIterator<Item = Target>) -> Self {
        let targets = targets.into_iter().map(|t| (t.id.clone(), t)).collect();
        Self { targets }
    }

    /// Built-in UK table.
    pub fn builtin() -> Self {
        Self::from_targets(builtin_targets())
    }

    pub fn get(&self, id: &TargetId) -> Option<&Target> {
        self.targets.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.values()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn regions(&self) -> BTreeSet<&str> {
        self.targets.values().map(|t| t.region.as_str()).collect()
    }

    /// Targets within `radius_km` of `center` (inclusive).
    pub fn within_radius(&self, center: GeoPoint, radius_km: f64) -> Vec<&Target> {
        self.targets
            .values()
            .filter(|t| haversine_km(center, t.location) <= radius_km)
            .collect()
    }

    /// Resolve a free-form postcode (full or area) to a known target.
    pub fn resolve(&self, postcode: &str) -> Option<&Target> {
        let area = area_of(postcode)?;
        self.targets.get(&TargetId::new(area))
    }
}

/// Uppercase, collapse whitespace and insert the inward-code space when missing
/// (`"m11aa"` → `"M1 1AA"`).
pub fn standardize_postcode(postcode: &str) -> String {
    let compact: String = postcode
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase();
    if compact.is_empty() {
        return compact;
    }

    let no_space: String = compact.chars().filter(|c| !c.is_whitespace()).collect();
    if is_full_postcode(&no_space) {
        let split = no_space.len() - 3;
        return format!("{} {}", &no_space[..split], &no_space[split..]);
    }
    compact
}

/// Outward code (area) of a postcode: `"SW1A 1AA"` → `"SW1A"`, `"M1"` → `"M1"`.
pub fn area_of(postcode: &str) -> Option<String> {
    let std = standardize_postcode(postcode);
    let head = std.split(' ').next()?;
    if head.is_empty() || !head.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(head.to_string())
}

// A1 1AA .. AA9A 9AA without the space.
fn is_full_postcode(s: &str) -> bool {
    static RE: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Z]{1,2}[0-9][A-Z0-9]?[0-9][A-Z]{2}$").expect("postcode regex")
    });
    re.is_match(s)
}

fn builtin_targets() -> Vec<Target> {
    use Level::{High, Low, Medium};
    vec![
        // Major cities
        Target::new("SW1A", "London", "London", High, High, 51.5074, -0.1278),
        Target::new("M1", "Manchester", "Greater Manchester", High, High, 53.4808, -2.2426),
        Target::new("B1", "Birmingham", "West Midlands", High, High, 52.4862, -1.8904),
        Target::new("G1", "Glasgow", "Scotland", High, High, 55.8642, -4.2518),
        Target::new("LS1", "Leeds", "West Yorkshire", High, High, 53.8008, -1.5491),
        Target::new("EH1", "Edinburgh", "Scotland", High, Medium, 55.9533, -3.1883),
        Target::new("L1", "Liverpool", "Merseyside", High, High, 53.4084, -2.9916),
        Target::new("S1", "Sheffield", "South Yorkshire", High, High, 53.3811, -1.4701),
        Target::new("BS1", "Bristol", "Somerset", High, High, 51.4545, -2.5879),
        Target::new("NE1", "Newcastle", "Tyne and Wear", High, Medium, 54.9783, -1.6178),
        // Commercial and industrial hubs
        Target::new("IG1", "Ilford", "Greater London", High, High, 51.5590, 0.0819),
        Target::new("DA1", "Dartford", "Kent", Medium, High, 51.4461, 0.2056),
        Target::new("RM1", "Romford", "Greater London", High, High, 51.5754, 0.1827),
        Target::new("UB1", "Southall", "Greater London", High, High, 51.5106, -0.3756),
        Target::new("CR0", "Croydon", "Greater London", High, High, 51.3762, -0.0982),
        Target::new("WD1", "Watford", "Hertfordshire", Medium, High, 51.6565, -0.3973),
        Target::new("SL1", "Slough", "Berkshire", Medium, High, 51.5105, -0.5950),
        Target::new("MK1", "Milton Keynes", "Buckinghamshire", Medium, High, 52.0406, -0.7594),
        Target::new("NN1", "Northampton", "Northamptonshire", Medium, High, 52.2405, -0.9027),
        Target::new("CV1", "Coventry", "West Midlands", Medium, High, 52.4068, -1.5197),
        // Regional centres
        Target::new("TR1", "Truro", "Cornwall", Low, Low, 50.2632, -5.0510),
        Target::new("EX1", "Exeter", "Devon", Medium, Medium, 50.7184, -3.5339),
        Target::new("BA1", "Bath", "Somerset", Medium, Low, 51.3758, -2.3599),
        Target::new("GL1", "Gloucester", "Gloucestershire", Medium, Medium, 51.8642, -2.2382),
        Target::new("HR1", "Hereford", "Herefordshire", Low, Medium, 52.0567, -2.7150),
        Target::new("SY1", "Shrewsbury", "Shropshire", Low, Medium, 52.7077, -2.7531),
        Target::new("ST1", "Stoke-on-Trent", "Staffordshire", Medium, Medium, 53.0027, -2.1794),
        Target::new("DE1", "Derby", "Derbyshire", Medium, High, 52.9225, -1.4746),
        Target::new("NG1", "Nottingham", "Nottinghamshire", High, High, 52.9548, -1.1581),
        Target::new("PE1", "Peterborough", "Cambridgeshire", Medium, High, 52.5695, -0.2405),
        // Scotland
        Target::new("AB1", "Aberdeen", "Scotland", Medium, High, 57.1497, -2.0943),
        Target::new("DD1", "Dundee", "Scotland", Medium, Medium, 56.4620, -2.9707),
        Target::new("FK1", "Falkirk", "Scotland", Medium, High, 56.0018, -3.7839),
        Target::new("KY1", "Kirkcaldy", "Scotland", Medium, Medium, 56.1132, -3.1563),
        // Wales
        Target::new("CF1", "Cardiff", "Wales", High, Medium, 51.4816, -3.1791),
        Target::new("SA1", "Swansea", "Wales", Medium, Medium, 51.6214, -3.9436),
        Target::new("NP1", "Newport", "Wales", Medium, Medium, 51.5842, -2.9977),
        // Northern Ireland
        Target::new("BT1", "Belfast", "Northern Ireland", High, Medium, 54.5973, -5.9301),
        // Mixed density
        Target::new("OX1", "Oxford", "Oxfordshire", Medium, Low, 51.7520, -1.2577),
        Target::new("CB1", "Cambridge", "Cambridgeshire", Medium, Low, 52.2053, 0.1218),
        Target::new("RG1", "Reading", "Berkshire", Medium, Medium, 51.4543, -0.9781),
        Target::new("GU1", "Guildford", "Surrey", Medium, Medium, 51.2362, -0.5704),
        Target::new("ME1", "Rochester", "Kent", Medium, Medium, 51.3886, 0.5041),
        Target::new("CT1", "Canterbury", "Kent", Medium, Low, 51.2802, 1.0789),
        Target::new("TN1", "Tunbridge Wells", "Kent", Medium, Low, 51.1328, 0.2634),
        Target::new("BN1", "Brighton", "East Sussex", Medium, Low, 50.8225, -0.1372),
        Target::new("PO1", "Portsmouth", "Hampshire", Medium, Medium, 50.8198, -1.0880),
        Target::new("SO1", "Southampton", "Hampshire", Medium, High, 50.9097, -1.4044),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_is_symmetric_and_zero_on_self() {
        let london = GeoPoint::new(51.5074, -0.1278);
        let manchester = GeoPoint::new(53.4808, -2.2426);
        let ab = haversine_km(london, manchester);
        let ba = haversine_km(manchester, london);
        assert!((ab - ba).abs() < 1e-9);
        assert_eq!(haversine_km(london, london), 0.0);
    }

    #[test]
    fn haversine_matches_known_distance() {
        // London ↔ Manchester is ~262 km great-circle.
        let d = haversine_km(
            GeoPoint::new(51.5074, -0.1278),
            GeoPoint::new(53.4808, -2.2426),
        );
        assert!((d - 262.0).abs() / 262.0 < 0.005, "got {d}");
    }

    #[test]
    fn builtin_table_is_populated() {
        let idx = GeoIndex::builtin();
        assert_eq!(idx.len(), 48);
        assert!(idx.regions().contains("Scotland"));
        let m1 = idx.get(&TargetId::new("m1")).expect("M1 present");
        assert_eq!(m1.name, "Manchester");
    }

    #[test]
    fn within_radius_filters_far_targets() {
        let idx = GeoIndex::builtin();
        let london = GeoPoint::new(51.5074, -0.1278);
        let near = idx.within_radius(london, 30.0);
        assert!(near.iter().any(|t| t.id.as_str() == "CR0"));
        assert!(near.iter().all(|t| t.id.as_str() != "G1"));
    }

    #[test]
    fn postcode_standardization() {
        assert_eq!(standardize_postcode("  m11aa "), "M1 1AA");
        assert_eq!(standardize_postcode("sw1a   1aa"), "SW1A 1AA");
        assert_eq!(standardize_postcode("LS1"), "LS1");
        assert_eq!(area_of("sw1a1aa").as_deref(), Some("SW1A"));
        assert_eq!(area_of("   "), None);
    }

    #[test]
    fn resolve_full_postcode_to_area() {
        let idx = GeoIndex::builtin();
        assert_eq!(idx.resolve("bs1 4dj").map(|t| t.name.as_str()), Some("Bristol"));
        assert!(idx.resolve("ZZ9 9ZZ").is_none());
    }
}
