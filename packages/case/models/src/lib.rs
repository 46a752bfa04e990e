#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Patient case record types shared across the episignal system.
//!
//! A [`PatientCase`] is one geotagged, syndrome-labelled case record.
//! Cases are created and geocoded by external collaborators; the
//! clustering engine only reads them. This crate also defines the
//! administrative-hierarchy location codes used to seed deterministic
//! cluster identifiers.

use chrono::NaiveDate;
use geo::{Contains, Rect, coord};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Urban/rural classification of the patient's residence area.
///
/// Decides which clustering strategy applies: `Rural` cases go through
/// administrative grouping (ABC), `Urban` cases through density-based
/// spatial clustering (GIS).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
pub enum AreaType {
    /// Urban residence; clustered on exact coordinates.
    Urban,
    /// Rural residence; clustered on village + syndrome.
    Rural,
}

/// Administrative hierarchy of a case, coarsest to finest.
///
/// All fields are optional — upstream registration forms leave any of
/// them blank, and a blank field simply drops out of the location code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminHierarchy {
    /// State name.
    pub state: Option<String>,
    /// District name.
    pub district: Option<String>,
    /// Subdistrict (tehsil/taluk) name.
    pub subdistrict: Option<String>,
    /// Village name. Required for rural (ABC) grouping.
    pub village: Option<String>,
}

impl AdminHierarchy {
    /// Concatenation of the first letters of each non-empty hierarchy
    /// field, uppercased. `"UNK"` when every field is empty.
    ///
    /// E.g. `(Kerala, Ernakulam, Kochi, Palluruthy)` -> `"KEKP"`.
    #[must_use]
    pub fn location_code(&self) -> String {
        let code: String = [&self.state, &self.district, &self.subdistrict, &self.village]
            .into_iter()
            .filter_map(|part| {
                part.as_deref()
                    .and_then(|p| p.trim().chars().next())
                    .map(|c| c.to_ascii_uppercase())
            })
            .collect();

        if code.is_empty() {
            "UNK".to_string()
        } else {
            code
        }
    }
}

/// One geotagged patient case record, immutable once geocoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientCase {
    /// Unique case identifier from the upstream registry.
    pub unique_id: String,
    /// Calendar date the case was entered.
    pub entry_date: NaiveDate,
    /// Urban/rural classification.
    pub area_type: AreaType,
    /// Free-text primary syndrome label (e.g. "Acute Diarrheal Disease").
    pub syndrome: String,
    /// Administrative location of the patient's residence.
    pub admin: AdminHierarchy,
    /// Geocoded latitude (WGS84). `None` until geocoding completes.
    pub latitude: Option<f64>,
    /// Geocoded longitude (WGS84). `None` until geocoding completes.
    pub longitude: Option<f64>,
    /// Free-form address text as captured at registration.
    pub address: Option<String>,
}

impl PatientCase {
    /// Returns the coordinate pair when both components are geocoded.
    #[must_use]
    pub const fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }

    /// Whether the case carries usable coordinates inside the national
    /// bounding box.
    #[must_use]
    pub fn has_valid_coordinates(&self, bounds: &GeoBounds) -> bool {
        self.coordinates()
            .is_some_and(|(lat, lon)| bounds.contains(lat, lon))
    }

    /// Whether the case has any address signal at all (street address or
    /// a named village). Cases without one geocode too coarsely to be
    /// trusted for density clustering.
    #[must_use]
    pub fn has_address_signal(&self) -> bool {
        let non_empty = |s: &Option<String>| s.as_deref().is_some_and(|v| !v.trim().is_empty());
        non_empty(&self.address) || non_empty(&self.admin.village)
    }
}

/// Geographic bounding box for plausible case coordinates.
///
/// Geocodes falling outside are treated as failures (e.g. a country
/// centroid returned for an unresolvable address).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    /// Minimum latitude.
    pub lat_min: f64,
    /// Maximum latitude.
    pub lat_max: f64,
    /// Minimum longitude.
    pub lon_min: f64,
    /// Maximum longitude.
    pub lon_max: f64,
}

impl GeoBounds {
    /// National bounding box (approx. India): lat 8-37, lon 68-97.
    pub const NATIONAL: Self = Self {
        lat_min: 8.0,
        lat_max: 37.0,
        lon_min: 68.0,
        lon_max: 97.0,
    };

    /// Whether `(lat, lon)` falls inside the box. `(0, 0)` never does.
    #[must_use]
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        let rect = Rect::new(
            coord! { x: self.lon_min, y: self.lat_min },
            coord! { x: self.lon_max, y: self.lat_max },
        );
        rect.contains(&coord! { x: lon, y: lat })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hierarchy(
        state: &str,
        district: &str,
        subdistrict: &str,
        village: &str,
    ) -> AdminHierarchy {
        let opt = |s: &str| (!s.is_empty()).then(|| s.to_string());
        AdminHierarchy {
            state: opt(state),
            district: opt(district),
            subdistrict: opt(subdistrict),
            village: opt(village),
        }
    }

    #[test]
    fn location_code_takes_first_letters() {
        assert_eq!(
            hierarchy("Kerala", "Ernakulam", "Kochi", "Palluruthy").location_code(),
            "KEKP"
        );
    }

    #[test]
    fn location_code_skips_empty_fields() {
        assert_eq!(hierarchy("Kerala", "", "", "Palluruthy").location_code(), "KP");
        assert_eq!(hierarchy("", "", "", "").location_code(), "UNK");
    }

    #[test]
    fn location_code_trims_and_uppercases() {
        assert_eq!(hierarchy(" kerala", "  ernakulam", "", "").location_code(), "KE");
    }

    #[test]
    fn national_bounds_containment() {
        let bounds = GeoBounds::NATIONAL;
        assert!(bounds.contains(12.97, 77.59));
        assert!(!bounds.contains(0.0, 0.0));
        assert!(!bounds.contains(51.5, -0.12));
    }
}
