use core::fmt;
use core::ops;

use serde::{Deserialize, Serialize};

use crate::error::BoostError;
use crate::tuning::{BUCKET_COUNT, LOAD_BAND_COUNT, LOAD_BAND_EDGES_PCT, RPM_BAND_EDGES};
use crate::types::TorqueRequest;

/// Operating point cell: engine speed band by requested-load band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct OperatingBucket(u8);

impl OperatingBucket {
    /// Bucket used when no fresh torque request identifies the operating
    /// point. Nothing is learned there.
    pub const IDLE: OperatingBucket = OperatingBucket(0);

    pub fn from_operating_point(engine_rpm: u16, load_pct: f32) -> Self {
        let rpm_band = RPM_BAND_EDGES
            .iter()
            .position(|edge| engine_rpm < *edge)
            .unwrap_or(RPM_BAND_EDGES.len());

        // NaN load falls into the lowest band
        let load_band = LOAD_BAND_EDGES_PCT
            .iter()
            .position(|edge| !(load_pct >= *edge))
            .unwrap_or(LOAD_BAND_EDGES_PCT.len());

        OperatingBucket((rpm_band * LOAD_BAND_COUNT + load_band) as u8)
    }

    pub fn from_request(request: Option<&TorqueRequest>) -> Self {
        request.map_or(OperatingBucket::IDLE, |r| {
            OperatingBucket::from_operating_point(r.engine_rpm, r.demand_pct)
        })
    }

    pub fn from_index(index: usize) -> Option<Self> {
        if index < BUCKET_COUNT {
            Some(OperatingBucket(index as u8))
        } else {
            None
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn rpm_band(self) -> usize {
        self.index() / LOAD_BAND_COUNT
    }

    pub fn load_band(self) -> usize {
        self.index() % LOAD_BAND_COUNT
    }

    pub fn all() -> impl Iterator<Item = OperatingBucket> {
        (0..BUCKET_COUNT as u8).map(OperatingBucket)
    }
}

impl TryFrom<u8> for OperatingBucket {
    type Error = BoostError;

    fn try_from(index: u8) -> Result<Self, Self::Error> {
        OperatingBucket::from_index(usize::from(index)).ok_or(BoostError::InvalidBucket(index))
    }
}

impl From<OperatingBucket> for u8 {
    fn from(b: OperatingBucket) -> u8 {
        b.0
    }
}

impl fmt::Display for OperatingBucket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (rpm band {}, load band {})", self.0, self.rpm_band(), self.load_band())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TrimEntry {
    /// Correction as a fraction of full scale.
    pub trim: f32,
    /// Consecutive low-error observations, saturating.
    pub confidence: u16,
    /// Observations that reached this entry.
    pub samples: u32,
}

/// Versioned set of trims, one per operating bucket.
///
/// Copied by value into each control cycle. Only the learning engine
/// mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrimTable {
    pub version: u32,
    pub entries: [TrimEntry; BUCKET_COUNT],
}

impl TrimTable {
    pub const fn new() -> Self {
        TrimTable {
            version: 0,
            entries: [TrimEntry {
                trim: 0.0,
                confidence: 0,
                samples: 0,
            }; BUCKET_COUNT],
        }
    }

    pub fn trim(&self, bucket: OperatingBucket) -> f32 {
        self[bucket].trim
    }

    /// First entry whose trim is not finite or exceeds `bound`.
    pub fn first_out_of_bounds(&self, bound: f32) -> Option<(OperatingBucket, f32)> {
        self.iter()
            .map(|(b, e)| (b, e.trim))
            .find(|(_, t)| !t.is_finite() || t.abs() > bound)
    }

    pub fn iter(&self) -> impl Iterator<Item = (OperatingBucket, &TrimEntry)> {
        OperatingBucket::all().zip(self.entries.iter())
    }
}

impl Default for TrimTable {
    fn default() -> Self {
        TrimTable::new()
    }
}

impl ops::Index<OperatingBucket> for TrimTable {
    type Output = TrimEntry;

    fn index(&self, b: OperatingBucket) -> &TrimEntry {
        &self.entries[b.index()]
    }
}

impl ops::IndexMut<OperatingBucket> for TrimTable {
    fn index_mut(&mut self, b: OperatingBucket) -> &mut TrimEntry {
        &mut self.entries[b.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuning::RPM_BAND_COUNT;

    #[test]
    fn bucket_bands() {
        let b = OperatingBucket::from_operating_point(0, 0.0);
        assert_eq!(b, OperatingBucket::IDLE);

        let b = OperatingBucket::from_operating_point(2200, 60.0);
        assert_eq!(b.rpm_band(), 2);
        assert_eq!(b.load_band(), 2);

        let b = OperatingBucket::from_operating_point(u16::MAX, 100.0);
        assert_eq!(b.index(), BUCKET_COUNT - 1);
        assert_eq!(b.rpm_band(), RPM_BAND_COUNT - 1);
    }

    #[test]
    fn band_edges_belong_to_upper_band() {
        let below = OperatingBucket::from_operating_point(1499, 24.9);
        let at = OperatingBucket::from_operating_point(1500, 25.0);
        assert_eq!((below.rpm_band(), below.load_band()), (0, 0));
        assert_eq!((at.rpm_band(), at.load_band()), (1, 1));
    }

    #[test]
    fn nan_load_is_lowest_band() {
        let b = OperatingBucket::from_operating_point(3000, f32::NAN);
        assert_eq!(b.load_band(), 0);
    }

    #[test]
    fn absent_request_uses_idle_bucket() {
        assert_eq!(OperatingBucket::from_request(None), OperatingBucket::IDLE);
    }

    #[test]
    fn out_of_bounds_detection() {
        let mut table = TrimTable::new();
        assert_eq!(table.first_out_of_bounds(0.25), None);

        let b = OperatingBucket::from_index(7).unwrap();
        table[b].trim = -0.3;
        assert_eq!(table.first_out_of_bounds(0.25), Some((b, -0.3)));

        table[b].trim = f32::NAN;
        assert!(table.first_out_of_bounds(0.25).is_some());
    }

    #[test]
    fn index_out_of_range() {
        assert!(OperatingBucket::from_index(BUCKET_COUNT).is_none());
    }

    #[test]
    fn deserialize_rejects_out_of_range_bucket() {
        let last = serde_json::to_string(&(BUCKET_COUNT - 1)).unwrap();
        let b: OperatingBucket = serde_json::from_str(&last).unwrap();
        assert_eq!(b.index(), BUCKET_COUNT - 1);

        for json in ["32", "255"] {
            assert!(serde_json::from_str::<OperatingBucket>(json).is_err(), "{}", json);
        }
    }
}
