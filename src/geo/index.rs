//! Grid-bucketed geospatial index.
//!
//! Members are bucketed into fixed-size lat/lng cells. A radius query walks
//! the cells covering the query's bounding box (or every occupied cell, when
//! that is cheaper) and then filters candidates with an exact haversine check
//! against each member's current position. The bounding box is a superset of
//! the query circle, so results match a linear haversine scan.

use std::collections::HashSet;
use std::f64::consts::{FRAC_PI_2, PI};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::geo::{haversine_km, EARTH_RADIUS_KM, GeoError, GeoPoint};
use crate::models::location::LiveLocation;

type Cell = (u32, u32);

// Widening applied to the bounding box so float rounding never drops a
// member that the exact haversine check would accept.
const BBOX_SLACK_RAD: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct Nearby {
    pub member_id: String,
    pub distance_km: f64,
}

pub struct GeoIndex {
    cell_degrees: f64,
    lat_cells: u32,
    lng_cells: u32,
    positions: DashMap<String, LiveLocation>,
    cells: DashMap<Cell, HashSet<String>>,
}

impl GeoIndex {
    pub fn new(cell_degrees: f64) -> Self {
        let cell_degrees = if cell_degrees.is_finite() && cell_degrees > 0.0 {
            cell_degrees.min(90.0)
        } else {
            0.25
        };

        Self {
            cell_degrees,
            lat_cells: (180.0 / cell_degrees).ceil() as u32,
            lng_cells: (360.0 / cell_degrees).ceil() as u32,
            positions: DashMap::new(),
            cells: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn get(&self, member_id: &str) -> Option<LiveLocation> {
        self.positions.get(member_id).map(|entry| entry.value().clone())
    }

    /// Inserts or moves a member. The member is added to its new cell before
    /// it leaves the old one, so concurrent queries never lose sight of it.
    pub fn upsert(&self, location: LiveLocation) -> Result<(), GeoError> {
        location.location.validate()?;
        let new_cell = self.cell_of(&location.location);

        match self.positions.entry(location.operator_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let old_cell = self.cell_of(&occupied.get().location);
                if old_cell != new_cell {
                    self.add_to_cell(new_cell, &location.operator_id);
                    self.remove_from_cell(old_cell, &location.operator_id);
                }
                occupied.insert(location);
            }
            Entry::Vacant(vacant) => {
                self.add_to_cell(new_cell, &location.operator_id);
                vacant.insert(location);
            }
        }

        Ok(())
    }

    pub fn remove(&self, member_id: &str) -> Option<LiveLocation> {
        match self.positions.entry(member_id.to_string()) {
            Entry::Occupied(occupied) => {
                let cell = self.cell_of(&occupied.get().location);
                self.remove_from_cell(cell, member_id);
                Some(occupied.remove())
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Members within `radius_km` of `center`, nearest first.
    pub fn query_radius(&self, center: &GeoPoint, radius_km: f64) -> Vec<Nearby> {
        if !(radius_km >= 0.0) || self.positions.is_empty() {
            return Vec::new();
        }

        let candidates = self.candidates(center, radius_km);

        let mut found: Vec<Nearby> = candidates
            .into_iter()
            .filter_map(|member_id| {
                let distance_km = {
                    let position = self.positions.get(&member_id)?;
                    haversine_km(center, &position.location)
                };
                (distance_km <= radius_km).then_some(Nearby {
                    member_id,
                    distance_km,
                })
            })
            .collect();

        found.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        found
    }

    fn candidates(&self, center: &GeoPoint, radius_km: f64) -> HashSet<String> {
        let ranges = self.cell_ranges(center, radius_km);
        let probes: u64 = ranges
            .iter()
            .map(|(lat, lng)| {
                u64::from(lat.1 - lat.0 + 1) * u64::from(lng.1 - lng.0 + 1)
            })
            .sum();

        let mut candidates = HashSet::new();

        if probes >= self.cells.len() as u64 {
            let in_range = |cell: &Cell| {
                ranges.iter().any(|(lat, lng)| {
                    (lat.0..=lat.1).contains(&cell.0) && (lng.0..=lng.1).contains(&cell.1)
                })
            };
            for entry in self.cells.iter() {
                if in_range(entry.key()) {
                    candidates.extend(entry.value().iter().cloned());
                }
            }
            return candidates;
        }

        for (lat, lng) in ranges {
            for lat_idx in lat.0..=lat.1 {
                for lng_idx in lng.0..=lng.1 {
                    if let Some(members) = self.cells.get(&(lat_idx, lng_idx)) {
                        candidates.extend(members.iter().cloned());
                    }
                }
            }
        }

        candidates
    }

    /// Cell index ranges (inclusive) covering the bounding box of the query
    /// circle. Two ranges come back when the box straddles the antimeridian.
    fn cell_ranges(&self, center: &GeoPoint, radius_km: f64) -> Vec<((u32, u32), (u32, u32))> {
        let full_lng = (0, self.lng_cells - 1);
        let angular = radius_km / EARTH_RADIUS_KM * (1.0 + BBOX_SLACK_RAD) + BBOX_SLACK_RAD;

        if angular >= PI {
            return vec![((0, self.lat_cells - 1), full_lng)];
        }

        let lat_rad = center.lat.to_radians();
        let min_lat = lat_rad - angular;
        let max_lat = lat_rad + angular;

        let lat_range = (
            self.lat_index(min_lat.to_degrees()),
            self.lat_index(max_lat.to_degrees()),
        );

        // Pole inside the circle: every longitude is reachable.
        if min_lat <= -FRAC_PI_2 || max_lat >= FRAC_PI_2 {
            return vec![(lat_range, full_lng)];
        }

        let ratio = angular.sin() / lat_rad.cos();
        if !(ratio < 1.0) {
            return vec![(lat_range, full_lng)];
        }

        let delta_lng = (ratio.asin() * (1.0 + BBOX_SLACK_RAD) + BBOX_SLACK_RAD).to_degrees();
        let west = center.lng - delta_lng;
        let east = center.lng + delta_lng;

        if east - west >= 360.0 {
            return vec![(lat_range, full_lng)];
        }

        let mut ranges = Vec::with_capacity(2);
        if west < -180.0 {
            ranges.push((lat_range, (self.lng_index(west + 360.0), self.lng_cells - 1)));
            ranges.push((lat_range, (0, self.lng_index(east))));
        } else if east > 180.0 {
            ranges.push((lat_range, (self.lng_index(west), self.lng_cells - 1)));
            ranges.push((lat_range, (0, self.lng_index(east - 360.0))));
        } else {
            ranges.push((lat_range, (self.lng_index(west), self.lng_index(east))));
        }
        ranges
    }

    fn cell_of(&self, point: &GeoPoint) -> Cell {
        (self.lat_index(point.lat), self.lng_index(point.lng))
    }

    fn lat_index(&self, lat: f64) -> u32 {
        let idx = ((lat.clamp(-90.0, 90.0) + 90.0) / self.cell_degrees).floor();
        (idx as u32).min(self.lat_cells - 1)
    }

    fn lng_index(&self, lng: f64) -> u32 {
        let idx = ((lng.clamp(-180.0, 180.0) + 180.0) / self.cell_degrees).floor();
        (idx as u32).min(self.lng_cells - 1)
    }

    fn add_to_cell(&self, cell: Cell, member_id: &str) {
        self.cells
            .entry(cell)
            .or_default()
            .insert(member_id.to_string());
    }

    fn remove_from_cell(&self, cell: Cell, member_id: &str) {
        if let Entry::Occupied(mut occupied) = self.cells.entry(cell) {
            occupied.get_mut().remove(member_id);
            if occupied.get().is_empty() {
                occupied.remove();
            }
        }
    }
}
