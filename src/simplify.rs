use crate::types::AreaFeature;
use geo::{CoordsIter, MultiPolygon, Simplify, SimplifyVwPreserve, Validation};
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SimplifyStats {
    pub simplified: usize,
    pub kept: usize,
    /// Rows where Douglas-Peucker broke validity and the area-based fallback was used.
    pub fallbacks: usize,
    pub vertices_before: usize,
    pub vertices_after: usize,
}

/// Simplifies every feature whose `name_column` is not one of `major_cities`.
/// Major-city geometries are left untouched.
pub fn simplify_outside_cities(
    features: &mut [AreaFeature],
    name_column: &str,
    major_cities: &[String],
    tolerance: f64,
) -> SimplifyStats {
    let cities: HashSet<&str> = major_cities.iter().map(|c| c.as_str()).collect();
    let mut stats = SimplifyStats::default();

    for feature in features.iter_mut() {
        let is_major = feature.properties.get(name_column)
            .and_then(|v| v.as_str())
            .map(|name| cities.contains(name))
            .unwrap_or(false);

        if is_major {
            stats.kept += 1;
            continue;
        }

        let before = feature.geometry.coords_count();
        let (geometry, fell_back) = simplify_geometry(&feature.geometry, tolerance);
        stats.vertices_before += before;
        stats.vertices_after += geometry.coords_count();
        stats.simplified += 1;
        if fell_back {
            stats.fallbacks += 1;
        }
        feature.geometry = geometry;
    }

    info!(
        "Simplified {} areas ({} -> {} vertices), kept {} city areas at full resolution",
        stats.simplified, stats.vertices_before, stats.vertices_after, stats.kept
    );
    if stats.fallbacks > 0 {
        debug!("{} areas needed the topology-preserving fallback", stats.fallbacks);
    }

    stats
}

/// Douglas-Peucker at `tolerance`, falling back to topology-preserving Visvalingam-Whyatt
/// when the result is invalid, and to the input when even that is invalid.
pub fn simplify_geometry(geometry: &MultiPolygon<f64>, tolerance: f64) -> (MultiPolygon<f64>, bool) {
    let candidate = geometry.simplify(&tolerance);
    if candidate.is_valid() {
        return (candidate, false);
    }

    // VW thresholds on triangle area, so square the distance.
    let candidate = geometry.simplify_vw_preserve(&(tolerance * tolerance));
    if candidate.is_valid() || !geometry.is_valid() {
        return (candidate, true);
    }

    (geometry.clone(), true)
}
