//! Planar geometry over location samples, used by the KML export.
//!
//! Coordinates are treated as a flat plane with x = longitude and
//! y = latitude. At the distances a single monitoring session covers the
//! distortion is negligible.
//!
//! - [`convex_hull`]: Graham scan, counter-clockwise boundary.
//! - [`simplify_path`]: Ramer-Douglas-Peucker over observation-ordered samples.

use std::cmp::Ordering;

use crate::geo::GeoLocation;

/// RDP tolerance in degrees (about 11 m of latitude).
pub const PATH_TOLERANCE_DEG: f64 = 0.0001;

/// Cross product of `o->a` and `o->b`. Positive for a counter-clockwise turn.
fn cross(o: &GeoLocation, a: &GeoLocation, b: &GeoLocation) -> f64 {
    (a.longitude - o.longitude) * (b.latitude - o.latitude)
        - (a.latitude - o.latitude) * (b.longitude - o.longitude)
}

fn distance(a: &GeoLocation, b: &GeoLocation) -> f64 {
    (b.longitude - a.longitude).hypot(b.latitude - a.latitude)
}

// ---------------------------------------------------------------------------
// Convex hull
// ---------------------------------------------------------------------------

/// Counter-clockwise convex boundary of `points`, not closed.
///
/// Fewer than 3 points come back unchanged. Exactly 3 are only reordered
/// to counter-clockwise. Colinear boundary points are dropped.
pub fn convex_hull(points: &[GeoLocation]) -> Vec<GeoLocation> {
    match points.len() {
        0..=2 => return points.to_vec(),
        3 => {
            let (a, b, c) = (points[0], points[1], points[2]);
            return if cross(&a, &b, &c) < 0.0 {
                vec![a, c, b]
            } else {
                vec![a, b, c]
            };
        }
        _ => {}
    }

    // Pivot: lowest latitude, leftmost on ties.
    let mut rest = points.to_vec();
    let pivot_idx = rest
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            a.latitude
                .total_cmp(&b.latitude)
                .then(a.longitude.total_cmp(&b.longitude))
        })
        .map(|(i, _)| i)
        .unwrap_or(0);
    let pivot = rest.swap_remove(pivot_idx);

    let angle = |p: &GeoLocation| (p.latitude - pivot.latitude).atan2(p.longitude - pivot.longitude);
    rest.sort_by(|a, b| {
        angle(a)
            .total_cmp(&angle(b))
            .then_with(|| distance(&pivot, a).total_cmp(&distance(&pivot, b)))
    });

    let mut hull: Vec<GeoLocation> = vec![pivot];
    for p in rest {
        while hull.len() >= 2 && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], &p) <= 0.0 {
            hull.pop();
        }
        hull.push(p);
    }
    hull
}

/// `points` with repeated coordinates removed, first occurrence kept.
pub fn distinct_points(points: &[GeoLocation]) -> Vec<GeoLocation> {
    let mut seen = std::collections::HashSet::new();
    points
        .iter()
        .filter(|p| seen.insert((p.latitude.to_bits(), p.longitude.to_bits())))
        .copied()
        .collect()
}

/// Unsigned shoelace area of an open ring, in square degrees.
pub fn polygon_area(ring: &[GeoLocation]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let twice: f64 = ring
        .iter()
        .zip(ring.iter().cycle().skip(1))
        .map(|(a, b)| a.longitude * b.latitude - b.longitude * a.latitude)
        .sum();
    twice.abs() / 2.0
}

/// `ring` with its first point appended, as KML polygons require.
pub fn closed_ring(ring: &[GeoLocation]) -> Vec<GeoLocation> {
    let mut closed = ring.to_vec();
    if let Some(first) = ring.first() {
        if ring.len() > 1 {
            closed.push(*first);
        }
    }
    closed
}

// ---------------------------------------------------------------------------
// Path simplification
// ---------------------------------------------------------------------------

/// Distance from `p` to the infinite line through `a` and `b`.
/// Falls back to point distance when `a` and `b` coincide.
pub fn perpendicular_distance(p: &GeoLocation, a: &GeoLocation, b: &GeoLocation) -> f64 {
    let len = distance(a, b);
    if len == 0.0 {
        return distance(a, p);
    }
    cross(a, b, p).abs() / len
}

/// Ramer-Douglas-Peucker. Endpoints are always kept.
pub fn douglas_peucker(points: &[GeoLocation], tolerance: f64) -> Vec<GeoLocation> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let (first, last) = (&points[0], &points[points.len() - 1]);
    let (split, max_dist) = points[1..points.len() - 1]
        .iter()
        .enumerate()
        .map(|(i, p)| (i + 1, perpendicular_distance(p, first, last)))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
        .unwrap_or((0, 0.0));

    if max_dist <= tolerance {
        return vec![*first, *last];
    }

    let mut left = douglas_peucker(&points[..=split], tolerance);
    let right = douglas_peucker(&points[split..], tolerance);
    left.pop();
    left.extend(right);
    left
}

/// Simplify a device path with [`PATH_TOLERANCE_DEG`].
pub fn simplify_path(points: &[GeoLocation]) -> Vec<GeoLocation> {
    douglas_peucker(points, PATH_TOLERANCE_DEG)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
