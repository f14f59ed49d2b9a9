//! WGS-84 geometry kernel: coordinates, geometries, bounding boxes, and the
//! pure spatial predicates the registry and federation engine build on.
//!
//! Every function here is stateless. Nothing in this crate touches a clock,
//! a socket, or a store.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mean WGS-84 radius used for great-circle math, in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("sphere radius {0} must be in (0, 1_000_000] meters")]
    RadiusOutOfRange(f64),
    #[error("polygon must have at least 3 vertices, got {0}")]
    TooFewVertices(usize),
    #[error("polygon height {0} must be >= 0")]
    NegativeHeight(f64),
    #[error("polygon edges {0} and {1} self-intersect")]
    SelfIntersecting(usize, usize),
    #[error("search range {0} must be >= 0")]
    NegativeRange(f64),
}

/// A WGS-84 point: degrees of latitude/longitude, meters of elevation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
    pub ele: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64, ele: f64) -> Self {
        Self { lat, lon, ele }
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(GeometryError::LatitudeOutOfRange(self.lat));
        }
        if !(-180.0..=180.0).contains(&self.lon) {
            return Err(GeometryError::LongitudeOutOfRange(self.lon));
        }
        Ok(())
    }
}

/// A bounded geographic volume. Tagged by `type` on the wire; never model
/// this via trait objects, the set of shapes is closed and small.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Geometry {
    Sphere { center: Coordinate, radius: f64 },
    Polygon { vertices: Vec<Coordinate>, height: f64 },
}

impl Geometry {
    pub fn validate(&self) -> Result<(), GeometryError> {
        match self {
            Geometry::Sphere { center, radius } => {
                center.validate()?;
                if !(*radius > 0.0 && *radius <= 1_000_000.0) {
                    return Err(GeometryError::RadiusOutOfRange(*radius));
                }
                Ok(())
            }
            Geometry::Polygon { vertices, height } => {
                if vertices.len() < 3 {
                    return Err(GeometryError::TooFewVertices(vertices.len()));
                }
                if *height < 0.0 {
                    return Err(GeometryError::NegativeHeight(*height));
                }
                for v in vertices {
                    v.validate()?;
                }
                validate_non_self_intersecting(vertices)
            }
        }
    }
}

/// Axis-aligned envelope of a [Geometry], used for coarse index lookups.
/// `wraps` marks a box that straddles the antimeridian: the box then
/// represents the union of `[min_lon, 180]` and `[-180, max_lon]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
    pub wraps: bool,
}

impl BoundingBox {
    /// Whether a longitude value falls within this box, honoring `wraps`.
    pub fn contains_lon(&self, lon: f64) -> bool {
        if self.wraps {
            lon >= self.min_lon || lon <= self.max_lon
        } else {
            lon >= self.min_lon && lon <= self.max_lon
        }
    }

    pub fn contains_point(&self, point: &Coordinate) -> bool {
        point.lat >= self.min_lat && point.lat <= self.max_lat && self.contains_lon(point.lon)
    }
}

fn normalize_lon(lon: f64) -> f64 {
    let wrapped = ((lon + 180.0).rem_euclid(360.0)) - 180.0;
    if wrapped == -180.0 && lon > 0.0 {
        180.0
    } else {
        wrapped
    }
}

/// Compute the bounding box of a [Geometry].
pub fn bbox(geometry: &Geometry) -> BoundingBox {
    match geometry {
        Geometry::Sphere { center, radius } => sphere_bbox(center, *radius),
        Geometry::Polygon { vertices, .. } => polygon_bbox(vertices),
    }
}

fn sphere_bbox(center: &Coordinate, radius: f64) -> BoundingBox {
    let lat_extent_deg = radius * 180.0 / (std::f64::consts::PI * EARTH_RADIUS_M);

    let raw_min_lat = center.lat - lat_extent_deg;
    let raw_max_lat = center.lat + lat_extent_deg;
    let pole_crossed = raw_min_lat < -90.0 || raw_max_lat > 90.0;
    let min_lat = raw_min_lat.max(-90.0);
    let max_lat = raw_max_lat.min(90.0);

    if pole_crossed {
        return BoundingBox {
            min_lat,
            max_lat,
            min_lon: -180.0,
            max_lon: 180.0,
            wraps: false,
        };
    }

    // Longitude degrees-per-meter grows with latitude; use the pole-ward
    // edge of the cap (the larger |lat|) so the envelope never undershoots.
    let worst_case_lat = if center.lat.abs() + lat_extent_deg >= 90.0 {
        89.999
    } else {
        center.lat.abs() + lat_extent_deg
    };
    let cos_lat = worst_case_lat.to_radians().cos().max(1e-9);
    let lon_extent_deg = lat_extent_deg / cos_lat;

    if lon_extent_deg >= 180.0 {
        return BoundingBox {
            min_lat,
            max_lat,
            min_lon: -180.0,
            max_lon: 180.0,
            wraps: false,
        };
    }

    let norm_min = normalize_lon(center.lon - lon_extent_deg);
    let norm_max = normalize_lon(center.lon + lon_extent_deg);
    let wraps = norm_min > norm_max;

    BoundingBox {
        min_lat,
        max_lat,
        min_lon: norm_min,
        max_lon: norm_max,
        wraps,
    }
}

fn polygon_bbox(vertices: &[Coordinate]) -> BoundingBox {
    let min_lat = vertices.iter().map(|v| v.lat).fold(f64::INFINITY, f64::min);
    let max_lat = vertices
        .iter()
        .map(|v| v.lat)
        .fold(f64::NEG_INFINITY, f64::max);

    let naive_min_lon = vertices.iter().map(|v| v.lon).fold(f64::INFINITY, f64::min);
    let naive_max_lon = vertices
        .iter()
        .map(|v| v.lon)
        .fold(f64::NEG_INFINITY, f64::max);

    if naive_max_lon - naive_min_lon <= 180.0 {
        return BoundingBox {
            min_lat,
            max_lat,
            min_lon: naive_min_lon,
            max_lon: naive_max_lon,
            wraps: false,
        };
    }

    // Candidate wrap interpretation: shift negative longitudes east by a
    // full turn and see if that produces a tighter envelope.
    let shifted: Vec<f64> = vertices
        .iter()
        .map(|v| if v.lon < 0.0 { v.lon + 360.0 } else { v.lon })
        .collect();
    let shifted_min = shifted.iter().cloned().fold(f64::INFINITY, f64::min);
    let shifted_max = shifted.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    if shifted_max - shifted_min < naive_max_lon - naive_min_lon {
        let max_lon = if shifted_max > 180.0 {
            shifted_max - 360.0
        } else {
            shifted_max
        };
        BoundingBox {
            min_lat,
            max_lat,
            min_lon: shifted_min,
            max_lon,
            wraps: true,
        }
    } else {
        BoundingBox {
            min_lat,
            max_lat,
            min_lon: naive_min_lon,
            max_lon: naive_max_lon,
            wraps: false,
        }
    }
}

/// Great-circle surface distance between two points, ignoring elevation.
pub fn surface_distance(a: &Coordinate, b: &Coordinate) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let sin_dlat = (dlat / 2.0).sin();
    let sin_dlon = (dlon / 2.0).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.min(1.0).sqrt().asin();
    EARTH_RADIUS_M * c
}

/// 3-D distance: great-circle surface distance combined with the elevation
/// delta. This is the value reported to clients in search results.
pub fn distance(a: &Coordinate, b: &Coordinate) -> f64 {
    let surface = surface_distance(a, b);
    let dele = b.ele - a.ele;
    (surface * surface + dele * dele).sqrt()
}

/// Project a point to local meters relative to an origin, using an
/// equirectangular approximation scaled by the origin's latitude. Good
/// enough at the scale this service operates at (registrations bounded to
/// a 1,000 km sphere).
fn project(origin: &Coordinate, point: &Coordinate) -> (f64, f64) {
    let deg_to_m = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;
    let cos_lat = origin.lat.to_radians().cos();
    let x = (point.lon - origin.lon) * cos_lat * deg_to_m;
    let y = (point.lat - origin.lat) * deg_to_m;
    (x, y)
}

fn centroid(vertices: &[Coordinate]) -> (f64, f64) {
    let n = vertices.len() as f64;
    let lat = vertices.iter().map(|v| v.lat).sum::<f64>() / n;
    let lon = vertices.iter().map(|v| v.lon).sum::<f64>() / n;
    (lat, lon)
}

fn min_elevation(vertices: &[Coordinate]) -> f64 {
    vertices
        .iter()
        .map(|v| v.ele)
        .fold(f64::INFINITY, f64::min)
}

/// Longitude-unwrapped copies of a polygon's vertices plus a matching point,
/// so that ray-casting and edge-distance math never have to reason about the
/// antimeridian directly.
fn unwrap_for_polygon(vertices: &[Coordinate], point: &Coordinate) -> (Vec<Coordinate>, Coordinate) {
    let bbox = polygon_bbox(vertices);
    if !bbox.wraps {
        return (vertices.to_vec(), *point);
    }
    let shift = |lon: f64| if lon < 0.0 { lon + 360.0 } else { lon };
    let shifted_vertices = vertices
        .iter()
        .map(|v| Coordinate::new(v.lat, shift(v.lon), v.ele))
        .collect();
    let shifted_point = Coordinate::new(point.lat, shift(point.lon), point.ele);
    (shifted_vertices, shifted_point)
}

/// Ray-cast point-in-polygon test on the 2-D footprint (elevation ignored).
fn point_in_footprint(vertices: &[Coordinate], point: &Coordinate) -> bool {
    let origin = vertices[0];
    let poly: Vec<(f64, f64)> = vertices.iter().map(|v| project(&origin, v)).collect();
    let (px, py) = project(&origin, point);

    let mut inside = false;
    let n = poly.len();
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = poly[i];
        let (xj, yj) = poly[j];
        if ((yi > py) != (yj > py)) && (px < (xj - xi) * (py - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Minimum distance in meters from `point` to the polygon's boundary edges,
/// in the horizontal plane.
fn distance_to_footprint_edges(vertices: &[Coordinate], point: &Coordinate) -> f64 {
    let origin = vertices[0];
    let poly: Vec<(f64, f64)> = vertices.iter().map(|v| project(&origin, v)).collect();
    let (px, py) = project(&origin, point);

    let n = poly.len();
    let mut best = f64::INFINITY;
    for i in 0..n {
        let (ax, ay) = poly[i];
        let (bx, by) = poly[(i + 1) % n];
        best = best.min(point_to_segment_distance(px, py, ax, ay, bx, by));
    }
    best
}

fn point_to_segment_distance(px: f64, py: f64, ax: f64, ay: f64, bx: f64, by: f64) -> f64 {
    let (dx, dy) = (bx - ax, by - ay);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq > 0.0 {
        (((px - ax) * dx + (py - ay) * dy) / len_sq).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let (cx, cy) = (ax + t * dx, ay + t * dy);
    ((px - cx).powi(2) + (py - cy).powi(2)).sqrt()
}

/// Does `geometry` contain `point`?
pub fn contains_point(geometry: &Geometry, point: &Coordinate) -> bool {
    match geometry {
        Geometry::Sphere { center, radius } => distance(center, point) <= *radius,
        Geometry::Polygon { vertices, height } => {
            let (shifted_vertices, shifted_point) = unwrap_for_polygon(vertices, point);
            let min_ele = min_elevation(&shifted_vertices);
            let ele_ok = shifted_point.ele >= min_ele && shifted_point.ele <= min_ele + height;
            ele_ok && point_in_footprint(&shifted_vertices, &shifted_point)
        }
    }
}

/// Distance in meters from `point` to the nearest point on `geometry`'s
/// surface: zero if `point` is inside. For a sphere this is the gap to its
/// surface along the line to the center; for a polygon it is the distance
/// to the nearest point on the extruded prism (boundary edges plus the
/// elevation band `[min_vertex_ele, min_vertex_ele + height]`).
pub fn nearest_point_distance(geometry: &Geometry, point: &Coordinate) -> f64 {
    match geometry {
        Geometry::Sphere { center, radius } => (distance(center, point) - radius).max(0.0),
        Geometry::Polygon { vertices, height } => {
            let (shifted_vertices, shifted_point) = unwrap_for_polygon(vertices, point);
            let min_ele = min_elevation(&shifted_vertices);
            let max_ele = min_ele + height;

            let vertical_gap = if shifted_point.ele < min_ele {
                min_ele - shifted_point.ele
            } else if shifted_point.ele > max_ele {
                shifted_point.ele - max_ele
            } else {
                0.0
            };

            let horizontal_gap = if point_in_footprint(&shifted_vertices, &shifted_point) {
                0.0
            } else {
                distance_to_footprint_edges(&shifted_vertices, &shifted_point)
            };

            (horizontal_gap * horizontal_gap + vertical_gap * vertical_gap).sqrt()
        }
    }
}

/// Does a query sphere of `range` meters at `center` intersect `geometry`?
pub fn intersects(geometry: &Geometry, center: &Coordinate, range: f64) -> bool {
    nearest_point_distance(geometry, center) <= range
}

/// Volume in cubic meters, used only to order search results "inside-out".
pub fn volume(geometry: &Geometry) -> f64 {
    match geometry {
        Geometry::Sphere { radius, .. } => (4.0 / 3.0) * std::f64::consts::PI * radius.powi(3),
        Geometry::Polygon { vertices, height } => {
            let (clat, clon) = centroid(vertices);
            let origin = Coordinate::new(clat, clon, 0.0);
            let poly: Vec<(f64, f64)> = vertices.iter().map(|v| project(&origin, v)).collect();

            let n = poly.len();
            let mut area2 = 0.0;
            for i in 0..n {
                let (xi, yi) = poly[i];
                let (xj, yj) = poly[(i + 1) % n];
                area2 += xi * yj - xj * yi;
            }
            let footprint_area = (area2 / 2.0).abs();
            footprint_area * height
        }
    }
}

fn segments_intersect(
    p1: (f64, f64),
    p2: (f64, f64),
    p3: (f64, f64),
    p4: (f64, f64),
) -> bool {
    fn cross(o: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
        (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
    }
    let d1 = cross(p3, p4, p1);
    let d2 = cross(p3, p4, p2);
    let d3 = cross(p1, p2, p3);
    let d4 = cross(p1, p2, p4);
    ((d1 > 0.0) != (d2 > 0.0)) && ((d3 > 0.0) != (d4 > 0.0))
}

fn validate_non_self_intersecting(vertices: &[Coordinate]) -> Result<(), GeometryError> {
    let origin = vertices[0];
    let poly: Vec<(f64, f64)> = vertices.iter().map(|v| project(&origin, v)).collect();
    let n = poly.len();
    for i in 0..n {
        let a1 = poly[i];
        let a2 = poly[(i + 1) % n];
        for j in (i + 1)..n {
            // Adjacent edges share an endpoint by construction; skip them.
            if j == i || (j + 1) % n == i {
                continue;
            }
            let b1 = poly[j];
            let b2 = poly[(j + 1) % n];
            if segments_intersect(a1, a2, b1, b2) {
                return Err(GeometryError::SelfIntersecting(i, j));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(lat: f64, lon: f64, ele: f64) -> Coordinate {
        Coordinate::new(lat, lon, ele)
    }

    #[test]
    fn register_search_distance_matches_scenario_1() {
        let reg_center = c(-33.8568, 151.2153, 0.0);
        let query_center = c(-33.8570, 151.2155, 0.0);
        let d = distance(&reg_center, &query_center);
        assert!((d - 24.6).abs() < 2.0, "distance was {d}");
    }

    #[test]
    fn sphere_bbox_contains_its_own_center() {
        let sphere = Geometry::Sphere {
            center: c(10.0, 20.0, 0.0),
            radius: 500.0,
        };
        let bb = bbox(&sphere);
        assert!(bb.contains_point(&c(10.0, 20.0, 0.0)));
    }

    #[test]
    fn antimeridian_sphere_bbox_wraps() {
        let sphere = Geometry::Sphere {
            center: c(0.0, 179.99, 0.0),
            radius: 10_000.0,
        };
        let bb = bbox(&sphere);
        assert!(bb.wraps, "expected wrap, got {bb:?}");
        assert!(bb.contains_lon(179.999));
        assert!(bb.contains_lon(-179.999));
        assert!(!bb.contains_lon(0.0));
    }

    #[test]
    fn antimeridian_registration_is_found_across_the_seam() {
        let sphere = Geometry::Sphere {
            center: c(0.0, 179.99, 0.0),
            radius: 10_000.0,
        };
        let query_center = c(0.0, -179.99, 0.0);
        assert!(intersects(&sphere, &query_center, 1000.0));
    }

    #[test]
    fn pole_crossing_sphere_widens_longitude() {
        let sphere = Geometry::Sphere {
            center: c(89.9, 0.0, 0.0),
            radius: 50_000.0,
        };
        let bb = bbox(&sphere);
        assert_eq!(bb.min_lon, -180.0);
        assert_eq!(bb.max_lon, 180.0);
    }

    #[test]
    fn sphere_volume_orders_smaller_first() {
        let small = Geometry::Sphere {
            center: c(0.0, 0.0, 0.0),
            radius: 10.0,
        };
        let large = Geometry::Sphere {
            center: c(0.0, 0.0, 0.0),
            radius: 1000.0,
        };
        assert!(volume(&small) < volume(&large));
    }

    #[test]
    fn polygon_contains_point_inside_footprint_and_elevation_band() {
        let square = Geometry::Polygon {
            vertices: vec![
                c(0.0, 0.0, 0.0),
                c(0.0, 0.001, 0.0),
                c(0.001, 0.001, 0.0),
                c(0.001, 0.0, 0.0),
            ],
            height: 10.0,
        };
        assert!(contains_point(&square, &c(0.0005, 0.0005, 5.0)));
        assert!(!contains_point(&square, &c(0.0005, 0.0005, 20.0)));
        assert!(!contains_point(&square, &c(5.0, 5.0, 5.0)));
    }

    #[test]
    fn degenerate_polygon_rejected() {
        let triangle = Geometry::Polygon {
            vertices: vec![c(0.0, 0.0, 0.0), c(0.0, 1.0, 0.0)],
            height: 1.0,
        };
        assert!(triangle.validate().is_err());
    }

    #[test]
    fn self_intersecting_polygon_rejected() {
        // A bowtie: 0,0 -> 1,1 -> 0,1 -> 1,0 -> back to 0,0 crosses itself.
        let bowtie = Geometry::Polygon {
            vertices: vec![c(0.0, 0.0, 0.0), c(1.0, 1.0, 0.0), c(0.0, 1.0, 0.0), c(1.0, 0.0, 0.0)],
            height: 1.0,
        };
        assert!(matches!(
            bowtie.validate(),
            Err(GeometryError::SelfIntersecting(_, _))
        ));
    }

    #[test]
    fn nearest_point_distance_is_zero_inside_sphere() {
        let sphere = Geometry::Sphere {
            center: c(0.0, 0.0, 0.0),
            radius: 500.0,
        };
        assert_eq!(nearest_point_distance(&sphere, &c(0.0, 0.0, 0.0)), 0.0);
    }

    #[test]
    fn nearest_point_distance_to_polygon_uses_edge_not_centroid() {
        let square = Geometry::Polygon {
            vertices: vec![
                c(0.0, 0.0, 0.0),
                c(0.0, 0.01, 0.0),
                c(0.01, 0.01, 0.0),
                c(0.01, 0.0, 0.0),
            ],
            height: 10.0,
        };
        let just_outside = c(0.0, -0.0001, 5.0);
        let centroid_distance = distance(&c(0.005, 0.005, 5.0), &just_outside);
        let edge_distance = nearest_point_distance(&square, &just_outside);
        assert!(
            edge_distance < centroid_distance,
            "edge distance {edge_distance} should be far tighter than centroid distance {centroid_distance}"
        );
    }

    #[test]
    fn sphere_radius_out_of_range_rejected() {
        let too_big = Geometry::Sphere {
            center: c(0.0, 0.0, 0.0),
            radius: 2_000_000.0,
        };
        assert!(too_big.validate().is_err());
    }
}
