//! Spherical geometry helpers: great-circle distance and representative
//! points for polygons and bounding boxes.

use crate::location::Coordinates;
use std::f64::consts::PI;

const DEG: f64 = PI / 180.0;
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance in kilometres between two points.
pub fn distance_km(a: Coordinates, b: Coordinates) -> f64 {
    let d_lat = (b.lat - a.lat) * DEG;
    let d_lon = (b.lon - a.lon) * DEG;
    let h = (d_lat / 2.0).sin().powi(2)
        + (a.lat * DEG).cos() * (b.lat * DEG).cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Haversine distance, or `None` if either side is missing.
pub fn haversine(a: Option<Coordinates>, b: Option<Coordinates>) -> Option<f64> {
    Some(distance_km(a?, b?))
}

/// Midpoint of a `[south, north, west, east]` bounding box.
pub fn bbox_midpoint(south: f64, north: f64, west: f64, east: f64) -> Coordinates {
    Coordinates::new((south + north) / 2.0, (west + east) / 2.0)
}

/// Area-weighted centroid of a ring given as `[lon, lat]` pairs.
///
/// Returns the centroid and the signed planar area. Degenerate rings fall
/// back to the vertex mean with zero area.
fn ring_centroid(ring: &[[f64; 2]]) -> Option<(Coordinates, f64)> {
    if ring.is_empty() {
        return None;
    }
    let mut area = 0.0;
    let mut cx = 0.0;
    let mut cy = 0.0;
    for i in 0..ring.len() {
        let [x0, y0] = ring[i];
        let [x1, y1] = ring[(i + 1) % ring.len()];
        let cross = x0 * y1 - x1 * y0;
        area += cross;
        cx += (x0 + x1) * cross;
        cy += (y0 + y1) * cross;
    }
    area /= 2.0;

    if area.abs() < 1e-12 {
        let n = ring.len() as f64;
        let lon = ring.iter().map(|p| p[0]).sum::<f64>() / n;
        let lat = ring.iter().map(|p| p[1]).sum::<f64>() / n;
        return Some((Coordinates::new(lat, lon), 0.0));
    }

    Some((Coordinates::new(cy / (6.0 * area), cx / (6.0 * area)), area))
}

fn parse_ring(value: &serde_json::Value) -> Option<Vec<[f64; 2]>> {
    value
        .as_array()?
        .iter()
        .map(|p| {
            let pair = p.as_array()?;
            Some([pair.first()?.as_f64()?, pair.get(1)?.as_f64()?])
        })
        .collect()
}

/// Centroid of a GeoJSON `Polygon` or `MultiPolygon` geometry (outer rings only).
/// Any other geometry type yields `None`.
pub fn geojson_centroid(geometry: &serde_json::Value) -> Option<Coordinates> {
    let kind = geometry.get("type")?.as_str()?;
    let coords = geometry.get("coordinates")?;

    let outer_rings: Vec<Vec<[f64; 2]>> = match kind {
        "Polygon" => vec![parse_ring(coords.as_array()?.first()?)?],
        "MultiPolygon" => coords
            .as_array()?
            .iter()
            .filter_map(|poly| parse_ring(poly.as_array()?.first()?))
            .collect(),
        _ => return None,
    };

    let parts: Vec<(Coordinates, f64)> = outer_rings
        .iter()
        .filter_map(|ring| ring_centroid(ring))
        .collect();
    if parts.is_empty() {
        return None;
    }

    let total: f64 = parts.iter().map(|(_, a)| a.abs()).sum();
    if total < 1e-12 {
        return Some(parts[0].0);
    }
    let lat = parts.iter().map(|(c, a)| c.lat * a.abs()).sum::<f64>() / total;
    let lon = parts.iter().map(|(c, a)| c.lon * a.abs()).sum::<f64>() / total;
    Some(Coordinates::new(lat, lon))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use serde_json::json;

    #[test]
    fn test_warsaw_london() {
        let warsaw = Coordinates::new(52.2297, 21.0122);
        let london = Coordinates::new(51.5074, -0.1278);
        let d = distance_km(warsaw, london);
        assert!((d - 1445.0).abs() < 1445.0 * 0.05, "got {}", d);
    }

    #[test]
    fn test_zero_distance() {
        let p = Coordinates::new(50.06, 19.94);
        assert_relative_eq!(distance_km(p, p), 0.0);
    }

    #[test]
    fn test_missing_side() {
        let p = Some(Coordinates::new(50.0, 20.0));
        assert_eq!(haversine(p, None), None);
        assert_eq!(haversine(None, p), None);
        assert!(haversine(p, p).is_some());
    }

    #[test]
    fn test_one_degree_latitude() {
        let a = Coordinates::new(50.0, 20.0);
        let b = Coordinates::new(51.0, 20.0);
        assert_relative_eq!(distance_km(a, b), 111.19, epsilon = 0.05);
    }

    #[test]
    fn test_bbox_midpoint() {
        let c = bbox_midpoint(50.0, 52.0, 19.0, 21.0);
        assert_relative_eq!(c.lat, 51.0);
        assert_relative_eq!(c.lon, 20.0);
    }

    #[test]
    fn test_square_polygon_centroid() {
        let geom = json!({
            "type": "Polygon",
            "coordinates": [[[20.0, 50.0], [22.0, 50.0], [22.0, 52.0], [20.0, 52.0], [20.0, 50.0]]]
        });
        let c = geojson_centroid(&geom).unwrap();
        assert_relative_eq!(c.lat, 51.0, epsilon = 1e-9);
        assert_relative_eq!(c.lon, 21.0, epsilon = 1e-9);
    }

    #[test]
    fn test_multipolygon_weighted() {
        // Big square around (51, 21), tiny one far away barely moves it.
        let geom = json!({
            "type": "MultiPolygon",
            "coordinates": [
                [[[20.0, 50.0], [22.0, 50.0], [22.0, 52.0], [20.0, 52.0], [20.0, 50.0]]],
                [[[30.0, 60.0], [30.01, 60.0], [30.01, 60.01], [30.0, 60.01], [30.0, 60.0]]]
            ]
        });
        let c = geojson_centroid(&geom).unwrap();
        assert!((c.lat - 51.0).abs() < 0.01);
        assert!((c.lon - 21.0).abs() < 0.01);
    }

    #[test]
    fn test_point_geometry_is_not_a_polygon() {
        let geom = json!({ "type": "Point", "coordinates": [21.0, 52.0] });
        assert!(geojson_centroid(&geom).is_none());
    }
}
