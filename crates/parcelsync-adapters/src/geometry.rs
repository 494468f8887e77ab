//! Polygon ring → well-known text.
//!
//! Only the exterior (first) ring is encoded; holes are dropped. Vertices are
//! written in the order received with no closing vertex added and no rounding,
//! so coordinates must already be in the store's reference system.

use std::fmt::Write as _;

use thiserror::Error;

use crate::FeatureGeometry;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("vertex {index} has {ordinates} ordinate(s), expected at least 2")]
    ShortVertex { index: usize, ordinates: usize },
}

/// Encodes one ring as `POLYGON((x y, x y, ...))`.
pub fn encode_ring(ring: &[[f64; 2]]) -> String {
    let mut wkt = String::with_capacity(ring.len() * 24 + 12);
    wkt.push_str("POLYGON((");
    for (i, [x, y]) in ring.iter().enumerate() {
        if i > 0 {
            wkt.push_str(", ");
        }
        let _ = write!(wkt, "{x} {y}");
    }
    wkt.push_str("))");
    wkt
}

/// Encodes the first ring of a feature geometry. Absent geometry, an empty
/// ring list or an empty first ring all encode to `None`.
pub fn encode_feature_geometry(
    geometry: Option<&FeatureGeometry>,
) -> Result<Option<String>, GeometryError> {
    let Some(ring) = geometry.and_then(|g| g.rings.first()) else {
        return Ok(None);
    };
    if ring.is_empty() {
        return Ok(None);
    }

    let vertices = ring
        .iter()
        .enumerate()
        .map(|(index, vertex)| match vertex.as_slice() {
            [x, y, ..] => Ok([*x, *y]),
            _ => Err(GeometryError::ShortVertex {
                index,
                ordinates: vertex.len(),
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(encode_ring(&vertices)))
}
