use std::collections::{HashMap, HashSet};

use anyhow::anyhow;
use geo::Area;

use crate::classification::scheme::CategoryPath;

/// Raw attributes of a feature, keyed by normalized attribute key.
pub type FeatureMap = HashMap<String, String>;

pub type FeatureId = String;

#[derive(Debug, Clone)]
pub struct Feature {
    pub id: FeatureId,
    pub geometry: geo::Geometry,
    pub attributes: FeatureMap,
    /// Set by classification. Features which stay unclassified are not POIs.
    pub category: Option<CategoryPath>,
}

impl Feature {
    /// Create an unclassified feature. Attribute keys are normalized, see `normalize_key`.
    pub fn new(id: impl Into<FeatureId>, geometry: geo::Geometry, attributes: FeatureMap) -> Self {
        Self {
            id: id.into(),
            geometry,
            attributes: attributes
                .into_iter()
                .map(|(key, value)| (normalize_key(&key), value))
                .collect(),
            category: None,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn class_a(&self) -> Option<&str> {
        self.category.as_ref().map(|category| category.class_a.as_str())
    }
}

/// Rename every feature whose id an earlier feature already carries to `<id>#<n>`, with the
/// smallest `n` giving an id not used anywhere in `features`. Returns the number of renamed
/// features.
pub fn make_ids_unique(features: &mut [Feature]) -> usize {
    let mut taken: HashSet<FeatureId> =
        features.iter().map(|feature| feature.id.clone()).collect();
    let mut seen = HashSet::with_capacity(features.len());
    let mut num_renamed = 0;
    for feature in features.iter_mut() {
        if seen.insert(feature.id.clone()) {
            continue;
        }
        let mut n = 1;
        let mut renamed = format!("{}#{}", feature.id, n);
        while taken.contains(&renamed) {
            n += 1;
            renamed = format!("{}#{}", feature.id, n);
        }
        log::debug!(
            "Feature id {} is not unique, renaming a duplicate to {}",
            feature.id,
            renamed
        );
        taken.insert(renamed.clone());
        seen.insert(renamed.clone());
        feature.id = renamed;
        num_renamed += 1;
    }
    num_renamed
}

/// Attribute keys use `_` where the source data uses `:` (e.g. `addr:street` becomes
/// `addr_street`). Rule text goes through the same normalization.
pub fn normalize_key(key: &str) -> String {
    key.replace(':', "_")
}

/// Check that a geometry is usable as a POI geometry, dropping degenerate parts of
/// multipolygons where possible.
pub fn validate_geometry(geometry: geo::Geometry) -> anyhow::Result<geo::Geometry> {
    match geometry {
        geo::Geometry::Point(point) => {
            if point.x().is_finite() && point.y().is_finite() {
                Ok(geo::Geometry::Point(point))
            } else {
                Err(anyhow!("Point has non-finite coordinates"))
            }
        }
        geo::Geometry::Polygon(polygon) => {
            if is_valid_polygon(&polygon) {
                Ok(geo::Geometry::Polygon(polygon))
            } else {
                Err(anyhow!("Polygon is degenerate or has non-finite coordinates"))
            }
        }
        geo::Geometry::MultiPolygon(multi_polygon) => {
            let num_parts = multi_polygon.0.len();
            let valid_parts: Vec<geo::Polygon> = multi_polygon
                .into_iter()
                .filter(is_valid_polygon)
                .collect();
            if valid_parts.is_empty() {
                return Err(anyhow!("MultiPolygon has no valid parts"));
            }
            if valid_parts.len() != num_parts {
                log::debug!(
                    "Dropped {} degenerate parts of a MultiPolygon",
                    num_parts - valid_parts.len()
                );
            }
            Ok(geo::Geometry::MultiPolygon(geo::MultiPolygon::new(
                valid_parts,
            )))
        }
        other => Err(anyhow!("Unsupported geometry type {}", kind_name(&other))),
    }
}

fn is_valid_polygon(polygon: &geo::Polygon) -> bool {
    let exterior = polygon.exterior();
    exterior.0.len() >= 4
        && exterior
            .coords()
            .all(|coord| coord.x.is_finite() && coord.y.is_finite())
        && polygon.unsigned_area() > 0.0
}

fn kind_name(geometry: &geo::Geometry) -> &'static str {
    match geometry {
        geo::Geometry::Line(_) => "Line",
        geo::Geometry::LineString(_) => "LineString",
        geo::Geometry::MultiPoint(_) => "MultiPoint",
        geo::Geometry::MultiLineString(_) => "MultiLineString",
        geo::Geometry::GeometryCollection(_) => "GeometryCollection",
        _ => "other",
    }
}
