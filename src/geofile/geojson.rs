use std::{collections::BTreeSet, fs, path::Path};

use anyhow::{anyhow, bail, Context};
use geojson::{feature::Id, GeoJson, JsonObject, JsonValue};

use super::feature::{make_ids_unique, normalize_key, validate_geometry, Feature, FeatureMap};
use crate::aggregation::accessibility::AccessibilityRecord;
use crate::grid::grid::GridId;

fn read_geojson(filepath: &Path) -> anyhow::Result<GeoJson> {
    let contents = fs::read_to_string(filepath)
        .with_context(|| format!("Reading GeoJSON file {:?}", filepath))?;
    contents
        .parse::<GeoJson>()
        .with_context(|| format!("Parsing GeoJSON file {:?}", filepath))
}

fn into_features(geojson: GeoJson) -> Vec<geojson::Feature> {
    match geojson {
        GeoJson::FeatureCollection(collection) => collection.features,
        GeoJson::Feature(feature) => vec![feature],
        GeoJson::Geometry(geometry) => vec![geojson::Feature {
            bbox: None,
            geometry: Some(geometry),
            id: None,
            properties: None,
            foreign_members: None,
        }],
    }
}

fn to_geo(geometry: geojson::Geometry) -> anyhow::Result<geo::Geometry> {
    geo::Geometry::<f64>::try_from(geometry.value)
        .map_err(|err| anyhow!("Could not convert GeoJSON geometry, {}", err))
}

fn property_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(value) => Some(value.clone()),
        JsonValue::Bool(value) => Some(value.to_string()),
        JsonValue::Number(value) => Some(value.to_string()),
        other => Some(other.to_string()),
    }
}

fn feature_id(feature: &geojson::Feature, index: usize) -> String {
    match &feature.id {
        Some(Id::String(id)) => id.clone(),
        Some(Id::Number(id)) => id.to_string(),
        None => ["id", "osm_id"]
            .iter()
            .find_map(|key| feature.property(key).and_then(property_to_string))
            .unwrap_or_else(|| index.to_string()),
    }
}

/// Read the raw features of a city. Only the attributes in `keys` (after key
/// normalization) are kept; features with missing or unusable geometry are dropped.
/// Repeated ids are made unique, see `make_ids_unique`.
pub fn read_features_from_geojson(
    filepath: &Path,
    keys: &BTreeSet<String>,
) -> anyhow::Result<Vec<Feature>> {
    let geojson_features = into_features(read_geojson(filepath)?);
    let num_read = geojson_features.len();
    let mut features = Vec::with_capacity(num_read);
    for (index, geojson_feature) in geojson_features.into_iter().enumerate() {
        let id = feature_id(&geojson_feature, index);
        let geometry = match geojson_feature
            .geometry
            .clone()
            .ok_or_else(|| anyhow!("missing geometry"))
            .and_then(to_geo)
            .and_then(validate_geometry)
        {
            Ok(geometry) => geometry,
            Err(err) => {
                log::debug!("Dropping feature {}: {}", id, err);
                continue;
            }
        };
        let attributes: FeatureMap = geojson_feature
            .properties
            .iter()
            .flatten()
            .filter_map(|(key, value)| {
                let key = normalize_key(key);
                if keys.contains(&key) {
                    property_to_string(value).map(|value| (key, value))
                } else {
                    None
                }
            })
            .collect();
        features.push(Feature::new(id, geometry, attributes));
    }
    if features.len() != num_read {
        log::warn!(
            "Out of {} features read from {:?}, only {} had a valid point or polygon geometry.",
            num_read,
            filepath,
            features.len()
        )
    }
    let num_renamed = make_ids_unique(&mut features);
    if num_renamed > 0 {
        log::warn!(
            "Renamed {} features of {:?} with a repeated id",
            num_renamed,
            filepath
        )
    }
    Ok(features)
}

/// Read a study-area boundary as the union of all polygonal geometries in the file.
pub fn read_boundary_from_geojson(filepath: &Path) -> anyhow::Result<geo::MultiPolygon> {
    let mut polygons = Vec::new();
    for feature in into_features(read_geojson(filepath)?) {
        let Some(geometry) = feature.geometry else {
            continue;
        };
        match to_geo(geometry)? {
            geo::Geometry::Polygon(polygon) => polygons.push(polygon),
            geo::Geometry::MultiPolygon(multi_polygon) => polygons.extend(multi_polygon),
            _ => log::warn!("Ignoring non-polygonal boundary geometry in {:?}", filepath),
        }
    }
    if polygons.is_empty() {
        bail!("No boundary polygons found in {:?}", filepath);
    }
    Ok(geo::MultiPolygon::new(polygons))
}

/// Read grid cells from a file with an integer `grid_id` property per polygon.
pub fn read_grid_polygons_from_geojson(
    filepath: &Path,
) -> anyhow::Result<Vec<(GridId, geo::Polygon)>> {
    into_features(read_geojson(filepath)?)
        .into_iter()
        .enumerate()
        .map(|(index, feature)| {
            let grid_id = feature
                .property("grid_id")
                .and_then(JsonValue::as_u64)
                .ok_or_else(|| anyhow!("Grid feature {} has no integer grid_id", index))?;
            let geometry = feature
                .geometry
                .ok_or_else(|| anyhow!("Grid cell {} has no geometry", grid_id))?;
            match to_geo(geometry)? {
                geo::Geometry::Polygon(polygon) => Ok((grid_id, polygon)),
                _ => Err(anyhow!("Grid cell {} is not a polygon", grid_id)),
            }
        })
        .collect()
}

/// Read the line geometries of a path network, used to locate building entrances.
pub fn read_lines_from_geojson(filepath: &Path) -> anyhow::Result<Vec<geo::LineString>> {
    let mut lines = Vec::new();
    let mut num_other = 0;
    for feature in into_features(read_geojson(filepath)?) {
        match feature.geometry.map(to_geo).transpose()? {
            Some(geo::Geometry::LineString(line)) => lines.push(line),
            Some(geo::Geometry::MultiLineString(multi_line)) => lines.extend(multi_line),
            _ => num_other += 1,
        }
    }
    if num_other > 0 {
        log::warn!(
            "Ignored {} features of {:?} which were not LineStrings.",
            num_other,
            filepath
        )
    }
    Ok(lines)
}

/// Write one feature per grid cell. Every Class_C in `categories` becomes a property, null
/// where the category is not reachable from the cell.
pub fn write_accessibility_to_geojson(
    records: &[AccessibilityRecord],
    categories: &BTreeSet<String>,
    output_filepath: &Path,
) -> anyhow::Result<()> {
    let feature_collection: geojson::FeatureCollection = records
        .iter()
        .map(|record| {
            let mut properties = JsonObject::new();
            properties.insert("grid_id".to_string(), JsonValue::from(record.grid_id));
            for category in categories {
                let value = record
                    .min_travel_times
                    .get(category)
                    .map_or(JsonValue::Null, |minutes| JsonValue::from(*minutes));
                properties.insert(category.clone(), value);
            }
            properties.insert(
                "mean_min_tt".to_string(),
                record
                    .mean_min_tt
                    .map_or(JsonValue::Null, JsonValue::from),
            );
            properties.insert("n".to_string(), JsonValue::from(record.n));
            geojson::Feature {
                bbox: None,
                geometry: Some(geojson::Geometry::new(geojson::Value::from(&record.geometry))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();
    let geojson_contents = GeoJson::from(feature_collection);
    fs::write(output_filepath, geojson_contents.to_string())
        .with_context(|| format!("Writing {:?}", output_filepath))
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use testdir::testdir;

    use super::{
        read_boundary_from_geojson, read_features_from_geojson, read_grid_polygons_from_geojson,
        read_lines_from_geojson, write_accessibility_to_geojson,
    };
    use crate::aggregation::accessibility::AccessibilityRecord;

    const FEATURES: &str = r#"{
  "type": "FeatureCollection",
  "features": [
    {"type": "Feature", "id": "node/1", "geometry": {"type": "Point", "coordinates": [13.4, 52.5]},
     "properties": {"amenity": "cafe", "name": "Kaffee", "addr:city": "Berlin", "wheelchair": "yes"}},
    {"type": "Feature", "geometry": {"type": "Polygon", "coordinates": [[[13.4, 52.5], [13.41, 52.5], [13.41, 52.51], [13.4, 52.5]]]},
     "properties": {"osm_id": 42, "shop": "supermarket", "brand": null}},
    {"type": "Feature", "geometry": {"type": "LineString", "coordinates": [[13.4, 52.5], [13.41, 52.5]]},
     "properties": {"highway": "footway"}},
    {"type": "Feature", "geometry": null, "properties": {"amenity": "bench"}}
  ]
}"#;

    #[test]
    fn test_read_features_from_geojson() {
        let path = testdir!().join("features.geojson");
        std::fs::write(&path, FEATURES).unwrap();
        let keys: BTreeSet<String> = ["amenity", "name", "shop", "brand", "addr_city"]
            .iter()
            .map(|key| key.to_string())
            .collect();

        let features = read_features_from_geojson(&path, &keys).unwrap();
        assert_eq!(features.len(), 2);

        let cafe = &features[0];
        assert_eq!(cafe.id, "node/1");
        assert!(matches!(cafe.geometry, geo::Geometry::Point(_)));
        assert_eq!(cafe.attribute("addr_city"), Some("Berlin"));
        assert_eq!(cafe.attribute("wheelchair"), None);

        let supermarket = &features[1];
        assert_eq!(supermarket.id, "42");
        assert!(matches!(supermarket.geometry, geo::Geometry::Polygon(_)));
        assert_eq!(supermarket.attribute("brand"), None);
        assert!(supermarket.category.is_none());
    }

    #[test]
    fn test_read_features_with_repeated_ids() {
        let path = testdir!().join("features.geojson");
        std::fs::write(
            &path,
            r#"{"type": "FeatureCollection", "features": [
                {"type": "Feature", "geometry": {"type": "Point", "coordinates": [13.4, 52.5]},
                 "properties": {"osm_id": 7, "amenity": "cafe"}},
                {"type": "Feature", "geometry": {"type": "Point", "coordinates": [13.5, 52.5]},
                 "properties": {"osm_id": 7, "amenity": "pharmacy"}}
            ]}"#,
        )
        .unwrap();
        let keys: BTreeSet<String> = BTreeSet::from(["amenity".to_string()]);
        let features = read_features_from_geojson(&path, &keys).unwrap();
        let ids: Vec<&str> = features.iter().map(|feature| feature.id.as_str()).collect();
        assert_eq!(ids, vec!["7", "7#1"]);
        assert_eq!(features[1].attribute("amenity"), Some("pharmacy"));
    }

    #[test]
    fn test_read_boundary_grid_and_lines() {
        let dir = testdir!();
        let path = dir.join("grid.geojson");
        std::fs::write(
            &path,
            r#"{"type": "FeatureCollection", "features": [
                {"type": "Feature", "properties": {"grid_id": 7},
                 "geometry": {"type": "Polygon", "coordinates": [[[0, 0], [1, 0], [1, 1], [0, 1], [0, 0]]]}},
                {"type": "Feature", "properties": {"grid_id": 9},
                 "geometry": {"type": "MultiPolygon", "coordinates": [[[[1, 0], [2, 0], [2, 1], [1, 1], [1, 0]]]]}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(read_boundary_from_geojson(&path).unwrap().0.len(), 2);
        // The second cell is a MultiPolygon, which is not a valid grid cell.
        assert!(read_grid_polygons_from_geojson(&path).is_err());

        let lines_path = dir.join("paths.geojson");
        std::fs::write(
            &lines_path,
            r#"{"type": "FeatureCollection", "features": [
                {"type": "Feature", "properties": {}, "geometry": {"type": "LineString", "coordinates": [[0, 0], [1, 1]]}},
                {"type": "Feature", "properties": {}, "geometry": {"type": "MultiLineString", "coordinates": [[[0, 1], [1, 0]], [[2, 2], [3, 3]]]}},
                {"type": "Feature", "properties": {}, "geometry": {"type": "Point", "coordinates": [0, 0]}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(read_lines_from_geojson(&lines_path).unwrap().len(), 3);
    }

    #[test]
    fn test_write_accessibility_to_geojson() {
        let dir = testdir!();
        let cell = geo::Rect::new(geo::Coord { x: 0.0, y: 0.0 }, geo::Coord { x: 1.0, y: 1.0 })
            .to_polygon();
        let records = vec![
            AccessibilityRecord {
                grid_id: 0,
                geometry: cell.clone(),
                min_travel_times: BTreeMap::from([("Food".to_string(), 5)]),
                mean_min_tt: Some(5.0),
                n: 1,
            },
            AccessibilityRecord {
                grid_id: 1,
                geometry: cell,
                min_travel_times: BTreeMap::new(),
                mean_min_tt: None,
                n: 0,
            },
        ];
        let categories: BTreeSet<String> =
            ["Food".to_string(), "Health".to_string()].into_iter().collect();
        let path = dir.join("accessibility.geojson");
        write_accessibility_to_geojson(&records, &categories, &path).unwrap();

        let written = read_grid_polygons_from_geojson(&path).unwrap();
        assert_eq!(written.len(), 2);
        let contents: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let first = &contents["features"][0]["properties"];
        assert_eq!(first["Food"], 5);
        assert!(first["Health"].is_null());
        assert_eq!(first["mean_min_tt"], 5.0);
        assert_eq!(first["n"], 1);
        let second = &contents["features"][1]["properties"];
        assert!(second["Food"].is_null());
        assert!(second["mean_min_tt"].is_null());
        assert_eq!(second["n"], 0);
    }
}
