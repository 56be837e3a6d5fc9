use std::{collections::BTreeSet, path::Path};

use anyhow::Context;
use geo::algorithm::line_intersection::{line_intersection, LineIntersection};
use geo::{Centroid, Intersects};
use rayon::prelude::*;
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use super::grid::{Grid, GridId};
use crate::crs::crs_utils::geodesic_area_m2;
use crate::geofile::feature::{Feature, FeatureId};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccessPointConfig {
    /// Polygons at least this large are also reached through their entrances.
    pub entrance_area_threshold_m2: f64,
}

impl Default for AccessPointConfig {
    fn default() -> Self {
        Self {
            entrance_area_threshold_m2: 40_000.0,
        }
    }
}

/// A feature reachable from a grid cell. Unique per (feature, cell).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccessPoint {
    pub feature_id: FeatureId,
    #[serde(rename = "NearestGridCell")]
    pub nearest_grid_cell: GridId,
}

/// Source of entrance locations of large POI footprints, i.e. where the footprint outline
/// meets the walkable network.
pub trait EntranceProvider: Sync {
    fn entrances(&self, footprint: &geo::MultiPolygon) -> Vec<geo::Point>;
}

/// Used when no path network is available: footprints are reached through centroids only.
#[derive(Debug, Default)]
pub struct NoEntrances;

impl EntranceProvider for NoEntrances {
    fn entrances(&self, _footprint: &geo::MultiPolygon) -> Vec<geo::Point> {
        Vec::new()
    }
}

struct IndexedSegment {
    line: geo::Line,
}

impl RTreeObject for IndexedSegment {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        line_envelope(&self.line)
    }
}

fn line_envelope(line: &geo::Line) -> AABB<[f64; 2]> {
    AABB::from_corners([line.start.x, line.start.y], [line.end.x, line.end.y])
}

/// Entrances as the crossings of footprint outlines with the segments of a path network.
pub struct PathNetworkEntrances {
    rtree: RTree<IndexedSegment>,
}

impl PathNetworkEntrances {
    pub fn new(paths: &[geo::LineString]) -> Self {
        let segments = paths
            .iter()
            .flat_map(|path| path.lines())
            .map(|line| IndexedSegment { line })
            .collect();
        Self {
            rtree: RTree::bulk_load(segments),
        }
    }

    pub fn num_segments(&self) -> usize {
        self.rtree.size()
    }
}

impl Default for PathNetworkEntrances {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl EntranceProvider for PathNetworkEntrances {
    fn entrances(&self, footprint: &geo::MultiPolygon) -> Vec<geo::Point> {
        let mut entrances = Vec::new();
        for polygon in footprint.0.iter() {
            let rings = std::iter::once(polygon.exterior()).chain(polygon.interiors());
            for edge in rings.flat_map(|ring| ring.lines()) {
                for segment in self
                    .rtree
                    .locate_in_envelope_intersecting(&line_envelope(&edge))
                {
                    match line_intersection(edge, segment.line) {
                        Some(LineIntersection::SinglePoint { intersection, .. }) => {
                            entrances.push(intersection.into())
                        }
                        // A path running along the outline touches it over a stretch, its
                        // start is as good an entrance as any.
                        Some(LineIntersection::Collinear { intersection }) => {
                            entrances.push(intersection.start.into())
                        }
                        None => {}
                    }
                }
            }
        }
        entrances
    }
}

/// All access points of a feature before grid assignment: the point itself, or the
/// centroid of a footprint plus its entrances when the footprint is a multipolygon or at
/// least `entrance_area_threshold_m2` large.
pub fn raw_access_points(
    feature: &Feature,
    config: &AccessPointConfig,
    entrances: &dyn EntranceProvider,
) -> Vec<geo::Point> {
    match &feature.geometry {
        geo::Geometry::Point(point) => vec![*point],
        geo::Geometry::Polygon(polygon) => {
            let mut points: Vec<geo::Point> = polygon.centroid().into_iter().collect();
            if geodesic_area_m2(polygon) >= config.entrance_area_threshold_m2 {
                points.extend(entrances.entrances(&geo::MultiPolygon::new(vec![polygon.clone()])));
            }
            points
        }
        geo::Geometry::MultiPolygon(multi_polygon) => {
            let mut points: Vec<geo::Point> = multi_polygon.centroid().into_iter().collect();
            points.extend(entrances.entrances(multi_polygon));
            points
        }
        _ => Vec::new(),
    }
}

/// Map every access point inside the study area to its nearest grid cell, keeping one
/// record per (feature, cell).
pub fn assign_access_points(
    features: &[Feature],
    grid: &Grid,
    boundary: &geo::MultiPolygon,
    config: &AccessPointConfig,
    entrances: &dyn EntranceProvider,
) -> BTreeSet<AccessPoint> {
    let per_feature: Vec<(Vec<AccessPoint>, usize, usize)> = features
        .par_iter()
        .map(|feature| {
            let raw_points = raw_access_points(feature, config, entrances);
            let num_raw = raw_points.len();
            let assigned: Vec<AccessPoint> = raw_points
                .into_iter()
                .filter(|point| boundary.intersects(point))
                .filter_map(|point| grid.nearest_cell(&point))
                .map(|nearest_grid_cell| AccessPoint {
                    feature_id: feature.id.clone(),
                    nearest_grid_cell,
                })
                .collect();
            let num_outside = num_raw - assigned.len();
            (assigned, num_raw, num_outside)
        })
        .collect();

    let mut access_points = BTreeSet::new();
    let (mut num_raw, mut num_outside) = (0, 0);
    for (assigned, feature_raw, feature_outside) in per_feature {
        num_raw += feature_raw;
        num_outside += feature_outside;
        access_points.extend(assigned);
    }
    log::info!(
        "Assigned {} access points of {} features to {} (feature, cell) pairs, {} outside the study area",
        num_raw,
        features.len(),
        access_points.len(),
        num_outside
    );
    access_points
}

pub fn write_access_points(
    access_points: &BTreeSet<AccessPoint>,
    output_filepath: &Path,
) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(output_filepath)
        .with_context(|| format!("Creating {:?}", output_filepath))?;
    for access_point in access_points {
        writer.serialize(access_point)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};

    use rstest::{fixture, rstest};
    use testdir::testdir;

    use super::{
        assign_access_points, raw_access_points, write_access_points, AccessPoint,
        AccessPointConfig, EntranceProvider, NoEntrances, PathNetworkEntrances,
    };
    use crate::geofile::feature::Feature;
    use crate::grid::grid::{
        tests::{grid, offset, square_boundary},
        Grid,
    };

    /// Axis-aligned square footprint between the given offsets in metres.
    fn footprint(west: f64, south: f64, east: f64, north: f64) -> geo::Polygon {
        geo::Polygon::new(
            vec![
                offset(west, south),
                offset(east, south),
                offset(east, north),
                offset(west, north),
            ]
            .into(),
            vec![],
        )
    }

    fn feature(id: &str, geometry: geo::Geometry) -> Feature {
        Feature::new(id, geometry, HashMap::new())
    }

    /// Two east-west paths crossing the 300 m footprint used below on both sides.
    #[fixture]
    fn paths() -> PathNetworkEntrances {
        PathNetworkEntrances::new(&[
            vec![offset(0.0, 230.0), offset(600.0, 230.0)].into(),
            vec![offset(0.0, 260.0), offset(600.0, 260.0)].into(),
        ])
    }

    fn pairs(access_points: &BTreeSet<AccessPoint>, id: &str) -> Vec<u64> {
        access_points
            .iter()
            .filter(|access_point| access_point.feature_id == id)
            .map(|access_point| access_point.nearest_grid_cell)
            .collect()
    }

    #[rstest]
    fn test_path_network_entrances(paths: PathNetworkEntrances) {
        assert_eq!(paths.num_segments(), 2);
        let large = geo::MultiPolygon::new(vec![footprint(120.0, 120.0, 420.0, 420.0)]);
        assert_eq!(paths.entrances(&large).len(), 4);
        let away = geo::MultiPolygon::new(vec![footprint(700.0, 700.0, 800.0, 800.0)]);
        assert!(paths.entrances(&away).is_empty());
    }

    #[rstest]
    fn test_raw_access_points(paths: PathNetworkEntrances) {
        let config = AccessPointConfig::default();
        let point = feature("point", geo::Point::from(offset(50.0, 50.0)).into());
        assert_eq!(raw_access_points(&point, &config, &paths).len(), 1);

        // 100 m x 100 m is below the area threshold, the crossing paths are not consulted.
        let small = feature("small", footprint(120.0, 200.0, 220.0, 300.0).into());
        assert_eq!(raw_access_points(&small, &config, &paths).len(), 1);

        let large = feature("large", footprint(120.0, 120.0, 420.0, 420.0).into());
        assert_eq!(raw_access_points(&large, &config, &paths).len(), 5);

        let multi = feature(
            "multi",
            geo::MultiPolygon::new(vec![footprint(120.0, 200.0, 220.0, 300.0)]).into(),
        );
        // Multipolygons are always reached through entrances too.
        assert_eq!(raw_access_points(&multi, &config, &paths).len(), 5);
    }

    #[rstest]
    fn test_assign_access_points(grid: Grid, paths: PathNetworkEntrances) {
        let features = vec![
            feature("point", geo::Point::from(offset(350.0, 250.0)).into()),
            feature("large", footprint(120.0, 120.0, 420.0, 420.0).into()),
            feature("outside", geo::Point::from(offset(1200.0, 500.0)).into()),
        ];
        let access_points = assign_access_points(
            &features,
            &grid,
            &square_boundary(1000.0),
            &AccessPointConfig::default(),
            &paths,
        );
        assert_eq!(pairs(&access_points, "point"), vec![23]);
        // Centroid in cell 22, the four entrances collapse onto cells 21 and 24.
        assert_eq!(pairs(&access_points, "large"), vec![21, 22, 24]);
        assert!(pairs(&access_points, "outside").is_empty());
        assert_eq!(access_points.len(), 4);
    }

    #[rstest]
    fn test_dedup_invariant(grid: Grid, paths: PathNetworkEntrances) {
        let boundary = square_boundary(1000.0);
        let config = AccessPointConfig::default();
        let features: Vec<Feature> = (0..8)
            .map(|index| {
                let west = 60.0 + index as f64 * 45.0;
                feature(
                    &format!("f{}", index),
                    footprint(west, 100.0, west + 250.0, 350.0).into(),
                )
            })
            .collect();
        let access_points = assign_access_points(&features, &grid, &boundary, &config, &paths);
        for feature in &features {
            let distinct_cells: BTreeSet<u64> = raw_access_points(feature, &config, &paths)
                .iter()
                .filter_map(|point| grid.nearest_cell(point))
                .collect();
            assert_eq!(pairs(&access_points, &feature.id).len(), distinct_cells.len());
        }
    }

    #[rstest]
    fn test_write_access_points(grid: Grid) {
        let features = vec![feature("node/1", geo::Point::from(offset(50.0, 50.0)).into())];
        let access_points = assign_access_points(
            &features,
            &grid,
            &square_boundary(1000.0),
            &AccessPointConfig::default(),
            &NoEntrances,
        );
        let path = testdir!().join("access_points.csv");
        write_access_points(&access_points, &path).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "feature_id,NearestGridCell\nnode/1,0\n"
        );
    }
}

#[cfg(test)]
#[generic_tests::define]
mod provider_tests {
    use std::collections::HashMap;

    use super::{assign_access_points, AccessPointConfig, EntranceProvider};
    use crate::geofile::feature::Feature;
    use crate::grid::grid::{
        tests::{offset, square_boundary},
        Grid,
    };

    /// Points and small footprints never depend on the entrance provider.
    #[test]
    fn test_small_features_ignore_entrances<P: EntranceProvider + Default>() {
        let grid = Grid::square(&square_boundary(1000.0), 100.0).unwrap();
        let small = geo::Polygon::new(
            vec![
                offset(420.0, 420.0),
                offset(480.0, 420.0),
                offset(480.0, 480.0),
                offset(420.0, 480.0),
            ]
            .into(),
            vec![],
        );
        let features = vec![
            Feature::new("a", geo::Point::from(offset(50.0, 50.0)).into(), HashMap::new()),
            Feature::new("b", small.into(), HashMap::new()),
        ];
        let access_points = assign_access_points(
            &features,
            &grid,
            &square_boundary(1000.0),
            &AccessPointConfig::default(),
            &P::default(),
        );
        let cells: Vec<u64> = access_points
            .iter()
            .map(|access_point| access_point.nearest_grid_cell)
            .collect();
        assert_eq!(cells, vec![0, 44]);
    }

    #[instantiate_tests(<crate::grid::access_points::NoEntrances>)]
    mod no_entrances {}

    #[instantiate_tests(<crate::grid::access_points::PathNetworkEntrances>)]
    mod path_network_entrances {}
}
