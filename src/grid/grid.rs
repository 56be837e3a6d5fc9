use std::collections::HashMap;

use anyhow::{anyhow, bail};
use geo::{BoundingRect, Centroid, Intersects};
use serde::Deserialize;

use crate::crs::crs_utils::LocalProjection;

pub type GridId = u64;

/// Upper bound on generated grids, guarding against a cell size given in the wrong unit.
const MAX_GRID_CELLS: usize = 20_000_000;

/// Fraction of a cell side trimmed off every edge before the boundary overlap test.
const CELL_INSET: f64 = 1e-6;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Side length of generated square cells.
    pub cell_size_m: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self { cell_size_m: 100.0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridCell {
    pub id: GridId,
    pub geometry: geo::Polygon,
    pub centroid: geo::Point,
}

type CellIndexerPoint = rstar::primitives::GeomWithData<[f64; 2], GridId>;

/// Nearest-centroid lookup over grid cells. Centroids are indexed in a local metric frame so
/// that distances are comparable in both directions.
pub struct CellIndexer {
    rtree: rstar::RTree<CellIndexerPoint>,
    projection: LocalProjection,
}

impl CellIndexer {
    pub fn new(cells: &[GridCell], projection: LocalProjection) -> Self {
        let points = cells
            .iter()
            .map(|cell| CellIndexerPoint::new(projection.project(&cell.centroid.0), cell.id))
            .collect();
        Self {
            rtree: rstar::RTree::bulk_load(points),
            projection,
        }
    }

    pub fn nearest_cell(&self, point: &geo::Point) -> Option<GridId> {
        self.rtree
            .nearest_neighbor(&self.projection.project(&point.0))
            .map(|nearest| nearest.data)
    }
}

/// The study-area grid of one city. Immutable once built.
pub struct Grid {
    cells: Vec<GridCell>,
    positions: HashMap<GridId, usize>,
    indexer: CellIndexer,
}

impl Grid {
    /// Build a grid from externally generated cell polygons.
    pub fn from_polygons(polygons: Vec<(GridId, geo::Polygon)>) -> anyhow::Result<Self> {
        if polygons.is_empty() {
            bail!("A grid needs at least one cell");
        }
        let mut cells = Vec::with_capacity(polygons.len());
        let mut positions = HashMap::with_capacity(polygons.len());
        for (id, geometry) in polygons {
            if positions.insert(id, cells.len()).is_some() {
                bail!("Duplicate grid cell id {}", id);
            }
            let centroid = geometry
                .centroid()
                .ok_or_else(|| anyhow!("Grid cell {} has an empty geometry", id))?;
            cells.push(GridCell {
                id,
                geometry,
                centroid,
            });
        }
        let reference_lat = {
            let (min_lat, max_lat) = cells.iter().fold(
                (f64::INFINITY, f64::NEG_INFINITY),
                |(min_lat, max_lat), cell| {
                    (min_lat.min(cell.centroid.y()), max_lat.max(cell.centroid.y()))
                },
            );
            (min_lat + max_lat) / 2.0
        };
        let indexer = CellIndexer::new(&cells, LocalProjection::new(reference_lat));
        Ok(Self {
            cells,
            positions,
            indexer,
        })
    }

    /// Tessellate the bounding box of `boundary` into square cells of `cell_size_m` and keep
    /// the cells overlapping the inside of the boundary. Cells sharing only an edge or a
    /// corner with it are dropped. Ids are assigned row by row from the south-west.
    pub fn square(boundary: &geo::MultiPolygon, cell_size_m: f64) -> anyhow::Result<Self> {
        if !(cell_size_m.is_finite() && cell_size_m > 0.0) {
            bail!("Grid cell size must be positive, got {}", cell_size_m);
        }
        let bounds = boundary
            .bounding_rect()
            .ok_or_else(|| anyhow!("Cannot build a grid over an empty boundary"))?;
        let projection = LocalProjection::new(bounds.center().y);
        let (dx, dy) = projection.degrees_for_metres(cell_size_m);
        // The epsilon keeps floating point noise from adding a row or column of slivers.
        let num_cols = ((bounds.width() / dx) - 1e-9).ceil().max(1.0) as usize;
        let num_rows = ((bounds.height() / dy) - 1e-9).ceil().max(1.0) as usize;
        if num_cols.saturating_mul(num_rows) > MAX_GRID_CELLS {
            bail!(
                "A {} m grid over this boundary would have {} x {} cells",
                cell_size_m,
                num_cols,
                num_rows
            );
        }

        let min = bounds.min();
        let mut polygons = Vec::new();
        for row in 0..num_rows {
            for col in 0..num_cols {
                let x = min.x + col as f64 * dx;
                let y = min.y + row as f64 * dy;
                let inner = geo::Rect::new(
                    geo::Coord {
                        x: x + dx * CELL_INSET,
                        y: y + dy * CELL_INSET,
                    },
                    geo::Coord {
                        x: x + dx * (1.0 - CELL_INSET),
                        y: y + dy * (1.0 - CELL_INSET),
                    },
                )
                .to_polygon();
                if !boundary.intersects(&inner) {
                    continue;
                }
                let cell = geo::Rect::new(
                    geo::Coord { x, y },
                    geo::Coord {
                        x: x + dx,
                        y: y + dy,
                    },
                )
                .to_polygon();
                polygons.push((polygons.len() as GridId, cell));
            }
        }
        log::info!(
            "Generated {} grid cells of {} m out of a {} x {} tessellation",
            polygons.len(),
            cell_size_m,
            num_cols,
            num_rows
        );
        Self::from_polygons(polygons)
    }

    pub fn cells(&self) -> &[GridCell] {
        &self.cells
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn cell(&self, id: GridId) -> Option<&GridCell> {
        self.positions.get(&id).map(|position| &self.cells[*position])
    }

    pub fn nearest_cell(&self, point: &geo::Point) -> Option<GridId> {
        self.indexer.nearest_cell(point)
    }
}
