use std::{collections::BTreeSet, fs};

use anyhow::{bail, Context};

use super::config::{CityConfig, Config};
use crate::aggregation::accessibility::AccessibilityAccumulator;
use crate::aggregation::chunked_join::{
    join_travel_times, replay_access_table, AccessIndex, AccessTableWriter, StreamStats,
};
use crate::classification::chain::{reclassify_independents, ChainFrequencies, MajorChains};
use crate::classification::scheme::{classify_features, ClassificationScheme};
use crate::geofile::feature::Feature;
use crate::geofile::geojson::{
    read_boundary_from_geojson, read_features_from_geojson, read_grid_polygons_from_geojson,
    read_lines_from_geojson, write_accessibility_to_geojson,
};
use crate::grid::access_points::{
    assign_access_points, write_access_points, EntranceProvider, NoEntrances,
    PathNetworkEntrances,
};
use crate::grid::grid::Grid;
use crate::travel_time::service::{
    Location, SessionGuard, TransportMode, TravelTimeRequest, TravelTimeService,
};

pub const ACCESS_POINTS_FILENAME: &str = "access_points.csv";
pub const ACCESS_TABLE_FILENAME: &str = "grid_ttm_access.csv";
pub const ACCESSIBILITY_FILENAME: &str = "accessibility.geojson";

/// What a city run produced, for the final report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CitySummary {
    pub name: String,
    pub num_features: usize,
    pub num_pois: usize,
    pub num_reclassified: usize,
    pub num_access_points: usize,
    pub num_cells: usize,
    pub stream: StreamStats,
}

fn load_grid(
    city: &CityConfig,
    boundary: &geo::MultiPolygon,
    config: &Config,
) -> anyhow::Result<Grid> {
    match &city.grid_path {
        Some(grid_path) => Grid::from_polygons(read_grid_polygons_from_geojson(grid_path)?)
            .with_context(|| format!("Loading grid {:?}", grid_path)),
        None => Grid::square(boundary, config.grid.cell_size_m),
    }
}

/// Everything known about a city once its inputs are loaded and classified.
pub struct CityContext {
    pub city: CityConfig,
    pub boundary: geo::MultiPolygon,
    pub grid: Grid,
    pub pois: Vec<Feature>,
    pub num_features: usize,
    pub chain_frequencies: ChainFrequencies,
    entrances: Box<dyn EntranceProvider + Send>,
}

impl CityContext {
    pub fn load(
        city: CityConfig,
        scheme: &ClassificationScheme,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let boundary = read_boundary_from_geojson(&city.boundary_path)
            .with_context(|| format!("Loading boundary of {}", city.name))?;
        let features = read_features_from_geojson(&city.features_path, &scheme.attribute_keys())
            .with_context(|| format!("Loading features of {}", city.name))?;
        let num_features = features.len();
        let pois = classify_features(scheme, features);
        let chain_frequencies = ChainFrequencies::from_features(&pois, &config.chain_detection);
        let grid = load_grid(&city, &boundary, config)?;
        let entrances: Box<dyn EntranceProvider + Send> = match &city.paths_path {
            Some(paths_path) => {
                let paths = read_lines_from_geojson(paths_path)
                    .with_context(|| format!("Loading path network of {}", city.name))?;
                let entrances = PathNetworkEntrances::new(&paths);
                log::debug!(
                    "{}: indexed {} path segments for entrance lookup",
                    city.name,
                    entrances.num_segments()
                );
                Box::new(entrances)
            }
            None => Box::new(NoEntrances),
        };
        log::info!(
            "Loaded {}: {} POIs out of {} features, {} grid cells",
            city.name,
            pois.len(),
            num_features,
            grid.num_cells()
        );
        Ok(Self {
            city,
            boundary,
            grid,
            pois,
            num_features,
            chain_frequencies,
            entrances,
        })
    }

    fn request(&self, index: &AccessIndex, config: &Config) -> TravelTimeRequest {
        let origins = self
            .grid
            .cells()
            .iter()
            .map(|cell| Location::new(cell.id, &cell.centroid))
            .collect();
        let destination_ids: BTreeSet<_> = index.destinations().collect();
        let destinations = destination_ids
            .into_iter()
            .filter_map(|id| self.grid.cell(id))
            .map(|cell| Location::new(cell.id, &cell.centroid))
            .collect();
        TravelTimeRequest {
            city: self.city.name.clone(),
            origins,
            destinations,
            mode: TransportMode::Walk,
            max_walk_time_min: config.travel_time.max_walk_time_min,
            walk_speed_kmh: config.travel_time.walk_speed_kmh,
            percentile: config.travel_time.percentile,
        }
    }

    /// Reclassify independents, assign access points, route and aggregate. Outputs go to
    /// `<output_dir>/<city>/`.
    pub fn process(
        mut self,
        chains: &MajorChains,
        scheme: &ClassificationScheme,
        config: &Config,
        service: &dyn TravelTimeService,
    ) -> anyhow::Result<CitySummary> {
        let name = self.city.name.clone();
        let num_reclassified =
            reclassify_independents(&mut self.pois, chains, &config.chain_detection, scheme)?;
        log::info!(
            "{}: reclassified {} {} features as {}",
            name,
            num_reclassified,
            config.chain_detection.category,
            config.chain_detection.fallback_category
        );

        let output_dir = config.city_output_dir(&name);
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("Creating output directory {:?}", output_dir))?;

        let access_points = assign_access_points(
            &self.pois,
            &self.grid,
            &self.boundary,
            &config.access_points,
            self.entrances.as_ref(),
        );
        write_access_points(&access_points, &output_dir.join(ACCESS_POINTS_FILENAME))?;
        let index = AccessIndex::new(&access_points, &self.pois);
        log::debug!(
            "{}: {} POIs indexed over {} destination cells",
            name,
            index.num_pois(),
            index.destinations().count()
        );

        let mut table_writer =
            AccessTableWriter::from_path(&output_dir.join(ACCESS_TABLE_FILENAME))?;
        let mut accumulator = AccessibilityAccumulator::default();
        let stream = if access_points.is_empty() {
            log::warn!("{}: no access points, skipping routing", name);
            StreamStats::default()
        } else {
            let request = self.request(&index, config);
            log::info!(
                "{}: requesting travel times from {} origins to {} destinations",
                name,
                request.origins.len(),
                request.destinations.len()
            );
            let mut session = SessionGuard::start(service, &request)?;
            let stats = join_travel_times(
                session.travel_times()?,
                &index,
                config.travel_time.chunk_size,
                (&mut table_writer, &mut accumulator),
            )?;
            session.close()?;
            if stats.records == 0 {
                bail!("{}: the travel time response is empty", name);
            }
            if stats.out_of_order > 0 {
                bail!(
                    "{}: the travel time response is not grouped by origin, {} records came \
                     after their origin was closed",
                    name,
                    stats.out_of_order
                );
            }
            stats
        };
        table_writer.finish()?;
        if stream.malformed > 0 {
            log::warn!(
                "{}: skipped {} malformed travel time records",
                name,
                stream.malformed
            );
        }

        let categories = scheme.class_c_categories();
        let records =
            accumulator.finish(&self.grid, &categories, config.travel_time.time_budget_min);
        write_accessibility_to_geojson(
            &records,
            &categories,
            &output_dir.join(ACCESSIBILITY_FILENAME),
        )?;

        Ok(CitySummary {
            name,
            num_features: self.num_features,
            num_pois: self.pois.len(),
            num_reclassified,
            num_access_points: access_points.len(),
            num_cells: self.grid.num_cells(),
            stream,
        })
    }
}

/// Recompute `accessibility.geojson` of a city from its persisted `grid_ttm_access.csv`.
pub fn recompute_from_access_table(
    city: &CityConfig,
    scheme: &ClassificationScheme,
    config: &Config,
) -> anyhow::Result<CitySummary> {
    let output_dir = config.city_output_dir(&city.name);
    let boundary = read_boundary_from_geojson(&city.boundary_path)
        .with_context(|| format!("Loading boundary of {}", city.name))?;
    let grid = load_grid(city, &boundary, config)?;
    let mut accumulator = AccessibilityAccumulator::default();
    let num_rows =
        replay_access_table(&output_dir.join(ACCESS_TABLE_FILENAME), &mut accumulator)?;
    log::info!(
        "{}: read {} access rows of {} origins",
        city.name,
        num_rows,
        accumulator.num_origins()
    );
    let categories = scheme.class_c_categories();
    let records = accumulator.finish(&grid, &categories, config.travel_time.time_budget_min);
    write_accessibility_to_geojson(
        &records,
        &categories,
        &output_dir.join(ACCESSIBILITY_FILENAME),
    )?;
    Ok(CitySummary {
        name: city.name.clone(),
        num_cells: grid.num_cells(),
        stream: StreamStats {
            rows: num_rows,
            ..StreamStats::default()
        },
        ..CitySummary::default()
    })
}
