use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::chunked_join::{AccessRow, AccessRowSink};
use crate::grid::grid::{Grid, GridId};
use crate::travel_time::record::Minutes;

/// Accessibility of one grid cell: the minimum travel time per reachable Class_C.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessibilityRecord {
    pub grid_id: GridId,
    pub geometry: geo::Polygon,
    pub min_travel_times: BTreeMap<String, Minutes>,
    /// Mean over the reachable categories, `None` if nothing is reachable.
    pub mean_min_tt: Option<f64>,
    /// Reachable categories within the time budget.
    pub n: usize,
}

/// Folds access rows into per-origin category minimums. Rows can arrive in any order.
#[derive(Debug, Default)]
pub struct AccessibilityAccumulator {
    minimums: HashMap<GridId, BTreeMap<String, Minutes>>,
}

impl AccessibilityAccumulator {
    pub fn add(&mut self, row: &AccessRow) {
        let minimums = self.minimums.entry(row.from_id).or_default();
        match minimums.get_mut(&row.class_c) {
            Some(minimum) => *minimum = (*minimum).min(row.travel_time_p50),
            None => {
                minimums.insert(row.class_c.clone(), row.travel_time_p50);
            }
        }
    }

    pub fn num_origins(&self) -> usize {
        self.minimums.len()
    }

    /// One record per grid cell, cells without any reachable category included.
    pub fn finish(
        mut self,
        grid: &Grid,
        categories: &BTreeSet<String>,
        time_budget_min: Option<Minutes>,
    ) -> Vec<AccessibilityRecord> {
        let records: Vec<AccessibilityRecord> = grid
            .cells()
            .iter()
            .map(|cell| {
                let mut min_travel_times = self.minimums.remove(&cell.id).unwrap_or_default();
                min_travel_times.retain(|category, _| categories.contains(category));
                let mean_min_tt = if min_travel_times.is_empty() {
                    None
                } else {
                    let total: f64 = min_travel_times.values().map(|tt| *tt as f64).sum();
                    Some(total / min_travel_times.len() as f64)
                };
                let n = min_travel_times
                    .values()
                    .filter(|tt| time_budget_min.map_or(true, |budget| **tt <= budget))
                    .count();
                AccessibilityRecord {
                    grid_id: cell.id,
                    geometry: cell.geometry.clone(),
                    min_travel_times,
                    mean_min_tt,
                    n,
                }
            })
            .collect();
        if !self.minimums.is_empty() {
            log::warn!(
                "Ignoring {} origins that are not cells of the grid",
                self.minimums.len()
            );
        }
        records
    }
}

impl AccessRowSink for AccessibilityAccumulator {
    fn accept(&mut self, rows: &[AccessRow]) -> anyhow::Result<()> {
        for row in rows {
            self.add(row);
        }
        Ok(())
    }
}
