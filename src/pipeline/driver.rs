use std::panic::{catch_unwind, AssertUnwindSafe};

use anyhow::{anyhow, Context};
use indicatif::{ParallelProgressIterator, ProgressBar};
use rayon::prelude::*;

use super::city::{recompute_from_access_table, CityContext, CitySummary};
use super::config::Config;
use crate::classification::chain::{ChainFrequencies, ChainScope, MajorChains};
use crate::classification::scheme::ClassificationScheme;
use crate::travel_time::service::TravelTimeService;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Recompute accessibility from persisted access tables instead of routing.
    pub from_access_table: bool,
}

/// Outcome of a run. A failing city never prevents the others from finishing.
#[derive(Debug, Default)]
pub struct RunReport {
    pub succeeded: Vec<CitySummary>,
    pub failed: Vec<(String, anyhow::Error)>,
}

impl RunReport {
    fn record(&mut self, name: String, result: anyhow::Result<CitySummary>) {
        match result {
            Ok(summary) => self.succeeded.push(summary),
            Err(err) => {
                log::error!("{} failed: {:#}", name, err);
                self.failed.push((name, err));
            }
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn log_summary(&self) {
        for summary in &self.succeeded {
            log::info!(
                "{}: ok, {} features, {} POIs, {} reclassified, {} access points, {} cells, \
                 {} records in {} chunks, {} rows, {} malformed",
                summary.name,
                summary.num_features,
                summary.num_pois,
                summary.num_reclassified,
                summary.num_access_points,
                summary.num_cells,
                summary.stream.records,
                summary.stream.chunks,
                summary.stream.rows,
                summary.stream.malformed
            );
        }
        for (name, err) in &self.failed {
            log::error!("{}: failed, {:#}", name, err);
        }
        log::info!(
            "{} cities succeeded, {} failed",
            self.succeeded.len(),
            self.failed.len()
        );
    }
}

fn guarded<T>(name: &str, run: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    catch_unwind(AssertUnwindSafe(run)).unwrap_or_else(|_| Err(anyhow!("{} panicked", name)))
}

/// Run all configured cities. Errors in the classification scheme or the chain detection
/// settings abort the run before any city is touched.
pub fn run(
    config: &Config,
    service: &dyn TravelTimeService,
    options: &RunOptions,
) -> anyhow::Result<RunReport> {
    let scheme = ClassificationScheme::from_csv_path(&config.classification_scheme_path)
        .with_context(|| {
            format!(
                "Loading classification scheme {:?}",
                config.classification_scheme_path
            )
        })?;
    config.chain_detection.validate(&scheme)?;
    log::info!(
        "Loaded {} classification rules, processing {} cities",
        scheme.rules().len(),
        config.cities.len()
    );

    let mut report = RunReport::default();
    if options.from_access_table {
        let results: Vec<(String, anyhow::Result<CitySummary>)> = config
            .cities
            .par_iter()
            .progress_with(ProgressBar::new(config.cities.len() as u64))
            .map(|city| {
                let result =
                    guarded(&city.name, || recompute_from_access_table(city, &scheme, config));
                (city.name.clone(), result)
            })
            .collect();
        for (name, result) in results {
            report.record(name, result);
        }
        return Ok(report);
    }

    log::info!("Loading and classifying cities");
    let loaded: Vec<(String, anyhow::Result<CityContext>)> = config
        .cities
        .par_iter()
        .progress_with(ProgressBar::new(config.cities.len() as u64))
        .map(|city| {
            let result =
                guarded(&city.name, || CityContext::load(city.clone(), &scheme, config));
            (city.name.clone(), result)
        })
        .collect();
    let mut contexts = Vec::with_capacity(loaded.len());
    for (name, result) in loaded {
        match result {
            Ok(context) => contexts.push(context),
            Err(err) => report.record(name, Err(err)),
        }
    }

    let chain_config = &config.chain_detection;
    let global_chains = match chain_config.scope {
        ChainScope::Global => {
            let mut frequencies = ChainFrequencies::default();
            for context in &contexts {
                frequencies.merge(&context.chain_frequencies);
            }
            let chains = frequencies.major_chains(chain_config.min_occurrences);
            if chains.is_empty() {
                log::warn!(
                    "No chain name occurs {} times, every {} feature becomes {}",
                    chain_config.min_occurrences,
                    chain_config.category,
                    chain_config.fallback_category
                );
            }
            log::info!("Found {} major chain names over all cities", chains.len());
            Some(chains)
        }
        ChainScope::PerCity => None,
    };

    log::info!("Processing cities");
    let num_contexts = contexts.len() as u64;
    let results: Vec<(String, anyhow::Result<CitySummary>)> = contexts
        .into_par_iter()
        .progress_with(ProgressBar::new(num_contexts))
        .map(|context| {
            let name = context.city.name.clone();
            let result = guarded(&name, || {
                let city_chains: MajorChains;
                let chains = match &global_chains {
                    Some(chains) => chains,
                    None => {
                        city_chains = context
                            .chain_frequencies
                            .major_chains(chain_config.min_occurrences);
                        &city_chains
                    }
                };
                context.process(chains, &scheme, config, service)
            });
            (name, result)
        })
        .collect();
    for (name, result) in results {
        report.record(name, result);
    }
    Ok(report)
}
