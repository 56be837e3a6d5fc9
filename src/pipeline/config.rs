use std::{
    collections::BTreeSet,
    fs::read_to_string,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;

use crate::classification::chain::ChainDetectionConfig;
use crate::grid::access_points::AccessPointConfig;
use crate::grid::grid::GridConfig;
use crate::travel_time::service::TravelTimeConfig;

#[derive(Deserialize, Debug, Clone)]
pub struct CityConfig {
    pub name: String,
    pub boundary_path: PathBuf,
    pub features_path: PathBuf,
    /// Precomputed grid with a `grid_id` property. Generated from the boundary if absent.
    #[serde(default)]
    pub grid_path: Option<PathBuf>,
    /// Path network used to locate entrances of large POIs.
    #[serde(default)]
    pub paths_path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub classification_scheme_path: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub chain_detection: ChainDetectionConfig,
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub access_points: AccessPointConfig,
    pub travel_time: TravelTimeConfig,
    pub cities: Vec<CityConfig>,
}

impl Config {
    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            bail!("Config file {:?} not found", path);
        }
        let contents = read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Parsing config file {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// City names become output directory names and must be unique.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut names = BTreeSet::new();
        for city in &self.cities {
            if city.name.is_empty() || city.name.contains(['/', '\\']) || city.name.starts_with('.')
            {
                bail!("'{}' cannot be used as a city name", city.name);
            }
            if !names.insert(city.name.as_str()) {
                bail!("City {} is configured more than once", city.name);
            }
        }
        if self.travel_time.chunk_size == 0 {
            bail!("travel_time.chunk_size must be at least 1");
        }
        Ok(())
    }

    /// Restrict the run to the named cities. An empty selection keeps all of them.
    pub fn select_cities(&mut self, names: &[String]) -> anyhow::Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        if let Some(unknown) = names
            .iter()
            .find(|name| !self.cities.iter().any(|city| &city.name == *name))
        {
            return Err(anyhow!("City {} is not configured", unknown));
        }
        self.cities.retain(|city| names.contains(&city.name));
        Ok(())
    }

    pub fn city_output_dir(&self, city: &str) -> PathBuf {
        self.output_dir.join(city)
    }
}
