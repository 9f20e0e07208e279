use clap::ValueEnum;
use serde::Deserialize;

use crate::error::SpecError;
use crate::graph::DependencyGraph;

/// How the executor schedules stages whose dependencies are satisfied.
/// Sequential is the reference behavior; parallel runs independent stages
/// concurrently without changing any ordering guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Concurrency {
    Sequential,
    Parallel,
}

impl Default for Concurrency {
    fn default() -> Self {
        Concurrency::Sequential
    }
}

/// Group a schedule into depth waves. Stages within one wave share no
/// ancestry and may run concurrently; waves execute in order, so every
/// stage still starts strictly after all of its dependencies finished.
pub fn plan_waves(
    graph: &DependencyGraph,
    order: &[String],
) -> Result<Vec<Vec<String>>, SpecError> {
    let depths = graph.depths()?;
    let mut waves: Vec<Vec<String>> = Vec::new();
    for name in order {
        let depth = depths[name];
        while waves.len() <= depth {
            waves.push(Vec::new());
        }
        waves[depth].push(name.clone());
    }
    waves.retain(|wave| !wave.is_empty());
    Ok(waves)
}
