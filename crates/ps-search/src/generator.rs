//! Variant generation: search strategies and the lazy [`VariantGenerator`].

use std::fmt;
use std::path::{Path, PathBuf};

use ps_types::{ConfigError, ExperimentConfig, PipelineSearch, RunConfig, SearchType};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::space::SearchSpace;

/// Random search was asked for more samples than distinct combinations exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SampleReduction {
    pub requested: usize,
    pub available: usize,
}

impl fmt::Display for SampleReduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requested {} samples but the search space has only {} distinct combinations; generating {}",
            self.requested, self.available, self.available
        )
    }
}

// ---------------------------------------------------------------------------
// Search strategies
// ---------------------------------------------------------------------------

/// Decides which combinations of a search space are run, and in which order.
///
/// Strategies hand out positions in grid order; the generator resolves them.
pub trait SearchStrategy: Send + Sync {
    /// Next batch of combination positions.
    fn suggest(&mut self, count: usize) -> Vec<usize>;

    /// Rewind so the same sequence is produced again.
    fn reset(&mut self);

    /// Total number of positions this strategy hands out.
    fn total(&self) -> usize;

    /// Set when the strategy produces fewer combinations than requested.
    fn reduction(&self) -> Option<SampleReduction> {
        None
    }

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

// ---- Grid search ----

/// Exhaustive enumeration of every combination in grid order.
#[derive(Debug, Clone)]
pub struct GridSearch {
    size: usize,
    cursor: usize,
}

impl GridSearch {
    pub fn new(space: &SearchSpace) -> Self {
        Self {
            size: space.size(),
            cursor: 0,
        }
    }
}

impl SearchStrategy for GridSearch {
    fn suggest(&mut self, count: usize) -> Vec<usize> {
        let end = self.cursor.saturating_add(count).min(self.size);
        let batch = (self.cursor..end).collect();
        self.cursor = end;
        batch
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn total(&self) -> usize {
        self.size
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Random search ----

/// Uniform sampling of distinct combinations.
///
/// Positions are drawn without replacement, so every variation point is
/// uniform and no combination repeats. Requests beyond the number of distinct
/// combinations are capped and reported through [`SampleReduction`].
#[derive(Debug, Clone)]
pub struct RandomSearch {
    order: Vec<usize>,
    cursor: usize,
    reduction: Option<SampleReduction>,
}

impl RandomSearch {
    pub fn new(space: &SearchSpace, samples: usize, seed: Option<u64>) -> Self {
        let size = space.size();
        let reduction = (samples > size).then_some(SampleReduction {
            requested: samples,
            available: size,
        });
        if let Some(reduction) = &reduction {
            warn!("Random search reduced: {reduction}");
        }

        let mut rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let order = rand::seq::index::sample(&mut rng, size, samples.min(size)).into_vec();

        Self {
            order,
            cursor: 0,
            reduction,
        }
    }
}

impl SearchStrategy for RandomSearch {
    fn suggest(&mut self, count: usize) -> Vec<usize> {
        let end = self.cursor.saturating_add(count).min(self.order.len());
        let batch = self.order[self.cursor..end].to_vec();
        self.cursor = end;
        batch
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn total(&self) -> usize {
        self.order.len()
    }

    fn reduction(&self) -> Option<SampleReduction> {
        self.reduction
    }

    fn name(&self) -> &str {
        "random"
    }
}

/// Strategy selection, as read from `pipeline_search`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStrategy {
    Grid,
    Random { samples: usize, seed: Option<u64> },
}

impl GenerationStrategy {
    pub fn from_settings(search: &PipelineSearch) -> Self {
        match search.search_type {
            SearchType::Grid => Self::Grid,
            SearchType::Random => Self::Random {
                samples: search.sample_num,
                seed: search.seed,
            },
        }
    }

    fn build(self, space: &SearchSpace) -> Box<dyn SearchStrategy> {
        match self {
            Self::Grid => Box::new(GridSearch::new(space)),
            Self::Random { samples, seed } => Box::new(RandomSearch::new(space, samples, seed)),
        }
    }
}

// ---------------------------------------------------------------------------
// Variant generator
// ---------------------------------------------------------------------------

/// Checkpoint directory of run `index` under `runs_dir`.
pub fn run_dir(runs_dir: &Path, index: usize) -> PathBuf {
    runs_dir.join(format!("run_{index}"))
}

/// Content fingerprint of resolved configuration values.
pub fn fingerprint(values: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(values.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Lazy, finite, restartable sequence of [`RunConfig`]s.
///
/// Each item is resolved only when requested. Indices are assigned in
/// generation order and never change, so a restarted generator reproduces the
/// same indices, values and checkpoint paths.
pub struct VariantGenerator {
    space: SearchSpace,
    strategy: Box<dyn SearchStrategy>,
    runs_dir: PathBuf,
    next_index: usize,
}

/// Generate the variants of `space` with `strategy`, checkpointing under
/// `runs_dir`.
pub fn generate(
    space: SearchSpace,
    strategy: GenerationStrategy,
    runs_dir: impl Into<PathBuf>,
) -> VariantGenerator {
    VariantGenerator::new(space, strategy, runs_dir)
}

impl VariantGenerator {
    pub fn new(
        space: SearchSpace,
        strategy: GenerationStrategy,
        runs_dir: impl Into<PathBuf>,
    ) -> Self {
        let strategy = strategy.build(&space);
        let runs_dir = runs_dir.into();
        debug!(
            "Variant generator: {} strategy, {} of {} combinations, runs under {}",
            strategy.name(),
            strategy.total(),
            space.size(),
            runs_dir.display()
        );
        Self {
            space,
            strategy,
            runs_dir,
            next_index: 0,
        }
    }

    /// Build the generator described by an experiment's `model.template` and
    /// `pipeline_search` settings.
    pub fn from_experiment(
        config: &ExperimentConfig,
        runs_dir: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let space = SearchSpace::parse(&config.model.template)?;
        let strategy = GenerationStrategy::from_settings(&config.pipeline_search);
        Ok(Self::new(space, strategy, runs_dir))
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    /// Total number of variants in the sequence.
    pub fn total(&self) -> usize {
        self.strategy.total()
    }

    pub fn reduction(&self) -> Option<SampleReduction> {
        self.strategy.reduction()
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Rewind to the first variant.
    pub fn restart(&mut self) {
        self.strategy.reset();
        self.next_index = 0;
    }
}

impl Iterator for VariantGenerator {
    type Item = RunConfig;

    fn next(&mut self) -> Option<Self::Item> {
        let position = self.strategy.suggest(1).into_iter().next()?;
        let values = self.space.resolve(position)?;
        let index = self.next_index;
        self.next_index += 1;
        Some(RunConfig::new(
            index,
            fingerprint(&values),
            run_dir(&self.runs_dir, index),
            values,
        ))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total().saturating_sub(self.next_index);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for VariantGenerator {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn sample_space() -> SearchSpace {
        SearchSpace::parse(&json!({
            "optimizer": {"search_choice": ["adam", "sgd"]},
            "layers": {"search_range": [1, 3]},
            "dropout": {"search_choice": [0.0, 0.1, 0.5]}
        }))
        .unwrap()
    }

    fn fingerprints(configs: &[RunConfig]) -> HashSet<String> {
        configs.iter().map(|c| c.fingerprint().to_string()).collect()
    }

    #[test]
    fn grid_produces_the_full_product() {
        let configs: Vec<RunConfig> =
            generate(sample_space(), GenerationStrategy::Grid, "/runs").collect();
        assert_eq!(configs.len(), 2 * 3 * 3);
        assert_eq!(fingerprints(&configs).len(), 18);

        for (i, config) in configs.iter().enumerate() {
            assert_eq!(config.index(), i);
        }
    }

    #[test]
    fn grid_is_deterministic_and_restartable() {
        let first: Vec<RunConfig> =
            generate(sample_space(), GenerationStrategy::Grid, "/runs").collect();
        let second: Vec<RunConfig> =
            generate(sample_space(), GenerationStrategy::Grid, "/runs").collect();
        assert_eq!(first, second);

        let mut generator = generate(sample_space(), GenerationStrategy::Grid, "/runs");
        let head: Vec<RunConfig> = generator.by_ref().take(4).collect();
        generator.restart();
        let again: Vec<RunConfig> = generator.collect();
        assert_eq!(again, first);
        assert_eq!(head[..], first[..4]);
    }

    #[test]
    fn grid_order_varies_last_point_fastest() {
        let mut generator = generate(sample_space(), GenerationStrategy::Grid, "/runs");
        let first = generator.next().unwrap();
        let second = generator.next().unwrap();
        // keys in order: dropout, layers, optimizer
        assert_eq!(first.get("/optimizer"), Some(&json!("adam")));
        assert_eq!(second.get("/optimizer"), Some(&json!("sgd")));
        assert_eq!(first.get("/layers"), second.get("/layers"));
        assert_eq!(first.get("/dropout"), second.get("/dropout"));
    }

    #[test]
    fn fixed_space_yields_the_template_once() {
        let template = json!({"lr": 0.01, "epochs": 5});
        let space = SearchSpace::parse(&template).unwrap();
        let configs: Vec<RunConfig> = generate(space, GenerationStrategy::Grid, "/runs").collect();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].values(), &template);
    }

    #[test]
    fn random_samples_are_distinct() {
        let strategy = GenerationStrategy::Random {
            samples: 10,
            seed: Some(7),
        };
        let generator = generate(sample_space(), strategy, "/runs");
        assert!(generator.reduction().is_none());

        let configs: Vec<RunConfig> = generator.collect();
        assert_eq!(configs.len(), 10);
        assert_eq!(fingerprints(&configs).len(), 10);
    }

    #[test]
    fn random_oversampling_is_capped_and_reported() {
        let strategy = GenerationStrategy::Random {
            samples: 50,
            seed: Some(1),
        };
        let generator = generate(sample_space(), strategy, "/runs");
        assert_eq!(
            generator.reduction(),
            Some(SampleReduction {
                requested: 50,
                available: 18
            })
        );
        assert_eq!(generator.len(), 18);

        let configs: Vec<RunConfig> = generator.collect();
        assert_eq!(configs.len(), 18);
        assert_eq!(fingerprints(&configs).len(), 18);
    }

    #[test]
    fn seeded_random_search_is_reproducible() {
        let strategy = GenerationStrategy::Random {
            samples: 6,
            seed: Some(42),
        };
        let a: Vec<RunConfig> = generate(sample_space(), strategy, "/runs").collect();
        let b: Vec<RunConfig> = generate(sample_space(), strategy, "/runs").collect();
        assert_eq!(a, b);
    }

    #[test]
    fn every_run_gets_its_own_save_dir() {
        let configs: Vec<RunConfig> =
            generate(sample_space(), GenerationStrategy::Grid, "/exp/runs").collect();
        let dirs: HashSet<&Path> = configs.iter().map(|c| c.save_dir()).collect();
        assert_eq!(dirs.len(), configs.len());
        assert_eq!(configs[3].save_dir(), Path::new("/exp/runs/run_3"));
    }

    #[test]
    fn from_experiment_reads_settings() {
        let config = ExperimentConfig::from_json_str(
            r#"{
                "pipeline_search": {"search_type": "grid"},
                "model": {
                    "metrics": ["f1"],
                    "template": {"c": {"search_choice": [1, 10, 100]}}
                }
            }"#,
        )
        .unwrap();
        let generator = VariantGenerator::from_experiment(&config, "/runs").unwrap();
        assert_eq!(generator.strategy_name(), "grid");
        assert_eq!(generator.total(), 3);
    }
}
