//! # ps-search
//!
//! Search space definitions and variant generation for Pipesweep.
//!
//! A configuration template with variation points is parsed into a
//! [`SearchSpace`]; a [`VariantGenerator`] then walks it with a grid or random
//! strategy and yields fully-resolved [`ps_types::RunConfig`]s lazily.

mod generator;
mod space;

pub use generator::{
    fingerprint, generate, run_dir, GenerationStrategy, GridSearch, RandomSearch,
    SampleReduction, SearchStrategy, VariantGenerator,
};
pub use space::{SearchSpace, CHOICE_KEY, RANGE_KEY};
