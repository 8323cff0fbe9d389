//! Precompilation of shared artifacts before any job runs.
//!
//! Compiling model definitions inside the worker processes would distort
//! their timings and compile the same model many times, so every distinct
//! model (and every premodel used by an initialization strategy) is built
//! once up front. A build failure aborts the run before anything spawns.

pub mod builder;
pub mod precompiler;

pub use builder::{ArtifactBuilder, CommandBuilder, OUTPUT_PLACEHOLDER, SOURCE_PLACEHOLDER};
pub use precompiler::{PrecompileOutcome, Precompiler, DEFAULT_COMPILED_EXTENSION};
