//! The build pipeline: parser, cache, instruction executors, and the
//! orchestrating engine.

pub mod cache;
pub mod clusterfile;
mod engine;
pub mod instruction;

pub use cache::{CacheProbe, CacheService};
pub use clusterfile::{Clusterfile, Instruction, InstructionKind};
pub use engine::{BuildEngine, BuildOutcome, BuildRequest};
