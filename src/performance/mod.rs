//! Runtime performance sampling (§9, §10.5).

pub mod sampler;

pub use sampler::{sample_process, ProcessSample, RuntimeSampler};
