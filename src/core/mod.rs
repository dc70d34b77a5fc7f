//! Core domain logic: the pipeline engine, subtitle processing, cover
//! normalization and housekeeping sweeps.

pub mod cover;
pub mod engine;
pub mod housekeeping;
pub mod subtitle;
