//! S3M (ScreamTracker 3) output

pub mod effects;
pub mod writer;

pub use writer::{write_module_to_s3m, S3mOptions};
