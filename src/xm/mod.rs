//! XM (FastTracker II) output

pub mod effects;
pub mod writer;

pub use writer::{write_module_to_xm, XmOptions};
