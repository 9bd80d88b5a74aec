//! Decoders for Krawall's in-ROM record layout

pub mod instrument;
pub mod module;
pub mod pattern;
pub mod sample;

pub use instrument::{read_instrument, EnvNode, Envelope, Instrument};
pub use module::{read_module, Module};
pub use pattern::{read_pattern, Event, EventReader, Pattern};
pub use sample::{read_sample, read_sample_size, Sample};
