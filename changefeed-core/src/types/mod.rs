//! Data types flowing through the pipeline
mod event;
mod record;
mod wire;

pub use event::{Change, Event, EventMeta};
pub use record::Record;
pub use wire::{KeyStrategy, ValueFormat, WireMessage};
