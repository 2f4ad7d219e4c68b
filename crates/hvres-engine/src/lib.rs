//! hvres-engine — turn desired state into host property values.
//!
//! Pure functions over a [`PropertyBag`](hvres_bridge::PropertyBag): given
//! the object as the host reports it and the configuration the caller
//! wants, write the exact values the host will accept. Nothing here talks
//! to the host; the same inputs always produce the same bag.
//!
//! # Components
//!
//! - **`memory`** — page-size alignment, huge-page and running-VM rules
//! - **`processor`** — unit conversion, SMT mapping, optional capability flags
//! - **`schema`** — host property names

pub mod memory;
pub mod processor;
pub mod schema;

pub use memory::{MemoryChanges, align_numa_block, align_up, apply_memory, read_memory};
pub use processor::{ProcessorChanges, SettingsVariant, apply_processor, read_processor};
