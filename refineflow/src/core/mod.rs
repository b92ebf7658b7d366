//! Core types for refineflow.
//!
//! This module contains the stage enum with its static dependency map, and
//! the record and output entry types carried through the stores.

mod record;
mod stage;

pub use record::{OutputEntry, Record};
pub use stage::{Field, Stage};
