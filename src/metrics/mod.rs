//! Hand-rolled Prometheus metrics (no external exporter dependency).

pub mod meter;

pub use meter::*;
