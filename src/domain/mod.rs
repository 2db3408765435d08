pub mod cohort;
pub mod cycle;
pub mod errors;
pub mod grid;
pub mod hybrid;
pub mod metrics;
pub mod ports;
pub mod regime;
pub mod repositories;
pub mod signals;
pub mod types;
pub mod weights;
