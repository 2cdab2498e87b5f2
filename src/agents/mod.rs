// Agent implementations shipped with the crate

pub mod simulated;

pub use simulated::{simulated_registry, SimulatedAgent};
