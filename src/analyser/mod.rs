//! The core of capture processing.
//! Dissect packets, rebuild flow sessions per time bin, resolve who the capture belongs to,
//! and reduce each bin to a feature vector that can be fused over time.
pub mod containers;
pub mod core;
pub mod features;
pub mod fusion;
pub mod sessions;
pub mod source;
pub mod store;
pub mod utils;

#[cfg(test)]
pub(crate) mod testutil;
