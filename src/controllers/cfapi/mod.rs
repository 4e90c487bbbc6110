pub mod config;
pub mod controller;
pub mod kyma;
pub mod patching;

pub use controller::{run, Reconciler};
