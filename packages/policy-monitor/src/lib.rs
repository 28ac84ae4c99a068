// Parametric Crop Cover - Policy Monitor Core
//
// This crate runs per-policy worker pools that pull weather and satellite
// measurements, evaluate parametric triggers, and raise claims.
//
// Worker infrastructure lives in kernel/jobs; business rules live in
// domains/*.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::*;
