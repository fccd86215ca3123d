pub mod analysis;
pub mod generator;
