pub mod batch;
pub mod config;
pub mod geo;
pub mod location;
