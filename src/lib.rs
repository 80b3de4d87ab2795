pub mod aggregator;
pub mod budget;
pub mod checks;
pub mod client;
pub mod config;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod load_models;
pub mod metrics;
pub mod outcome;
pub mod percentiles;
pub mod scheduler;
pub mod target;
pub mod utils;
pub mod vu;
pub mod yaml_config;
