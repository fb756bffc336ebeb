pub mod accumulator;
pub mod aggregator;
pub mod catalog;
pub mod composer;
pub mod config;
pub mod delta;
pub mod error;
pub mod orchestrator;
pub mod routes;
pub mod upstream;
