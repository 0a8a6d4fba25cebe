pub mod config;
pub mod conflicts;
pub mod errors;
pub mod gates;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod review;
pub mod story;
pub mod tracker;
pub mod util;
pub mod workflow;
