pub mod architecture;
pub mod audit;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod init;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod plan;
pub mod qa;
pub mod retry;
pub mod sandbox;
pub mod util;
