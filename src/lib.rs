pub mod agent;
pub mod agent_config;
pub mod client;
pub mod errors;
pub mod logging;
