pub mod agent;
pub mod analyzer;
pub mod backup;
pub mod config;
pub mod errors;
pub mod fix;
pub mod init;
pub mod integrity;
pub mod issue;
pub mod orchestrator;
pub mod pipeline_config;
pub mod process;
pub mod publish;
pub mod queue;
pub mod session;
pub mod strategy;
pub mod telemetry;
pub mod util;
