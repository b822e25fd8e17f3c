//! CLI command implementations.
//!
//! | Module    | Commands handled       |
//! |-----------|------------------------|
//! | `init`    | `Init`                 |
//! | `run`     | `Run`, `Resume`        |
//! | `status`  | `Status`               |
//! | `config`  | `Config`               |
//! | `protect` | `Protect`              |

pub mod config;
pub mod init;
pub mod protect;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use init::cmd_init;
pub use protect::cmd_protect;
pub use run::{cmd_resume, cmd_run};
pub use status::cmd_status;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

use remediate::config::PIPELINE_DIR;
use remediate::pipeline_config::PipelineToml;
use remediate::telemetry::init_telemetry;

/// Set up logging before any command runs. The JSON file layer is only
/// enabled once `.pipeline/` exists, so `init` never writes into a bare repo.
pub fn init_logging(project_dir: &Path, verbose: bool) -> Option<WorkerGuard> {
    let pipeline_dir = project_dir.join(PIPELINE_DIR);
    let level = if verbose {
        "debug".to_string()
    } else {
        let mut settings = PipelineToml::load_or_default(&pipeline_dir).unwrap_or_default();
        settings.apply_env();
        settings.pipeline.log_level
    };
    let log_dir = pipeline_dir.join("logs");
    init_telemetry(&level, pipeline_dir.exists().then_some(log_dir.as_path()))
}
