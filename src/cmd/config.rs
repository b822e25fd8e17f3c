//! Configuration view and validation commands: `pipeline config`.

use anyhow::{Context, Result};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use remediate::config::Config;
    use remediate::pipeline_config::CONFIG_FILE_NAME;

    let config = Config::new(project_dir.to_path_buf(), false)?;
    let config_path = config.pipeline_dir.join(CONFIG_FILE_NAME);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Pipeline Configuration");
            println!("======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No pipeline.toml found at {}; using defaults.", config_path.display());
            }
            println!("Effective values (with env overrides):");
            println!();
            let rendered = toml::to_string_pretty(&config.settings).context("Failed to render configuration")?;
            for line in rendered.lines() {
                println!("  {}", line);
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.settings.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
    }

    Ok(())
}
