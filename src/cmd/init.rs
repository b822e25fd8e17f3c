//! `pipeline init`.

use anyhow::Result;
use std::path::Path;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    use remediate::init::init_project;

    let result = init_project(project_dir)?;
    if result.created {
        println!(
            "{} {}",
            console::style("Initialized").green().bold(),
            result.pipeline_dir.display()
        );
    } else {
        println!("Already initialized at {}", result.pipeline_dir.display());
    }
    if result.wrote_config {
        println!();
        println!("Edit .pipeline/pipeline.toml to set:");
        println!("  - [analyzer] command  (prints a JSON array of issue records)");
        println!("  - [agent] command     (reads one fix instruction on stdin)");
        println!("  - [protection] files  (then run 'pipeline protect setup')");
    }
    println!();
    Ok(())
}
