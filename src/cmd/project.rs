//! Project initialization for `shipwright init`.

use anyhow::Result;

pub fn cmd_init(project_dir: &std::path::Path, name: Option<&str>) -> Result<()> {
    use shipwright::init::init_project;

    let result = init_project(project_dir, name)?;

    if result.created {
        println!(
            "Initialized shipwright project at {}",
            result.shipwright_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .shipwright/");
        println!("  ├── pipeline.toml   # Sandbox, retry, architecture and remote settings");
        println!("  ├── plan.toml       # Phase plan (edit before running)");
        println!("  └── logs/           # Tracing logs");
        println!();
        println!("Next steps:");
        println!("  1. Review .shipwright/plan.toml");
        println!("  2. Run `shipwright run --dry-run` to check the plan against policy");
        println!("  3. Run `shipwright run` to execute the pipeline");
    } else if result.written.is_empty() {
        println!(
            "Shipwright project already initialized at {}",
            result.shipwright_dir.display()
        );
        println!("Existing files left unchanged.");
    } else {
        println!(
            "Completed shipwright initialization at {}",
            result.shipwright_dir.display()
        );
        for file in &result.written {
            println!("  wrote {}", file.display());
        }
    }

    Ok(())
}
