use std::path::Path;

use manifold_core::config::minimal_config_template;
use manifold_types::{ManifoldError, Result};

pub(crate) fn run_config_generate(dest: Option<&str>) -> Result<()> {
    let Some(dest) = dest else {
        print!("{}", minimal_config_template());
        return Ok(());
    };
    let path = Path::new(dest);
    if path.exists() {
        return Err(ManifoldError::Config(format!(
            "refusing to overwrite existing '{}'",
            path.display()
        )));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, minimal_config_template())?;
    println!("Wrote starter config to {}", path.display());
    Ok(())
}
