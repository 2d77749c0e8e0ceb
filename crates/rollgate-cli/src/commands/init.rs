use std::path::Path;

use anyhow::{bail, Context};

use rollgate_core::RollgateConfig;

pub fn init(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", output.display());
    }
    let content = RollgateConfig::scaffold().to_toml_string()?;
    std::fs::write(output, content).with_context(|| format!("writing {}", output.display()))?;
    println!("✓ Generated {}", output.display());
    Ok(())
}
