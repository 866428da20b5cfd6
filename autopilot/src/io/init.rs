//! Initialization helpers for `.autopilot/` scaffolding.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};

use super::StatePaths;
use super::config::{AutopilotConfig, write_config};

/// Keeps engine state out of the checkpoints it commits.
const AUTOPILOT_GITIGNORE: &str = "*\n";

/// Options for `init_workspace`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing engine-owned files.
    pub force: bool,
}

/// Create `.autopilot/` scaffolding in `root` with a default config.
///
/// Fails if `.autopilot/` already exists unless `options.force` is set.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<StatePaths> {
    let paths = StatePaths::new(root);
    if paths.dir.exists() && !paths.dir.is_dir() {
        return Err(anyhow!(
            "autopilot init: .autopilot exists but is not a directory"
        ));
    }
    if paths.dir.exists() && !options.force {
        return Err(anyhow!(
            "autopilot init: .autopilot already exists (use --force to overwrite)"
        ));
    }

    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create directory {}", paths.dir.display()))?;
    let gitignore = paths.dir.join(".gitignore");
    fs::write(&gitignore, AUTOPILOT_GITIGNORE)
        .with_context(|| format!("write file {}", gitignore.display()))?;
    write_config(&paths.config, &AutopilotConfig::default())?;

    Ok(paths)
}
