//! CLI subcommand handlers.

use crate::ConfigAction;
use relaybot_core::RelayConfig;
use std::path::Path;

pub fn handle_config(action: ConfigAction, config_file: Option<&Path>) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let path = match config_file {
                Some(path) => path.to_path_buf(),
                None => relaybot_core::config::user_config_path().ok_or_else(|| {
                    anyhow::anyhow!("No home directory found; pass --config <path>")
                })?,
            };
            if init_config(&path)? {
                println!("Created default configuration at: {}", path.display());
            } else {
                println!("Configuration file already exists at: {}", path.display());
            }
            Ok(())
        }
        ConfigAction::Show => {
            println!("{}", render_config(config_file)?);
            Ok(())
        }
    }
}

/// Write the default configuration to `path` unless a file is already there.
fn init_config(path: &Path) -> anyhow::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, RelayConfig::default().to_toml_string()?)?;
    Ok(true)
}

fn render_config(config_file: Option<&Path>) -> anyhow::Result<String> {
    let config = relaybot_core::load_config(config_file, None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    Ok(config.to_toml_string()?)
}
