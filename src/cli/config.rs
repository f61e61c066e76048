//! Config command handlers.

use std::path::Path;

use anyhow::Result;

use super::{load_config, ConfigAction};

/// Handle `dlquota config` subcommands.
pub(crate) fn cmd_config(action: ConfigAction, path: Option<&Path>) -> Result<()> {
    let config = load_config(path)?;
    match action {
        ConfigAction::Show => {
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Check => {
            println!("Configuration OK");
            if config.tenants.is_empty() {
                println!("  tenants:          (none)");
            } else {
                println!("  tenants:          {}", config.tenants.join(", "));
            }
            println!("  sync tick:        {}s", config.sync_tick_secs);
            println!("  rate purge tick:  {}s", config.rate_expiration_tick_secs);
            println!("  reporter flush:   {}s", config.reporter.flush_tick_secs);
            println!(
                "  default limits:   quota {}, rate {}",
                config.defaults.max_quota, config.defaults.rate_limit
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_check_accepts_valid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "tenants = [\"a\"]\nsync_tick_secs = 10\n").unwrap();
        assert!(cmd_config(ConfigAction::Check, Some(path.as_path())).is_ok());
    }

    #[test]
    fn test_config_check_rejects_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "sync_tick_secs = 0\n").unwrap();
        assert!(cmd_config(ConfigAction::Check, Some(path.as_path())).is_err());
    }

    #[test]
    fn test_config_show_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(cmd_config(ConfigAction::Show, Some(path.as_path())).is_err());
    }
}
