//! Initialize the configuration directory: create ~/.chatbridge and a template config.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{Config, RouteConfig, RouteDirection};

/// Template written by `init`: empty tokens and one example route to edit.
pub fn template_config() -> Config {
    let mut config = Config::default();
    config.telegram.bot_token = Some(String::new());
    config.discord.bot_token = Some(String::new());
    config.routes.push(RouteConfig {
        telegram_chat_id: "-1000000000000".to_string(),
        discord_channel_id: "000000000000000000".to_string(),
        direction: RouteDirection::Both,
    });
    config
}

/// Create the config directory and a template config file if it does not exist.
/// An existing config file is left untouched. Returns the config directory.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if config_path.exists() {
        log::debug!("config already exists at {}, skipping", config_path.display());
    } else {
        let json = serde_json::to_string_pretty(&template_config())
            .context("serializing template config")?;
        std::fs::write(config_path, json)
            .with_context(|| format!("writing template config to {}", config_path.display()))?;
        log::info!("created template config at {}", config_path.display());
    }

    Ok(config_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;

    #[test]
    fn init_writes_loadable_template_once() {
        let dir = std::env::temp_dir().join(format!("chatbridge-init-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("config.json");
        let returned = init_config_dir(&path).unwrap();
        assert_eq!(returned, dir.join("nested"));

        let (config, _) = load_config(Some(path.clone())).unwrap();
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].direction, RouteDirection::Both);

        std::fs::write(&path, "{}").unwrap();
        init_config_dir(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
