use std::{fs, io, path::Path};

use anyhow::Context;
use chat_core::ChatConfig;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub address: String,
    pub table: String,
    pub chat: ChatConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            address: "0x00000000000000000000000000000000000a11ce".into(),
            table: "Table 1".into(),
            chat: ChatConfig::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    address: Option<String>,
    table: Option<String>,
    chat: Option<ChatConfig>,
}

/// Defaults, then the optional TOML file at `path`, then `APP__*` variables.
pub fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    match fs::read_to_string(path) {
        Ok(raw) => apply_file(&mut settings, &raw)
            .with_context(|| format!("failed to parse config file '{}'", path.display()))?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read config file '{}'", path.display()))
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file_cfg: FileSettings = toml::from_str(raw)?;
    if let Some(v) = file_cfg.address {
        settings.address = v;
    }
    if let Some(v) = file_cfg.table {
        settings.table = v;
    }
    if let Some(v) = file_cfg.chat {
        settings.chat = v;
    }
    Ok(())
}

fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("APP__ADDRESS") {
        settings.address = v;
    }
    if let Some(v) = lookup("APP__TABLE") {
        settings.table = v;
    }

    if let Some(parsed) = lookup("APP__RECONNECT_ATTEMPTS").and_then(|v| v.parse().ok()) {
        settings.chat.reconnect_attempts = parsed;
    }
    if let Some(parsed) = lookup("APP__DEDUP_CAPACITY").and_then(|v| v.parse().ok()) {
        settings.chat.dedup_capacity_per_group = parsed;
    }
    if let Some(parsed) = lookup("APP__EVENT_BUFFER").and_then(|v| v.parse().ok()) {
        settings.chat.event_buffer = parsed;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
