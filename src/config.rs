use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which playback strategy to use. `Auto` inspects the input devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputModality {
    #[default]
    Auto,
    Hover,
    Touch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_catalog_url")]
    pub catalog_url: String,
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    #[serde(default = "default_volume_ceiling")]
    pub volume_ceiling: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub input_modality: InputModality,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_catalog_url() -> String {
    "http://localhost:3000/api/preview".to_string()
}

fn default_relay_url() -> String {
    "http://localhost:3000/api/preview-proxy".to_string()
}

fn default_volume_ceiling() -> f32 {
    0.4
}

fn default_max_retries() -> u32 {
    2
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_user_agent() -> String {
    format!("PreviewShelf/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            catalog_url: default_catalog_url(),
            relay_url: default_relay_url(),
            volume_ceiling: default_volume_ceiling(),
            max_retries: default_max_retries(),
            input_modality: InputModality::default(),
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl EngineConfig {
    pub fn config_dir() -> AppResult<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| AppError::Config("Cannot find home directory".into()))?;
        Ok(home.join(".preview-shelf"))
    }

    pub fn config_path() -> AppResult<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load from the default location, writing defaults there on first run.
    pub fn load() -> AppResult<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            log::info!("No config at {}, writing defaults", path.display());
            let config = Self::default();
            config.save_to(&path)?;
            return Ok(config);
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&content)?;
        config.volume_ceiling = config.volume_ceiling.clamp(0.0, 1.0);
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> AppResult<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> AppResult<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> AppResult<()> {
        for (name, value) in [("catalog_url", &self.catalog_url), ("relay_url", &self.relay_url)] {
            url::Url::parse(value)
                .map_err(|e| AppError::Config(format!("Invalid {}: {}", name, e)))?;
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"catalog_url": "https://example.com/lookup"}"#).unwrap();
        assert_eq!(config.catalog_url, "https://example.com/lookup");
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.input_modality, InputModality::Auto);
        assert!((config.volume_ceiling - 0.4).abs() < f32::EPSILON);
    }

    #[test]
    fn load_from_clamps_volume_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = EngineConfig {
            volume_ceiling: 3.0,
            input_modality: InputModality::Touch,
            ..EngineConfig::default()
        };
        config.save_to(&path).unwrap();

        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded.volume_ceiling, 1.0);
        assert_eq!(loaded.input_modality, InputModality::Touch);
    }

    #[test]
    fn load_from_rejects_unparseable_urls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"relay_url": "not a url"}"#).unwrap();

        let err = EngineConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
