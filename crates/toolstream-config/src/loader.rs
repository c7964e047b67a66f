use std::path::{Path, PathBuf};
use std::str::FromStr;

use toolstream_common::{Error, Result};
use tracing::{debug, info};

use crate::model::EngineConfig;

const ENV_PREFIX: &str = "TOOLSTREAM_";

/// Resolves an [`EngineConfig`] from a file plus `TOOLSTREAM_*` environment overrides.
///
/// Lookup order for the file: the explicit path, `./toolstream.yml`, then
/// `~/.toolstream/config.yml`. A missing file is not an error; defaults are used.
#[derive(Debug, Default, Clone)]
pub struct ConfigLoader {
    path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<EngineConfig> {
        let _ = dotenvy::dotenv();

        let mut config = match self.resolve_path()? {
            Some(path) => Self::load_file(&path)?,
            None => {
                debug!("no config file found, using defaults");
                EngineConfig::default()
            }
        };

        apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse one file, choosing TOML or YAML by extension.
    pub fn load_file(path: &Path) -> Result<EngineConfig> {
        let raw = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&raw)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?,
            _ => serde_yaml::from_str(&raw)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?,
        };
        info!("loaded config from {}", path.display());
        Ok(config)
    }

    fn resolve_path(&self) -> Result<Option<PathBuf>> {
        if let Some(path) = &self.path {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            return Ok(Some(path.clone()));
        }

        let local = PathBuf::from("toolstream.yml");
        if local.exists() {
            return Ok(Some(local));
        }

        Ok(dirs::home_dir()
            .map(|home| home.join(".toolstream").join("config.yml"))
            .filter(|p| p.exists()))
    }
}

/// Apply `TOOLSTREAM_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides(
    config: &mut EngineConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.is_empty());

    if let Some(v) = var("ENDPOINT") {
        config.endpoint = v;
    }
    if let Some(v) = var("API_KEY") {
        config.api_key = Some(v);
    }
    if let Some(v) = var("MODEL") {
        config.model = v;
    }
    if let Some(v) = var("TEMPERATURE") {
        config.temperature = parse_var("TEMPERATURE", &v)?;
    }
    if let Some(v) = var("MAX_TOKENS") {
        config.max_tokens = parse_var("MAX_TOKENS", &v)?;
    }
    if let Some(v) = var("TIMEOUT_SECS") {
        config.timeout_secs = parse_var("TIMEOUT_SECS", &v)?;
    }
    if let Some(v) = var("MAX_TURNS") {
        config.max_turns = parse_var("MAX_TURNS", &v)?;
    }
    if let Some(v) = var("SYSTEM_PROMPT") {
        config.system_prompt = Some(v);
    }
    if let Some(v) = var("TOOL_SERVER_URL") {
        config.tool_server_url = Some(v);
    }
    Ok(())
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{ENV_PREFIX}{name}={value:?}: {e}")))
}
