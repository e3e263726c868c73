use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

// ── Top-level config ──────────────────────────────────────────────

/// Top-level Herald configuration, loaded from `config.toml`.
///
/// Resolution order for the config directory: explicit `--config-dir`,
/// `HERALD_CONFIG_DIR` env, `~/.herald`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to config.toml - computed at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Discord bot token. Overridden by `HERALD_DISCORD_TOKEN`.
    #[serde(default)]
    pub discord_token: String,

    /// Provider factory name. Default: `"gemini"`.
    #[serde(default = "default_provider")]
    pub provider: String,

    /// API key for the selected provider. Overridden by `HERALD_API_KEY`.
    pub api_key: Option<String>,

    /// Bot persona: system prompt and model (`[persona]`).
    #[serde(default)]
    pub persona: PersonaConfig,

    /// Reply-chain history reconstruction (`[history]`).
    #[serde(default)]
    pub history: HistoryConfig,

    /// Generation call behavior (`[generation]`).
    #[serde(default)]
    pub generation: GenerationConfig,

    /// HTTP gateway (`[gateway]`).
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    /// System prompt defining the bot's persona.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Model identifier routed through the provider.
    #[serde(default = "default_model")]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Maximum turns in a reconstructed conversation, including the
    /// triggering message.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Upper bound on a single generation call, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Model temperature (0.0–2.0).
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Pre-shared credential for the `X-API-Key` header. Overridden by
    /// `HERALD_GATEWAY_API_KEY`.
    #[serde(default)]
    pub api_key: String,
    /// Fallback target for `/notify` requests without a `channel_id`.
    #[serde(default)]
    pub default_notify_channel_id: Option<u64>,
}

fn default_provider() -> String {
    "gemini".to_string()
}

fn default_system_prompt() -> String {
    "You are a helpful assistant.".to_string()
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_max_depth() -> usize {
    5
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_temperature() -> f64 {
    0.7
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            model: default_model(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            temperature: default_temperature(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: String::new(),
            default_notify_channel_id: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: default_config_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("config.toml"),
            discord_token: String::new(),
            provider: default_provider(),
            api_key: None,
            persona: PersonaConfig::default(),
            history: HistoryConfig::default(),
            generation: GenerationConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

fn default_config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("HERALD_CONFIG_DIR") {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }

    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not determine home directory")?;
    Ok(home.join(".herald"))
}

impl Config {
    /// Load config from `config_dir` (or the default location), creating a
    /// default file on first run.
    pub async fn load_or_init(config_dir: Option<&Path>) -> Result<Self> {
        let dir = match config_dir {
            Some(dir) => dir.to_path_buf(),
            None => default_config_dir()?,
        };
        let config_path = dir.join("config.toml");

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;

        let mut config = if config_path.exists() {
            // Warn if config file is world-readable (it may contain tokens)
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = fs::metadata(&config_path).await {
                    if meta.permissions().mode() & 0o004 != 0 {
                        tracing::warn!(
                            "Config file {} is world-readable. Consider: chmod 600 {}",
                            config_path.display(),
                            config_path.display(),
                        );
                    }
                }
            }

            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            toml::from_str::<Config>(&contents).context("Failed to parse config file")?
        } else {
            let config = Config::default();
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render default config")?;
            fs::write(&config_path, rendered)
                .await
                .context("Failed to write default config file")?;
            tracing::warn!(
                "Created default config at {}; fill in discord_token, api_key, and [gateway] api_key",
                config_path.display()
            );
            config
        };

        config.config_path = config_path;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_with(|name| std::env::var(name).ok());
    }

    fn apply_overrides_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        if let Some(token) = non_empty(lookup("HERALD_DISCORD_TOKEN")) {
            self.discord_token = token;
        }
        if let Some(key) = non_empty(lookup("HERALD_API_KEY")) {
            self.api_key = Some(key);
        }
        if let Some(key) = non_empty(lookup("HERALD_GATEWAY_API_KEY")) {
            self.gateway.api_key = key;
        }
    }

    /// Structural validation. Credential presence is checked separately so a
    /// freshly created default file still loads.
    pub fn validate(&self) -> Result<()> {
        if self.persona.model.trim().is_empty() {
            anyhow::bail!("persona.model must not be empty");
        }
        if self.history.max_depth == 0 {
            anyhow::bail!("history.max_depth must be at least 1");
        }
        if self.generation.timeout_secs == 0 {
            anyhow::bail!("generation.timeout_secs must be at least 1");
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            anyhow::bail!("generation.temperature must be between 0.0 and 2.0");
        }
        Ok(())
    }

    /// Check the credentials `run` cannot operate without.
    pub fn require_credentials(&self) -> Result<()> {
        if self.discord_token.trim().is_empty() {
            anyhow::bail!(
                "discord_token is not set. Edit {} or set HERALD_DISCORD_TOKEN.",
                self.config_path.display()
            );
        }
        if self.gateway.api_key.trim().is_empty() {
            anyhow::bail!(
                "[gateway] api_key is not set. Edit {} or set HERALD_GATEWAY_API_KEY.",
                self.config_path.display()
            );
        }
        Ok(())
    }
}
