//! Configuration system for relaybot.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! explicit config file -> environment -> overrides. The user-level file lives at
//! `~/.config/relaybot/config.toml` (platform equivalent via `directories`).

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::channels::telegram::TelegramConfig;
use crate::error::ConfigError;
use crate::pipeline::CozeConfig;

/// Top-level configuration for the relay bot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub assembly: AssemblyConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub relay: RelayFrontConfig,
    /// Optional Telegram transport configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram: Option<TelegramConfig>,
    /// Optional downstream conversational API configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coze: Option<CozeConfig>,
}

/// Timing thresholds for coalescing fragments into one burst.
///
/// The defaults are the hand-tuned values the bot has always shipped with.
/// They have no derivation beyond "felt right on mobile clients", so they are
/// kept configurable rather than baked in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    /// Base idle window after the most recent fragment.
    pub debounce_ms: u64,
    /// Shorter window used once more than `fast_after_parts` fragments arrived.
    pub fast_debounce_ms: u64,
    pub fast_after_parts: usize,
    /// Hard cap on fragments per burst.
    pub max_parts: usize,
    /// Session length after which a firing check completes unconditionally.
    pub force_after_ms: u64,
    /// Absolute ceiling after which every new check is armed at `min_delay_ms`.
    /// The janitor retires bursts open for twice this long.
    pub assembly_ceiling_ms: u64,
    pub min_delay_ms: u64,
    /// Tolerance subtracted from the armed window when judging idleness.
    pub idle_slack_ms: u64,
    pub janitor_interval_secs: u64,
    /// Acknowledgement for the first fragment of a burst.
    pub first_ack: String,
    /// Acknowledgement for later fragments; `{n}` is the part number.
    pub part_ack: String,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2000,
            fast_debounce_ms: 1500,
            fast_after_parts: 3,
            max_parts: 4,
            force_after_ms: 10_000,
            assembly_ceiling_ms: 60_000,
            min_delay_ms: 100,
            idle_slack_ms: 100,
            janitor_interval_secs: 30,
            first_ack: "📝 Message received, assembling parts...".to_string(),
            part_ack: "📝 Received part {n}, assembling...".to_string(),
        }
    }
}

impl AssemblyConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn fast_debounce(&self) -> Duration {
        Duration::from_millis(self.fast_debounce_ms)
    }

    pub fn force_after(&self) -> Duration {
        Duration::from_millis(self.force_after_ms)
    }

    pub fn assembly_ceiling(&self) -> Duration {
        Duration::from_millis(self.assembly_ceiling_ms)
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn idle_slack(&self) -> Duration {
        Duration::from_millis(self.idle_slack_ms)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }

    /// Bursts open longer than this are force-retired by the janitor.
    pub fn janitor_max_age(&self) -> Duration {
        self.assembly_ceiling() * 2
    }

    /// Render the acknowledgement text for the given part number.
    pub fn ack_text(&self, part: usize) -> String {
        if part <= 1 {
            self.first_ack.clone()
        } else {
            self.part_ack.replace("{n}", &part.to_string())
        }
    }

    /// Reject thresholds that would make the engine misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| {
            Err(ConfigError::Invalid {
                message: message.to_string(),
            })
        };
        if self.debounce_ms == 0 || self.fast_debounce_ms == 0 {
            return invalid("assembly debounce windows must be non-zero");
        }
        if self.fast_debounce_ms > self.debounce_ms {
            return invalid("assembly.fast_debounce_ms must not exceed assembly.debounce_ms");
        }
        if self.max_parts == 0 {
            return invalid("assembly.max_parts must be at least 1");
        }
        if self.min_delay_ms > self.debounce_ms {
            return invalid("assembly.min_delay_ms must not exceed assembly.debounce_ms");
        }
        if self.force_after_ms == 0 || self.assembly_ceiling_ms == 0 {
            return invalid("assembly ceilings must be non-zero");
        }
        if self.janitor_interval_secs == 0 {
            return invalid("assembly.janitor_interval_secs must be non-zero");
        }
        Ok(())
    }
}

/// User-facing texts and limits for the dispatch path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Delivered when the downstream call faults or times out.
    pub apology_text: String,
    /// Delivered when the downstream API answers but reports failure.
    pub api_error_text: String,
    /// Delivered instead of calling downstream when the daily quota is spent.
    pub quota_exceeded_text: String,
    pub request_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            apology_text: "⚠️ Sorry, something went wrong while processing your message."
                .to_string(),
            api_error_text: "⚠️ The assistant is unavailable right now. Please try again later."
                .to_string(),
            quota_exceeded_text: "⏳ You have reached today's request limit.".to_string(),
            request_timeout_secs: 120,
        }
    }
}

impl DispatchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Daily request quota applied before each downstream call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub enabled: bool,
    pub daily_limit: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_limit: 5,
        }
    }
}

/// Settings for the transport-facing front.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayFrontConfig {
    /// Menu button labels that discard an in-flight burst.
    pub interrupt_labels: Vec<String>,
    /// Commands that discard an in-flight burst. Other slash-prefixed text is
    /// treated as an ordinary fragment.
    pub interrupt_commands: Vec<String>,
    /// Whether fragment acknowledgements are sent back to the user.
    pub send_acknowledgements: bool,
}

impl Default for RelayFrontConfig {
    fn default() -> Self {
        Self {
            interrupt_labels: vec![
                "ℹ️ Instructions".to_string(),
                "💼 Plans".to_string(),
                "🔧 Support".to_string(),
                "👤 My profile".to_string(),
            ],
            interrupt_commands: vec!["/start".to_string()],
            send_acknowledgements: true,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.assembly.validate()
    }

    /// Serialize the effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }
}

/// Path of the user-level configuration file, if a home directory is known.
pub fn user_config_path() -> Option<std::path::PathBuf> {
    directories::ProjectDirs::from("dev", "relaybot", "relaybot")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `RELAYBOT_`)
/// 3. Explicit config file (`--config`)
/// 4. User config (`~/.config/relaybot/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    config_file: Option<&Path>,
    overrides: Option<&RelayConfig>,
) -> Result<RelayConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(RelayConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }

    // RELAYBOT_ASSEMBLY__DEBOUNCE_MS, RELAYBOT_TELEGRAM__BOT_TOKEN, etc.
    figment = figment.merge(Env::prefixed("RELAYBOT_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.assembly.debounce_ms, 2000);
        assert_eq!(config.assembly.fast_debounce_ms, 1500);
        assert_eq!(config.assembly.max_parts, 4);
        assert_eq!(config.assembly.janitor_max_age(), Duration::from_secs(120));
        assert_eq!(config.quota.daily_limit, 5);
        assert_eq!(config.relay.interrupt_commands, vec!["/start".to_string()]);
        assert!(config.telegram.is_none());
        assert!(config.coze.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ack_text() {
        let config = AssemblyConfig::default();
        assert_eq!(config.ack_text(1), config.first_ack);
        assert_eq!(config.ack_text(3), "📝 Received part 3, assembling...");
    }

    #[test]
    fn test_validate_rejects_bad_windows() {
        let config = AssemblyConfig {
            fast_debounce_ms: 5000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AssemblyConfig {
            max_parts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AssemblyConfig {
            debounce_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = RelayConfig::default();
        let rendered = config.to_toml_string().unwrap();
        let parsed: RelayConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.assembly.debounce_ms, config.assembly.debounce_ms);
        assert_eq!(parsed.relay.interrupt_labels, config.relay.interrupt_labels);
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[assembly]\ndebounce_ms = 3000\nmax_parts = 8\n\n[quota]\ndaily_limit = 50"
        )
        .unwrap();

        let config = load_config(Some(file.path()), None).unwrap();
        assert_eq!(config.assembly.debounce_ms, 3000);
        assert_eq!(config.assembly.max_parts, 8);
        // Unset keys keep their defaults.
        assert_eq!(config.assembly.fast_debounce_ms, 1500);
        assert_eq!(config.quota.daily_limit, 50);
    }

    #[test]
    fn test_load_config_interrupt_commands() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay]\ninterrupt_commands = [\"/start\", \"/plans\"]").unwrap();

        let config = load_config(Some(file.path()), None).unwrap();
        assert_eq!(config.relay.interrupt_commands, vec!["/start", "/plans"]);
        assert_eq!(config.relay.interrupt_labels.len(), 4);
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = RelayConfig::default();
        overrides.assembly.debounce_ms = 500;
        overrides.assembly.fast_debounce_ms = 400;
        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.assembly.debounce_ms, 500);
        assert_eq!(config.assembly.fast_debounce_ms, 400);
    }
}
