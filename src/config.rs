//! Configuration management
//!
//! Loads configuration from config.toml with support for:
//! - Chat platform credentials and guild
//! - Server binding settings
//! - Storage backend selection
//! - Runtime settings (limits, anti-cheat policy, leaderboards, notifications)
//!
//! Runtime settings are also persisted through the storage backend and can be
//! changed while the server runs with [`Settings::apply`].

use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ValidationError;
use crate::models::{AntiCheatOverride, ChannelId};

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

/// Refresh interval bounds for the auto-post leaderboard.
pub const MIN_REFRESH_INTERVAL_SECS: u64 = 10;
pub const MAX_REFRESH_INTERVAL_SECS: u64 = 3600;

/// Main configuration structure matching config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub discord: DiscordConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// Bot token (DISCORD_TOKEN takes precedence)
    #[serde(default)]
    pub token: String,
    /// Guild the engine manages (GUILD_ID takes precedence)
    #[serde(default)]
    pub guild_id: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Storage configuration. The remote database is used when DATABASE_URL is
/// set and reachable; the local file is always available as fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub data_path: String,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_path: "giveaways.db".to_string(),
            url: None,
        }
    }
}

/// Settings that can change at runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub limits: LimitSettings,
    pub anti_cheat: AntiCheatPolicy,
    pub leaderboard: LeaderboardSettings,
    pub notifications: NotificationSettings,
    pub invites: InviteSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub min_duration_secs: i64,
    pub max_duration_secs: i64,
    pub max_winners: u32,
    pub max_active_giveaways: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            min_duration_secs: 60,
            max_duration_secs: 30 * 24 * 3600,
            max_winners: 20,
            max_active_giveaways: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiCheatPolicy {
    pub enabled: bool,
    pub block_bots: bool,
    pub min_account_age_days: u32,
    pub join_rate_window_secs: i64,
    /// More than this many other joins inside the window rejects the invite.
    pub join_rate_threshold: u32,
    /// Accounts younger than this are scored for suspicion.
    pub young_account_days: u32,
    pub suspicion_threshold: u32,
}

impl Default for AntiCheatPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            block_bots: true,
            min_account_age_days: 7,
            join_rate_window_secs: 300,
            join_rate_threshold: 3,
            young_account_days: 7,
            suspicion_threshold: 4,
        }
    }
}

impl AntiCheatPolicy {
    /// Apply a per-giveaway override on top of the global policy.
    pub fn with_override(&self, over: Option<&AntiCheatOverride>) -> Self {
        let mut policy = self.clone();
        if let Some(over) = over {
            if let Some(enabled) = over.enabled {
                policy.enabled = enabled;
            }
            if let Some(block_bots) = over.block_bots {
                policy.block_bots = block_bots;
            }
            if let Some(days) = over.min_account_age_days {
                policy.min_account_age_days = days;
            }
            if let Some(threshold) = over.join_rate_threshold {
                policy.join_rate_threshold = threshold;
            }
        }
        policy
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderboardSettings {
    pub auto_post_enabled: bool,
    pub auto_post_category_id: Option<ChannelId>,
    pub refresh_interval_secs: u64,
    /// "HH:MM" (UTC) for the daily forced post.
    pub daily_post_time: Option<String>,
    pub max_entries: usize,
}

impl Default for LeaderboardSettings {
    fn default() -> Self {
        Self {
            auto_post_enabled: true,
            auto_post_category_id: None,
            refresh_interval_secs: 30,
            daily_post_time: None,
            max_entries: 25,
        }
    }
}

impl LeaderboardSettings {
    pub fn daily_post_at(&self) -> Option<NaiveTime> {
        self.daily_post_time
            .as_deref()
            .and_then(|t| NaiveTime::parse_from_str(t, "%H:%M").ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub dm_winners: bool,
    pub dm_pacing_ms: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            dm_winners: true,
            dm_pacing_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InviteSettings {
    /// Soft cap on uses of a generated invite link.
    pub max_uses_per_code: u32,
}

impl Default for InviteSettings {
    fn default() -> Self {
        Self {
            max_uses_per_code: 100,
        }
    }
}

/// Partial settings update. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    pub max_winners: Option<u32>,
    pub max_active_giveaways: Option<usize>,
    pub min_duration_secs: Option<i64>,
    pub max_duration_secs: Option<i64>,
    pub anti_cheat_enabled: Option<bool>,
    pub block_bots: Option<bool>,
    pub min_account_age_days: Option<u32>,
    pub join_rate_threshold: Option<u32>,
    pub auto_post_enabled: Option<bool>,
    pub auto_post_category_id: Option<ChannelId>,
    pub refresh_interval_secs: Option<u64>,
    pub daily_post_time: Option<String>,
    pub dm_winners: Option<bool>,
    pub dm_pacing_ms: Option<u64>,
    pub max_uses_per_code: Option<u32>,
}

/// What changed in an applied patch that needs follow-up work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsChange {
    pub refresh_interval_changed: bool,
}

impl Settings {
    /// Merge `patch` into these settings. Nothing is changed on error.
    pub fn apply(&mut self, patch: SettingsPatch) -> Result<SettingsChange, ValidationError> {
        let mut next = self.clone();

        if let Some(v) = patch.max_winners {
            if v == 0 {
                return Err(ValidationError::InvalidSetting(
                    "max_winners must be at least 1".into(),
                ));
            }
            next.limits.max_winners = v;
        }
        if let Some(v) = patch.max_active_giveaways {
            next.limits.max_active_giveaways = v;
        }
        if let Some(v) = patch.min_duration_secs {
            next.limits.min_duration_secs = v;
        }
        if let Some(v) = patch.max_duration_secs {
            next.limits.max_duration_secs = v;
        }
        if next.limits.min_duration_secs > next.limits.max_duration_secs {
            return Err(ValidationError::InvalidSetting(
                "min_duration_secs exceeds max_duration_secs".into(),
            ));
        }

        if let Some(v) = patch.anti_cheat_enabled {
            next.anti_cheat.enabled = v;
        }
        if let Some(v) = patch.block_bots {
            next.anti_cheat.block_bots = v;
        }
        if let Some(v) = patch.min_account_age_days {
            next.anti_cheat.min_account_age_days = v;
        }
        if let Some(v) = patch.join_rate_threshold {
            next.anti_cheat.join_rate_threshold = v;
        }

        if let Some(v) = patch.auto_post_enabled {
            next.leaderboard.auto_post_enabled = v;
        }
        if let Some(v) = patch.auto_post_category_id {
            next.leaderboard.auto_post_category_id = Some(v).filter(|id| !id.is_empty());
        }
        if let Some(v) = patch.refresh_interval_secs {
            if !(MIN_REFRESH_INTERVAL_SECS..=MAX_REFRESH_INTERVAL_SECS).contains(&v) {
                return Err(ValidationError::InvalidSetting(format!(
                    "refresh_interval_secs must be between {} and {}",
                    MIN_REFRESH_INTERVAL_SECS, MAX_REFRESH_INTERVAL_SECS
                )));
            }
            next.leaderboard.refresh_interval_secs = v;
        }
        if let Some(v) = patch.daily_post_time {
            if v.is_empty() {
                next.leaderboard.daily_post_time = None;
            } else {
                NaiveTime::parse_from_str(&v, "%H:%M").map_err(|_| {
                    ValidationError::InvalidSetting("daily_post_time must be HH:MM".into())
                })?;
                next.leaderboard.daily_post_time = Some(v);
            }
        }

        if let Some(v) = patch.dm_winners {
            next.notifications.dm_winners = v;
        }
        if let Some(v) = patch.dm_pacing_ms {
            next.notifications.dm_pacing_ms = v;
        }
        if let Some(v) = patch.max_uses_per_code {
            next.invites.max_uses_per_code = v;
        }

        let change = SettingsChange {
            refresh_interval_changed: next.leaderboard.refresh_interval_secs
                != self.leaderboard.refresh_interval_secs,
        };
        *self = next;
        Ok(change)
    }
}

impl Config {
    /// Load from config.toml or use defaults
    pub fn load() -> Result<Self> {
        Self::load_from("config.toml")
    }

    /// Load from specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut config: Self = if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            toml::from_str(DEFAULT_CONFIG).context("Failed to parse default config")?
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment variables take precedence over the file.
    fn apply_env(&mut self) {
        if let Some(token) = non_empty_env("DISCORD_TOKEN") {
            self.discord.token = token;
        }
        if let Some(guild) = non_empty_env("GUILD_ID") {
            self.discord.guild_id = guild;
        }
        if let Some(url) = non_empty_env("DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Some(path) = non_empty_env("GIVEAWAY_DATA_PATH") {
            self.database.data_path = path;
        }
        if let Some(host) = non_empty_env("GIVEAWAY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = non_empty_env("GIVEAWAY_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl Default for Config {
    fn default() -> Self {
        // The embedded default config is validated by the tests below.
        toml::from_str(DEFAULT_CONFIG).unwrap_or_else(|_| Self {
            discord: DiscordConfig {
                token: String::new(),
                guild_id: String::new(),
                api_base: default_api_base(),
            },
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig::default(),
            settings: Settings::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_default_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.settings.leaderboard.refresh_interval_secs, 30);
        assert_eq!(config.settings.anti_cheat.join_rate_threshold, 3);
    }

    #[test]
    fn test_apply_reports_interval_change() {
        let mut settings = Settings::default();
        let change = settings
            .apply(SettingsPatch {
                refresh_interval_secs: Some(10),
                ..Default::default()
            })
            .unwrap();
        assert!(change.refresh_interval_changed);
        assert_eq!(settings.leaderboard.refresh_interval_secs, 10);

        let change = settings
            .apply(SettingsPatch {
                refresh_interval_secs: Some(10),
                ..Default::default()
            })
            .unwrap();
        assert!(!change.refresh_interval_changed);
    }

    #[test]
    fn test_apply_rejects_bad_values_atomically() {
        let mut settings = Settings::default();
        let err = settings.apply(SettingsPatch {
            max_winners: Some(5),
            refresh_interval_secs: Some(1),
            ..Default::default()
        });
        assert!(err.is_err());
        assert_eq!(settings.limits.max_winners, 20);

        assert!(settings
            .apply(SettingsPatch {
                daily_post_time: Some("25:99".into()),
                ..Default::default()
            })
            .is_err());
    }

    #[test]
    fn test_daily_post_time_parsing() {
        let mut settings = Settings::default();
        settings
            .apply(SettingsPatch {
                daily_post_time: Some("18:30".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            settings.leaderboard.daily_post_at(),
            NaiveTime::from_hms_opt(18, 30, 0)
        );
    }

    #[test]
    fn test_override_replaces_fields() {
        let policy = AntiCheatPolicy::default();
        let over = AntiCheatOverride {
            enabled: Some(false),
            min_account_age_days: Some(30),
            ..Default::default()
        };
        let merged = policy.with_override(Some(&over));
        assert!(!merged.enabled);
        assert_eq!(merged.min_account_age_days, 30);
        assert!(merged.block_bots);
    }
}
