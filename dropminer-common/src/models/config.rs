// File: dropminer-common/src/models/config.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Tie-break applied among channels whose games share a priority rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityMode {
    #[default]
    EndingSoonest,
    LowAvailabilityFirst,
    /// Never fall back to games missing from the priority list.
    PriorityOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSinkKind {
    #[default]
    Log,
    None,
}

/// Timer settings, all in seconds on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollIntervals {
    pub watch_interval_secs: u64,
    pub idle_poll_secs: u64,
    pub maintenance_period_secs: u64,
    pub online_delay_secs: u64,
    pub progress_timeout_secs: u64,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            watch_interval_secs: 59,
            idle_poll_secs: 300,
            maintenance_period_secs: 3600,
            online_delay_secs: 120,
            progress_timeout_secs: 60,
        }
    }
}

impl PollIntervals {
    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs.max(1))
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_secs(self.idle_poll_secs.max(1))
    }

    pub fn maintenance_period(&self) -> Duration {
        Duration::from_secs(self.maintenance_period_secs.max(60))
    }

    pub fn online_delay(&self) -> Duration {
        Duration::from_secs(self.online_delay_secs)
    }

    pub fn progress_timeout(&self) -> Duration {
        Duration::from_secs(self.progress_timeout_secs)
    }
}

/// Miner settings handed to the engine at construction and replaced
/// wholesale through `apply_config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    /// Game names, most wanted first.
    pub priority: Vec<String>,
    pub exclude: BTreeSet<String>,
    pub priority_mode: PriorityMode,
    pub intervals: PollIntervals,
    /// Channels requested per game directory fetch.
    pub directory_limit: usize,
    pub status_sink: StatusSinkKind,
    pub claim_points_bonus: bool,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            priority: Vec::new(),
            exclude: BTreeSet::new(),
            priority_mode: PriorityMode::default(),
            intervals: PollIntervals::default(),
            directory_limit: 30,
            status_sink: StatusSinkKind::default(),
            claim_points_bonus: false,
        }
    }
}

impl MinerConfig {
    pub fn is_excluded(&self, game_name: &str) -> bool {
        self.exclude.iter().any(|g| g.eq_ignore_ascii_case(game_name))
    }

    /// Position in the priority list; `None` when the game is unlisted.
    pub fn priority_index(&self, game_name: &str) -> Option<usize> {
        self.priority.iter().position(|g| g.eq_ignore_ascii_case(game_name))
    }

    /// Listed games rank by position, unlisted ones after all of them.
    pub fn priority_rank(&self, game_name: &str) -> usize {
        self.priority_index(game_name).unwrap_or(usize::MAX)
    }

    /// Whether a game may be mined at all under this configuration.
    pub fn allows_game(&self, game_name: &str) -> bool {
        if self.is_excluded(game_name) {
            return false;
        }
        self.priority_mode != PriorityMode::PriorityOnly || self.priority_index(game_name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_membership() {
        let cfg = MinerConfig {
            priority: vec!["Alpha".into(), "Beta".into()],
            exclude: ["Gamma".to_string()].into_iter().collect(),
            priority_mode: PriorityMode::PriorityOnly,
            ..Default::default()
        };
        assert_eq!(cfg.priority_rank("beta"), 1);
        assert_eq!(cfg.priority_rank("Delta"), usize::MAX);
        assert!(!cfg.allows_game("Gamma"));
        assert!(!cfg.allows_game("Delta"));
        assert!(cfg.allows_game("Alpha"));
    }

    #[test]
    fn test_partial_settings_fill_defaults() -> Result<(), serde_json::Error> {
        let cfg: MinerConfig = serde_json::from_str(r#"{"priority":["A"],"priority_mode":"low_availability_first"}"#)?;
        assert_eq!(cfg.priority_mode, PriorityMode::LowAvailabilityFirst);
        assert_eq!(cfg.intervals.watch_interval_secs, 59);
        assert_eq!(cfg.directory_limit, 30);
        Ok(())
    }
}
