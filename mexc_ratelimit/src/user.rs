use std::collections::HashMap;
use std::collections::VecDeque;
use std::str::FromStr;

use parking_lot::RwLock;
use serde::Deserialize;

use crate::config::PriorityMultipliers;
use crate::config::RateLimitConfig;
use crate::error::RateLimitError;

/// Service tier scaling a user's effective limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityLevel {
    Low,
    Medium,
    High,
    Premium,
}

impl PriorityLevel {
    pub fn multiplier(self, multipliers: &PriorityMultipliers) -> f64 {
        match self {
            PriorityLevel::Low => multipliers.low,
            PriorityLevel::Medium => multipliers.medium,
            PriorityLevel::High => multipliers.high,
            PriorityLevel::Premium => multipliers.premium,
        }
    }
}

impl FromStr for PriorityLevel {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(PriorityLevel::Low),
            "medium" => Ok(PriorityLevel::Medium),
            "high" => Ok(PriorityLevel::High),
            "premium" => Ok(PriorityLevel::Premium),
            other => Err(RateLimitError::UnknownPriority(other.to_string())),
        }
    }
}

/// One recorded adaptation-factor change, kept for audit/debugging
#[derive(Debug, Clone)]
pub struct AdaptationEvent {
    pub timestamp: u64,
    pub factor: f64,
    pub reason: String,
}

/// Capped length of a user's adaptation history ring
const HISTORY_CAP: usize = 50;

/// Per-user customization: priority tier, endpoint overrides and the
/// adaptation audit ring
#[derive(Debug, Clone)]
pub struct UserLimits {
    pub user_id: String,
    pub custom_limits: HashMap<String, RateLimitConfig>,
    pub priority_level: PriorityLevel,
    adaptation_history: VecDeque<AdaptationEvent>,
}

impl UserLimits {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            custom_limits: HashMap::new(),
            priority_level: PriorityLevel::Medium,
            adaptation_history: VecDeque::with_capacity(HISTORY_CAP),
        }
    }

    pub fn push_event(&mut self, event: AdaptationEvent) {
        if self.adaptation_history.len() == HISTORY_CAP {
            self.adaptation_history.pop_front();
        }
        self.adaptation_history.push_back(event);
    }

    pub fn history(&self) -> impl Iterator<Item = &AdaptationEvent> {
        self.adaptation_history.iter()
    }
}

/// Table of users that have been customized, lazily materialized
pub(crate) struct UserTable {
    users: RwLock<HashMap<String, UserLimits>>,
}

impl UserTable {
    pub fn new() -> Self {
        Self { users: RwLock::new(HashMap::new()) }
    }

    pub fn set_priority(&self, user_id: &str, level: PriorityLevel) {
        let mut users = self.users.write();
        users.entry(user_id.to_string()).or_insert_with(|| UserLimits::new(user_id)).priority_level = level;
    }

    pub fn set_custom_limits(&self, user_id: &str, endpoint: &str, config: RateLimitConfig) {
        let mut users = self.users.write();
        users
            .entry(user_id.to_string())
            .or_insert_with(|| UserLimits::new(user_id))
            .custom_limits
            .insert(endpoint.to_string(), config);
    }

    pub fn priority(&self, user_id: &str) -> Option<PriorityLevel> {
        self.users.read().get(user_id).map(|user| user.priority_level)
    }

    pub fn custom_limits(&self, user_id: &str, endpoint: &str) -> Option<RateLimitConfig> {
        self.users.read().get(user_id).and_then(|user| user.custom_limits.get(endpoint).cloned())
    }

    pub fn push_history(&self, user_id: &str, event: AdaptationEvent) {
        let mut users = self.users.write();
        users.entry(user_id.to_string()).or_insert_with(|| UserLimits::new(user_id)).push_event(event);
    }

    pub fn history(&self, user_id: &str) -> Vec<AdaptationEvent> {
        self.users.read().get(user_id).map(|user| user.history().cloned().collect()).unwrap_or_default()
    }
}
