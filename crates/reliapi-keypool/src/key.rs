//! Provider key state.

use std::fmt;
use std::time::Instant;

/// Lifecycle status of a provider key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Active,
    Degraded,
    Exhausted,
    Banned,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Degraded => "degraded",
            KeyStatus::Exhausted => "exhausted",
            KeyStatus::Banned => "banned",
        }
    }
}

/// Error kind recorded against a key; drives the error-score increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyErrorKind {
    /// Upstream 429.
    RateLimited,
    /// Upstream 5xx.
    ServerError,
    /// Connect failure or timeout.
    Network,
    /// Anything else.
    Other,
}

impl KeyErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyErrorKind::RateLimited => "429",
            KeyErrorKind::ServerError => "5xx",
            KeyErrorKind::Network => "network",
            KeyErrorKind::Other => "other",
        }
    }

    pub(crate) fn score_increment(&self) -> f64 {
        match self {
            KeyErrorKind::RateLimited => 0.1,
            KeyErrorKind::ServerError => 0.05,
            KeyErrorKind::Network | KeyErrorKind::Other => 0.02,
        }
    }

    /// Classifies an upstream status code, network failures map to
    /// [`KeyErrorKind::Network`] before this is consulted.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => KeyErrorKind::RateLimited,
            500..=599 => KeyErrorKind::ServerError,
            _ => KeyErrorKind::Other,
        }
    }
}

/// A provider API key with health tracking.
///
/// The secret lives in memory only and never appears in `Debug` output.
#[derive(Clone)]
pub struct ProviderKey {
    pub id: String,
    pub provider: String,
    pub secret: String,
    pub status: KeyStatus,
    pub qps_limit: Option<f64>,
    pub recent_error_score: f64,
    pub health_score: f64,
    pub last_used_at: Instant,
    pub current_qps: f64,
    pub consecutive_errors: u32,
}

impl ProviderKey {
    pub fn new(id: impl Into<String>, provider: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            secret: secret.into(),
            status: KeyStatus::Active,
            qps_limit: None,
            recent_error_score: 0.0,
            health_score: 1.0,
            last_used_at: Instant::now(),
            current_qps: 0.0,
            consecutive_errors: 0,
        }
    }

    pub fn with_qps_limit(mut self, qps_limit: f64) -> Self {
        self.qps_limit = Some(qps_limit);
        self
    }

    /// Load score used for selection. Lower is better; non-active keys
    /// score infinity.
    pub fn load_score(&self) -> f64 {
        if self.status != KeyStatus::Active {
            return f64::INFINITY;
        }
        let qps_share = match self.qps_limit {
            Some(limit) if limit > 0.0 => self.current_qps / limit,
            _ => 0.0,
        };
        qps_share + self.recent_error_score
    }

    pub(crate) fn update_health(&mut self) {
        self.health_score = (1.0 - self.recent_error_score).max(0.0);
    }
}

impl fmt::Debug for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderKey")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("secret", &"<redacted>")
            .field("status", &self.status)
            .field("qps_limit", &self.qps_limit)
            .field("recent_error_score", &self.recent_error_score)
            .field("health_score", &self.health_score)
            .field("current_qps", &self.current_qps)
            .field("consecutive_errors", &self.consecutive_errors)
            .finish()
    }
}
