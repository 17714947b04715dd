//! Controlled fault injection for resilience testing
//!
//! The injector only fires where the runner explicitly calls
//! [`FailureInjector::maybe_fail`]. A disabled injector never fails.

use crate::error::{EtlError, EtlResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Kind of fault, also used to classify transient fetch errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Storage,
    Validation,
    Timeout,
    Throttle,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Network => "network",
            FailureKind::Storage => "storage",
            FailureKind::Validation => "validation",
            FailureKind::Timeout => "timeout",
            FailureKind::Throttle => "throttle",
        }
    }

    /// The error this kind of fault surfaces as
    pub fn to_error(self, message: impl Into<String>) -> EtlError {
        let message = message.into();
        match self {
            FailureKind::Network | FailureKind::Timeout | FailureKind::Throttle => {
                EtlError::transient(self, message)
            },
            FailureKind::Storage => EtlError::Persistence(sqlx::Error::Protocol(message)),
            FailureKind::Validation => EtlError::Validation(message),
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailureKind {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "network" | "network_error" => Ok(FailureKind::Network),
            "storage" | "database" | "database_error" => Ok(FailureKind::Storage),
            "validation" | "validation_error" => Ok(FailureKind::Validation),
            "timeout" => Ok(FailureKind::Timeout),
            "throttle" | "rate_limit" => Ok(FailureKind::Throttle),
            other => Err(EtlError::Config(format!("Unknown failure kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureInjector {
    enabled: bool,
    probability: f64,
    fail_at_index: Option<usize>,
    kind: FailureKind,
}

impl FailureInjector {
    /// Enabled injector. `probability` is clamped to `[0, 1]`; `fail_at_index`
    /// is the 0-based position of the record that always fails.
    pub fn new(probability: f64, fail_at_index: Option<usize>, kind: FailureKind) -> Self {
        let probability = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };

        Self {
            enabled: true,
            probability,
            fail_at_index,
            kind,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            probability: 0.0,
            fail_at_index: None,
            kind: FailureKind::Network,
        }
    }

    /// Deterministic failure at one index and nowhere else
    pub fn at_index(index: usize, kind: FailureKind) -> Self {
        Self::new(0.0, Some(index), kind)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    pub fn fail_at_index(&self) -> Option<usize> {
        self.fail_at_index
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn should_fail(&self, index: usize) -> bool {
        if !self.enabled {
            return false;
        }
        if self.fail_at_index == Some(index) {
            return true;
        }
        self.probability > 0.0 && rand::random::<f64>() < self.probability
    }

    /// Fail with the configured kind when [`should_fail`](Self::should_fail) says so
    pub fn maybe_fail(&self, index: usize) -> EtlResult<()> {
        if !self.should_fail(index) {
            return Ok(());
        }

        warn!(index, kind = %self.kind, "Injecting failure");
        Err(self
            .kind
            .to_error(format!("injected {} failure at record {}", self.kind, index)))
    }
}

impl Default for FailureInjector {
    fn default() -> Self {
        Self::disabled()
    }
}
