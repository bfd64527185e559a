//! Operation risk classification.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Risk level assigned to an invocable operation.
///
/// Levels are totally ordered: `Low < Medium < High < Critical`. The kernel
/// compares a call's resolved risk against the policy thresholds for
/// simulation forcing and approval gating.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    /// Read-only or otherwise harmless operations.
    Low,
    /// Default classification for unannotated operations.
    #[default]
    Medium,
    /// Operations that change physical state.
    High,
    /// Operations that can damage equipment or endanger people.
    Critical,
}

impl RiskLevel {
    /// Returns the canonical uppercase name used in policy artifacts.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl Display for RiskLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(Error::InvalidRiskLevel {
                value: other.to_owned(),
            }),
        }
    }
}
