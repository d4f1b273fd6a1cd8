//! Assessment record produced by both the external assessor and the static analyzer

use exec_common::policy::risk_level_for_score;
use exec_common::RiskLevel;
use serde::{Deserialize, Serialize};

/// Verdict on the assessor scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AssessorVerdict {
    Safe,
    Unsafe,
}

impl AssessorVerdict {
    /// Only low-risk scores are considered safe
    pub fn for_score(score: u8) -> Self {
        match risk_level_for_score(score) {
            RiskLevel::Low => AssessorVerdict::Safe,
            RiskLevel::Medium | RiskLevel::High => AssessorVerdict::Unsafe,
        }
    }
}

/// Structured risk assessment of a piece of code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub risk_level: RiskLevel,
    /// 0-100, higher is safer
    pub security_score: u8,
    pub verdict: AssessorVerdict,
    #[serde(default)]
    pub risk_factors: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

/// Clamp any numeric score into 0..=100
pub fn clamp_score(raw: f64) -> u8 {
    if raw.is_nan() {
        return 0;
    }
    raw.round().clamp(0.0, 100.0) as u8
}
