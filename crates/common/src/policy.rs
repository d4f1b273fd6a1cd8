//! Admission thresholds shared by the security gate and the execution pipeline.
//!
//! Every "is this score acceptable" decision goes through [`admits`] so the
//! boundary is applied identically at upload time and at execute time.

use crate::models::{RiskLevel, SecurityLevel};

/// Minimum score (inclusive) for code to be admitted.
pub const ADMIT_THRESHOLD: u8 = 50;

/// Scores at or above this are considered safe by the assessor scale.
pub const SAFE_THRESHOLD: u8 = 70;

/// Scores below this are high risk. Scores in `[MARGINAL_FLOOR, ADMIT_THRESHOLD)`
/// are marginal and may be force-executed by the device owner.
pub const MARGINAL_FLOOR: u8 = 30;

/// Inclusive admit boundary: 50 admits, 49 does not.
pub fn admits(score: u8) -> bool {
    score >= ADMIT_THRESHOLD
}

/// A rejection that the device owner may override with an explicit force flag.
pub fn is_marginal(score: u8) -> bool {
    (MARGINAL_FLOOR..ADMIT_THRESHOLD).contains(&score)
}

/// Risk level for a score on the assessor scale (>=70 low, 30-69 medium, <30 high).
pub fn risk_level_for_score(score: u8) -> RiskLevel {
    if score >= SAFE_THRESHOLD {
        RiskLevel::Low
    } else if score >= MARGINAL_FLOOR {
        RiskLevel::Medium
    } else {
        RiskLevel::High
    }
}

/// Security level is the inverse of risk level: low risk means high security.
pub fn security_level_for_risk(risk: RiskLevel) -> SecurityLevel {
    match risk {
        RiskLevel::Low => SecurityLevel::High,
        RiskLevel::Medium => SecurityLevel::Medium,
        RiskLevel::High => SecurityLevel::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_boundary_is_inclusive() {
        assert!(admits(50));
        assert!(!admits(49));
        assert!(admits(100));
        assert!(!admits(0));
    }

    #[test]
    fn test_marginal_band() {
        assert!(is_marginal(30));
        assert!(is_marginal(49));
        assert!(!is_marginal(29));
        assert!(!is_marginal(50));
    }

    #[test]
    fn test_risk_level_thresholds() {
        assert_eq!(risk_level_for_score(100), RiskLevel::Low);
        assert_eq!(risk_level_for_score(70), RiskLevel::Low);
        assert_eq!(risk_level_for_score(69), RiskLevel::Medium);
        assert_eq!(risk_level_for_score(30), RiskLevel::Medium);
        assert_eq!(risk_level_for_score(29), RiskLevel::High);
        assert_eq!(risk_level_for_score(0), RiskLevel::High);
    }

    #[test]
    fn test_security_level_inverts_risk() {
        assert_eq!(security_level_for_risk(RiskLevel::Low), SecurityLevel::High);
        assert_eq!(
            security_level_for_risk(RiskLevel::Medium),
            SecurityLevel::Medium
        );
        assert_eq!(security_level_for_risk(RiskLevel::High), SecurityLevel::Low);
    }
}
