//! Admission decisions
//!
//! [`SecurityGate::assess`] never fails: if the external assessor is missing
//! or errors out, the static analyzer answers instead. [`SecurityGate::decide`]
//! turns an assessment into the [`AnalysisResult`] stored on the session, and
//! [`SecurityGate::clearance`] re-checks that record when execution is requested.

use std::sync::Arc;

use chrono::Utc;
use exec_common::policy::{admits, is_marginal, security_level_for_risk};
use exec_common::{AnalysisResult, AnalysisSource, Error, Result, Verdict};
use tracing::{info, warn};

use crate::assessment::{AssessorVerdict, RiskAssessment};
use crate::assessor::RiskAssessor;
use crate::static_analysis::StaticAnalyzer;

/// Why an execution was allowed to proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clearance {
    /// Analysis on file approved the code
    Approved,
    /// Marginal rejection overridden by the device owner
    ForcedMarginal,
}

#[derive(Clone)]
pub struct SecurityGate {
    assessor: Option<Arc<dyn RiskAssessor>>,
    fallback: StaticAnalyzer,
}

impl SecurityGate {
    pub fn new(assessor: Option<Arc<dyn RiskAssessor>>) -> Self {
        Self {
            assessor,
            fallback: StaticAnalyzer::new(),
        }
    }

    /// Gate that only uses the static analyzer
    pub fn static_only() -> Self {
        Self::new(None)
    }

    /// Score `code`, degrading to static analysis on any assessor failure
    pub async fn assess(&self, code: &str) -> (RiskAssessment, AnalysisSource) {
        if let Some(assessor) = &self.assessor {
            match assessor.assess(code).await {
                Ok(assessment) => return (assessment, AnalysisSource::Assessor),
                Err(e) => {
                    warn!("Risk assessor unavailable, using static analysis: {}", e);
                }
            }
        }

        (self.fallback.analyze(code), AnalysisSource::StaticFallback)
    }

    /// Apply the admission policy: UNSAFE or below threshold is REJECTED
    pub fn decide(&self, assessment: RiskAssessment, source: AnalysisSource) -> AnalysisResult {
        let score = assessment.security_score.min(100);
        let verdict = if assessment.verdict == AssessorVerdict::Unsafe || !admits(score) {
            Verdict::Rejected
        } else {
            Verdict::Approved
        };

        AnalysisResult {
            summary: assessment.summary,
            security_score: score,
            security_level: security_level_for_risk(assessment.risk_level),
            verdict,
            risk_factors: assessment.risk_factors,
            recommendations: assessment.recommendations,
            source,
            analyzed_at: Utc::now(),
        }
    }

    /// Assess and decide in one step
    pub async fn analyze(&self, code: &str) -> AnalysisResult {
        let (assessment, source) = self.assess(code).await;
        let result = self.decide(assessment, source);

        info!(
            score = result.security_score,
            verdict = ?result.verdict,
            source = ?result.source,
            risk_factors = result.risk_factors.len(),
            "Security analysis finished"
        );

        result
    }

    /// Check the analysis on file before running code.
    ///
    /// Without `force` only approved code passes. With `force` a marginal
    /// rejection may pass too; anything else stays rejected. Missing analysis
    /// is always an error.
    pub fn clearance(&self, analysis: Option<&AnalysisResult>, force: bool) -> Result<Clearance> {
        let analysis = analysis.ok_or_else(|| {
            Error::Validation("Code has not been security analyzed".to_string())
        })?;

        let score = analysis.security_score;
        if analysis.verdict == Verdict::Approved && admits(score) {
            return Ok(Clearance::Approved);
        }

        let marginal = is_marginal(score) || admits(score);
        if force && marginal {
            warn!(score, "Executing marginal code on owner override");
            return Ok(Clearance::ForcedMarginal);
        }

        Err(Error::SecurityRejected(Box::new(analysis.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use exec_common::{RiskLevel, SecurityLevel};

    struct FixedAssessor(RiskAssessment);

    #[async_trait]
    impl RiskAssessor for FixedAssessor {
        async fn assess(&self, _code: &str) -> Result<RiskAssessment> {
            Ok(self.0.clone())
        }
    }

    struct BrokenAssessor;

    #[async_trait]
    impl RiskAssessor for BrokenAssessor {
        async fn assess(&self, _code: &str) -> Result<RiskAssessment> {
            Err(Error::Assessor("connection refused".to_string()))
        }
    }

    fn assessment(score: u8, verdict: AssessorVerdict) -> RiskAssessment {
        RiskAssessment {
            risk_level: exec_common::policy::risk_level_for_score(score),
            security_score: score,
            verdict,
            risk_factors: vec![],
            recommendations: vec![],
            summary: "test".to_string(),
        }
    }

    fn gate_with(assessment: RiskAssessment) -> SecurityGate {
        SecurityGate::new(Some(Arc::new(FixedAssessor(assessment))))
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let gate = SecurityGate::static_only();

        let at = gate.decide(
            assessment(50, AssessorVerdict::Safe),
            AnalysisSource::Assessor,
        );
        assert_eq!(at.verdict, Verdict::Approved);

        let below = gate.decide(
            assessment(49, AssessorVerdict::Safe),
            AnalysisSource::Assessor,
        );
        assert_eq!(below.verdict, Verdict::Rejected);
    }

    #[test]
    fn test_unsafe_verdict_rejects_regardless_of_score() {
        let gate = SecurityGate::static_only();
        let result = gate.decide(
            assessment(95, AssessorVerdict::Unsafe),
            AnalysisSource::Assessor,
        );
        assert_eq!(result.verdict, Verdict::Rejected);
    }

    #[test]
    fn test_security_level_inverts_risk_level() {
        let gate = SecurityGate::static_only();
        let result = gate.decide(
            assessment(90, AssessorVerdict::Safe),
            AnalysisSource::Assessor,
        );
        assert_eq!(result.security_level, SecurityLevel::High);

        let result = gate.decide(
            assessment(10, AssessorVerdict::Unsafe),
            AnalysisSource::Assessor,
        );
        assert_eq!(result.security_level, SecurityLevel::Low);
    }

    #[tokio::test]
    async fn test_uses_assessor_when_available() {
        let gate = gate_with(assessment(80, AssessorVerdict::Safe));
        let result = gate.analyze("import os\nos.system('ls')").await;
        assert_eq!(result.source, AnalysisSource::Assessor);
        assert_eq!(result.security_score, 80);
        assert_eq!(result.verdict, Verdict::Approved);
    }

    #[tokio::test]
    async fn test_falls_back_to_static_analysis() {
        let gate = SecurityGate::new(Some(Arc::new(BrokenAssessor)));
        let result = gate.analyze("import os\nos.system('ls')").await;
        assert_eq!(result.source, AnalysisSource::StaticFallback);
        assert_eq!(result.security_score, 65);
        // static analysis calls 65 MEDIUM risk, which is UNSAFE on the assessor scale
        assert_eq!(result.verdict, Verdict::Rejected);
    }

    #[tokio::test]
    async fn test_static_only_is_deterministic() {
        let gate = SecurityGate::static_only();
        let code = "import socket\nsocket.socket()\n";
        let a = gate.analyze(code).await;
        let b = gate.analyze(code).await;
        assert_eq!(a.security_score, b.security_score);
        assert_eq!(a.verdict, b.verdict);
        assert_eq!(a.risk_factors, b.risk_factors);
    }

    #[test]
    fn test_clearance_requires_analysis() {
        let gate = SecurityGate::static_only();
        assert!(matches!(
            gate.clearance(None, true),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_clearance_rules() {
        let gate = SecurityGate::static_only();

        let approved = gate.decide(assessment(85, AssessorVerdict::Safe), AnalysisSource::Assessor);
        assert_eq!(gate.clearance(Some(&approved), false).unwrap(), Clearance::Approved);

        let marginal = gate.decide(assessment(40, AssessorVerdict::Unsafe), AnalysisSource::Assessor);
        assert!(matches!(
            gate.clearance(Some(&marginal), false),
            Err(Error::SecurityRejected(_))
        ));
        assert_eq!(
            gate.clearance(Some(&marginal), true).unwrap(),
            Clearance::ForcedMarginal
        );

        let dangerous = gate.decide(assessment(10, AssessorVerdict::Unsafe), AnalysisSource::Assessor);
        assert_eq!(dangerous.security_level, SecurityLevel::Low);
        assert!(matches!(
            gate.clearance(Some(&dangerous), true),
            Err(Error::SecurityRejected(_))
        ));
    }

    #[test]
    fn test_risk_level_is_preserved_through_decide() {
        let gate = SecurityGate::static_only();
        let mut a = assessment(60, AssessorVerdict::Safe);
        a.risk_level = RiskLevel::Medium;
        let result = gate.decide(a, AnalysisSource::Assessor);
        assert_eq!(result.security_level, SecurityLevel::Medium);
        assert_eq!(result.verdict, Verdict::Approved);
    }
}
