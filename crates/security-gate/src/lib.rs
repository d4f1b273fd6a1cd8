//! Security Gate
//!
//! Scores submitted code before it is encrypted and queued for execution.
//! An external risk assessor is preferred; a deterministic static analyzer
//! takes over whenever the assessor is missing, failing or unintelligible.

pub mod assessment;
pub mod assessor;
pub mod gate;
pub mod parser;
pub mod static_analysis;

pub use assessment::{AssessorVerdict, RiskAssessment};
pub use assessor::{AssessorConfig, HttpRiskAssessor, RiskAssessor};
pub use gate::{Clearance, SecurityGate};
pub use static_analysis::StaticAnalyzer;
