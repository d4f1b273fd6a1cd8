//! Types shared by every crate in the secure execution pipeline:
//! the error taxonomy, the session model with its state machine, and the
//! admission thresholds.

pub mod error;
pub mod models;
pub mod policy;

pub use error::{Error, Result};
pub use models::{
    AnalysisResult, AnalysisSource, Device, EncryptedPayload, ExecutionStatus, RentalAction,
    RentalStatus, RiskLevel, SecurityLevel, Session, Verdict, DEFAULT_REQUIREMENTS,
};
