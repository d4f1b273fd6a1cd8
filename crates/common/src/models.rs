//! Session data model and the rental / execution state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Manifest used when the renter does not supply one
pub const DEFAULT_REQUIREMENTS: &str = "numpy\npandas\nscikit-learn\nmatplotlib\n";

/// Rental lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RentalStatus {
    /// Renter asked for the device, owner has not answered
    Requested,
    /// Owner accepted; code may be uploaded and executed
    Active,
    /// Owner closed the rental; cost is final
    Completed,
    /// Owner declined the request
    Rejected,
}

/// Execution sub-lifecycle of a single code submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Executing,
    Completed,
    Error,
    Rejected,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Error | ExecutionStatus::Rejected
        )
    }
}

/// Risk level on the assessor scale (HIGH = dangerous)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Security level recorded on the session (HIGH = safe)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SecurityLevel {
    High,
    Medium,
    Low,
}

/// Admission verdict recorded on the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Approved,
    Rejected,
}

/// Which analyzer produced an analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    Assessor,
    StaticFallback,
}

/// Security analysis stored on the session for audit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    /// Human-readable summary from the analyzer
    pub summary: String,

    /// 0-100, higher is safer
    pub security_score: u8,

    pub security_level: SecurityLevel,

    pub verdict: Verdict,

    #[serde(default)]
    pub risk_factors: Vec<String>,

    #[serde(default)]
    pub recommendations: Vec<String>,

    pub source: AnalysisSource,

    pub analyzed_at: DateTime<Utc>,
}

/// Ciphertext fields kept only while an execution is pending or running.
/// All values are hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub ciphertext: String,
    pub iv: String,
    pub auth_tag: String,
    pub salt: String,
}

/// A rentable device, owned by the device-listing service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    /// Price per hour
    pub hourly_price: f64,
    #[serde(default = "default_true")]
    pub available: bool,
}

fn default_true() -> bool {
    true
}

/// Owner-side rental transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RentalAction {
    Accept,
    Reject,
    Complete,
}

impl RentalAction {
    /// Parse the target status names used by clients ("active", "rejected", "completed")
    pub fn from_target_status(status: &str) -> Result<Self> {
        match status {
            "active" => Ok(RentalAction::Accept),
            "rejected" => Ok(RentalAction::Reject),
            "completed" => Ok(RentalAction::Complete),
            other => Err(Error::Validation(format!("Invalid status: {}", other))),
        }
    }
}

/// One rental/execution unit pairing a renter with a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub renter_id: String,
    pub device_id: String,
    pub status: RentalStatus,
    pub execution_status: ExecutionStatus,

    /// Per-session secret (hex)
    pub encryption_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_code: Option<EncryptedPayload>,

    pub requirements: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_result: Option<AnalysisResult>,

    #[serde(default)]
    pub output: String,

    #[serde(default)]
    pub cost: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new rental request
    pub fn new(renter_id: String, device_id: String, encryption_key: String) -> Self {
        Self::with_id(
            uuid::Uuid::new_v4().to_string(),
            renter_id,
            device_id,
            encryption_key,
        )
    }

    /// Create a new rental request with a caller-chosen id
    pub fn with_id(
        id: String,
        renter_id: String,
        device_id: String,
        encryption_key: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            renter_id,
            device_id,
            status: RentalStatus::Requested,
            execution_status: ExecutionStatus::Pending,
            encryption_key,
            encrypted_code: None,
            requirements: DEFAULT_REQUIREMENTS.to_string(),
            analysis_result: None,
            output: String::new(),
            cost: 0.0,
            start_time: None,
            end_time: None,
            executed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_renter(&self, actor: &str) -> bool {
        self.renter_id == actor
    }

    /// Fails unless `actor` owns the session's device
    pub fn ensure_owner(&self, actor: &str, device: &Device) -> Result<()> {
        if device.id != self.device_id {
            return Err(Error::Validation(format!(
                "Device {} does not belong to session {}",
                device.id, self.id
            )));
        }
        if device.owner_id != actor {
            return Err(Error::Unauthorized(
                "you must be the device owner".to_string(),
            ));
        }
        Ok(())
    }

    /// Fails unless `actor` is the renter
    pub fn ensure_renter(&self, actor: &str) -> Result<()> {
        if !self.is_renter(actor) {
            return Err(Error::Unauthorized("you must be the renter".to_string()));
        }
        Ok(())
    }

    /// Fails unless `actor` is the renter or the device owner
    pub fn ensure_participant(&self, actor: &str, device: &Device) -> Result<()> {
        if self.is_renter(actor) || device.owner_id == actor {
            Ok(())
        } else {
            Err(Error::Unauthorized(
                "you must be the renter or the device owner".to_string(),
            ))
        }
    }

    /// Apply an owner-side rental transition
    pub fn apply_rental_action(
        &mut self,
        action: RentalAction,
        actor: &str,
        device: &Device,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_owner(actor, device)?;

        match (action, self.status) {
            (RentalAction::Accept, RentalStatus::Requested) => {
                self.status = RentalStatus::Active;
                self.start_time = Some(now);
            }
            (RentalAction::Reject, RentalStatus::Requested) => {
                self.status = RentalStatus::Rejected;
            }
            (RentalAction::Complete, RentalStatus::Active) => {
                let start = *self.start_time.get_or_insert(self.created_at);
                self.end_time = Some(now);
                self.cost = rental_cost(start, now, device.hourly_price);
                self.status = RentalStatus::Completed;
            }
            (action, status) => {
                return Err(Error::Validation(format!(
                    "Cannot {:?} a session in {:?} status",
                    action, status
                )));
            }
        }

        self.updated_at = now;
        Ok(())
    }

    /// Check that the renter may upload code right now
    pub fn ensure_can_upload(&self, actor: &str) -> Result<()> {
        self.ensure_renter(actor)?;

        if self.status != RentalStatus::Active {
            return Err(Error::Validation(format!(
                "Cannot upload code to a session in {:?} status",
                self.status
            )));
        }

        if self.execution_status != ExecutionStatus::Pending {
            return Err(Error::Validation(format!(
                "Cannot upload code while execution is {:?}",
                self.execution_status
            )));
        }

        Ok(())
    }

    /// Security gate rejected the upload: pending -> rejected, nothing retained but the analysis
    pub fn record_rejection(&mut self, analysis: AnalysisResult) -> Result<()> {
        self.expect_execution_status(ExecutionStatus::Pending)?;

        self.output = format!(
            "Code rejected due to security concerns. Security score: {}/100 ({:?} security). Risk factors: {}",
            analysis.security_score,
            analysis.security_level,
            analysis.risk_factors.join(", ")
        );
        self.analysis_result = Some(analysis);
        self.encrypted_code = None;
        self.execution_status = ExecutionStatus::Rejected;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Security gate admitted the upload: store ciphertext, stay pending
    pub fn record_admission(
        &mut self,
        analysis: AnalysisResult,
        payload: EncryptedPayload,
        requirements: String,
    ) -> Result<()> {
        self.expect_execution_status(ExecutionStatus::Pending)?;

        self.output = format!(
            "Code uploaded successfully. Security Score: {}/100 ({:?} security). Waiting for execution on lender device...",
            analysis.security_score, analysis.security_level
        );
        self.analysis_result = Some(analysis);
        self.encrypted_code = Some(payload);
        self.requirements = requirements;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// pending -> executing
    pub fn begin_execution(&mut self) -> Result<()> {
        if self.status != RentalStatus::Active {
            return Err(Error::Validation(format!(
                "Cannot execute code in a session in {:?} status",
                self.status
            )));
        }
        self.expect_execution_status(ExecutionStatus::Pending)?;
        if self.encrypted_code.is_none() {
            return Err(Error::Validation("No code to execute".to_string()));
        }

        self.execution_status = ExecutionStatus::Executing;
        self.output = "Executing code on lender device...".to_string();
        self.updated_at = Utc::now();
        Ok(())
    }

    /// executing -> completed | error. Ciphertext is always dropped.
    pub fn finish_execution(&mut self, succeeded: bool, output: String, now: DateTime<Utc>) {
        self.encrypted_code = None;
        self.output = output;
        self.executed_at = Some(now);
        self.updated_at = now;
        self.execution_status = if succeeded {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Error
        };
    }

    /// True when the privacy invariant holds for the current status
    pub fn ciphertext_invariant_holds(&self) -> bool {
        !self.execution_status.is_terminal() || self.encrypted_code.is_none()
    }

    fn expect_execution_status(&self, expected: ExecutionStatus) -> Result<()> {
        if self.execution_status != expected {
            return Err(Error::Validation(format!(
                "Execution is {:?}, expected {:?}",
                self.execution_status, expected
            )));
        }
        Ok(())
    }
}

/// `hours elapsed x hourly price`
pub fn rental_cost(start: DateTime<Utc>, end: DateTime<Utc>, hourly_price: f64) -> f64 {
    let hours = (end - start).num_milliseconds() as f64 / 3_600_000.0;
    hours * hourly_price
}
