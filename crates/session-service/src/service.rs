//! The secure execution pipeline as seen by the HTTP layer
//!
//! Every operation loads the session, applies one state-machine transition
//! from `exec_common::Session` and writes the whole record back. Ciphertext
//! and the session key never leave this module except through
//! [`CreatedSession`], which hands the key to the renter once.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use code_vault::{fingerprint, generate_session_key, CodeVault};
use exec_common::{
    AnalysisResult, Device, Error, ExecutionStatus, RentalAction, RentalStatus, Result,
    SecurityLevel, Session, Verdict, DEFAULT_REQUIREMENTS,
};
use execution_engine::{
    BaseImageManager, CatalogStatus, ExecutionRequest, Orchestrator, PerformanceStats,
};
use security_gate::{Clearance, SecurityGate};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::storage::SessionStore;

const TOP_RISK_FACTORS: usize = 10;
const RECENT_HIGH_RISK: usize = 5;
const SCORE_BUCKETS: [&str; 5] = ["0-19", "20-39", "40-59", "60-79", "80-100"];

/// Session as shown to participants: no key, no ciphertext
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: String,
    pub renter_id: String,
    pub device_id: String,
    pub status: RentalStatus,
    pub execution_status: ExecutionStatus,
    pub requirements: String,
    /// Encrypted code is waiting for execution
    pub has_code: bool,
    pub analysis_result: Option<AnalysisResult>,
    pub output: String,
    pub cost: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            renter_id: session.renter_id.clone(),
            device_id: session.device_id.clone(),
            status: session.status,
            execution_status: session.execution_status,
            requirements: session.requirements.clone(),
            has_code: session.encrypted_code.is_some(),
            analysis_result: session.analysis_result.clone(),
            output: session.output.clone(),
            cost: session.cost,
            start_time: session.start_time,
            end_time: session.end_time,
            executed_at: session.executed_at,
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub session_id: String,
    pub session_key: String,
    pub status: RentalStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityInfo {
    pub score: u8,
    pub level: SecurityLevel,
    pub verdict: Verdict,
    pub analyzed_at: DateTime<Utc>,
}

impl From<&AnalysisResult> for SecurityInfo {
    fn from(analysis: &AnalysisResult) -> Self {
        Self {
            score: analysis.security_score,
            level: analysis.security_level,
            verdict: analysis.verdict,
            analyzed_at: analysis.analyzed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub session_id: String,
    pub verdict: Verdict,
    pub analysis: AnalysisResult,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub session_id: String,
    pub output: String,
    pub execution_status: ExecutionStatus,
    pub performance_stats: PerformanceStats,
    pub security_info: SecurityInfo,
    /// Owner overrode a marginal analysis
    pub forced: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultResponse {
    pub session_id: String,
    pub status: RentalStatus,
    pub execution_status: ExecutionStatus,
    pub output: String,
    pub security_analysis: Option<AnalysisResult>,
    pub executed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingExecution {
    pub session: SessionView,
    pub security_info: Option<SecurityInfo>,
}

/// Analytics window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Timeframe {
    #[default]
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
    #[serde(rename = "90d")]
    Quarter,
}

impl Timeframe {
    pub fn duration(self) -> Duration {
        match self {
            Timeframe::Week => Duration::days(7),
            Timeframe::Month => Duration::days(30),
            Timeframe::Quarter => Duration::days(90),
        }
    }
}

impl FromStr for Timeframe {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "7d" => Ok(Timeframe::Week),
            "30d" => Ok(Timeframe::Month),
            "90d" => Ok(Timeframe::Quarter),
            other => Err(Error::Validation(format!(
                "Invalid timeframe: {} (expected 7d, 30d or 90d)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LevelCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerdictCounts {
    pub approved: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskFactorCount {
    pub factor: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreBucket {
    pub range: &'static str,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HighRiskSession {
    pub session_id: String,
    pub device_id: String,
    pub score: u8,
    pub risk_factors: Vec<String>,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityAnalytics {
    pub timeframe: Timeframe,
    pub total_analyzed: usize,
    pub average_score: f64,
    pub security_levels: LevelCounts,
    pub verdicts: VerdictCounts,
    pub top_risk_factors: Vec<RiskFactorCount>,
    pub score_distribution: Vec<ScoreBucket>,
    pub recent_high_risk: Vec<HighRiskSession>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildStarted {
    pub message: String,
    pub categories: usize,
}

/// Index into [`SCORE_BUCKETS`]
fn score_bucket(score: u8) -> usize {
    (usize::from(score.min(100)) / 20).min(SCORE_BUCKETS.len() - 1)
}

/// Aggregate the analyses of `sessions` analysed at or after `since`
pub fn summarize_analyses(
    sessions: &[Session],
    timeframe: Timeframe,
    since: DateTime<Utc>,
) -> SecurityAnalytics {
    let mut analysed: Vec<(&Session, &AnalysisResult)> = sessions
        .iter()
        .filter_map(|s| s.analysis_result.as_ref().map(|a| (s, a)))
        .filter(|(_, a)| a.analyzed_at >= since)
        .collect();
    analysed.sort_by(|a, b| b.1.analyzed_at.cmp(&a.1.analyzed_at));

    let mut levels = LevelCounts::default();
    let mut verdicts = VerdictCounts::default();
    let mut buckets = [0usize; SCORE_BUCKETS.len()];
    let mut factors: HashMap<&str, usize> = HashMap::new();
    let mut score_sum = 0u64;

    for (_, analysis) in &analysed {
        score_sum += u64::from(analysis.security_score);
        buckets[score_bucket(analysis.security_score)] += 1;

        match analysis.security_level {
            SecurityLevel::High => levels.high += 1,
            SecurityLevel::Medium => levels.medium += 1,
            SecurityLevel::Low => levels.low += 1,
        }
        match analysis.verdict {
            Verdict::Approved => verdicts.approved += 1,
            Verdict::Rejected => verdicts.rejected += 1,
        }
        for factor in &analysis.risk_factors {
            *factors.entry(factor.as_str()).or_default() += 1;
        }
    }

    let mut top_risk_factors: Vec<RiskFactorCount> = factors
        .into_iter()
        .map(|(factor, count)| RiskFactorCount {
            factor: factor.to_string(),
            count,
        })
        .collect();
    top_risk_factors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.factor.cmp(&b.factor)));
    top_risk_factors.truncate(TOP_RISK_FACTORS);

    let recent_high_risk = analysed
        .iter()
        .filter(|(_, a)| a.security_level == SecurityLevel::Low)
        .take(RECENT_HIGH_RISK)
        .map(|(s, a)| HighRiskSession {
            session_id: s.id.clone(),
            device_id: s.device_id.clone(),
            score: a.security_score,
            risk_factors: a.risk_factors.clone(),
            analyzed_at: a.analyzed_at,
        })
        .collect();

    let average_score = if analysed.is_empty() {
        0.0
    } else {
        let avg = score_sum as f64 / analysed.len() as f64;
        (avg * 10.0).round() / 10.0
    };

    SecurityAnalytics {
        timeframe,
        total_analyzed: analysed.len(),
        average_score,
        security_levels: levels,
        verdicts,
        top_risk_factors,
        score_distribution: SCORE_BUCKETS
            .into_iter()
            .zip(buckets)
            .map(|(range, count)| ScoreBucket { range, count })
            .collect(),
        recent_high_risk,
    }
}

/// Marks a session as having an execution in flight until dropped
struct InFlightGuard {
    sessions: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl InFlightGuard {
    fn acquire(sessions: &Arc<Mutex<HashSet<String>>>, session_id: &str) -> Result<Self> {
        let mut set = sessions.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(session_id.to_string()) {
            return Err(Error::Validation(
                "An upload or execution is already in progress for this session".to_string(),
            ));
        }
        Ok(Self {
            sessions: Arc::clone(sessions),
            session_id: session_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.session_id);
    }
}

/// Persist `executing`, run the attempt, then persist `completed` or `error`.
/// The guard is held until the final state is written.
async fn run_execution(
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn SessionStore>,
    mut session: Session,
    _guard: InFlightGuard,
) -> Result<(Session, PerformanceStats)> {
    store.save_session(&session).await?;

    let payload = session
        .encrypted_code
        .clone()
        .ok_or_else(|| Error::Validation("No code to execute".to_string()))?;

    let result = orchestrator
        .execute(ExecutionRequest {
            session_id: &session.id,
            payload: &payload,
            session_key: &session.encryption_key,
            requirements: &session.requirements,
        })
        .await;

    match result {
        Ok(outcome) => {
            session.finish_execution(true, outcome.output, Utc::now());
            store.save_session(&session).await?;
            Ok((session, outcome.stats))
        }
        Err(e) => {
            let mut output = format!("Execution Error: {}", e);
            if let Some(captured) = e.captured_output() {
                output.push_str("\n\n");
                output.push_str(captured);
            }
            session.finish_execution(false, output, Utc::now());

            if let Err(save_err) = store.save_session(&session).await {
                error!(
                    session_id = %session.id,
                    "Failed to persist failed execution: {}",
                    save_err
                );
            }
            Err(e)
        }
    }
}

pub struct SessionService {
    store: Arc<dyn SessionStore>,
    gate: SecurityGate,
    vault: CodeVault,
    orchestrator: Arc<Orchestrator>,
    base_images: Arc<BaseImageManager>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl SessionService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        gate: SecurityGate,
        vault: CodeVault,
        orchestrator: Arc<Orchestrator>,
        base_images: Arc<BaseImageManager>,
    ) -> Self {
        Self {
            store,
            gate,
            vault,
            orchestrator,
            base_images,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    async fn load_session(&self, session_id: &str) -> Result<Session> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Session {} not found", session_id)))
    }

    async fn load_device(&self, device_id: &str) -> Result<Device> {
        self.store
            .get_device(device_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Device {} not found", device_id)))
    }

    /// Renter requests a device
    pub async fn create_session(&self, renter_id: &str, device_id: &str) -> Result<CreatedSession> {
        let device = self.load_device(device_id).await?;

        if !device.available {
            return Err(Error::Validation(format!(
                "Device {} is not available",
                device_id
            )));
        }
        if device.owner_id == renter_id {
            return Err(Error::Validation(
                "You cannot rent your own device".to_string(),
            ));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let session_key = generate_session_key(&session_id, device_id);
        let session = Session::with_id(
            session_id.clone(),
            renter_id.to_string(),
            device_id.to_string(),
            session_key.clone(),
        );
        self.store.save_session(&session).await?;

        info!(session_id = %session_id, device_id = %device_id, "Session requested");

        Ok(CreatedSession {
            session_id,
            session_key,
            status: session.status,
        })
    }

    /// Owner accepts, rejects or completes a rental
    pub async fn update_status(
        &self,
        actor: &str,
        session_id: &str,
        target_status: &str,
    ) -> Result<SessionView> {
        let action = RentalAction::from_target_status(target_status)?;
        let mut session = self.load_session(session_id).await?;
        let device = self.load_device(&session.device_id).await?;

        session.apply_rental_action(action, actor, &device, Utc::now())?;
        self.store.save_session(&session).await?;

        info!(
            session_id = %session_id,
            status = ?session.status,
            cost = session.cost,
            "Rental status updated"
        );

        Ok(SessionView::from(&session))
    }

    /// Analyse, then either reject and forget the code or encrypt and queue it
    pub async fn upload(
        &self,
        actor: &str,
        session_id: &str,
        code: &str,
        requirements: Option<&str>,
    ) -> Result<UploadResponse> {
        if code.trim().is_empty() {
            return Err(Error::Validation("Code is required".to_string()));
        }

        let _guard = InFlightGuard::acquire(&self.in_flight, session_id)?;

        let mut session = self.load_session(session_id).await?;
        session.ensure_can_upload(actor)?;

        info!(
            session_id = %session_id,
            code_len = code.len(),
            code_sha256 = %fingerprint(code.as_bytes()),
            "Analyzing uploaded code"
        );

        let analysis = self.gate.analyze(code).await;

        if analysis.verdict == Verdict::Rejected {
            session.record_rejection(analysis.clone())?;
            self.store.save_session(&session).await?;

            warn!(
                session_id = %session_id,
                score = analysis.security_score,
                "Upload rejected by security gate"
            );
            return Err(Error::SecurityRejected(Box::new(analysis)));
        }

        let vault = self.vault.clone();
        let plaintext = code.to_string();
        let session_key = session.encryption_key.clone();
        let payload = tokio::task::spawn_blocking(move || vault.encrypt(&plaintext, &session_key))
            .await
            .map_err(|e| Error::Crypto(format!("Encryption task failed: {}", e)))??;
        let requirements = requirements
            .filter(|r| !r.trim().is_empty())
            .unwrap_or(DEFAULT_REQUIREMENTS)
            .to_string();

        session.record_admission(analysis.clone(), payload, requirements)?;
        self.store.save_session(&session).await?;

        info!(
            session_id = %session_id,
            score = analysis.security_score,
            "Code admitted and encrypted"
        );

        Ok(UploadResponse {
            session_id: session.id.clone(),
            verdict: analysis.verdict,
            analysis,
            message: session.output.clone(),
        })
    }

    /// Owner runs the pending code. The run happens on its own task, so the
    /// executing and final states are persisted and the container is cleaned
    /// up even if the caller stops waiting.
    pub async fn execute(
        &self,
        actor: &str,
        session_id: &str,
        force_execute: bool,
    ) -> Result<ExecuteResponse> {
        let guard = InFlightGuard::acquire(&self.in_flight, session_id)?;

        let mut session = self.load_session(session_id).await?;
        let device = self.load_device(&session.device_id).await?;
        session.ensure_owner(actor, &device)?;

        let clearance = self
            .gate
            .clearance(session.analysis_result.as_ref(), force_execute)?;
        session.begin_execution()?;

        let run = tokio::spawn(run_execution(
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.store),
            session,
            guard,
        ));
        let (session, performance_stats) = run
            .await
            .map_err(|e| Error::runtime(format!("Execution task failed: {}", e)))??;

        let security_info = session
            .analysis_result
            .as_ref()
            .map(SecurityInfo::from)
            .ok_or_else(|| Error::Validation("Code has not been security analyzed".to_string()))?;

        Ok(ExecuteResponse {
            session_id: session.id,
            output: session.output,
            execution_status: session.execution_status,
            performance_stats,
            security_info,
            forced: clearance == Clearance::ForcedMarginal,
        })
    }

    /// Output and analysis, for the renter or the device owner
    pub async fn result(&self, actor: &str, session_id: &str) -> Result<ResultResponse> {
        let session = self.load_session(session_id).await?;
        let device = self.load_device(&session.device_id).await?;
        session.ensure_participant(actor, &device)?;

        Ok(ResultResponse {
            session_id: session.id,
            status: session.status,
            execution_status: session.execution_status,
            output: session.output,
            security_analysis: session.analysis_result,
            executed_at: session.executed_at,
        })
    }

    pub async fn analysis(&self, actor: &str, session_id: &str) -> Result<AnalysisResult> {
        let session = self.load_session(session_id).await?;
        let device = self.load_device(&session.device_id).await?;
        session.ensure_participant(actor, &device)?;

        session.analysis_result.ok_or_else(|| {
            Error::NotFound(format!("No security analysis for session {}", session_id))
        })
    }

    async fn owner_device_sessions(&self, devices: &[Device]) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for device in devices {
            sessions.extend(self.store.sessions_for_device(&device.id).await?);
        }
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    /// All sessions on devices the actor owns, newest first
    pub async fn owner_sessions(&self, owner_id: &str) -> Result<Vec<SessionView>> {
        let devices = self.store.devices_for_owner(owner_id).await?;
        let sessions = self.owner_device_sessions(&devices).await?;
        Ok(sessions.iter().map(SessionView::from).collect())
    }

    pub async fn renter_sessions(&self, renter_id: &str) -> Result<Vec<SessionView>> {
        let sessions = self.store.sessions_for_renter(renter_id).await?;
        Ok(sessions.iter().map(SessionView::from).collect())
    }

    /// Active sessions on the owner's devices with code waiting to run
    pub async fn pending_executions(&self, owner_id: &str) -> Result<Vec<PendingExecution>> {
        let devices = self.store.devices_for_owner(owner_id).await?;
        let sessions = self.owner_device_sessions(&devices).await?;

        Ok(sessions
            .iter()
            .filter(|s| {
                s.status == RentalStatus::Active
                    && s.execution_status == ExecutionStatus::Pending
                    && s.encrypted_code.is_some()
            })
            .map(|s| PendingExecution {
                session: SessionView::from(s),
                security_info: s.analysis_result.as_ref().map(SecurityInfo::from),
            })
            .collect())
    }

    pub async fn security_analytics(
        &self,
        owner_id: &str,
        timeframe: Timeframe,
        device_id: Option<&str>,
    ) -> Result<SecurityAnalytics> {
        let mut devices = self.store.devices_for_owner(owner_id).await?;

        if let Some(device_id) = device_id {
            devices.retain(|d| d.id == device_id);
            if devices.is_empty() {
                return Err(Error::Unauthorized(format!(
                    "you do not own device {}",
                    device_id
                )));
            }
        }

        let sessions = self.owner_device_sessions(&devices).await?;
        let since = Utc::now() - timeframe.duration();

        Ok(summarize_analyses(&sessions, timeframe, since))
    }

    pub async fn base_image_status(&self) -> CatalogStatus {
        self.base_images.status().await
    }

    /// Start a rebuild of every base image in the background
    pub async fn rebuild_base_images(&self, actor: &str) -> Result<RebuildStarted> {
        let devices = self.store.devices_for_owner(actor).await?;
        if devices.is_empty() {
            return Err(Error::Unauthorized(
                "only device owners can rebuild base images".to_string(),
            ));
        }

        let manager = Arc::clone(&self.base_images);
        let categories = manager.catalog().entries().len();
        tokio::spawn(async move {
            let ready = manager.rebuild_all().await;
            info!(ready = ready.len(), "Base image rebuild finished");
        });

        info!(actor = %actor, "Base image rebuild started");

        Ok(RebuildStarted {
            message: "Base image rebuild started".to_string(),
            categories,
        })
    }
}
