//! Build & run pipeline for one execution attempt
//!
//! decrypt -> build context -> build image -> verify -> run with limits ->
//! bound by timeout -> collect -> cleanup. Cleanup runs on every path once
//! the first artifact exists; only the attempt's own container, image and
//! context directory are ever removed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use code_vault::CodeVault;
use exec_common::{EncryptedPayload, Error, Result};
use futures_util::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::catalog::ImageCatalog;
use crate::context::{BuildContext, DescriptorShape};
use crate::monitor::{ResourceMonitor, ResourcePeaks};
use crate::resolver::{resolve, Manifest, Resolution};
use crate::runtime::{build_to_completion, ContainerRuntime, ContainerSpec};

/// Grace period for the runtime to report an exit status after the logs end or a kill
const WAIT_GRACE: Duration = Duration::from_secs(10);

const NO_OUTPUT: &str = "No output generated";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Parent directory of ephemeral build contexts
    pub work_dir: PathBuf,
    /// Plain runtime image used when no base image is ready
    pub runtime_image: String,
    pub timeout: Duration,
    pub memory_limit_mb: u64,
    pub cpu_shares: i64,
    pub verify_retries: u32,
    pub verify_delay: Duration,
    pub monitor_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("secure-exec"),
            runtime_image: "python:3.9-slim".to_string(),
            timeout: Duration::from_secs(30),
            memory_limit_mb: 512,
            cpu_shares: 512,
            verify_retries: 3,
            verify_delay: Duration::from_secs(2),
            monitor_interval: Duration::from_secs(1),
        }
    }
}

/// Everything needed to run one session's code
pub struct ExecutionRequest<'a> {
    pub session_id: &'a str,
    pub payload: &'a EncryptedPayload,
    pub session_key: &'a str,
    pub requirements: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    pub build_time_ms: u64,
    pub execution_time_ms: u64,
    pub base_image: String,
    pub category: String,
    pub additional_packages: usize,
    pub optimization: String,
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    pub peak_cpu_percent: f64,
    pub peak_memory_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Program output followed by the statistics block
    pub output: String,
    pub image: String,
    pub timed_out: bool,
    pub exit_code: Option<i64>,
    pub stats: PerformanceStats,
}

/// Marker appended when the wall-clock bound kills a container
pub fn timeout_marker(timeout: Duration) -> String {
    format!(
        "\n[EXECUTION TIMEOUT - Process killed after {} seconds]",
        timeout.as_secs()
    )
}

fn stats_block(stats: &PerformanceStats) -> String {
    format!(
        "\n\n--- EXECUTION STATS ---\nBuild time: {}ms\nExecution time: {}ms\nBase image: {}\nPackages installed: {}\nOptimization: {}",
        stats.build_time_ms,
        stats.execution_time_ms,
        stats.base_image,
        stats.additional_packages,
        stats.optimization
    )
}

/// Container memory limit in bytes, saturating at the largest value the runtime accepts
pub fn memory_limit_bytes(limit_mb: u64) -> i64 {
    i64::try_from(limit_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX)
}

/// Execution image tag: session id, build time and a random suffix
pub fn execution_image_name(session_id: &str) -> String {
    let session: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();

    format!(
        "exec-{}-{}-{}",
        session,
        chrono::Utc::now().timestamp_millis(),
        &suffix[..8]
    )
}

/// Artifacts created by one attempt, torn down together
#[derive(Default)]
struct Artifacts {
    context: Option<BuildContext>,
    image: Option<String>,
    container: Option<String>,
}

impl Artifacts {
    async fn cleanup(self, runtime: &dyn ContainerRuntime, catalog: &ImageCatalog) {
        if let Some(id) = self.container {
            match runtime.remove_container(&id).await {
                Ok(()) => debug!(container_id = %id, "Removed execution container"),
                Err(e) => warn!(container_id = %id, "Failed to remove container: {}", e),
            }
        }

        if let Some(image) = self.image {
            if catalog.contains_image(&image) {
                warn!(image = %image, "Refusing to remove a base image during cleanup");
            } else {
                match runtime.remove_image(&image, true).await {
                    Ok(()) => debug!(image = %image, "Removed execution image"),
                    Err(e) => warn!(image = %image, "Failed to remove image: {}", e),
                }
            }
        }

        if let Some(context) = self.context {
            let path = context.path().to_path_buf();
            if let Err(e) = context.remove() {
                warn!(path = %path.display(), "Failed to remove build context: {}", e);
            }
        }
    }
}

pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    catalog: Arc<ImageCatalog>,
    vault: CodeVault,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        catalog: Arc<ImageCatalog>,
        vault: CodeVault,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            runtime,
            catalog,
            vault,
            config,
        }
    }

    /// Run one attempt. A timeout is a successful outcome with the marker in
    /// the output; build and runtime failures carry whatever was captured.
    pub async fn execute(&self, request: ExecutionRequest<'_>) -> Result<ExecutionOutcome> {
        let vault = self.vault.clone();
        let payload = request.payload.clone();
        let session_key = request.session_key.to_string();
        let code = tokio::task::spawn_blocking(move || vault.decrypt(&payload, &session_key))
            .await
            .map_err(|e| Error::Crypto(format!("Decryption task failed: {}", e)))??;

        let manifest = Manifest::parse(request.requirements);
        let resolution = resolve(&self.catalog, &manifest);
        let image = execution_image_name(request.session_id);

        info!(
            session_id = %request.session_id,
            image = %image,
            category = %resolution.category,
            additional_packages = resolution.additional_packages.len(),
            fallback = resolution.is_fallback(),
            "Starting execution"
        );

        let mut artifacts = Artifacts::default();
        let result = self
            .run_attempt(code, &resolution, &image, &mut artifacts)
            .await;
        artifacts
            .cleanup(self.runtime.as_ref(), &self.catalog)
            .await;

        match &result {
            Ok(outcome) => info!(
                session_id = %request.session_id,
                timed_out = outcome.timed_out,
                exit_code = ?outcome.exit_code,
                "Execution finished"
            ),
            Err(e) => error!(session_id = %request.session_id, "Execution failed: {}", e),
        }

        result
    }

    async fn run_attempt(
        &self,
        code: String,
        resolution: &Resolution,
        image: &str,
        artifacts: &mut Artifacts,
    ) -> Result<ExecutionOutcome> {
        let build_started = Instant::now();

        let (context, shape) = BuildContext::for_execution(
            &self.config.work_dir,
            &format!("{}-", image),
            &code,
            resolution,
            &self.config.runtime_image,
        )?;
        drop(code);
        let archive = context.archive();
        artifacts.context = Some(context);

        artifacts.image = Some(image.to_string());
        build_to_completion(self.runtime.as_ref(), image, archive?).await?;
        self.verify_image(image).await?;
        let build_time = build_started.elapsed();

        let spec = ContainerSpec {
            name: format!("{}-run", image),
            image: image.to_string(),
            memory_bytes: memory_limit_bytes(self.config.memory_limit_mb),
            cpu_shares: self.config.cpu_shares,
            network_disabled: true,
        };
        let container_id = self.runtime.create_container(&spec).await?;
        artifacts.container = Some(container_id.clone());

        let run_started = Instant::now();
        self.runtime.start_container(&container_id).await?;
        let monitor = ResourceMonitor::spawn(
            self.runtime.clone(),
            container_id.clone(),
            self.config.monitor_interval,
        );

        let (mut output, timed_out, exit_code) = self.collect(&container_id).await;
        let execution_time = run_started.elapsed();
        let peaks = monitor.finish();

        let exit_code = match exit_code {
            Ok(code) => code,
            Err(e) => return Err(e.with_output(output)),
        };

        let stats = self.performance_stats(
            resolution,
            shape,
            build_time,
            execution_time,
            exit_code,
            timed_out,
            peaks,
        );

        if output.trim().is_empty() {
            output = NO_OUTPUT.to_string();
        }
        output.push_str(&stats_block(&stats));

        Ok(ExecutionOutcome {
            output,
            image: image.to_string(),
            timed_out,
            exit_code,
            stats,
        })
    }

    /// Stream logs under the wall-clock bound, kill on expiry, then read the exit code
    async fn collect(&self, container_id: &str) -> (String, bool, Result<Option<i64>>) {
        let mut output = String::new();

        let follow = async {
            let mut logs = self.runtime.logs(container_id);
            while let Some(chunk) = logs.next().await {
                match chunk {
                    Ok(text) => output.push_str(&text),
                    Err(e) => {
                        warn!(container_id = %container_id, "Log stream ended early: {}", e);
                        break;
                    }
                }
            }
        };
        let timed_out = tokio::time::timeout(self.config.timeout, follow)
            .await
            .is_err();

        if timed_out {
            warn!(
                container_id = %container_id,
                timeout_secs = self.config.timeout.as_secs(),
                "Execution timed out, killing container"
            );
            if let Err(e) = self.runtime.kill_container(container_id).await {
                warn!(container_id = %container_id, "Failed to kill container: {}", e);
            }
            output.push_str(&timeout_marker(self.config.timeout));
        }

        let exit_code = match tokio::time::timeout(
            WAIT_GRACE,
            self.runtime.wait_container(container_id),
        )
        .await
        {
            Ok(Ok(code)) => Ok(Some(code)),
            Ok(Err(e)) if timed_out => {
                warn!(container_id = %container_id, "No exit status after kill: {}", e);
                Ok(None)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(container_id = %container_id, "Timed out waiting for exit status");
                Ok(None)
            }
        };

        (output, timed_out, exit_code)
    }

    /// The runtime may report a finished build before the image can be
    /// inspected, so existence is retried a bounded number of times.
    async fn verify_image(&self, image: &str) -> Result<()> {
        let attempts = self.config.verify_retries.max(1);

        for attempt in 1..=attempts {
            match self.runtime.inspect_image(image).await {
                Ok(Some(_)) => {
                    debug!(image = %image, attempt, "Execution image verified");
                    return Ok(());
                }
                Ok(None) => debug!(image = %image, attempt, "Execution image not visible yet"),
                Err(e) => warn!(image = %image, attempt, "Image inspection failed: {}", e),
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.verify_delay).await;
            }
        }

        match self.runtime.list_images().await {
            Ok(images) => error!(image = %image, available = ?images, "Built image never became visible"),
            Err(e) => error!(image = %image, "Built image never became visible; listing images failed: {}", e),
        }

        Err(Error::build(format!(
            "Image {} was not found after {} attempts",
            image, attempts
        )))
    }

    #[allow(clippy::too_many_arguments)]
    fn performance_stats(
        &self,
        resolution: &Resolution,
        shape: DescriptorShape,
        build_time: Duration,
        execution_time: Duration,
        exit_code: Option<i64>,
        timed_out: bool,
        peaks: ResourcePeaks,
    ) -> PerformanceStats {
        PerformanceStats {
            build_time_ms: build_time.as_millis() as u64,
            execution_time_ms: execution_time.as_millis() as u64,
            base_image: resolution
                .image
                .clone()
                .unwrap_or_else(|| self.config.runtime_image.clone()),
            category: resolution.category.clone(),
            additional_packages: resolution.additional_packages.len(),
            optimization: shape.optimization().to_string(),
            exit_code,
            timed_out,
            peak_cpu_percent: peaks.peak_cpu_percent,
            peak_memory_bytes: peaks.peak_memory_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedProgram, ScriptedRuntime};

    struct Fixture {
        runtime: Arc<ScriptedRuntime>,
        catalog: Arc<ImageCatalog>,
        orchestrator: Orchestrator,
        work_dir: tempfile::TempDir,
        vault: CodeVault,
    }

    fn fixture(timeout: Duration) -> Fixture {
        let runtime = Arc::new(ScriptedRuntime::new());
        let catalog = Arc::new(ImageCatalog::standard());
        let work_dir = tempfile::tempdir().unwrap();
        let vault = CodeVault::new(1_000);
        let config = OrchestratorConfig {
            work_dir: work_dir.path().to_path_buf(),
            timeout,
            verify_delay: Duration::from_millis(10),
            monitor_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(runtime.clone(), catalog.clone(), vault.clone(), config);

        Fixture {
            runtime,
            catalog,
            orchestrator,
            work_dir,
            vault,
        }
    }

    fn ready_base(f: &Fixture, category: &str) {
        let entry = f.catalog.get(category).unwrap();
        f.runtime.add_image(entry.image(), 10);
        entry.mark_ready(10);
    }

    async fn run(f: &Fixture, session_id: &str, code: &str, requirements: &str) -> Result<ExecutionOutcome> {
        let key = code_vault::generate_session_key(session_id, "device-1");
        let payload = f.vault.encrypt(code, &key).unwrap();
        f.orchestrator
            .execute(ExecutionRequest {
                session_id,
                payload: &payload,
                session_key: &key,
                requirements,
            })
            .await
    }

    fn work_dir_is_empty(f: &Fixture) -> bool {
        std::fs::read_dir(f.work_dir.path()).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_successful_run_applies_limits_and_cleans_up() {
        let f = fixture(Duration::from_secs(5));
        ready_base(&f, "data-science");
        f.runtime.set_program(ScriptedProgram {
            output: vec!["[0 1 2]\n".to_string()],
            exit_code: 0,
            hang: false,
        });

        let outcome = run(&f, "session-1", "print(1)", "numpy\npandas").await.unwrap();

        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.output.starts_with("[0 1 2]\n"));
        assert!(outcome.output.contains("--- EXECUTION STATS ---"));
        assert!(outcome.output.contains("MAXIMUM - No additional packages needed!"));
        assert_eq!(outcome.stats.base_image, "exec-base-data-science");

        let created = f.runtime.created_containers();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].memory_bytes, 512 * 1024 * 1024);
        assert_eq!(created[0].cpu_shares, 512);
        assert!(created[0].network_disabled);

        assert_eq!(f.runtime.live_containers(), 0);
        assert!(!f.runtime.has_image(&outcome.image));
        assert!(f.runtime.has_image("exec-base-data-science"));
        assert!(work_dir_is_empty(&f));
    }

    #[tokio::test]
    async fn test_timeout_kills_container_and_appends_marker() {
        let f = fixture(Duration::from_millis(200));
        f.runtime.set_program(ScriptedProgram {
            output: vec!["started\n".to_string()],
            exit_code: 0,
            hang: true,
        });

        let outcome = run(&f, "session-slow", "while True: pass", "").await.unwrap();

        assert!(outcome.timed_out);
        assert!(outcome.output.contains("started"));
        assert!(outcome
            .output
            .contains("[EXECUTION TIMEOUT - Process killed after 0 seconds]"));
        assert_eq!(f.runtime.killed_containers().len(), 1);
        assert_eq!(f.runtime.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_build_failure_still_cleans_up() {
        let f = fixture(Duration::from_secs(5));
        f.runtime.fail_build_of("exec-");

        let err = run(&f, "session-2", "print(1)", "numpy").await.unwrap_err();

        match &err {
            Error::Build { output, .. } => assert!(output.contains("Step 1/4")),
            other => panic!("expected build error, got {:?}", other),
        }
        assert!(f.runtime.created_containers().is_empty());
        assert_eq!(f.runtime.removed_images().len(), 1);
        assert!(work_dir_is_empty(&f));
    }

    #[tokio::test]
    async fn test_verify_retries_then_succeeds() {
        let f = fixture(Duration::from_secs(5));
        f.runtime.miss_inspections(2);

        let outcome = run(&f, "session-3", "print(1)", "").await;
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn test_verify_exhaustion_is_a_build_error() {
        let f = fixture(Duration::from_secs(5));
        f.runtime.miss_inspections(10);

        let err = run(&f, "session-4", "print(1)", "").await.unwrap_err();
        assert!(matches!(err, Error::Build { .. }));
        assert!(f.runtime.created_containers().is_empty());
        assert!(work_dir_is_empty(&f));
    }

    #[tokio::test]
    async fn test_tampered_payload_aborts_before_any_artifact() {
        let f = fixture(Duration::from_secs(5));
        let key = code_vault::generate_session_key("s", "d");
        let mut payload = f.vault.encrypt("print(1)", &key).unwrap();
        payload.auth_tag = "00".repeat(16);

        let err = f
            .orchestrator
            .execute(ExecutionRequest {
                session_id: "s",
                payload: &payload,
                session_key: &key,
                requirements: "",
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Tamper));
        assert!(f.runtime.built_images().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_runs_use_distinct_images() {
        let f = fixture(Duration::from_secs(5));

        let (a, b) = tokio::join!(
            run(&f, "session-a", "print('a')", ""),
            run(&f, "session-b", "print('b')", "")
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.image, b.image);
        let built = f.runtime.built_images();
        assert_eq!(built.len(), 2);
        let removed = f.runtime.removed_images();
        assert!(removed.contains(&a.image));
        assert!(removed.contains(&b.image));
        assert_eq!(removed.len(), 2);
    }

    #[tokio::test]
    async fn test_repeated_runs_on_same_session_use_distinct_images() {
        let f = fixture(Duration::from_secs(5));
        let a = run(&f, "session-x", "print(1)", "").await.unwrap();
        let b = run(&f, "session-x", "print(1)", "").await.unwrap();
        assert_ne!(a.image, b.image);
    }

    #[test]
    fn test_execution_image_name_is_tag_safe() {
        let name = execution_image_name("Session_ABC");
        assert!(name.starts_with("exec-session-abc-"));
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn test_memory_limit_bytes_saturates() {
        assert_eq!(memory_limit_bytes(512), 512 * 1024 * 1024);
        assert_eq!(memory_limit_bytes(u64::MAX), i64::MAX);
        assert_eq!(memory_limit_bytes(u64::MAX / 1024), i64::MAX);
    }

    #[test]
    fn test_empty_output_placeholder() {
        let stats = PerformanceStats {
            build_time_ms: 1,
            execution_time_ms: 2,
            base_image: "python:3.9-slim".to_string(),
            category: "basic".to_string(),
            additional_packages: 0,
            optimization: DescriptorShape::Fallback.optimization().to_string(),
            exit_code: Some(0),
            timed_out: false,
            peak_cpu_percent: 0.0,
            peak_memory_bytes: 0,
        };
        let block = stats_block(&stats);
        assert!(block.contains("Build time: 1ms"));
        assert!(block.contains("Optimization: FALLBACK - Using basic Python image"));
    }
}
