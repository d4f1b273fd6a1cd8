//! Scripted in-memory [`ContainerRuntime`] for tests

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use exec_common::{Error, Result};
use futures_util::stream::{self, BoxStream, StreamExt};

use crate::runtime::{ContainerRuntime, ContainerSpec, ImageDetails, ResourceSample};

/// What a started container prints and how it exits
#[derive(Debug, Clone)]
pub struct ScriptedProgram {
    pub output: Vec<String>,
    pub exit_code: i64,
    /// Keep running after printing until killed
    pub hang: bool,
}

impl Default for ScriptedProgram {
    fn default() -> Self {
        Self {
            output: vec!["ok\n".to_string()],
            exit_code: 0,
            hang: false,
        }
    }
}

#[derive(Debug, Clone)]
struct ScriptedContainer {
    spec: ContainerSpec,
    killed: bool,
}

#[derive(Default)]
struct State {
    images: HashMap<String, u64>,
    built: Vec<String>,
    build_contexts: Vec<Vec<u8>>,
    removed_images: Vec<String>,
    failing_builds: Vec<String>,
    inspect_misses: u32,
    containers: HashMap<String, ScriptedContainer>,
    created: Vec<ContainerSpec>,
    removed_containers: Vec<String>,
    killed: HashSet<String>,
    program: ScriptedProgram,
    next_id: u64,
}

/// Runtime that records every call and plays back a [`ScriptedProgram`]
#[derive(Default)]
pub struct ScriptedRuntime {
    state: Mutex<State>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_image(&self, tag: &str, size_bytes: u64) {
        self.state().images.insert(tag.to_string(), size_bytes);
    }

    pub fn has_image(&self, tag: &str) -> bool {
        self.state().images.contains_key(tag)
    }

    /// Builds of tags starting with `prefix` fail
    pub fn fail_build_of(&self, prefix: &str) {
        self.state().failing_builds.push(prefix.to_string());
    }

    /// The next `n` image inspections report the image missing
    pub fn miss_inspections(&self, n: u32) {
        self.state().inspect_misses = n;
    }

    pub fn set_program(&self, program: ScriptedProgram) {
        self.state().program = program;
    }

    pub fn built_images(&self) -> Vec<String> {
        self.state().built.clone()
    }

    pub fn build_contexts(&self) -> Vec<Vec<u8>> {
        self.state().build_contexts.clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.state().removed_images.clone()
    }

    pub fn created_containers(&self) -> Vec<ContainerSpec> {
        self.state().created.clone()
    }

    pub fn removed_containers(&self) -> Vec<String> {
        self.state().removed_containers.clone()
    }

    pub fn killed_containers(&self) -> Vec<String> {
        self.state().killed.iter().cloned().collect()
    }

    pub fn live_containers(&self) -> usize {
        self.state().containers.len()
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    fn build_image<'a>(&'a self, tag: &str, context: Vec<u8>) -> BoxStream<'a, Result<String>> {
        let mut state = self.state();
        state.built.push(tag.to_string());
        state.build_contexts.push(context);

        if state.failing_builds.iter().any(|p| tag.starts_with(p.as_str())) {
            let items = vec![
                Ok("Step 1/4 : FROM python:3.9-slim\n".to_string()),
                Err(Error::build("pip install returned a non-zero code: 1")),
            ];
            return stream::iter(items).boxed();
        }

        state.images.insert(tag.to_string(), 1024 * 1024);
        let items = vec![
            Ok("Step 1/4 : FROM python:3.9-slim\n".to_string()),
            Ok(format!("Successfully tagged {}\n", tag)),
        ];
        stream::iter(items).boxed()
    }

    async fn inspect_image(&self, image: &str) -> Result<Option<ImageDetails>> {
        let mut state = self.state();
        if state.inspect_misses > 0 {
            state.inspect_misses -= 1;
            return Ok(None);
        }
        Ok(state
            .images
            .get(image)
            .map(|size| ImageDetails { size_bytes: *size }))
    }

    async fn list_images(&self) -> Result<Vec<String>> {
        Ok(self.state().images.keys().cloned().collect())
    }

    async fn remove_image(&self, image: &str, _force: bool) -> Result<()> {
        let mut state = self.state();
        state.images.remove(image);
        state.removed_images.push(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state();
        if !state.images.contains_key(&spec.image) {
            return Err(Error::runtime(format!("No such image: {}", spec.image)));
        }
        state.next_id += 1;
        let id = format!("container-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            ScriptedContainer {
                spec: spec.clone(),
                killed: false,
            },
        );
        state.created.push(spec.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        if self.state().containers.contains_key(id) {
            Ok(())
        } else {
            Err(Error::runtime(format!("No such container: {}", id)))
        }
    }

    fn logs<'a>(&'a self, _id: &'a str) -> BoxStream<'a, Result<String>> {
        let program = self.state().program.clone();
        let lines = stream::iter(program.output.into_iter().map(Ok));
        if program.hang {
            lines.chain(stream::pending()).boxed()
        } else {
            lines.boxed()
        }
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let state = self.state();
        match state.containers.get(id) {
            Some(container) if container.killed => Ok(137),
            Some(_) => Ok(state.program.exit_code),
            None => Err(Error::runtime(format!("No such container: {}", id))),
        }
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        if let Some(container) = state.containers.get_mut(id) {
            container.killed = true;
        }
        state.killed.insert(id.to_string());
        Ok(())
    }

    async fn stats(&self, id: &str) -> Result<ResourceSample> {
        match self.state().containers.get(id) {
            Some(container) if !container.killed => Ok(ResourceSample {
                cpu_percent: 12.5,
                memory_bytes: (container.spec.memory_bytes / 4) as u64,
            }),
            _ => Err(Error::runtime(format!("No such container: {}", id))),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        state.containers.remove(id);
        state.removed_containers.push(id.to_string());
        Ok(())
    }
}
