//! Warm-up, rebuild and status of the base image catalog
//!
//! This is the only writer of catalog readiness. Warm-up and rebuild hold a
//! build lock so they never race each other; resolves keep reading the
//! catalog while a build is in progress and see unbuilt categories as unready.

use std::path::PathBuf;
use std::sync::Arc;

use exec_common::Result;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::catalog::{CatalogEntry, ImageCatalog};
use crate::context::BuildContext;
use crate::runtime::{build_to_completion, ContainerRuntime};

/// Per-category status as reported to operators
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseImageStatus {
    pub category: String,
    pub image: String,
    pub ready: bool,
    pub exists: bool,
    pub packages: Vec<String>,
    pub package_count: usize,
    pub size_bytes: u64,
    #[serde(rename = "sizeMB")]
    pub size_mb: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogStatus {
    pub base_images: Vec<BaseImageStatus>,
    pub total_ready: usize,
    pub total_categories: usize,
}

pub struct BaseImageManager {
    catalog: Arc<ImageCatalog>,
    runtime: Arc<dyn ContainerRuntime>,
    runtime_image: String,
    work_dir: PathBuf,
    build_lock: Mutex<()>,
}

impl BaseImageManager {
    pub fn new(
        catalog: Arc<ImageCatalog>,
        runtime: Arc<dyn ContainerRuntime>,
        runtime_image: String,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            catalog,
            runtime,
            runtime_image,
            work_dir,
            build_lock: Mutex::new(()),
        }
    }

    pub fn catalog(&self) -> &Arc<ImageCatalog> {
        &self.catalog
    }

    /// Make every category ready, reusing images that already exist.
    /// Failures are logged per category and leave that category unready.
    pub async fn warm_up(&self) -> Vec<String> {
        let _guard = self.build_lock.lock().await;
        info!(
            categories = self.catalog.entries().len(),
            "Initializing base images"
        );

        for entry in self.catalog.entries() {
            if entry.is_ready() {
                continue;
            }

            match self.runtime.inspect_image(entry.image()).await {
                Ok(Some(details)) => {
                    entry.mark_ready(details.size_bytes);
                    info!(image = %entry.image(), "Base image already exists");
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(image = %entry.image(), "Failed to inspect base image: {}", e),
            }

            if let Err(e) = self.build_entry(entry).await {
                error!(category = %entry.category(), "Failed to build base image: {}", e);
            }
        }

        let ready = self.ready_categories();
        info!(ready = ready.len(), "Base image initialization complete");
        ready
    }

    /// Force-remove and rebuild every category
    pub async fn rebuild_all(&self) -> Vec<String> {
        {
            let _guard = self.build_lock.lock().await;
            info!("Rebuilding all base images");

            for entry in self.catalog.entries() {
                entry.mark_unready();
                if let Err(e) = self.runtime.remove_image(entry.image(), true).await {
                    warn!(image = %entry.image(), "Failed to remove base image: {}", e);
                }
            }
        }

        self.warm_up().await
    }

    pub async fn status(&self) -> CatalogStatus {
        let mut base_images = Vec::with_capacity(self.catalog.entries().len());

        for entry in self.catalog.entries() {
            let details = match self.runtime.inspect_image(entry.image()).await {
                Ok(details) => details,
                Err(e) => {
                    warn!(image = %entry.image(), "Failed to inspect base image: {}", e);
                    None
                }
            };
            let size_bytes = details
                .as_ref()
                .map(|d| d.size_bytes)
                .unwrap_or_else(|| entry.size_bytes());

            base_images.push(BaseImageStatus {
                category: entry.category().to_string(),
                image: entry.image().to_string(),
                ready: entry.is_ready(),
                exists: details.is_some(),
                packages: entry.packages().to_vec(),
                package_count: entry.packages().len(),
                size_bytes,
                size_mb: (size_bytes as f64 / (1024.0 * 1024.0)).round() as u64,
            });
        }

        CatalogStatus {
            total_ready: self.catalog.ready_count(),
            total_categories: base_images.len(),
            base_images,
        }
    }

    pub fn ready_categories(&self) -> Vec<String> {
        self.catalog
            .ready_entries()
            .map(|e| e.category().to_string())
            .collect()
    }

    async fn build_entry(&self, entry: &CatalogEntry) -> Result<()> {
        info!(image = %entry.image(), "Building base image");

        let context = BuildContext::for_base_image(
            &self.work_dir,
            entry.category(),
            &self.runtime_image,
            entry.packages(),
        )?;
        let archive = context.archive();
        if let Err(e) = context.remove() {
            warn!(category = %entry.category(), "Failed to remove base image context: {}", e);
        }

        build_to_completion(self.runtime.as_ref(), entry.image(), archive?).await?;

        let size = self
            .runtime
            .inspect_image(entry.image())
            .await?
            .map(|d| d.size_bytes)
            .unwrap_or(0);
        entry.mark_ready(size);
        info!(image = %entry.image(), size_bytes = size, "Base image ready");

        Ok(())
    }
}
