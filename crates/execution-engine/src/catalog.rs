//! Base image catalog
//!
//! A fixed set of package profiles, each backed by a prebuilt image. The only
//! mutable state is the per-entry `ready` flag and image size, both atomics:
//! readers never wait on a build in progress and simply see "not ready" until
//! the warm-up or rebuild task flips the flag. Readiness is eventual; a fresh
//! process starts with nothing ready.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Category used when no other profile matches
pub const BASIC_CATEGORY: &str = "basic";

/// Prefix of every base image tag
pub const BASE_IMAGE_PREFIX: &str = "exec-base";

/// Category name and its fixed package list
pub struct CategoryProfile {
    pub name: &'static str,
    pub packages: &'static [&'static str],
}

pub const STANDARD_PROFILES: &[CategoryProfile] = &[
    CategoryProfile {
        name: "data-science",
        packages: &[
            "numpy",
            "pandas",
            "scikit-learn",
            "matplotlib",
            "seaborn",
            "scipy",
            "jupyter",
        ],
    },
    CategoryProfile {
        name: "web-dev",
        packages: &[
            "fastapi",
            "flask",
            "django",
            "requests",
            "beautifulsoup4",
            "selenium",
        ],
    },
    CategoryProfile {
        name: "ml",
        packages: &[
            "tensorflow",
            "torch",
            "transformers",
            "opencv-python",
            "pillow",
        ],
    },
    CategoryProfile {
        name: BASIC_CATEGORY,
        packages: &["requests", "python-dateutil", "pytz"],
    },
];

/// One catalog category
#[derive(Debug)]
pub struct CatalogEntry {
    category: String,
    packages: Vec<String>,
    image: String,
    ready: AtomicBool,
    size_bytes: AtomicU64,
}

impl CatalogEntry {
    pub fn new(category: impl Into<String>, packages: Vec<String>, image: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            packages,
            image: image.into(),
            ready: AtomicBool::new(false),
            size_bytes: AtomicU64::new(0),
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Relaxed)
    }

    /// Record a finished build. The size is stored before the flag flips.
    pub fn mark_ready(&self, size_bytes: u64) {
        self.size_bytes.store(size_bytes, Ordering::Relaxed);
        self.ready.store(true, Ordering::Release);
    }

    pub fn mark_unready(&self) {
        self.ready.store(false, Ordering::Release);
    }
}

/// The set of base image categories
#[derive(Debug)]
pub struct ImageCatalog {
    entries: Vec<CatalogEntry>,
}

impl ImageCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    /// Catalog built from [`STANDARD_PROFILES`]
    pub fn standard() -> Self {
        Self::new(
            STANDARD_PROFILES
                .iter()
                .map(|profile| {
                    CatalogEntry::new(
                        profile.name,
                        profile.packages.iter().map(|p| p.to_string()).collect(),
                        format!("{}-{}", BASE_IMAGE_PREFIX, profile.name),
                    )
                })
                .collect(),
        )
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn get(&self, category: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.category == category)
    }

    pub fn is_ready(&self, category: &str) -> bool {
        self.get(category).map(CatalogEntry::is_ready).unwrap_or(false)
    }

    pub fn ready_entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter().filter(|e| e.is_ready())
    }

    pub fn ready_count(&self) -> usize {
        self.ready_entries().count()
    }

    /// True when `image` is one of the catalog's base images
    pub fn contains_image(&self, image: &str) -> bool {
        self.entries.iter().any(|e| e.image == image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_catalog_starts_unready() {
        let catalog = ImageCatalog::standard();
        assert_eq!(catalog.entries().len(), 4);
        assert_eq!(catalog.ready_count(), 0);
        assert!(catalog.get(BASIC_CATEGORY).is_some());
        assert_eq!(
            catalog.get("data-science").unwrap().image(),
            "exec-base-data-science"
        );
    }

    #[test]
    fn test_mark_ready_and_unready() {
        let catalog = ImageCatalog::standard();
        let entry = catalog.get("ml").unwrap();

        entry.mark_ready(1024);
        assert!(catalog.is_ready("ml"));
        assert_eq!(entry.size_bytes(), 1024);
        assert_eq!(catalog.ready_count(), 1);

        entry.mark_unready();
        assert!(!catalog.is_ready("ml"));
        assert!(!catalog.is_ready("unknown"));
    }

    #[test]
    fn test_contains_image() {
        let catalog = ImageCatalog::standard();
        assert!(catalog.contains_image("exec-base-web-dev"));
        assert!(!catalog.contains_image("exec-session-1-123"));
    }
}
