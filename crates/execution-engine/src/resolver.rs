//! Manifest to base image resolution

use std::collections::HashSet;

use serde::Serialize;

use crate::catalog::{ImageCatalog, BASIC_CATEGORY};

/// Points per manifest package found in a category
pub const MATCH_WEIGHT: u32 = 10;

/// Extra points for the data-science category when the manifest names numpy or pandas
pub const DATA_SCIENCE_BONUS: u32 = 5;

/// A requirement line and the distribution name it refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Line as written, e.g. `pandas>=2.0`
    pub raw: String,
    /// Lower-cased name without extras or version, e.g. `pandas`
    pub name: String,
}

/// Parsed requirements manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    requirements: Vec<Requirement>,
}

impl Manifest {
    /// Trim lines, drop blanks and `#` comments, strip extras and version specifiers
    pub fn parse(text: &str) -> Self {
        let requirements = text
            .lines()
            .map(|line| line.split('#').next().unwrap_or_default().trim())
            .filter(|line| !line.is_empty())
            .filter_map(|line| {
                let name = distribution_name(line);
                if name.is_empty() {
                    None
                } else {
                    Some(Requirement {
                        raw: line.to_string(),
                        name,
                    })
                }
            })
            .collect();

        Self { requirements }
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.requirements.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.requirements.iter().map(|r| r.name.as_str())
    }

    pub fn mentions(&self, name: &str) -> bool {
        self.names().any(|n| n == name)
    }
}

fn distribution_name(line: &str) -> String {
    let end = line
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
        .unwrap_or(line.len());
    line[..end].to_ascii_lowercase().replace('_', "-")
}

pub(crate) fn lines_to_file<'a>(lines: impl Iterator<Item = &'a str>) -> String {
    let mut file = String::new();
    for line in lines {
        file.push_str(line);
        file.push('\n');
    }
    file
}

/// Manifest lines whose package is not in `packages`, original text preserved
pub fn delta(manifest: &Manifest, packages: &[String]) -> Vec<String> {
    let covered: HashSet<String> = packages.iter().map(|p| distribution_name(p)).collect();

    manifest
        .requirements()
        .iter()
        .filter(|r| !covered.contains(&r.name))
        .map(|r| r.raw.clone())
        .collect()
}

/// Outcome of resolving a manifest against the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub category: String,
    /// Base image to build on; `None` when no usable category was ready
    pub image: Option<String>,
    pub score: u32,
    /// Manifest packages already present in the base image
    pub matched: Vec<String>,
    /// Manifest lines that still need installing
    pub additional_packages: Vec<String>,
}

impl Resolution {
    pub fn is_fallback(&self) -> bool {
        self.image.is_none()
    }
}

fn score_category(manifest: &Manifest, category: &str, packages: &[String]) -> (u32, Vec<String>) {
    let names: HashSet<String> = packages.iter().map(|p| distribution_name(p)).collect();
    let matched: Vec<String> = manifest
        .names()
        .filter(|n| names.contains(*n))
        .map(str::to_string)
        .collect();

    let mut score = MATCH_WEIGHT * matched.len() as u32;
    if category == "data-science" && (manifest.mentions("numpy") || manifest.mentions("pandas")) {
        score += DATA_SCIENCE_BONUS;
    }

    (score, matched)
}

/// Pick the ready category that best covers `manifest`.
///
/// Highest positive score wins, first in catalog order on ties. Without any
/// match the basic category is used if ready; with nothing usable the result
/// is a fallback that installs the whole manifest.
pub fn resolve(catalog: &ImageCatalog, manifest: &Manifest) -> Resolution {
    let mut best: Option<(u32, Vec<String>, &str, &str, &[String])> = None;

    for entry in catalog.ready_entries() {
        let (score, matched) = score_category(manifest, entry.category(), entry.packages());
        if matched.is_empty() {
            continue;
        }
        if best.as_ref().map(|(s, ..)| score > *s).unwrap_or(true) {
            best = Some((score, matched, entry.category(), entry.image(), entry.packages()));
        }
    }

    if let Some((score, matched, category, image, packages)) = best {
        return Resolution {
            category: category.to_string(),
            image: Some(image.to_string()),
            score,
            matched,
            additional_packages: delta(manifest, packages),
        };
    }

    match catalog.get(BASIC_CATEGORY).filter(|e| e.is_ready()) {
        Some(basic) => Resolution {
            category: BASIC_CATEGORY.to_string(),
            image: Some(basic.image().to_string()),
            score: 0,
            matched: Vec::new(),
            additional_packages: delta(manifest, basic.packages()),
        },
        None => Resolution {
            category: BASIC_CATEGORY.to_string(),
            image: None,
            score: 0,
            matched: Vec::new(),
            additional_packages: manifest
                .requirements()
                .iter()
                .map(|r| r.raw.clone())
                .collect(),
        },
    }
}
