//! Build descriptors and ephemeral build contexts

use std::fs;
use std::path::{Path, PathBuf};

use exec_common::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;

use crate::resolver::{lines_to_file, Resolution};

pub const SOURCE_FILE: &str = "code.py";
pub const REQUIREMENTS_FILE: &str = "requirements.txt";
pub const ADDITIONAL_REQUIREMENTS_FILE: &str = "additional_requirements.txt";

/// How the execution image relates to the base image catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorShape {
    /// No base image: the whole manifest is installed on the plain runtime
    Fallback,
    /// Base image plus the missing packages
    Delta,
    /// Base image already has everything
    NoInstall,
}

impl DescriptorShape {
    pub fn for_resolution(resolution: &Resolution) -> Self {
        if resolution.is_fallback() {
            DescriptorShape::Fallback
        } else if resolution.additional_packages.is_empty() {
            DescriptorShape::NoInstall
        } else {
            DescriptorShape::Delta
        }
    }

    /// Label used in execution statistics
    pub fn optimization(&self) -> &'static str {
        match self {
            DescriptorShape::Fallback => "FALLBACK - Using basic Python image",
            DescriptorShape::Delta => "OPTIMIZED - Minimal package downloads",
            DescriptorShape::NoInstall => "MAXIMUM - No additional packages needed!",
        }
    }
}

const SYSTEM_BUILD_DEPS: &str =
    "RUN apt-get update && apt-get install -y gcc g++ && rm -rf /var/lib/apt/lists/*";

/// Dockerfile for a catalog base image
pub fn base_image_dockerfile(runtime_image: &str, packages: &[String]) -> String {
    let mut dockerfile = format!("FROM {}\n\n{}\n\n", runtime_image, SYSTEM_BUILD_DEPS);
    if !packages.is_empty() {
        dockerfile.push_str(&format!(
            "RUN pip install --no-cache-dir {}\n\n",
            packages.join(" ")
        ));
    }
    dockerfile.push_str("WORKDIR /app\n\nCMD [\"python\"]\n");
    dockerfile
}

/// Dockerfile for a one-shot execution image
pub fn execution_dockerfile(shape: DescriptorShape, base_image: &str) -> String {
    let run = "CMD [\"python\", \"code.py\"]\n";

    match shape {
        DescriptorShape::Fallback => format!(
            "FROM {base}\n\n{deps}\n\nWORKDIR /app\n\nCOPY {src} {req} ./\n\nRUN pip install --no-cache-dir -r {req}\n\n{run}",
            base = base_image,
            deps = SYSTEM_BUILD_DEPS,
            src = SOURCE_FILE,
            req = REQUIREMENTS_FILE,
            run = run,
        ),
        DescriptorShape::Delta => format!(
            "FROM {base}\n\nWORKDIR /app\n\nCOPY {src} {req} ./\n\nRUN pip install --no-cache-dir -r {req}\n\n{run}",
            base = base_image,
            src = SOURCE_FILE,
            req = ADDITIONAL_REQUIREMENTS_FILE,
            run = run,
        ),
        DescriptorShape::NoInstall => format!(
            "FROM {base}\n\nWORKDIR /app\n\nCOPY {src} ./\n\n{run}",
            base = base_image,
            src = SOURCE_FILE,
            run = run,
        ),
    }
}

/// A uniquely named directory holding everything `docker build` needs.
/// The directory is removed when the value is dropped or [`BuildContext::remove`] is called.
pub struct BuildContext {
    dir: TempDir,
}

impl BuildContext {
    /// Create an empty context directory under `work_dir`
    pub fn create(work_dir: &Path, prefix: &str) -> Result<Self> {
        fs::create_dir_all(work_dir)?;
        let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(work_dir)?;
        Ok(Self { dir })
    }

    /// Context for a catalog base image
    pub fn for_base_image(
        work_dir: &Path,
        category: &str,
        runtime_image: &str,
        packages: &[String],
    ) -> Result<Self> {
        let context = Self::create(work_dir, &format!("base-{}-", category))?;
        context.write_file("Dockerfile", &base_image_dockerfile(runtime_image, packages))?;
        Ok(context)
    }

    /// Context for an execution image
    pub fn for_execution(
        work_dir: &Path,
        prefix: &str,
        code: &str,
        resolution: &Resolution,
        runtime_image: &str,
    ) -> Result<(Self, DescriptorShape)> {
        let shape = DescriptorShape::for_resolution(resolution);
        let context = Self::create(work_dir, prefix)?;

        context.write_file(SOURCE_FILE, code)?;

        let packages = resolution.additional_packages.iter().map(String::as_str);
        let base_image = match (shape, resolution.image.as_deref()) {
            (DescriptorShape::Fallback, _) | (_, None) => {
                context.write_file(REQUIREMENTS_FILE, &lines_to_file(packages))?;
                runtime_image
            }
            (DescriptorShape::Delta, Some(image)) => {
                context.write_file(ADDITIONAL_REQUIREMENTS_FILE, &lines_to_file(packages))?;
                image
            }
            (DescriptorShape::NoInstall, Some(image)) => image,
        };

        context.write_file("Dockerfile", &execution_dockerfile(shape, base_image))?;

        Ok((context, shape))
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_file(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        fs::write(&path, contents)?;
        Ok(path)
    }

    /// Gzipped tar of the whole directory
    pub fn archive(&self) -> Result<Vec<u8>> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut tar = tar::Builder::new(encoder);
        tar.append_dir_all(".", self.dir.path())?;
        let encoder = tar.into_inner()?;
        Ok(encoder.finish()?)
    }

    /// Delete the directory now, reporting failures
    pub fn remove(self) -> Result<()> {
        self.dir.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn resolution(image: Option<&str>, additional: &[&str]) -> Resolution {
        Resolution {
            category: "data-science".to_string(),
            image: image.map(str::to_string),
            score: 10,
            matched: vec![],
            additional_packages: additional.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_shape_selection() {
        assert_eq!(
            DescriptorShape::for_resolution(&resolution(None, &["numpy"])),
            DescriptorShape::Fallback
        );
        assert_eq!(
            DescriptorShape::for_resolution(&resolution(Some("b"), &["xgboost"])),
            DescriptorShape::Delta
        );
        assert_eq!(
            DescriptorShape::for_resolution(&resolution(Some("b"), &[])),
            DescriptorShape::NoInstall
        );
    }

    #[test]
    fn test_no_install_descriptor_has_no_pip() {
        let dockerfile = execution_dockerfile(DescriptorShape::NoInstall, "exec-base-ml");
        assert!(dockerfile.starts_with("FROM exec-base-ml\n"));
        assert!(!dockerfile.contains("pip install"));
        assert!(dockerfile.contains("COPY code.py ./"));
    }

    #[test]
    fn test_delta_descriptor_installs_only_additional() {
        let dockerfile = execution_dockerfile(DescriptorShape::Delta, "exec-base-ml");
        assert!(dockerfile.contains("additional_requirements.txt"));
        assert!(!dockerfile.contains("apt-get"));
    }

    #[test]
    fn test_base_image_dockerfile() {
        let dockerfile =
            base_image_dockerfile("python:3.9-slim", &["numpy".to_string(), "pandas".to_string()]);
        assert!(dockerfile.starts_with("FROM python:3.9-slim\n"));
        assert!(dockerfile.contains("RUN pip install --no-cache-dir numpy pandas"));
    }

    #[test]
    fn test_execution_context_files_and_archive() {
        let work_dir = tempfile::tempdir().unwrap();
        let (context, shape) = BuildContext::for_execution(
            work_dir.path(),
            "exec-test-",
            "print('hi')\n",
            &resolution(Some("exec-base-data-science"), &["xgboost>=2"]),
            "python:3.9-slim",
        )
        .unwrap();

        assert_eq!(shape, DescriptorShape::Delta);
        assert!(context.path().starts_with(work_dir.path()));
        assert_eq!(
            fs::read_to_string(context.path().join(ADDITIONAL_REQUIREMENTS_FILE)).unwrap(),
            "xgboost>=2\n"
        );

        let archive = context.archive().unwrap();
        let mut tar = tar::Archive::new(GzDecoder::new(archive.as_slice()));
        let mut names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert!(names.iter().any(|n| n.ends_with("Dockerfile")));
        assert!(names.iter().any(|n| n.ends_with("code.py")));

        let path = context.path().to_path_buf();
        context.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_fallback_context_uses_runtime_image() {
        let work_dir = tempfile::tempdir().unwrap();
        let (context, shape) = BuildContext::for_execution(
            work_dir.path(),
            "exec-test-",
            "print(1)",
            &resolution(None, &["numpy"]),
            "python:3.9-slim",
        )
        .unwrap();

        assert_eq!(shape, DescriptorShape::Fallback);
        let dockerfile = fs::read_to_string(context.path().join("Dockerfile")).unwrap();
        assert!(dockerfile.starts_with("FROM python:3.9-slim\n"));
        assert!(context.path().join(REQUIREMENTS_FILE).exists());
    }
}
