//! Build context assembly
//!
//! Turns a build request into a build descriptor plus the optional
//! dependency file, stages both in a scratch directory, verifies the
//! directory and reads it back into a [`ContextSpec`] for upload.

use std::fs;
use std::path::{Path, PathBuf};

use sdk::errors::{BuildError, ValidationError};
use sdk::manifest::ContextSpec;
use sdk::types::BuildRequest;
use tempfile::TempDir;

/// File name of the build descriptor inside the context
pub const DESCRIPTOR_FILE: &str = "Dockerfile";

/// Directory the dependency file is copied to inside the image
const DEPENDENCY_DIR: &str = "/tmp";

/// Descriptor and dependency file name produced for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledContext {
    pub descriptor: String,
    pub dependency_file: Option<&'static str>,
}

/// Render the build descriptor
///
/// With a dependency file the descriptor copies it in, drops privileges to
/// run the runtime's extension hook and then restores them.
pub fn render_descriptor(source_image: &str, dependency_file: Option<&str>) -> String {
    let mut descriptor = format!("FROM {}\n", source_image);
    if let Some(file) = dependency_file {
        descriptor.push_str(&format!("COPY ./{} {}/{}\n", file, DEPENDENCY_DIR, file));
        descriptor.push_str("USER nobody\n");
        descriptor.push_str("RUN /bin/extend\n");
        descriptor.push_str("USER root\n");
    }
    descriptor
}

/// Verify a staged context: the directory exists, is non-empty and holds
/// the descriptor
pub fn check_build_dir(dir: &Path) -> Result<(), ValidationError> {
    let invalid = || ValidationError::InvalidBuildDir(dir.to_path_buf());

    let mut entries = fs::read_dir(dir).map_err(|_| invalid())?;
    if entries.next().is_none() {
        return Err(invalid());
    }
    if !dir.join(DESCRIPTOR_FILE).is_file() {
        return Err(invalid());
    }
    Ok(())
}

/// Staged context files in a scratch directory
///
/// The directory is removed on [`close`](Self::close) or when dropped.
#[derive(Debug)]
pub struct ScratchBundle {
    dir: TempDir,
}

impl ScratchBundle {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Read every staged file into a context spec named `name`
    pub fn to_context_spec(&self, name: &str) -> Result<ContextSpec, BuildError> {
        let mut spec = ContextSpec::new(name);
        for entry in fs::read_dir(self.path())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let contents = fs::read_to_string(entry.path())?;
            spec = spec.with_file(file_name, contents);
        }
        Ok(spec)
    }

    /// Remove the scratch directory, reporting failures
    pub fn close(self) -> std::io::Result<()> {
        self.dir.close()
    }
}

/// Assembles build contexts
#[derive(Debug, Clone, Default)]
pub struct BuildContextAssembler {
    scratch_root: Option<PathBuf>,
}

impl BuildContextAssembler {
    /// Stage contexts under `scratch_root`, or the system temp dir when unset
    pub fn new(scratch_root: Option<PathBuf>) -> Self {
        Self { scratch_root }
    }

    /// Produce the descriptor for a request; no I/O
    pub fn assemble(&self, request: &BuildRequest) -> AssembledContext {
        let dependency_file = request
            .dependency_content
            .as_ref()
            .map(|_| request.runtime_kind.dependency_file_name());

        AssembledContext {
            descriptor: render_descriptor(&request.source_image, dependency_file),
            dependency_file,
        }
    }

    /// Write the descriptor and the dependency file into a fresh scratch
    /// directory and verify it
    pub fn write_bundle(
        &self,
        request: &BuildRequest,
        assembled: &AssembledContext,
    ) -> Result<ScratchBundle, BuildError> {
        let dir = match &self.scratch_root {
            Some(root) => {
                fs::create_dir_all(root)?;
                tempfile::Builder::new().prefix("runway-").tempdir_in(root)?
            }
            None => tempfile::Builder::new().prefix("runway-").tempdir()?,
        };

        fs::write(dir.path().join(DESCRIPTOR_FILE), &assembled.descriptor)?;
        if let (Some(file), Some(content)) =
            (assembled.dependency_file, request.dependency_content.as_ref())
        {
            fs::write(dir.path().join(file), content)?;
        }

        check_build_dir(dir.path())?;
        tracing::debug!("Staged build context in {}", dir.path().display());

        Ok(ScratchBundle { dir })
    }

    /// Assemble, stage and read back the context for upload
    ///
    /// The scratch directory is gone when this returns.
    pub fn prepare(&self, request: &BuildRequest, name: &str) -> Result<ContextSpec, BuildError> {
        let assembled = self.assemble(request);
        let bundle = self.write_bundle(request, &assembled)?;
        let spec = bundle.to_context_spec(name);

        let path = bundle.path().to_path_buf();
        if let Err(e) = bundle.close() {
            tracing::warn!("Failed to remove scratch directory {}: {}", path.display(), e);
        }

        spec
    }
}
