//! Exchange directories for workloads.
//!
//! Each workload gets a fresh pair of directories: one holding its inputs, one receiving its
//! outputs. On the Docker backend these are bind-mounted into the container; on Kubernetes they
//! must be created under the shared volume root so workload pods can see them.

use std::{
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

/// Creates workload directory pairs under a fixed root.
#[derive(Clone, Debug)]
pub struct WorkdirFactory {
    root: PathBuf,
    preserve: bool,
}

impl WorkdirFactory {
    /// `root` is where directory pairs are created; when unset, the system temporary directory
    /// is used. When `preserve` is set, cleanup leaves the directories in place for inspection.
    pub fn new(root: Option<PathBuf>, preserve: bool) -> Self {
        Self {
            root: root.unwrap_or_else(std::env::temp_dir),
            preserve,
        }
    }

    /// Creates a fresh directory pair. `label` distinguishes the flavor of workload in the
    /// directory names, e.g. `training` produces `training-ds-*` and `training-out-*`.
    pub fn create(&self, label: &str) -> Result<WorkdirPair, io::Error> {
        let input = self.create_dir(&format!("{label}-ds-"))?;
        let output = match self.create_dir(&format!("{label}-out-")) {
            Ok(output) => output,
            Err(err) => {
                if let Err(err) = std::fs::remove_dir_all(&input) {
                    warn!(dir = %input.display(), %err, "couldn't remove workload directory");
                }
                return Err(err);
            }
        };
        Ok(WorkdirPair {
            input,
            output,
            preserve: self.preserve,
        })
    }

    fn create_dir(&self, prefix: &str) -> Result<PathBuf, io::Error> {
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.root)?
            .keep();
        // Workload containers run under arbitrary UIDs, so the directories must be writable by
        // anyone.
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o777))?;
        Ok(dir)
    }
}

/// A pair of exchange directories for one workload. The pair is removed by [`Self::cleanup`],
/// which the orchestration runs on every exit path.
#[derive(Debug)]
pub struct WorkdirPair {
    input: PathBuf,
    output: PathBuf,
    preserve: bool,
}

impl WorkdirPair {
    /// The directory holding the workload's inputs.
    pub fn input(&self) -> &Path {
        &self.input
    }

    /// The directory the workload writes its outputs into.
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Removes both directories. Removal failures are logged, never surfaced: at this point the
    /// job's outcome is already decided and must not change.
    pub async fn cleanup(self) {
        if self.preserve {
            info!(
                input = %self.input.display(),
                output = %self.output.display(),
                "preserving workload directories",
            );
            return;
        }
        for dir in [&self.input, &self.output] {
            if let Err(err) = tokio::fs::remove_dir_all(dir).await {
                warn!(dir = %dir.display(), %err, "couldn't remove workload directory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::WorkdirFactory;
    use std::os::unix::fs::PermissionsExt;

    #[tokio::test]
    async fn directory_pair_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        let factory = WorkdirFactory::new(Some(root.path().to_path_buf()), false);

        let pair = factory.create("training").unwrap();
        let input = pair.input().to_path_buf();
        let output = pair.output().to_path_buf();

        let input_name = input.file_name().unwrap().to_str().unwrap();
        let output_name = output.file_name().unwrap().to_str().unwrap();
        assert!(input_name.starts_with("training-ds-"), "{input_name}");
        assert!(output_name.starts_with("training-out-"), "{output_name}");

        for dir in [&input, &output] {
            let mode = std::fs::metadata(dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o777);
        }

        std::fs::write(input.join("dataset.csv"), b"a,b\n").unwrap();
        pair.cleanup().await;
        assert!(!input.exists());
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn preserved_directories_survive_cleanup() {
        let root = tempfile::tempdir().unwrap();
        let factory = WorkdirFactory::new(Some(root.path().to_path_buf()), true);

        let pair = factory.create("prediction").unwrap();
        let input = pair.input().to_path_buf();
        let output = pair.output().to_path_buf();

        pair.cleanup().await;
        assert!(input.exists());
        assert!(output.exists());
    }

    #[test]
    fn default_root_is_the_system_temp_dir() {
        let factory = WorkdirFactory::new(None, false);
        let pair = factory.create("training").unwrap();
        assert!(pair.input().starts_with(std::env::temp_dir()));
        std::fs::remove_dir_all(pair.input()).unwrap();
        std::fs::remove_dir_all(pair.output()).unwrap();
    }
}
