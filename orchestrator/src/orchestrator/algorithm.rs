//! Algorithm images and artifact naming.

use crate::{
    orchestrator::{Components, Error},
    runner::ImageSpec,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use trainyard_core::time::Clock;
use trainyard_orchestrator_core::blobstore::BucketKind;

/// Path inside a custom algorithm image where its `algorithm.py` lives. Template-mode workloads
/// have this file copied out of the image into their input directory.
pub const IMAGE_ALGORITHM_PATH: &str = "/app/algorithm.py";

/// File name an archive image is staged under while it is loaded onto the backend.
const ARCHIVE_FILE: &str = "algorithm-image.tar";

/// Where a custom algorithm's container image comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmImage {
    /// An image pulled from a registry by reference.
    Registry { reference: String },
    /// A caller-uploaded image tar archive, addressed by its key in the algorithm bucket.
    Archive { key: String },
}

/// How a custom algorithm's workload is started.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run a staged Python template which loads the algorithm's `algorithm.py` from the image.
    PythonTemplate,
    /// Bring-your-own-container: run the image's own entrypoint unchanged.
    Byoc,
}

/// Makes a custom algorithm's image runnable on the backend, returning the image reference
/// workloads are started from. Archive images are fetched from the object store into
/// `scratch_dir` and loaded under a deterministic local tag; the archive is removed once the
/// backend has it.
///
/// `scratch_dir` must be the job's exchange directory: the Kubernetes backend can only read the
/// archive through the shared volume.
pub async fn prepare_algorithm_image<C: Clock>(
    components: &Components<C>,
    owner: &str,
    image: &AlgorithmImage,
    scratch_dir: &Path,
) -> Result<String, Error> {
    let spec = match image {
        AlgorithmImage::Registry { reference } => ImageSpec::Registry {
            image: reference.clone(),
        },
        AlgorithmImage::Archive { key } => {
            let tar_path = scratch_dir.join(ARCHIVE_FILE);
            components
                .blobstore()
                .download_to_file(components.bucket(BucketKind::CustomAlgorithm), key, &tar_path)
                .await?;
            let spec = ImageSpec::Archive {
                tar_path: tar_path.clone(),
                tag: custom_image_tag(owner, key),
            };
            components.runner().prepare_image(&spec).await?;
            tokio::fs::remove_file(&tar_path).await?;
            return Ok(spec.reference().to_string());
        }
    };
    components.runner().prepare_image(&spec).await?;
    Ok(spec.reference().to_string())
}

/// The local tag an archive image is loaded under. Derived from the owner and the archive key,
/// so re-submissions of the same archive reuse the already-loaded image.
pub fn custom_image_tag(owner: &str, key: &str) -> String {
    let stem = key
        .rsplit('/')
        .next()
        .unwrap_or(key)
        .trim_end_matches(".tar");
    format!("trainyard/custom-{}:latest", slugify(&format!("{owner}-{stem}")))
}

/// Reduces a string to the characters Docker accepts in a repository name.
fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    for c in value.chars() {
        match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '.' | '_' | '-') => slug.push(c),
            _ => slug.push('-'),
        }
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::custom_image_tag;

    #[test]
    fn custom_image_tags() {
        assert_eq!(
            custom_image_tag("ada", "gradient-boost.tar"),
            "trainyard/custom-ada-gradient-boost:latest"
        );
        assert_eq!(
            custom_image_tag("Ada Lovelace", "uploads/My Algo.tar"),
            "trainyard/custom-ada-lovelace-my-algo:latest"
        );
        // Deterministic, so re-submissions reuse the loaded image.
        assert_eq!(
            custom_image_tag("ada", "algo.tar"),
            custom_image_tag("ada", "algo.tar")
        );
    }
}
