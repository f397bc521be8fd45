#![cfg_attr(docsrs, feature(doc_cfg))]

use git_version::git_version;

pub mod binaries;
pub mod binary_utils;
pub mod config;
pub mod metrics;
pub mod orchestrator;
pub mod runner;
pub mod trace;
pub mod workdir;

/// Returns the git revision used to build this crate, using `git describe`, if it was built from a
/// git repository. The `GIT_REVISION` environment variable provides an override for builds made
/// from a source tarball.
pub fn git_revision() -> &'static str {
    let mut git_revision: &'static str = git_version!(fallback = "unknown");
    if git_revision == "unknown" {
        if let Some(value) = option_env!("GIT_REVISION") {
            git_revision = value;
        }
    }
    git_revision
}
