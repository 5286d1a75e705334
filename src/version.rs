//! Build metadata embedded by `build.rs`.

use std::fmt;

/// Package version from Cargo.toml.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version and git metadata captured at build time.
///
/// Git fields read "unknown" when the crate was built outside a checkout.
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub version: &'static str,
    pub branch: &'static str,
    pub sha: &'static str,
    pub dirty: bool,
    /// RFC 3339 build timestamp.
    pub built_at: &'static str,
}

/// Metadata for this build.
pub const BUILD: BuildInfo = BuildInfo {
    version: PKG_VERSION,
    branch: match option_env!("VERGEN_GIT_BRANCH") {
        Some(branch) => branch,
        None => "unknown",
    },
    sha: match option_env!("VERGEN_GIT_SHA") {
        Some(sha) => sha,
        None => "unknown",
    },
    dirty: is_true(option_env!("VERGEN_GIT_DIRTY")),
    built_at: match option_env!("VERGEN_BUILD_TIMESTAMP") {
        Some(ts) => ts,
        None => "unknown",
    },
};

const fn is_true(flag: Option<&str>) -> bool {
    match flag {
        Some(value) => matches!(value.as_bytes(), b"true"),
        None => false,
    }
}

impl BuildInfo {
    /// First seven characters of the commit SHA.
    pub fn short_sha(&self) -> &'static str {
        &self.sha[..7.min(self.sha.len())]
    }
}

/// Renders as `{version}+{branch}.{sha}`, with `.dirty` appended for a dirty tree.
impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}.{}", self.version, self.branch, self.short_sha())?;
        if self.dirty {
            f.write_str(".dirty")?;
        }
        Ok(())
    }
}

/// Full version string for `--version` output, e.g. `0.2.1+main.abc1234`.
pub fn version_string() -> String {
    BUILD.to_string()
}
