//! The version registry: an ordered table of known application versions.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::appd::Appd;

/// Errors raised by the version registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    /// No entry matches the requested app version. This is the explicit
    /// signal that the native implementation is authoritative.
    #[error("no version found")]
    NoVersionFound,

    /// Two entries share an app version.
    #[error("duplicate app version {0}")]
    Duplicate(u64),

    /// An embedded entry has no process descriptor.
    #[error("version {0} has no process descriptor")]
    MissingAppd(u64),

    /// The registry is empty and no native fallback is configured.
    #[error("no versions registered and no native fallback configured")]
    Empty,
}

/// Pure function mapping the outer process argv (binary name and the literal
/// `start` token already removed) to the embedded child's argv.
pub type StartArgsFn = Arc<dyn Fn(&[String]) -> Vec<String> + Send + Sync>;

/// One application implementation known to the multiplexer.
#[derive(Clone)]
pub struct Version {
    /// Chain-level protocol version this record serves.
    pub app_version: u64,
    /// Wire protocol vintage the embedded child speaks.
    pub abci_version: AbciVersion,
    /// Process descriptor; `None` for the native record.
    pub appd: Option<Arc<Appd>>,
    /// argv transformer; `None` means pass-through.
    pub start_args: Option<StartArgsFn>,
    /// One-shot sub-commands run before `start`, in order. Advisory.
    pub pre_handlers: Vec<String>,
}

impl Version {
    /// Describe an embedded application for the given app version.
    pub fn embedded(app_version: u64, abci_version: AbciVersion, appd: Appd) -> Self {
        Self {
            app_version,
            abci_version,
            appd: Some(Arc::new(appd)),
            start_args: None,
            pre_handlers: Vec::new(),
        }
    }

    pub fn with_start_args(
        mut self,
        f: impl Fn(&[String]) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        self.start_args = Some(Arc::new(f));
        self
    }

    pub fn with_pre_handlers(mut self, pre_handlers: Vec<String>) -> Self {
        self.pre_handlers = pre_handlers;
        self
    }

    /// Compute the embedded child's argv from the outer process argv.
    pub fn get_start_args(&self, program_args: &[String]) -> Vec<String> {
        match &self.start_args {
            Some(f) => f(program_args),
            None => program_args.to_vec(),
        }
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Version")
            .field("app_version", &self.app_version)
            .field("abci_version", &self.abci_version)
            .field("appd", &self.appd.as_ref().map(|a| a.path()))
            .field("pre_handlers", &self.pre_handlers)
            .finish()
    }
}

/// Wire protocol vintage spoken by an embedded application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbciVersion {
    V1,
    V2,
}

impl fmt::Display for AbciVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbciVersion::V1 => write!(f, "v1"),
            AbciVersion::V2 => write!(f, "v2"),
        }
    }
}

/// Registry of all embedded application versions, ordered by app version.
#[derive(Clone, Debug, Default)]
pub struct Versions(Vec<Version>);

impl Versions {
    pub fn new(mut versions: Vec<Version>) -> Self {
        versions.sort_by_key(|v| v.app_version);
        Self(versions)
    }

    /// Check registry invariants. `native_fallback` states whether a native
    /// implementation exists to serve versions beyond the registry.
    pub fn validate(&self, native_fallback: bool) -> Result<(), VersionError> {
        if self.0.is_empty() && !native_fallback {
            return Err(VersionError::Empty);
        }
        for pair in self.0.windows(2) {
            if pair[0].app_version == pair[1].app_version {
                return Err(VersionError::Duplicate(pair[0].app_version));
            }
        }
        for version in &self.0 {
            if version.appd.is_none() {
                return Err(VersionError::MissingAppd(version.app_version));
            }
        }
        Ok(())
    }

    /// Resolve the entry with `app_version == v`.
    ///
    /// `Err(NoVersionFound)` means no embedded binary serves `v`: the native
    /// implementation is the latest and handles it.
    pub fn get_for_app_version(&self, app_version: u64) -> Result<&Version, VersionError> {
        self.0
            .iter()
            .find(|v| v.app_version == app_version)
            .ok_or(VersionError::NoVersionFound)
    }

    /// Whether the native (latest) implementation serves `app_version`.
    pub fn should_use_latest_app(&self, app_version: u64) -> bool {
        matches!(
            self.get_for_app_version(app_version),
            Err(VersionError::NoVersionFound)
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Version> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(app_version: u64) -> Version {
        Version::embedded(app_version, AbciVersion::V2, Appd::new("/usr/bin/true"))
    }

    #[test]
    fn registry_is_sorted_on_construction() {
        let versions = Versions::new(vec![version(3), version(1), version(2)]);
        let order: Vec<u64> = versions.iter().map(|v| v.app_version).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn validate_rejects_duplicates() {
        let versions = Versions::new(vec![version(2), version(2)]);
        assert_eq!(versions.validate(true), Err(VersionError::Duplicate(2)));
    }

    #[test]
    fn validate_rejects_missing_appd() {
        let mut bad = version(2);
        bad.appd = None;
        let versions = Versions::new(vec![bad]);
        assert_eq!(versions.validate(true), Err(VersionError::MissingAppd(2)));
    }

    #[test]
    fn validate_empty_needs_native_fallback() {
        let versions = Versions::new(vec![]);
        assert_eq!(versions.validate(false), Err(VersionError::Empty));
        assert!(versions.validate(true).is_ok());
    }

    #[test]
    fn lookup_is_exact_match() {
        let versions = Versions::new(vec![version(1), version(3)]);
        assert_eq!(versions.get_for_app_version(1).unwrap().app_version, 1);
        assert_eq!(versions.get_for_app_version(3).unwrap().app_version, 3);
        // A gap resolves to the sentinel, same as exceeding the registry.
        assert_eq!(
            versions.get_for_app_version(2).unwrap_err(),
            VersionError::NoVersionFound
        );
        assert_eq!(
            versions.get_for_app_version(4).unwrap_err(),
            VersionError::NoVersionFound
        );
    }

    #[test]
    fn should_use_latest_app_derives_from_sentinel() {
        let versions = Versions::new(vec![version(2)]);
        assert!(!versions.should_use_latest_app(2));
        assert!(versions.should_use_latest_app(5));
    }

    #[test]
    fn get_start_args_defaults_to_passthrough() {
        let v = version(2);
        let args = vec!["--home".to_string(), "/tmp".to_string()];
        assert_eq!(v.get_start_args(&args), args);
    }

    #[test]
    fn get_start_args_applies_transformer() {
        let v = version(2).with_start_args(|args| {
            let mut out = args.to_vec();
            out.push("--force-migration".to_string());
            out
        });
        let args = vec!["--home".to_string(), "/tmp".to_string()];
        assert_eq!(
            v.get_start_args(&args),
            vec!["--home", "/tmp", "--force-migration"]
        );
    }
}
