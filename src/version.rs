//! Module update checks against a package registry
//!
//! The latest published version of a module is looked up through a `Cacher`
//! with a one-day TTL, then compared against the locally installed version
//! using semantic-version ordering.

use futures::future::{BoxFuture, FutureExt};
use reqwest::Client;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::cache::{BoxError, CacheError, CacheStore, Cacher, Producer};

/// Default registry queried for published versions
pub const DEFAULT_REGISTRY_URL: &str = "https://registry.npmjs.org";

/// How long a looked-up latest version is trusted
pub const UPDATE_CHECK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default budget for a single registry request
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur while checking for updates
#[derive(Debug, Error)]
pub enum VersionError {
    /// A version string is not valid semver
    #[error("invalid version '{version}': {source}")]
    InvalidVersion {
        version: String,
        #[source]
        source: semver::Error,
    },

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Looking up the latest version failed
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Outcome of comparing the installed version against the latest release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatus {
    pub update_is_available: bool,
    pub latest: String,
    pub current: String,
}

/// The part of a registry "latest" document that gets cached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestRelease {
    pub version: String,
}

/// Parses a version, tolerating surrounding whitespace and a leading `v`
pub fn parse_version(version: &str) -> Result<Version, VersionError> {
    let trimmed = version.trim();
    let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(bare).map_err(|source| VersionError::InvalidVersion {
        version: version.to_string(),
        source,
    })
}

/// Compares `latest` against `current`
///
/// An update is available only when `latest` is strictly greater; a local
/// build ahead of the registry is not an update. Pre-release ordering follows
/// semver rules (`1.0.0-beta.1 < 1.0.0`).
pub fn compare_versions(latest: &str, current: &str) -> Result<UpdateStatus, VersionError> {
    let latest_version = parse_version(latest)?;
    let current_version = parse_version(current)?;
    Ok(UpdateStatus {
        update_is_available: latest_version > current_version,
        latest: latest.trim().to_string(),
        current: current.trim().to_string(),
    })
}

/// Client for looking up published versions in a package registry
#[derive(Debug, Clone)]
pub struct RegistryClient {
    /// HTTP client for making requests
    http_client: Client,
    /// Base URL of the registry (allows override for testing)
    base_url: String,
}

impl RegistryClient {
    /// Creates a client for the default registry
    pub fn new() -> Result<Self, VersionError> {
        Self::with_base_url(DEFAULT_REGISTRY_URL, DEFAULT_FETCH_TIMEOUT)
    }

    /// Creates a client for `base_url` whose requests give up after `timeout`
    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Result<Self, VersionError> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            base_url: base_url.into(),
        })
    }

    /// URL of the "latest" document for `module`
    ///
    /// Scoped names keep their `@` but have the `/` escaped, which is what
    /// registries expect (`@scope/pkg` becomes `@scope%2Fpkg`).
    pub fn latest_url(&self, module: &str) -> String {
        format!(
            "{}/{}/latest",
            self.base_url.trim_end_matches('/'),
            module.replace('/', "%2F")
        )
    }

    /// Fetches the latest published release of `module`
    pub async fn latest_version(&self, module: &str) -> Result<LatestRelease, VersionError> {
        let url = self.latest_url(module);
        debug!(%url, "querying registry");

        let release = self
            .http_client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<LatestRelease>()
            .await?;

        Ok(release)
    }
}

/// Producer that asks the registry for one module's latest release
struct LatestReleaseProducer {
    registry: RegistryClient,
    module: String,
}

impl Producer<LatestRelease> for LatestReleaseProducer {
    fn produce(&self) -> BoxFuture<'static, Result<LatestRelease, BoxError>> {
        let registry = self.registry.clone();
        let module = self.module.clone();
        async move {
            let release = registry.latest_version(&module).await?;
            // Reject garbage before it gets cached for a day.
            parse_version(&release.version)?;
            Ok::<_, BoxError>(release)
        }
        .boxed()
    }
}

/// Checks whether a newer version of one module has been published
#[derive(Debug, Clone)]
pub struct ModuleVersionChecker {
    module: String,
    cacher: Cacher<LatestRelease>,
}

impl ModuleVersionChecker {
    /// Creates a checker for `module`, caching lookups in `store` for one day
    pub fn new(module: impl Into<String>, store: CacheStore, registry: RegistryClient) -> Self {
        Self::with_ttl(module, store, registry, UPDATE_CHECK_TTL)
    }

    /// Creates a checker with a custom cache TTL
    pub fn with_ttl(
        module: impl Into<String>,
        store: CacheStore,
        registry: RegistryClient,
        ttl: Duration,
    ) -> Self {
        let module = module.into();
        let producer = LatestReleaseProducer {
            registry,
            module: module.clone(),
        };
        let cacher = Cacher::new(producer, store, cache_key(&module), ttl);
        Self { module, cacher }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Cache entry backing this checker
    pub fn cacher(&self) -> &Cacher<LatestRelease> {
        &self.cacher
    }

    /// Compares `current` against the latest published version
    ///
    /// `current` is validated before anything is fetched.
    pub async fn check(&self, current: &str) -> Result<UpdateStatus, VersionError> {
        parse_version(current)?;
        let latest = self.cacher.get().await?;
        compare_versions(&latest.version, current)
    }

    /// Like [`check`](Self::check), giving up on the lookup after `budget`
    pub async fn check_with_timeout(
        &self,
        current: &str,
        budget: Duration,
    ) -> Result<UpdateStatus, VersionError> {
        parse_version(current)?;
        let latest = self.cacher.get_with_timeout(budget).await?;
        compare_versions(&latest.version, current)
    }
}

/// Cache key for a module's update check
pub fn cache_key(module: &str) -> String {
    format!("{}-updates", module)
}
