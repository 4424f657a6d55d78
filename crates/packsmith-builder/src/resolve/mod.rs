//! Module resolution.
//!
//! Every declared module is fetched into a form the assembler can consume:
//! local directories and archives are staged as layers, images are found
//! locally or pulled according to the pull policy, and registry packages are
//! looked up and then handled as images. Fetches run concurrently up to a
//! fixed limit; results always come back in declaration order.

mod local;
mod retry;

use std::path::PathBuf;
use std::sync::Arc;

use packsmith_image::{ImageReference, LocalImage};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub use local::{ModuleInfo, StagedModule, Target, stage};
pub use retry::{Attempts, RetryError, RetryPolicy, with_retry};

use crate::client::{ImageClient, PackageLookup};
use crate::diagnostics::Diagnostics;
use crate::error::{BuilderError, ResolutionReason};
use crate::module::{ModuleReference, ModuleSource};
use crate::policy::{OFFICIAL_REGISTRY_URL, PullPolicy};
use crate::settings::DEFAULT_CONCURRENCY;

/// Label a buildpackage image carries its identity in.
pub const PACKAGE_LABEL: &str = "io.buildpacks.buildpackage.metadata";

/// Content of a resolved module.
#[derive(Debug, Clone)]
pub enum ModuleContent {
    /// A layer written to the staging area.
    Staged {
        /// Layer file.
        path: PathBuf,
        /// Layer digest.
        digest: String,
    },
    /// A locally available image whose layers hold the module.
    Image {
        /// The image.
        image: LocalImage,
    },
    /// Nothing to add; the module is expected in the base image.
    Bare,
}

/// A module ready for assembly.
#[derive(Debug, Clone)]
pub struct ResolvedModule {
    /// The declaration.
    pub reference: ModuleReference,
    /// Verified identity.
    pub info: ModuleInfo,
    /// Content.
    pub content: ModuleContent,
    /// Warnings raised while resolving this module.
    pub diagnostics: Diagnostics,
}

/// Resolution stopped at a fatal failure.
#[derive(Debug)]
pub struct ResolveFailure {
    /// The first fatal failure.
    pub error: BuilderError,
    /// Findings gathered before the run stopped, failures included.
    pub diagnostics: Diagnostics,
}

const STAGING_SLOTS: u32 = 1024;

/// Blocking staging jobs started for one run.
///
/// A job keeps its slot until it returns, even when the task awaiting it has
/// been aborted, so [`StagingTasks::finished`] resolves only once nothing is
/// writing to the staging area.
#[derive(Debug, Clone)]
pub struct StagingTasks(Arc<Semaphore>);

impl StagingTasks {
    /// No jobs running.
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(Semaphore::new(STAGING_SLOTS as usize)))
    }

    /// Run `job` on the blocking pool, tracked until it returns.
    pub async fn spawn<F, T>(&self, job: F) -> Result<T, ResolutionReason>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::clone(&self.0)
            .acquire_owned()
            .await
            .map_err(|_| ResolutionReason::InvalidContent("staging closed".to_string()))?;
        tokio::task::spawn_blocking(move || {
            let output = job();
            drop(slot);
            output
        })
        .await
        .map_err(|e| ResolutionReason::InvalidContent(format!("staging task failed: {e}")))
    }

    /// Wait for every job started so far.
    pub async fn finished(&self) {
        if let Ok(slots) = self.0.acquire_many(STAGING_SLOTS).await {
            drop(slots);
        }
    }
}

impl Default for StagingTasks {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetches every declared module with bounded concurrency.
pub struct ModuleResolver {
    fetcher: Fetcher,
    concurrency: usize,
}

impl ModuleResolver {
    /// Resolver staging local modules under `staging`.
    #[must_use]
    pub fn new(
        client: Arc<dyn ImageClient>,
        lookup: Arc<dyn PackageLookup>,
        pull_policy: PullPolicy,
        staging: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fetcher: Fetcher {
                client,
                lookup,
                pull_policy,
                retry: RetryPolicy::default(),
                staging: staging.into(),
                staging_tasks: StagingTasks::new(),
                registry_url: Arc::from(OFFICIAL_REGISTRY_URL),
            },
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Override the retry limits.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.fetcher.retry = retry;
        self
    }

    /// Maximum fetches in flight; at least one.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Track local staging jobs in `tasks`.
    #[must_use]
    pub fn with_staging_tasks(mut self, tasks: StagingTasks) -> Self {
        self.fetcher.staging_tasks = tasks;
        self
    }

    /// Registry index consulted for `urn:cnb:registry:` modules.
    #[must_use]
    pub fn with_registry(mut self, registry_url: &str) -> Self {
        self.fetcher.registry_url = Arc::from(registry_url);
        self
    }

    /// Resolve `modules`, returning them in the same order.
    ///
    /// The first fatal failure stops the run: fetches not yet finished are
    /// aborted, and failures that had already happened are reported
    /// alongside it.
    pub async fn resolve(
        &self,
        modules: Vec<ModuleReference>,
    ) -> Result<Vec<ResolvedModule>, ResolveFailure> {
        let total = modules.len();
        tracing::info!(
            modules = total,
            concurrency = self.concurrency,
            pull_policy = %self.fetcher.pull_policy,
            "Resolving modules"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for (index, reference) in modules.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let fetcher = self.fetcher.clone();
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => fetcher.resolve_one(&reference).await,
                    Err(_) => Err(ResolutionReason::InvalidContent(
                        "resolver shut down".to_string(),
                    )),
                };
                (index, reference, result)
            });
        }

        let mut slots: Vec<Option<ResolvedModule>> = vec![None; total];
        let mut failures = Diagnostics::new();
        let mut first_error: Option<BuilderError> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, _, Ok(resolved))) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(resolved);
                    }
                }
                Ok((_, reference, Err(reason))) => {
                    tracing::error!(module = %reference, reason = %reason, "Module resolution failed");
                    failures.error(
                        reference.id.to_string(),
                        format!("resolving {reference}: {reason}"),
                    );
                    if first_error.is_none() {
                        first_error = Some(BuilderError::ModuleResolution {
                            module: reference.to_string(),
                            reason,
                        });
                        tasks.abort_all();
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    tracing::error!(error = %e, "Resolver task panicked");
                    if first_error.is_none() {
                        first_error = Some(BuilderError::Internal {
                            message: format!("resolver task failed: {e}"),
                        });
                        tasks.abort_all();
                    }
                }
            }
        }

        let mut diagnostics = Diagnostics::new();
        for resolved in slots.iter().flatten() {
            diagnostics.extend(resolved.diagnostics.clone());
        }

        if let Some(error) = first_error {
            diagnostics.extend(failures);
            return Err(ResolveFailure { error, diagnostics });
        }

        let resolved: Vec<ResolvedModule> = slots.into_iter().flatten().collect();
        if resolved.len() != total {
            return Err(ResolveFailure {
                error: BuilderError::Internal {
                    message: format!("resolved {} of {total} modules", resolved.len()),
                },
                diagnostics,
            });
        }
        tracing::info!(modules = total, "Modules resolved");
        Ok(resolved)
    }

    /// Find or pull the base image under the pull policy.
    pub async fn fetch_base(&self, reference: &ImageReference) -> Result<LocalImage, BuilderError> {
        tracing::info!(image = %reference, "Fetching base image");
        self.fetcher
            .fetch_image(reference)
            .await
            .map_err(|reason| BuilderError::ModuleResolution {
                module: format!("base image '{reference}'"),
                reason,
            })
    }
}

/// Per-task view of the resolver.
#[derive(Clone)]
struct Fetcher {
    client: Arc<dyn ImageClient>,
    lookup: Arc<dyn PackageLookup>,
    pull_policy: PullPolicy,
    retry: RetryPolicy,
    staging: PathBuf,
    staging_tasks: StagingTasks,
    registry_url: Arc<str>,
}

#[derive(Debug, Deserialize)]
struct PackageIdentity {
    id: String,
    version: Option<String>,
    name: Option<String>,
    homepage: Option<String>,
}

impl Fetcher {
    async fn resolve_one(
        &self,
        reference: &ModuleReference,
    ) -> Result<ResolvedModule, ResolutionReason> {
        tracing::debug!(module = %reference, "Resolving module");
        let mut diagnostics = Diagnostics::new();

        let (info, content) = match &reference.source {
            ModuleSource::Bare => {
                diagnostics.warn_about(
                    reference.id.to_string(),
                    format!(
                        "builder configuration: {reference} has no 'uri' or 'image'; it must already be present in the base image"
                    ),
                );
                (ModuleInfo::declared(reference), ModuleContent::Bare)
            }
            ModuleSource::LocalPath(path) => {
                let staged = {
                    let reference = reference.clone();
                    let path = path.clone();
                    let staging = self.staging.clone();
                    self.staging_tasks
                        .spawn(move || stage(&reference, &path, &staging))
                        .await??
                };
                (
                    staged.info,
                    ModuleContent::Staged {
                        path: staged.path,
                        digest: staged.digest,
                    },
                )
            }
            ModuleSource::Image(image) => self.from_image(reference, image, &mut diagnostics).await?,
            ModuleSource::Registry { id, version } => {
                let operation = format!("registry lookup {id}");
                let image = with_retry(&self.retry, &operation, || {
                    self.lookup.lookup(&self.registry_url, id, version.as_deref())
                })
                .await
                .map_err(retry_reason)?;
                tracing::debug!(module = %reference, image = %image, "Registry package located");
                self.from_image(reference, &image, &mut diagnostics).await?
            }
        };

        tracing::debug!(
            module = %reference,
            version = info.version.as_deref().unwrap_or("-"),
            "Module resolved"
        );
        Ok(ResolvedModule {
            reference: reference.clone(),
            info,
            content,
            diagnostics,
        })
    }

    async fn from_image(
        &self,
        reference: &ModuleReference,
        image_ref: &ImageReference,
        diagnostics: &mut Diagnostics,
    ) -> Result<(ModuleInfo, ModuleContent), ResolutionReason> {
        let image = self.fetch_image(image_ref).await?;
        let mut info = ModuleInfo::declared(reference);

        match image.config.label(PACKAGE_LABEL) {
            None => diagnostics.warn_about(
                reference.id.to_string(),
                format!(
                    "{reference}: image {image_ref} has no {PACKAGE_LABEL} label; its identity was not verified"
                ),
            ),
            Some(label) => {
                let identity: PackageIdentity = serde_json::from_str(label).map_err(|e| {
                    ResolutionReason::InvalidContent(format!(
                        "{image_ref}: malformed {PACKAGE_LABEL} label: {e}"
                    ))
                })?;
                if identity.id != reference.id.as_str() {
                    return Err(ResolutionReason::InvalidContent(format!(
                        "{image_ref} contains '{}', expected '{}'",
                        identity.id, reference.id
                    )));
                }
                match (&reference.version, &identity.version) {
                    (Some(declared), Some(found)) if declared != found => {
                        return Err(ResolutionReason::InvalidContent(format!(
                            "{image_ref} contains version '{found}', expected '{declared}'"
                        )));
                    }
                    (None, Some(found)) => info.version = Some(found.clone()),
                    _ => {}
                }
                info.name = identity.name;
                info.homepage = identity.homepage;
            }
        }

        Ok((info, ModuleContent::Image { image }))
    }

    async fn fetch_image(&self, reference: &ImageReference) -> Result<LocalImage, ResolutionReason> {
        match self.pull_policy {
            PullPolicy::Never => self.client.find_local(reference).await?.ok_or_else(|| {
                ResolutionReason::NotFound(format!(
                    "{reference} is not available locally and the pull policy is never"
                ))
            }),
            PullPolicy::IfNotPresent => {
                if let Some(image) = self.client.find_local(reference).await? {
                    tracing::debug!(image = %reference, digest = %image.digest, "Using local image");
                    return Ok(image);
                }
                self.pull(reference).await
            }
            PullPolicy::Always => self.pull(reference).await,
        }
    }

    async fn pull(&self, reference: &ImageReference) -> Result<LocalImage, ResolutionReason> {
        tracing::info!(image = %reference, "Pulling image");
        let operation = format!("pull {reference}");
        let image = with_retry(&self.retry, &operation, || self.client.pull(reference))
            .await
            .map_err(retry_reason)?;
        tracing::debug!(image = %reference, digest = %image.digest, "Image pulled");
        Ok(image)
    }
}

fn retry_reason(err: RetryError) -> ResolutionReason {
    match err {
        RetryError::Fatal(err) => err.into(),
        RetryError::Exhausted { attempts, last } => ResolutionReason::RetryExhausted {
            attempts,
            last: last.to_string(),
        },
    }
}
