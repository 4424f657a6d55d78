//! `builder create`, end to end.

use std::path::PathBuf;
use std::sync::Arc;

use packsmith_image::ImageReference;
use tempfile::TempDir;
use tokio::sync::watch;

use crate::assemble::{BuilderAssembler, OrderMetadata, StackMetadata};
use crate::client::{ImageClient, PackageLookup};
use crate::config::BuilderConfig;
use crate::diagnostics::{Diagnostics, Finding};
use crate::error::{BuilderError, BuilderResult};
use crate::module::ModuleReference;
use crate::order::OrderValidator;
use crate::policy::{CreateFlags, PolicyGate};
use crate::resolve::{ModuleResolver, ResolveFailure, StagingTasks};
use crate::settings::Settings;

/// Requests cancellation of a run.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    /// Cancel every run holding a token from this handle.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Observed by a run to learn it was cancelled.
#[derive(Debug, Clone)]
pub struct CancelToken(watch::Receiver<bool>);

impl CancelToken {
    /// A token that is never cancelled.
    #[must_use]
    pub fn never() -> Self {
        let (_sender, receiver) = watch::channel(false);
        Self(receiver)
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested; never if the handle is dropped first.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A connected handle and token.
#[must_use]
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (sender, receiver) = watch::channel(false);
    (CancelHandle(sender), CancelToken(receiver))
}

/// A builder that was created.
#[derive(Debug)]
pub struct CreateOutcome {
    /// Builder image reference.
    pub image: ImageReference,
    /// Manifest digest.
    pub digest: String,
    /// Whether the image went to its registry instead of the local store.
    pub published: bool,
    /// Findings in encounter order.
    pub diagnostics: Vec<Finding>,
}

/// A run that ended without a builder.
#[derive(Debug)]
pub struct CreateFailure {
    /// Why the run stopped.
    pub error: BuilderError,
    /// Findings gathered before it stopped; empty when cancelled.
    pub diagnostics: Vec<Finding>,
}

/// Runs policy checks, validation, resolution and assembly for one builder.
pub struct BuilderCreator {
    client: Arc<dyn ImageClient>,
    lookup: Arc<dyn PackageLookup>,
    settings: Settings,
    staging_root: Option<PathBuf>,
}

impl BuilderCreator {
    /// Creator using `client` for images and `lookup` for registry packages.
    #[must_use]
    pub fn new(
        client: Arc<dyn ImageClient>,
        lookup: Arc<dyn PackageLookup>,
        settings: Settings,
    ) -> Self {
        Self {
            client,
            lookup,
            settings,
            staging_root: None,
        }
    }

    /// Create per-run staging areas under `root` instead of the system temp dir.
    #[must_use]
    pub fn with_staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(root.into());
        self
    }

    /// Create a builder.
    pub async fn create(&self, flags: &CreateFlags) -> Result<CreateOutcome, CreateFailure> {
        self.create_with_cancel(flags, CancelToken::never()).await
    }

    /// Create a builder, stopping early if `cancel` fires.
    ///
    /// A cancelled run saves and publishes nothing, and its findings are
    /// discarded. The staging area outlives the run until every staging job
    /// has returned, then it is removed.
    pub async fn create_with_cancel(
        &self,
        flags: &CreateFlags,
        mut cancel: CancelToken,
    ) -> Result<CreateOutcome, CreateFailure> {
        let tasks = StagingTasks::new();
        let mut staging: Option<TempDir> = None;
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::warn!(image = %flags.image_name, "Builder creation cancelled");
                Err(CreateFailure {
                    error: BuilderError::Cancelled,
                    diagnostics: Vec::new(),
                })
            }
            result = self.run(flags, &mut staging, &tasks) => result,
        };
        tasks.finished().await;
        drop(staging);
        result
    }

    async fn run(
        &self,
        flags: &CreateFlags,
        staging: &mut Option<TempDir>,
        tasks: &StagingTasks,
    ) -> Result<CreateOutcome, CreateFailure> {
        let mut diagnostics = Diagnostics::new();
        match self.execute(flags, &mut diagnostics, staging, tasks).await {
            Ok((image, digest, published)) => Ok(CreateOutcome {
                image,
                digest,
                published,
                diagnostics: diagnostics.drain(),
            }),
            Err(error) => {
                tracing::debug!(error = %error, "Builder creation failed");
                Err(CreateFailure {
                    error,
                    diagnostics: diagnostics.drain(),
                })
            }
        }
    }

    async fn execute(
        &self,
        flags: &CreateFlags,
        diagnostics: &mut Diagnostics,
        staging: &mut Option<TempDir>,
        tasks: &StagingTasks,
    ) -> BuilderResult<(ImageReference, String, bool)> {
        let gate = PolicyGate::new(&self.settings);
        let decision = gate.check_flags(flags)?;
        tracing::info!(
            image = %decision.image,
            config = %decision.config_path.display(),
            pull_policy = %decision.pull_policy,
            publish = decision.publish,
            "Creating builder"
        );

        let config = BuilderConfig::from_file(&decision.config_path)?;
        gate.check_config(&config)?;

        let findings = OrderValidator::validate(&config);
        if findings.has_errors() {
            let mut unresolved: Vec<String> = Vec::new();
            for id in findings.error_subjects() {
                if !unresolved.contains(&id) {
                    unresolved.push(id);
                }
            }
            diagnostics.extend(findings);
            return Err(BuilderError::UnresolvedOrderReference { ids: unresolved });
        }
        diagnostics.extend(findings);

        let staging = staging.insert(self.staging_area()?);
        let resolver = ModuleResolver::new(
            Arc::clone(&self.client),
            Arc::clone(&self.lookup),
            decision.pull_policy,
            staging.path(),
        )
        .with_staging_tasks(tasks.clone())
        .with_retry(self.settings.retry)
        .with_concurrency(self.settings.concurrency)
        .with_registry(&decision.registry_url);

        let base = match config.base_image()? {
            Some(reference) => Some(resolver.fetch_base(&reference).await?),
            None => {
                tracing::info!("No base image configured, assembling on an empty base");
                None
            }
        };

        let modules: Vec<ModuleReference> = config.modules().cloned().collect();
        let resolved = match resolver.resolve(modules).await {
            Ok(resolved) => resolved,
            Err(ResolveFailure {
                error,
                diagnostics: found,
            }) => {
                diagnostics.extend(found);
                return Err(error);
            }
        };
        for module in &resolved {
            diagnostics.extend(module.diagnostics.clone());
        }

        let image = BuilderAssembler::new(Arc::clone(&self.client))
            .with_description(config.description.clone())
            .assemble(
                decision.image.clone(),
                base,
                resolved,
                &OrderMetadata::from_config(&config),
                &StackMetadata::from_config(&config),
            )
            .await?;

        let stored = if decision.publish {
            tracing::info!(image = %image.reference, "Publishing builder");
            self.client.push(&image).await
        } else {
            tracing::info!(image = %image.reference, "Saving builder");
            self.client.save(&image).await
        };
        let digest = stored.map_err(|source| BuilderError::Store {
            reference: decision.image.to_string(),
            source,
        })?;

        tracing::info!(image = %decision.image, digest = %digest, "Builder created");
        Ok((decision.image, digest, decision.publish))
    }

    fn staging_area(&self) -> BuilderResult<TempDir> {
        let staging = match &self.staging_root {
            Some(root) => std::fs::create_dir_all(root).and_then(|()| {
                tempfile::Builder::new().prefix("builder-").tempdir_in(root)
            }),
            None => tempfile::Builder::new().prefix("packsmith-builder-").tempdir(),
        };
        staging.map_err(|e| BuilderError::Internal {
            message: format!("creating staging area: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn cancel_token_fires() {
        let (handle, mut token) = cancel_pair();
        assert!(!token.is_cancelled());
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn never_token_stays_pending() {
        let mut token = CancelToken::never();
        let waited = tokio::time::timeout(Duration::from_secs(3600), token.cancelled()).await;
        assert!(waited.is_err());
    }
}
