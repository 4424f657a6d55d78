//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Report, Result};
use console::Style;
use packsmith_common::PackPaths;
use packsmith_image::RegistryAuth;

use crate::client::{RegistryIndex, StoreClient};
use crate::diagnostics::{Finding, Severity};
use crate::pipeline::{BuilderCreator, cancel_pair};
use crate::policy::CreateFlags;
use crate::settings::Settings;

/// packsmith - buildpack builder images
#[derive(Parser)]
#[command(name = "packsmith")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for packsmith data
    #[arg(long, global = true, env = "PACKSMITH_ROOT")]
    pub root: Option<PathBuf>,

    /// Enable experimental features
    #[arg(long, global = true)]
    pub experimental: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Manage builders
    #[command(subcommand)]
    Builder(BuilderCommands),
}

/// `builder` subcommands.
#[derive(Subcommand)]
pub enum BuilderCommands {
    /// Create a builder image
    Create {
        /// Builder image name
        image_name: String,

        /// Path to the builder configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Publish to the registry instead of the local store
        #[arg(long)]
        publish: bool,

        /// Pull policy: always, never or if-not-present
        #[arg(long)]
        pull_policy: Option<String>,

        /// Buildpack registry name or index URL
        #[arg(short = 'R', long)]
        buildpack_registry: Option<String>,
    },
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let paths = self
            .root
            .clone()
            .map_or_else(PackPaths::new, PackPaths::with_root);
        let mut settings = Settings::load(&PackPaths::settings_file())?;
        settings.experimental |= self.experimental;
        settings.color &= !self.no_color;

        match self.command {
            Commands::Builder(BuilderCommands::Create {
                image_name,
                config,
                publish,
                pull_policy,
                buildpack_registry,
            }) => {
                let flags = CreateFlags {
                    image_name,
                    config_path: config,
                    publish,
                    pull_policy,
                    registry: buildpack_registry,
                };
                create(&paths, settings, &flags).await
            }
        }
    }
}

async fn create(paths: &PackPaths, settings: Settings, flags: &CreateFlags) -> Result<()> {
    paths.create_dirs()?;
    let client = StoreClient::open(&paths.store())?.with_auth(credentials());
    let lookup = RegistryIndex::new(reqwest::Client::new());
    let color = settings.color;
    let creator = BuilderCreator::new(Arc::new(client), Arc::new(lookup), settings)
        .with_staging_root(paths.staging());

    let (handle, token) = cancel_pair();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });
    let result = creator.create_with_cancel(flags, token).await;
    interrupt.abort();

    match result {
        Ok(outcome) => {
            print_findings(&outcome.diagnostics, color);
            let success = styled(Style::new().green().bold(), color);
            let verb = if outcome.published { "published" } else { "created" };
            println!(
                "{} builder image {}",
                success.apply_to(format!("Successfully {verb}")),
                outcome.image
            );
            println!("Digest: {}", outcome.digest);
            Ok(())
        }
        Err(failure) => {
            print_findings(&failure.diagnostics, color);
            Err(Report::new(failure.error))
        }
    }
}

fn print_findings(findings: &[Finding], color: bool) {
    let warning = styled(Style::new().yellow().bold(), color);
    let error = styled(Style::new().red().bold(), color);
    for finding in findings {
        let style = match finding.severity {
            Severity::Warning => &warning,
            Severity::Error => &error,
        };
        println!(
            "{} {}",
            style.apply_to(format!("{}:", finding.severity)),
            finding.message
        );
    }
}

fn styled(style: Style, color: bool) -> Style {
    if color { style } else { style.force_styling(false) }
}

/// Registry credentials from `PACKSMITH_REGISTRY_USERNAME` and
/// `PACKSMITH_REGISTRY_PASSWORD`.
fn credentials() -> Option<RegistryAuth> {
    let username = std::env::var("PACKSMITH_REGISTRY_USERNAME").ok()?;
    let password = std::env::var("PACKSMITH_REGISTRY_PASSWORD").ok()?;
    Some(RegistryAuth { username, password })
}
