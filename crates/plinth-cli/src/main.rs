//! `plinth` CLI: renders per-host boot configuration from a cluster
//! specification.
//!
//! Rendered documents go to stdout; structured JSON logs go to stderr. The
//! secret snapshot in the data directory is created on first use and updated
//! whenever a render issues new secrets.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use plinth_core::{ClusterSpec, Details, RenderError, Renderer, SecretStore, SigningPolicy};
use plinth_storage::FileBackend;

use crate::config::{CliConfig, Overrides};

/// Exit code for a missing host, cluster, template or certificate request.
const EXIT_NOT_FOUND: u8 = 2;

// ── CLI structure ────────────────────────────────────────────────────

/// plinth renders host configs, static pods and cluster addons, issuing
/// certificates and secrets on demand.
#[derive(Parser)]
#[command(
    name = "plinth",
    version,
    about = "plinth: render host configs and cluster addons with an embedded CA",
    long_about = None,
    after_help = "Environment variables:\n  \
        PLINTH_SPEC                   Cluster specification (default: ./clusters.yaml)\n  \
        PLINTH_DATA_DIR               Data directory (default: ./data)\n  \
        PLINTH_TEMPLATE_DETAILS_DIR   Record template executions here\n  \
        PLINTH_LOG_LEVEL              Log filter (default: info)"
)]
struct Cli {
    /// Cluster specification YAML.
    #[arg(long, global = true)]
    spec: Option<PathBuf>,

    /// Data directory holding the secret snapshot.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Record every template execution under this directory.
    #[arg(long, global = true)]
    template_details_dir: Option<PathBuf>,

    /// Log filter (overridden by `RUST_LOG`).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render the config of a host.
    Config {
        /// Host name.
        host: String,
    },
    /// Render the static-pods document of a host.
    StaticPods {
        /// Host name.
        host: String,
    },
    /// Print the fingerprint of a host's config and render context.
    Tag {
        /// Host name.
        host: String,
    },
    /// Print the composed render context of a host.
    Context {
        /// Host name.
        host: String,
    },
    /// Render the addons of a cluster.
    Addons {
        /// Cluster name.
        cluster: String,
    },
    /// Render the bootstrap pods of a cluster.
    BootstrapPods {
        /// Cluster name.
        cluster: String,
    },
    /// Cluster password operations.
    Password {
        #[command(subcommand)]
        action: PasswordCommands,
    },
}

#[derive(Subcommand)]
enum PasswordCommands {
    /// Set a cluster password.
    Set {
        /// Cluster name.
        cluster: String,
        /// Password name.
        name: String,
        /// Password value.
        value: String,
    },
    /// List the password names of a cluster.
    List {
        /// Cluster name.
        cluster: String,
    },
}

// ── Bootstrap ────────────────────────────────────────────────────────

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();
}

async fn open(config: &CliConfig) -> Result<(Renderer, Arc<SecretStore>)> {
    let spec = ClusterSpec::from_file(&config.spec_path).with_context(|| {
        format!(
            "failed to load cluster specification {}",
            config.spec_path.display()
        )
    })?;
    let policy = SigningPolicy::parse(&spec.ssl_config).context("invalid ssl_config")?;

    let backend = Arc::new(FileBackend::in_dir(&config.data_dir));
    let store = Arc::new(
        SecretStore::load(policy, backend)
            .await
            .with_context(|| format!("failed to load secrets from {}", config.data_dir.display()))?,
    );

    let mut renderer = Renderer::new(Arc::new(spec), Arc::clone(&store));
    if let Some(dir) = &config.template_details_dir {
        renderer = renderer.with_details(Details::new(dir));
    }

    info!(
        spec = %config.spec_path.display(),
        data_dir = %config.data_dir.display(),
        "plinth ready"
    );
    Ok((renderer, store))
}

// ── Command dispatch ─────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = CliConfig::from_env().with_overrides(Overrides {
        spec_path: cli.spec,
        data_dir: cli.data_dir,
        template_details_dir: cli.template_details_dir,
        log_level: cli.log_level,
    });
    init_logging(&config.log_level);

    match run(&config, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let not_found = e
                .downcast_ref::<RenderError>()
                .is_some_and(RenderError::is_not_found);
            if not_found {
                ExitCode::from(EXIT_NOT_FOUND)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(config: &CliConfig, command: Commands) -> Result<()> {
    let (renderer, store) = open(config).await?;

    match command {
        Commands::Config { host } => {
            let rendered = renderer
                .config(&host)
                .await
                .with_context(|| format!("failed to render config of {host}"))?;
            print!("{}", rendered.raw);
        }
        Commands::StaticPods { host } => {
            let out = renderer
                .static_pods(&host)
                .await
                .with_context(|| format!("failed to render static pods of {host}"))?;
            print!("{out}");
        }
        Commands::Tag { host } => {
            let tag = renderer
                .tag(&host)
                .await
                .with_context(|| format!("failed to compute tag of {host}"))?;
            println!("{tag}");
        }
        Commands::Context { host } => {
            let context = renderer
                .context(&host)
                .with_context(|| format!("failed to compose context of {host}"))?;
            let yaml = serde_yaml::to_string(&context).context("failed to serialize context")?;
            print!("{yaml}");
        }
        Commands::Addons { cluster } => {
            let out = renderer
                .addons(&cluster)
                .await
                .with_context(|| format!("failed to render addons of {cluster}"))?;
            print!("{out}");
        }
        Commands::BootstrapPods { cluster } => {
            let out = renderer
                .bootstrap_pods(&cluster)
                .await
                .with_context(|| format!("failed to render bootstrap pods of {cluster}"))?;
            print!("{out}");
        }
        Commands::Password { action } => password(&store, action).await?,
    }
    Ok(())
}

async fn password(store: &SecretStore, action: PasswordCommands) -> Result<()> {
    match action {
        PasswordCommands::Set {
            cluster,
            name,
            value,
        } => {
            store
                .set_password(&cluster, &name, &value)
                .context("failed to set password")?;
            store.save().await.context("failed to save secrets")?;
            println!("password {name} set for cluster {cluster}");
        }
        PasswordCommands::List { cluster } => {
            for name in store
                .password_names(&cluster)
                .context("failed to list passwords")?
            {
                println!("{name}");
            }
        }
    }
    Ok(())
}
