//! Catalog index CLI
//!
//! Commands for building index images and managing local catalog stores.

use std::path::PathBuf;

use anyhow::{bail, Context};
use catalog_index::bundle::build::{BundleBuildRequest, BundleBuilder};
use catalog_index::config::CatalogConfig;
use catalog_index::index::{
    AddToIndexRequest, CliImageEngine, ContainerTool, Credentials, DeleteFromIndexRequest,
    ExportFromIndexRequest, ImageEngine, IndexAdder, IndexDeleter, IndexExporter, RenderOutcome,
};
use catalog_index::{DirectoryLoader, GraphStore, MergeEngine, RemoveMode};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "catalog-index")]
#[command(about = "Bundle catalog graphs, stored in SQLite and shipped as index images")]
struct Cli {
    /// Config file layered over catalog.toml and the environment
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at info level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and edit index images
    #[command(subcommand)]
    Index(IndexCommand),

    /// Work on a local store file
    #[command(subcommand)]
    Registry(RegistryCommand),

    /// Build bundle images
    #[command(subcommand)]
    Bundle(BundleCommand),

    /// Log the container tool in to a registry (password read from stdin)
    Login {
        registry: String,
        #[arg(short, long)]
        username: String,
        #[arg(long)]
        container_tool: Option<ContainerTool>,
    },
}

#[derive(Args)]
struct ImageArgs {
    /// Tag of the image to produce
    #[arg(short, long)]
    tag: String,

    /// Registry-serving base image
    #[arg(long)]
    binary_image: Option<String>,

    /// Write the database and Dockerfile instead of building
    #[arg(short, long)]
    generate: bool,

    /// Dockerfile path for --generate
    #[arg(short = 'd', long)]
    out_dockerfile: Option<PathBuf>,

    #[arg(long)]
    container_tool: Option<ContainerTool>,
}

#[derive(Subcommand)]
enum IndexCommand {
    /// Add bundle images to an index
    Add {
        /// Bundle images, comma separated
        #[arg(short, long, value_delimiter = ',', required = true)]
        bundles: Vec<String>,

        /// Index to build on
        #[arg(short, long)]
        from_index: Option<String>,

        #[command(flatten)]
        image: ImageArgs,

        /// Downgrade dangling replaces and head conflicts to warnings
        #[arg(long)]
        permissive: bool,

        /// Replace stored bundles whose content changed
        #[arg(long)]
        overwrite: bool,
    },

    /// Export one package of an index as manifest directories
    Export {
        #[arg(short, long)]
        index: String,

        #[arg(short = 'o', long)]
        package: String,

        #[arg(short, long, default_value = "downloaded")]
        download_folder: PathBuf,

        #[arg(long)]
        container_tool: Option<ContainerTool>,

        /// Leave out bundles the next kept bundle can skip
        #[arg(long)]
        minimal: bool,
    },

    /// Remove whole packages from an index
    Rm {
        #[arg(short, long)]
        from_index: String,

        /// Packages, comma separated
        #[arg(short, long, value_delimiter = ',', required = true)]
        operators: Vec<String>,

        #[command(flatten)]
        image: ImageArgs,
    },
}

#[derive(Subcommand)]
enum RegistryCommand {
    /// Bring a store's schema up to date
    Migrate {
        /// Clear a failed migration, pinning this version
        #[arg(long)]
        force: Option<u32>,
    },

    /// Show schema version and contents
    Status,

    /// Populate the store from a manifest directory
    Load {
        directory: PathBuf,
        #[arg(long)]
        permissive: bool,
    },

    /// Print channel heads
    Heads {
        /// Only this package
        package: Option<String>,
    },

    /// Remove one bundle
    Rm {
        package: String,
        bundle: String,
        /// Re-point bundles that replace it instead of refusing
        #[arg(long)]
        rewire: bool,
    },

    /// Hard-delete soft-deleted bundles
    Prune {
        /// Packages to purge; all when omitted
        packages: Vec<String>,
    },
}

#[derive(Subcommand)]
enum BundleCommand {
    /// Write annotations and bundle.Dockerfile, then build
    Build {
        /// Bundle directory holding manifests/
        #[arg(short, long)]
        directory: PathBuf,

        #[arg(short, long)]
        tag: String,

        #[arg(short, long)]
        package: String,

        /// Channels, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        channels: Vec<String>,

        #[arg(short = 'e', long)]
        default: Option<String>,

        #[arg(long)]
        overwrite: bool,

        #[arg(long)]
        container_tool: Option<ContainerTool>,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = CatalogConfig::load_from(cli.config.as_deref()).context("loading configuration")?;
    let engine_for = |tool: Option<ContainerTool>| CliImageEngine::new(tool.unwrap_or(config.index.container_tool));

    match cli.command {
        Commands::Index(IndexCommand::Add {
            bundles,
            from_index,
            image,
            permissive,
            overwrite,
        }) => {
            let engine = engine_for(image.container_tool);
            let request = AddToIndexRequest {
                generate: image.generate,
                from_index,
                binary_source_image: Some(image.binary_image.unwrap_or_else(|| config.index.binary_source_image.clone())),
                out_dockerfile: image.out_dockerfile.or_else(|| config.index.out_dockerfile.clone()),
                tag: image.tag,
                bundles,
                permissive: permissive || config.merge.permissive,
                overwrite: overwrite || config.merge.overwrite,
                database_path: Some(config.index.database_path.clone()),
            };
            let result = IndexAdder::new(&engine, config.cancellation()).add_to_index(&request)?;
            for warning in &result.report.warnings() {
                println!("⚠️  {}", warning);
            }
            print_outcome(&result.outcome);
            Ok(())
        }

        Commands::Index(IndexCommand::Export {
            index,
            package,
            download_folder,
            container_tool,
            minimal,
        }) => {
            let request = ExportFromIndexRequest {
                index,
                package,
                download_path: download_folder,
                container_tool: container_tool.unwrap_or(config.index.container_tool),
                minimal: minimal || config.export.minimal,
            };
            let engine = request.engine();
            let summary = IndexExporter::new(&engine, config.cancellation()).export_from_index(&request)?;
            println!(
                "✅ Exported {} bundles of {} to {:?}",
                summary.bundles.len(),
                summary.package,
                request.download_path
            );
            for (channel, head) in &summary.heads {
                println!("  {} → {}", channel, head);
            }
            Ok(())
        }

        Commands::Index(IndexCommand::Rm {
            from_index,
            operators,
            image,
        }) => {
            let engine = engine_for(image.container_tool);
            let request = DeleteFromIndexRequest {
                from_index,
                packages: operators,
                tag: image.tag,
                generate: image.generate,
                binary_source_image: Some(image.binary_image.unwrap_or_else(|| config.index.binary_source_image.clone())),
                out_dockerfile: image.out_dockerfile.or_else(|| config.index.out_dockerfile.clone()),
                database_path: Some(config.index.database_path.clone()),
            };
            let outcome = IndexDeleter::new(&engine, config.cancellation()).delete_from_index(&request)?;
            print_outcome(&outcome);
            Ok(())
        }

        Commands::Registry(command) => run_registry(&config, command),

        Commands::Bundle(BundleCommand::Build {
            directory,
            tag,
            package,
            channels,
            default,
            overwrite,
            container_tool,
        }) => {
            let engine = engine_for(container_tool);
            let request = BundleBuildRequest {
                manifest_dir: directory,
                tag,
                package,
                channels,
                default_channel: default,
                overwrite,
            };
            let dockerfile = BundleBuilder::new(&engine).build(&request, &config.cancellation())?;
            println!("✅ Built {} from {:?}", request.tag, dockerfile);
            Ok(())
        }

        Commands::Login {
            registry,
            username,
            container_tool,
        } => {
            let mut password = String::new();
            std::io::stdin()
                .read_line(&mut password)
                .context("reading password from stdin")?;
            let credentials = Credentials {
                username,
                password: password.trim_end().to_string(),
            };
            engine_for(container_tool).login(&registry, &credentials)?;
            println!("✅ Logged in to {}", registry);
            Ok(())
        }
    }
}

fn run_registry(config: &CatalogConfig, command: RegistryCommand) -> anyhow::Result<()> {
    let path = config.store_path();
    match command {
        RegistryCommand::Migrate { force } => {
            if let Some(version) = force {
                GraphStore::force(&path, version)?;
                println!("✅ Forced {:?} to schema version {}", path, version);
            }
            GraphStore::open(&path)?.close()?;
            let status = GraphStore::status(&path)?;
            println!("✅ {:?} at schema version {}", path, status.current);
            Ok(())
        }

        RegistryCommand::Status => {
            if !path.exists() {
                bail!("no store at {:?}", path);
            }
            let status = GraphStore::status(&path)?;
            println!("📦 Store: {:?}", path);
            println!("🔢 Schema: {} of {}{}", status.current, status.latest, if status.dirty { " (dirty)" } else { "" });
            if !status.pending.is_empty() {
                println!("⏳ Pending migrations: {:?}", status.pending);
            }
            if status.is_current() {
                let store = GraphStore::open(&path)?;
                println!("🔁 Generation: {}", store.generation()?);
                for package in store.list_packages()? {
                    let bundles = store.list_bundles(&package, false)?.len();
                    let channels = store.list_channels(&package)?.len();
                    println!("  {} ({} bundles, {} channels)", package, bundles, channels);
                }
            }
            Ok(())
        }

        RegistryCommand::Load { directory, permissive } => {
            let mut options = config.merge_options();
            options.permissive |= permissive;
            let mut store = GraphStore::open(&path)?;
            let report = DirectoryLoader::new(&directory, options).populate(&mut store)?;
            for warning in &report.warnings() {
                println!("⚠️  {}", warning);
            }
            for package in &report.packages {
                println!(
                    "✅ {}: {} added, {} unchanged, {} rejected",
                    package.package,
                    package.added.len(),
                    package.unchanged.len(),
                    package.rejected.len()
                );
            }
            store.close()?;
            Ok(())
        }

        RegistryCommand::Heads { package } => {
            let store = GraphStore::open(&path)?;
            let packages = match package {
                Some(p) => vec![p],
                None => store.list_packages()?,
            };
            for package in packages {
                let default = store.default_channel(&package)?;
                for channel in store.list_channels(&package)? {
                    let marker = if default.as_deref() == Some(channel.as_str()) { " (default)" } else { "" };
                    match store.get_head(&package, &channel)? {
                        Some(head) => println!("{}/{}{} → {} {}", package, channel, marker, head.node.name, head.node.version),
                        None => println!("{}/{}{} → (no head)", package, channel, marker),
                    }
                }
            }
            Ok(())
        }

        RegistryCommand::Rm { package, bundle, rewire } => {
            let mode = if rewire { RemoveMode::Rewire } else { RemoveMode::Strict };
            let mut store = GraphStore::open(&path)?;
            let report = MergeEngine::new(&mut store, config.merge_options()).remove_bundle(&package, &bundle, mode)?;
            println!("✅ Removed {}; pruned {:?}", bundle, report.pruned);
            for (channel, head) in &report.heads {
                println!("  {} → {}", channel, head);
            }
            store.close()?;
            Ok(())
        }

        RegistryCommand::Prune { packages } => {
            let mut store = GraphStore::open(&path)?;
            let purged = MergeEngine::new(&mut store, config.merge_options()).purge_pruned(&packages)?;
            println!("🧹 Purged {} soft-deleted bundles", purged);
            store.close()?;
            Ok(())
        }
    }
}

fn print_outcome(outcome: &RenderOutcome) {
    match outcome {
        RenderOutcome::Built { tag, digest } => println!("✅ Built {} ({})", tag, digest),
        RenderOutcome::Generated {
            dockerfile,
            database,
            digest,
        } => println!("📝 Wrote {:?} and {:?} ({})", dockerfile, database, digest),
    }
}
