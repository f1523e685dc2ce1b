// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The `deboci` command line interface. */

use {
    anyhow::{bail, Context},
    clap::{Parser, Subcommand},
    debian_oci_builder::{
        build::{BuildRequest, ChrootRunner, ImageAssembler, PlatformBuild, PlatformSpec},
        cache::DiskCache,
        client::CachingClient,
        database::PackageDB,
        download::download_selected,
        error::BuildError,
        package::Priority,
        progress::{ConsoleProgress, NoProgress, Progress},
        recipe::Recipe,
        resolve::resolve,
        secondstage,
        source::Source,
        unpack::unpack,
    },
    futures::StreamExt,
    std::{
        collections::BTreeSet,
        path::PathBuf,
        sync::Mutex,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
    tracing_subscriber::EnvFilter,
};

#[derive(Parser)]
#[command(name = "deboci", version, about = "Reproducible Debian base images as OCI archives")]
struct Cli {
    /// Log verbosity (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Directory for the HTTP disk cache.
    #[arg(long, global = true, hide = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a Debian base system image.
    Build {
        /// Recipe file to use.
        #[arg(short = 'f', long = "filename")]
        filename: PathBuf,

        /// Output OCI image archive.
        #[arg(short, long, default_value = "debian-image.tar")]
        output: PathBuf,

        /// Target platform(s), comma separated, in `os/arch` format.
        #[arg(short, long, default_value = "linux/amd64")]
        platform: String,

        /// Name and optionally a tag in the `name:tag` format.
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Keep the scratch directory around for inspection.
        #[arg(long)]
        dev: bool,
    },

    /// Operations run inside the image after layer composition.
    #[command(subcommand, hide = true)]
    SecondStage(SecondStageCommands),
}

#[derive(Subcommand)]
enum SecondStageCommands {
    /// Merge the top-level `/bin`, `/sbin`, and `/lib*` into `/usr`.
    MergeUsr,

    /// Set up the image with the requested recipe.
    Provision {
        /// Recipe file to use.
        #[arg(short = 'f', long = "filename")]
        filename: PathBuf,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    std::process::exit(match run().await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            1
        }
    });
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_level).context("invalid log level")?,
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Build {
            filename,
            output,
            platform,
            tags,
            dev,
        } => build(cli.cache_dir, filename, output, platform, tags, dev).await,
        Commands::SecondStage(SecondStageCommands::MergeUsr) => {
            secondstage::merge_usr(std::path::Path::new("/"))?;
            Ok(())
        }
        Commands::SecondStage(SecondStageCommands::Provision { filename }) => {
            let file = std::fs::File::open(&filename)
                .with_context(|| format!("failed to open recipe {}", filename.display()))?;
            let recipe = Recipe::from_yaml(file)?;

            secondstage::provision(std::path::Path::new("/"), &recipe)?;
            Ok(())
        }
    }
}

async fn build(
    cache_dir: Option<PathBuf>,
    filename: PathBuf,
    output: PathBuf,
    platform: String,
    tags: Vec<String>,
    dev: bool,
) -> anyhow::Result<()> {
    let cache_dir = match cache_dir {
        Some(dir) => dir,
        None => dirs::cache_dir()
            .context("no cache directory available")?
            .join("deboci"),
    };
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("failed to create cache directory {}", cache_dir.display()))?;

    let client = CachingClient::new(DiskCache::new(&cache_dir)?)?;

    let recipe_file = std::fs::File::open(&filename)
        .with_context(|| format!("failed to open recipe {}", filename.display()))?;
    let recipe = Recipe::from_yaml(recipe_file)?;

    if recipe.sources.is_empty() {
        bail!("recipe lists no sources");
    }

    let platforms = platform
        .split(',')
        .map(PlatformSpec::parse)
        .collect::<Result<Vec<_>, _>>()?;

    // Scratch for downloads, unpack output, and rootfs staging. The
    // guard lives until the end of the build unless --dev keeps it.
    let mut _scratch_guard = None;
    let scratch_path = {
        let scratch = tempfile::Builder::new().prefix("deboci-").tempdir()?;

        if dev {
            let kept = scratch.into_path();
            info!(scratch = %kept.display(), "development mode; keeping scratch directory");
            kept
        } else {
            let path = scratch.path().to_path_buf();
            _scratch_guard = Some(scratch);
            path
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; cancelling");
                cancel.cancel();
            }
        });
    }

    let progress: Box<dyn Progress> = if tracing::enabled!(tracing::Level::DEBUG) {
        Box::new(NoProgress)
    } else {
        Box::new(ConsoleProgress::new())
    };

    let mut source_date_epoch: u64 = 0;
    let mut platform_builds = Vec::new();

    for platform_spec in &platforms {
        info!(platform = %platform_spec, "building image");

        let debian_arch = platform_spec.debian_architecture()?;

        info!("loading package universe");
        let (universe, epoch) =
            load_universe(&client, &recipe, &debian_arch, progress.as_ref()).await?;

        source_date_epoch = source_date_epoch.max(epoch);

        let mut include = BTreeSet::new();

        if !recipe.options.omit_required {
            for pkg in universe.iter() {
                if pkg.priority() == Priority::Required {
                    include.insert(pkg.name().to_string());
                }
            }
        }
        include.extend(recipe.packages.include.iter().cloned());

        info!(seeds = include.len(), "resolving selected packages");
        let selection = resolve(
            &universe,
            &debian_arch,
            &include.into_iter().collect::<Vec<_>>(),
            &recipe.packages.exclude,
        )?;
        info!(selected = selection.db.len(), "resolved selection");

        let platform_scratch = scratch_path.join(platform_spec.scratch_name());
        std::fs::create_dir_all(&platform_scratch)?;

        info!("downloading selected packages");
        let archives = download_selected(
            &client,
            &platform_scratch,
            &selection.db,
            0,
            progress.as_ref(),
            &cancel,
        )
        .await?;

        info!("unpacking packages");
        let unpacked = unpack(
            &platform_scratch,
            &archives,
            epoch,
            progress.as_ref(),
            &cancel,
        )
        .await?;

        platform_builds.push(PlatformBuild {
            platform: platform_spec.clone(),
            data_archives: unpacked.data_archives_in_order(&selection.install_order),
            dpkg_database_archive: unpacked.dpkg_database_archive.clone(),
            configure_order: selection.configure_order.clone(),
            scratch: platform_scratch,
        });
    }

    // The environment override wins over the computed epoch.
    if let Ok(value) = std::env::var("SOURCE_DATE_EPOCH") {
        source_date_epoch = value
            .parse()
            .context("SOURCE_DATE_EPOCH is not an integer")?;
    }

    let request = BuildRequest {
        output: output.clone(),
        tags,
        download_only: recipe.options.download_only,
        source_date_epoch,
        container: recipe.container_config(),
        recipe_path: filename,
        second_stage_binary: std::env::current_exe()?,
        platforms: platform_builds,
    };

    info!(output = %output.display(), "building multi-platform image");

    tokio::task::spawn_blocking(move || {
        let runner = ChrootRunner;
        ImageAssembler::new(&runner).build(&request)
    })
    .await??;

    Ok(())
}

/// Fetch all sources in parallel and merge their packages into one
/// universe for the target architecture.
async fn load_universe(
    client: &CachingClient,
    recipe: &Recipe,
    architecture: &str,
    progress: &dyn Progress,
) -> anyhow::Result<(PackageDB, u64)> {
    let bar = progress.start("Source", recipe.sources.len() as u64);

    let mut source_stream = futures::stream::iter(recipe.sources.iter().map(|config| {
        let client = client.clone();
        let config = config.clone();

        async move {
            let source = Source::new(client, config).await?;
            source.components(architecture).await
        }
    }))
    .buffer_unordered(4);

    let mut components = Vec::new();

    while let Some(result) = source_stream.next().await {
        components.extend(result?);
        progress.tick(bar);
    }
    progress.finish(bar);

    let mut epoch: u64 = 0;
    for component in &components {
        epoch = epoch.max(component.last_updated.timestamp().max(0) as u64);
    }

    let bar = progress.start("Repository", components.len() as u64);

    let universe = Mutex::new(PackageDB::new());

    {
        let mut component_stream = futures::stream::iter(components.iter().map(|component| {
            let universe = &universe;

            async move {
                let packages = component.packages().await?;

                universe
                    .lock()
                    .expect("universe lock")
                    .add_all(packages)?;

                Ok::<_, BuildError>(())
            }
        }))
        .buffer_unordered(4);

        while let Some(result) = component_stream.next().await {
            result?;
            progress.tick(bar);
        }
    }
    progress.finish(bar);

    let universe = universe.into_inner().expect("universe lock");

    debug!(packages = universe.len(), architecture, "universe loaded");

    Ok((universe, epoch))
}
