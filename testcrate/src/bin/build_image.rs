//! Builds an image from a directory, a lone build file, or a remote context
//! on the daemon at `CONTAINER_HOST` and prints the build log.
//!
//! With `podman system service --time=0 tcp:localhost:8888` running:
//!
//! `cargo r --bin build_image -- --path ./ctx --tag myimage:latest`

use std::path::PathBuf;

use build_orchestrator::{
    config::load_build_options, BuildError, BuildEvent, BuildLog, BuildOptions, ContextSources,
    ImageBuilder,
};
use clap::Parser;
use futures::StreamExt;
use owo_colors::OwoColorize;
use stacked_errors::{bail, Result, StackableErr};
use tokio::io::AsyncRead;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about)]
struct Args {
    /// Context directory
    #[arg(long)]
    path: Option<PathBuf>,
    /// Build from only this build file, with no other context
    #[arg(long)]
    file: Option<PathBuf>,
    /// Context URI for the daemon to fetch
    #[arg(long)]
    remote: Option<String>,
    /// Build file name relative to the context
    #[arg(long)]
    dockerfile: Option<String>,
    #[arg(short, long)]
    tag: Option<String>,
    /// `KEY=VALUE`, can be repeated
    #[arg(long = "build-arg")]
    build_args: Vec<String>,
    /// JSON file with further build options, command line flags take
    /// precedence
    #[arg(long, env = "BUILD_ORCHESTRATOR_OPTIONS")]
    options_file: Option<PathBuf>,
    #[arg(long)]
    gzip: bool,
    /// Request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

async fn options(args: &Args) -> Result<BuildOptions> {
    let mut options = match &args.options_file {
        Some(path) => load_build_options(path).await.stack()?,
        None => BuildOptions::default(),
    };
    if args.tag.is_some() {
        options.tag.clone_from(&args.tag);
    }
    if args.dockerfile.is_some() {
        options.dockerfile.clone_from(&args.dockerfile);
    }
    for arg in &args.build_args {
        let Some((key, val)) = arg.split_once('=') else {
            bail!("--build-arg \"{arg}\" is not in the KEY=VALUE format")
        };
        options.buildargs.insert(key.to_owned(), val.to_owned());
    }
    options.gzip |= args.gzip;
    if args.timeout.is_some() {
        options.timeout = args.timeout;
    }
    Ok(options)
}

async fn print_log(mut log: BuildLog) {
    while let Some(event) = log.next().await {
        match event {
            Ok(BuildEvent::Stream(text)) => print!("{text}"),
            Ok(BuildEvent::Error { message, .. }) => println!("{}", message.red()),
            Ok(BuildEvent::Other(_)) => (),
            Err(e) => {
                println!("{}", e.red());
                break
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let options = options(&args).await?;
    let fileobj: Option<Box<dyn AsyncRead + Send + Unpin>> = match &args.file {
        Some(file) => Some(Box::new(
            tokio::fs::File::open(file)
                .await
                .stack_err_with(|| format!("opening {file:?}"))?,
        )),
        None => None,
    };
    let sources = ContextSources {
        path: args.path.clone(),
        fileobj,
        remote: args.remote.clone(),
        custom_context: false,
    };

    let builder = ImageBuilder::from_env().await.stack()?;
    match builder.build_from_sources(options, sources).await {
        Ok((image, log)) => {
            print_log(log).await;
            info!("built image {} {:?}", image.short_id(), image.tags());
            println!("{}", image.id().green());
            Ok(())
        }
        Err(BuildError::Build { message, log }) => {
            print_log(log).await;
            bail!("build failed: {message}")
        }
        Err(e) => bail!("{e}"),
    }
}
