//! Site Deployer CLI

use clap::{Arg, ArgAction, ArgMatches, Command};
use site_deployer::aws::{self, cleanup::Teardown, Config};
use std::{path::PathBuf, process::ExitCode};
use tracing::{error, info, warn};

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

/// Exit code reported when interrupted with Ctrl-C
const INTERRUPTED: u8 = 130;

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .help("Path to YAML config file")
        .value_parser(clap::value_parser!(PathBuf))
}

fn bucket_arg(help: &'static str) -> Arg {
    Arg::new("bucket")
        .long("bucket")
        .help(help)
        .value_parser(clap::value_parser!(String))
}

/// Loads the config named by `--config`, if any
fn load_config(matches: &ArgMatches) -> Result<Config, aws::Error> {
    Config::load(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))
}

async fn run(matches: ArgMatches) -> ExitCode {
    match matches.subcommand() {
        Some((aws::DEPLOY_CMD, matches)) => {
            let mut config = match load_config(matches) {
                Ok(config) => config,
                Err(e) => {
                    error!(error=?e, "failed to load config");
                    return ExitCode::FAILURE;
                }
            };
            if let Some(source) = matches.get_one::<PathBuf>("source") {
                config.source_dir = source.to_string_lossy().to_string();
            }
            if let Some(region) = matches.get_one::<String>("region") {
                config.region = region.clone();
            }
            let bucket = matches.get_one::<String>("bucket").cloned();
            match aws::deploy(&config, bucket).await {
                Ok(report) if report.success() => return ExitCode::SUCCESS,
                Ok(report) => error!(bucket = report.bucket.as_str(), "deployment incomplete"),
                Err(e) => error!(error=?e, "failed to deploy site"),
            }
        }
        Some((aws::CLEANUP_CMD, matches)) => {
            let config = match load_config(matches) {
                Ok(config) => config,
                Err(e) => {
                    error!(error=?e, "failed to load config");
                    return ExitCode::FAILURE;
                }
            };
            let bucket = matches.get_one::<String>("bucket").cloned();
            match aws::cleanup(&config, bucket).await {
                Ok(Teardown::Cancelled) => {
                    info!("cleanup cancelled, no resources were modified");
                    return ExitCode::SUCCESS;
                }
                Ok(Teardown::Completed(report)) if report.success() => return ExitCode::SUCCESS,
                Ok(Teardown::Completed(report)) => error!(
                    bucket = report.bucket.name.as_str(),
                    "cleanup incomplete, re-run to resume"
                ),
                Err(e) => error!(error=?e, "failed to clean up site"),
            }
        }
        Some((cmd, _)) => {
            error!(cmd, "invalid subcommand");
        }
        None => {
            error!("no subcommand provided");
        }
    }
    ExitCode::FAILURE
}

/// Entrypoint for the Site Deployer CLI
#[tokio::main]
async fn main() -> ExitCode {
    // Define application
    let matches = Command::new("site-deployer")
        .version(crate_version())
        .about("Deploy a static website to S3 behind CloudFront, and tear it down again.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new(aws::DEPLOY_CMD)
                .about("Create a website bucket, upload a local directory into it, and serve it through a new CloudFront distribution.")
                .arg(config_arg())
                .arg(bucket_arg("Name of the bucket to create (prompted for if omitted)"))
                .arg(
                    Arg::new("source")
                        .long("source")
                        .help("Directory to upload")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("region")
                        .long("region")
                        .help("Region to create the bucket in")
                        .value_parser(clap::value_parser!(String)),
                ),
        )
        .subcommand(
            Command::new(aws::CLEANUP_CMD)
                .about("Delete a website bucket, every object version in it, and the CloudFront distribution in front of it.")
                .arg(config_arg())
                .arg(bucket_arg("Name of the bucket to delete (prompted for if omitted)")),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Every step can be re-run safely, so an interrupt simply stops where we are
    tokio::select! {
        code = run(matches) => code,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, re-run the command to resume");
            ExitCode::from(INTERRUPTED)
        }
    }
}
