use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use sizeinfo_service::config::Config;
use tracing::level_filters::LevelFilter;
use url::Url;

/// The name of the configuration file.
pub const CONFIG_RC_FILE_NAME: &str = ".sizeinforc";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Outputs the normalized records as JSON.
    Json,
    /// Outputs the details of every record, followed by its size table.
    Pretty,
    /// Outputs only the size tables.
    Compact,
}

/// Looks up size and fit metadata of garments.
///
/// The brand can be passed with the `--brand` option or put in `~/.sizeinforc`.
/// The output format can be controlled with the `--format` option.
#[derive(Clone, Parser, Debug)]
#[command(author, version, about, long_about)]
struct Cli {
    /// Path to the configuration file of the size info service.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// The size-metadata endpoint to query.
    ///
    /// Overrides the endpoint of the configuration file.
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// The brand of garments given without one.
    #[arg(long, short, global = true)]
    brand: Option<String>,

    /// The upper limit for a whole request, like `10s`.
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// The output format.
    #[arg(long, global = true, value_enum, default_value = "pretty")]
    format: OutputFormat,

    /// The severity level of logging output.
    ///
    /// Possible values:
    /// off, error, warn, info, debug, trace
    #[arg(long, global = true)]
    log_level: Option<LevelFilter>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Looks up the size info of one garment.
    Lookup {
        /// The garment id, optionally prefixed with its brand as `BRAND:GARMENT_ID`.
        garment: String,

        /// Bypass the cache and always query the endpoint.
        #[arg(long)]
        refresh: bool,
    },
    /// Looks up the size info of several garments concurrently.
    Preload {
        /// The garment ids, optionally prefixed with their brand as `BRAND:GARMENT_ID`.
        #[arg(required = true)]
        garments: Vec<String>,

        /// Print the request statistics afterwards.
        #[arg(long)]
        status: bool,
    },
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    pub endpoint: Option<String>,
    pub brand: Option<String>,
}

impl ConfigFile {
    pub fn parse(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(buf) => toml::from_str(&buf).context("Could not parse configuration file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Configuration file not found");
                Ok(Self::default())
            }
            Err(e) => Err(e).context(format!(
                "Could not read configuration file at {}",
                path.display()
            )),
        }
    }
}

/// A garment to look up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Garment {
    pub garment_id: String,
    pub brand: String,
}

#[derive(Clone, Debug)]
pub enum Action {
    Lookup { garment: Garment, refresh: bool },
    Preload { garments: Vec<Garment>, status: bool },
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub config: Config,
    pub output_format: OutputFormat,
    pub action: Action,
}

impl Settings {
    pub fn get() -> Result<Self> {
        let cli = Cli::parse();

        let mut config = Config::get(cli.config.as_deref()).context("failed loading config")?;

        let global_config_path = find_global_config_file()?;
        let mut global_config_file = ConfigFile::parse(&global_config_path)?;
        let mut project_config_file = match find_project_config_file() {
            Some(path) if path != global_config_path => ConfigFile::parse(&path)?,
            _ => ConfigFile::default(),
        };

        let endpoint = cli
            .endpoint
            .or_else(|| project_config_file.endpoint.take())
            .or_else(|| global_config_file.endpoint.take());
        if let Some(endpoint) = endpoint {
            config.endpoint = Url::parse(&endpoint).context("Invalid endpoint URL")?;
        }
        if let Some(timeout) = cli.timeout {
            config.max_download_timeout = Some(timeout);
        }
        if let Some(level) = cli.log_level {
            config.logging.level = level;
        }

        let brand = cli
            .brand
            .or_else(|| project_config_file.brand.take())
            .or_else(|| global_config_file.brand.take());

        let action = match cli.command {
            Command::Lookup { garment, refresh } => Action::Lookup {
                garment: parse_garment(&garment, brand.as_deref())?,
                refresh,
            },
            Command::Preload { garments, status } => Action::Preload {
                garments: garments
                    .iter()
                    .map(|garment| parse_garment(garment, brand.as_deref()))
                    .collect::<Result<_>>()?,
                status,
            },
        };

        Ok(Settings {
            config,
            output_format: cli.format,
            action,
        })
    }
}

/// Parses `BRAND:GARMENT_ID`, or a plain garment id of the default brand.
fn parse_garment(garment: &str, default_brand: Option<&str>) -> Result<Garment> {
    let (brand, garment_id) = match garment.split_once(':') {
        Some((brand, garment_id)) => (brand, garment_id),
        None => match default_brand {
            Some(brand) => (brand, garment),
            None => bail!(
                "No brand provided for `{garment}`. Pass it either as `BRAND:{garment}`, via the `--brand` option or put it in {CONFIG_RC_FILE_NAME}."
            ),
        },
    };

    if brand.is_empty() || garment_id.is_empty() {
        bail!("Invalid garment `{garment}`");
    }

    Ok(Garment {
        garment_id: garment_id.to_owned(),
        brand: brand.to_owned(),
    })
}

fn find_global_config_file() -> Result<PathBuf> {
    dirs::home_dir()
        .ok_or_else(|| anyhow!("Could not find home dir"))
        .map(|mut path| {
            path.push(CONFIG_RC_FILE_NAME);
            path
        })
}

fn find_project_config_file() -> Option<PathBuf> {
    std::env::current_dir().ok().and_then(|mut path| {
        loop {
            path.push(CONFIG_RC_FILE_NAME);
            if path.exists() {
                return Some(path);
            }
            path.pop();
            if !path.pop() {
                return None;
            }
        }
    })
}
