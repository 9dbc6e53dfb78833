// src/config.rs
use crate::rebuild::FailurePolicy;
use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SITE_DIR: &str = "public";
const DEFAULT_WEB_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// The Antora invocation used when no build command is configured.
pub fn default_build_command() -> Vec<String> {
    ["npx", "antora", "--playbook", "local-antora-playbook.yml"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Command-line arguments for the application.
#[derive(Parser, Debug, Default)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Build command, split on whitespace (e.g. "npx antora site.yml")
    #[clap(
        short,
        long,
        value_parser,
        help = "Build command, split on whitespace (e.g. \"npx antora site.yml\")"
    )]
    pub build: Option<String>,

    /// Directory holding the generated site
    #[clap(short, long, value_parser, help = "Directory holding the generated site")]
    pub site_dir: Option<PathBuf>,

    /// HTTP address for the site and reload hub (e.g., "127.0.0.1:3000")
    #[clap(
        short,
        long,
        value_parser,
        help = "HTTP address for the site and reload hub (e.g., \"127.0.0.1:3000\")"
    )]
    pub webaddr: Option<String>,

    /// Do not serve the site or push reloads
    #[clap(long, help = "Do not serve the site or push reloads")]
    pub no_serve: bool,

    /// Debounce window for file events, in milliseconds
    #[clap(long, value_parser, help = "Debounce window for file events, in milliseconds")]
    pub debounce_ms: Option<u64>,

    /// Also rebuild on changes to dotfiles and dot-directories
    #[clap(long, help = "Also rebuild on changes to dotfiles and dot-directories")]
    pub include_dotfiles: bool,

    /// What to do when a build fails
    #[clap(long, value_enum, help = "What to do when a build fails")]
    pub on_build_error: Option<FailurePolicy>,

    /// Path to a configuration file (e.g., sitewatch.toml)
    #[clap(
        short,
        long,
        value_parser,
        help = "Path to a configuration file (e.g., sitewatch.toml)"
    )]
    pub config: Option<PathBuf>,

    /// Files or directories to watch
    #[clap(help = "Files or directories to watch")]
    pub paths: Vec<String>,

    /// Log level (e.g., trace, debug, info, warn, error)
    #[clap(
        long,
        value_parser,
        help = "Log level (e.g., trace, debug, info, warn, error)"
    )]
    pub log_level: Option<String>,
}

/// Configuration loaded from file, environment, or defaults.
#[derive(Deserialize, Serialize, Debug, Default)]
pub struct FileConfig {
    /// Paths to watch
    pub paths: Option<Vec<String>>,
    /// Build command as program followed by arguments
    pub build: Option<Vec<String>>,
    /// Generated site directory
    pub site_dir: Option<PathBuf>,
    /// Web address
    pub webaddr: Option<String>,
    /// Serve the site and push reloads
    pub serve: Option<bool>,
    /// Debounce window in milliseconds
    pub debounce_ms: Option<u64>,
    /// Ignore dotfiles
    pub ignore_dotfiles: Option<bool>,
    /// Build failure policy
    pub on_build_error: Option<FailurePolicy>,
    /// Log level
    pub log_level: Option<String>,
}

/// Final application configuration after merging all sources.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Files or directories to watch
    pub watch_paths: Vec<String>,
    /// Build command, program first
    pub build_command: Vec<String>,
    /// Root of the generated site
    pub site_dir: PathBuf,
    /// HTTP address for the site and reload hub
    pub web_addr: String,
    /// Whether to run the web server
    pub serve: bool,
    /// Debounce window for file events
    pub debounce: Duration,
    /// Whether to drop changes under dot-segments
    pub ignore_dotfiles: bool,
    /// What to do when a build fails
    pub on_build_error: FailurePolicy,
    /// Log level
    pub log_level: String,
}

impl AppConfig {
    /// Loads the application configuration from the process arguments.
    pub fn load() -> Result<Self, figment::Error> {
        Self::from_args(CliArgs::parse())
    }

    /// Merges defaults, config file, environment, and the given CLI arguments.
    ///
    /// Precedence, lowest first: defaults, `sitewatch.toml` (the `[sitewatch]`
    /// table), `SITEWATCH_*` variables, command-line flags.
    pub fn from_args(cli_args: CliArgs) -> Result<Self, figment::Error> {
        let config_file_path = cli_args
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from("sitewatch.toml"));

        let default_log_level =
            std::env::var("SITEWATCH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let fig = Figment::new()
            .merge(Serialized::defaults(FileConfig {
                paths: Some(vec![]),
                build: Some(default_build_command()),
                site_dir: Some(PathBuf::from(DEFAULT_SITE_DIR)),
                webaddr: Some(DEFAULT_WEB_ADDR.to_string()),
                serve: Some(true),
                debounce_ms: Some(DEFAULT_DEBOUNCE_MS),
                ignore_dotfiles: Some(true),
                on_build_error: Some(FailurePolicy::Continue),
                log_level: Some(default_log_level.clone()),
            }))
            .merge(Toml::file(config_file_path).nested())
            .merge(Env::prefixed("SITEWATCH_").map(|key| key.as_str().replace("__", ".").into()));

        let mut merged_config: FileConfig = fig.select("sitewatch").extract()?;

        // CLI wins over everything that was set
        if let Some(cli_build) = cli_args.build {
            merged_config.build = Some(cli_build.split_whitespace().map(String::from).collect());
        }
        if let Some(cli_sd) = cli_args.site_dir {
            merged_config.site_dir = Some(cli_sd);
        }
        if let Some(cli_wa) = cli_args.webaddr {
            merged_config.webaddr = Some(cli_wa);
        }
        if let Some(cli_db) = cli_args.debounce_ms {
            merged_config.debounce_ms = Some(cli_db);
        }
        if let Some(cli_policy) = cli_args.on_build_error {
            merged_config.on_build_error = Some(cli_policy);
        }
        if let Some(cli_ll) = cli_args.log_level {
            merged_config.log_level = Some(cli_ll);
        }
        // Flags can only switch a setting away from its default
        let serve = !cli_args.no_serve && merged_config.serve.unwrap_or(true);
        let ignore_dotfiles =
            !cli_args.include_dotfiles && merged_config.ignore_dotfiles.unwrap_or(true);

        let watch_paths = if !cli_args.paths.is_empty() {
            cli_args.paths
        } else {
            merged_config.paths.unwrap_or_default()
        };

        let build_command = merged_config.build.unwrap_or_else(default_build_command);
        if build_command.is_empty() {
            return Err(figment::Error::from(
                "build command must name a program".to_string(),
            ));
        }

        Ok(AppConfig {
            watch_paths,
            build_command,
            site_dir: merged_config
                .site_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SITE_DIR)),
            web_addr: merged_config
                .webaddr
                .unwrap_or_else(|| DEFAULT_WEB_ADDR.to_string()),
            serve,
            debounce: Duration::from_millis(
                merged_config.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS),
            ),
            ignore_dotfiles,
            on_build_error: merged_config.on_build_error.unwrap_or_default(),
            log_level: merged_config.log_level.unwrap_or(default_log_level),
        })
    }
}
