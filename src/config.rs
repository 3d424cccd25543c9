use crate::services::{
    crawler::DEFAULT_LIST_WORKERS,
    pipeline::default_concurrency,
    source_client::{
        ContentTypePolicy, DEFAULT_STRIP_PREFIX, KeyPolicy, SourceConfig, hcp_auth_token,
    },
};
use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use reqwest::Url;
use std::{env, path::PathBuf};

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Migration tool from an HCP namespace to S3-compatible object storage"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List objects in an HCP namespace and write the listing to disk
    List(ListArgs),
    /// Migrate listed HCP objects to the destination store
    Migrate(MigrateArgs),
}

/// Flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Authorization token for HCP (overrides HCP_AUTH_TOKEN)
    #[arg(short = 'a', long)]
    pub auth_token: Option<String>,

    /// HCP username, used with --password when no token is given (overrides HCP_USERNAME)
    #[arg(long)]
    pub username: Option<String>,

    /// HCP password (overrides HCP_PASSWORD)
    #[arg(long)]
    pub password: Option<String>,

    /// Namespace URL, e.g. https://ns.tenant.hcp.example.com/rest (overrides HCP_NAMESPACE_URL)
    #[arg(short = 'n', long)]
    pub namespace_url: Option<String>,

    /// Host header for HCP (overrides HCP_HOST_HEADER)
    #[arg(long)]
    pub host_header: Option<String>,

    /// Work directory for listings and run logs (overrides HCP_DATA_DIR)
    #[arg(short = 'd', long)]
    pub data_dir: Option<PathBuf>,

    /// Disable TLS certificate verification
    #[arg(short = 'i', long)]
    pub insecure: bool,

    /// Enable logging
    #[arg(short = 'l', long)]
    pub log: bool,

    /// Enable debugging, including a trace of every source request
    #[arg(long)]
    pub debug: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// File with one child prefix per line under the namespace URL
    #[arg(long)]
    pub prefixes_file: Option<PathBuf>,

    /// Concurrent directory listing requests
    #[arg(long, default_value_t = DEFAULT_LIST_WORKERS)]
    pub list_workers: usize,
}

#[derive(Args, Debug, Clone)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Number of entries to skip from the input listing
    #[arg(short = 's', long, default_value_t = 0)]
    pub skip: u64,

    /// Perform a fake migration: fetch and derive keys, write nothing
    #[arg(long)]
    pub fake: bool,

    /// Annotation holding the metadata document for each object
    #[arg(long)]
    pub annotation: Option<String>,

    /// Concurrent transfers (defaults to available parallelism)
    #[arg(short = 'c', long)]
    pub concurrency: Option<usize>,

    /// Listing file to migrate (defaults to <data-dir>/object_listing.txt)
    #[arg(long, conflicts_with = "crawl")]
    pub input: Option<PathBuf>,

    /// Where migrated objects go
    #[arg(long, value_enum, default_value_t = DestinationKind::S3)]
    pub destination: DestinationKind,

    /// Destination key for objects without an annotation
    #[arg(long, value_enum, default_value_t = KeyPolicyArg::Strip)]
    pub key_policy: KeyPolicyArg,

    /// Prefix removed from source paths by the `strip` key policy
    #[arg(long, default_value = DEFAULT_STRIP_PREFIX)]
    pub strip_prefix: String,

    /// Header that wins when both content-type headers are present
    #[arg(long, value_enum, default_value_t = ContentTypeArg::Standard)]
    pub content_type_policy: ContentTypeArg,

    /// Crawl the namespace and migrate discovered objects directly
    #[arg(long)]
    pub crawl: bool,

    /// Concurrent directory listing requests when crawling
    #[arg(long, default_value_t = DEFAULT_LIST_WORKERS)]
    pub list_workers: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DestinationKind {
    /// S3-compatible endpoint from MINIO_* variables
    S3,
    /// Local disk under <data-dir>/download with an SQLite index
    Local,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum KeyPolicyArg {
    /// Strip --strip-prefix from the source path
    Strip,
    /// Use the source path verbatim
    Raw,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ContentTypeArg {
    /// Content-Type, then X-HCP-ContentType
    Standard,
    /// X-HCP-ContentType, then Content-Type
    Hcp,
}

impl SourceArgs {
    /// Default tracing directive when RUST_LOG is unset.
    pub fn log_directive(&self) -> &'static str {
        if self.debug {
            "debug"
        } else if self.log {
            "info"
        } else {
            "warn"
        }
    }

    fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .or_else(|| env_var("HCP_DATA_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn source_config(
        &self,
        key_policy: KeyPolicy,
        content_type_policy: ContentTypePolicy,
    ) -> Result<SourceConfig> {
        // --- Merge CLI over environment ---
        let raw_url = self
            .namespace_url
            .clone()
            .or_else(|| env_var("HCP_NAMESPACE_URL"))
            .context("--namespace-url (or HCP_NAMESPACE_URL) is required")?;
        let namespace_url = Url::parse(&raw_url)
            .with_context(|| format!("--namespace-url malformed: `{raw_url}`"))?;
        if !matches!(namespace_url.scheme(), "http" | "https") {
            bail!("--namespace-url must be http or https, got `{raw_url}`");
        }

        let auth_token = match self.auth_token.clone().or_else(|| env_var("HCP_AUTH_TOKEN")) {
            Some(token) => token,
            None => {
                let username = self.username.clone().or_else(|| env_var("HCP_USERNAME"));
                let password = self.password.clone().or_else(|| env_var("HCP_PASSWORD"));
                match (username, password) {
                    (Some(username), Some(password)) => hcp_auth_token(&username, &password),
                    _ => bail!(
                        "--auth-token (or HCP_AUTH_TOKEN), or --username and --password, are required"
                    ),
                }
            }
        };

        Ok(SourceConfig {
            namespace_url,
            auth_token,
            host_header: self.host_header.clone().or_else(|| env_var("HCP_HOST_HEADER")),
            insecure: self.insecure,
            key_policy,
            content_type_policy,
        })
    }
}

/// Resolved configuration for `list`.
#[derive(Debug, Clone)]
pub struct ListConfig {
    pub source: SourceConfig,
    pub data_dir: PathBuf,
    pub prefixes_file: Option<PathBuf>,
    pub list_workers: usize,
}

impl ListConfig {
    pub fn from_args(args: &ListArgs) -> Result<Self> {
        if args.list_workers == 0 {
            bail!("--list-workers must be at least 1");
        }
        Ok(Self {
            source: args
                .source
                .source_config(KeyPolicy::default(), ContentTypePolicy::default())?,
            data_dir: args.source.data_dir(),
            prefixes_file: args.prefixes_file.clone(),
            list_workers: args.list_workers,
        })
    }
}

/// Resolved configuration for `migrate`.
#[derive(Debug, Clone)]
pub struct MigrateConfig {
    pub source: SourceConfig,
    pub data_dir: PathBuf,
    /// `None` when crawling directly.
    pub input: Option<PathBuf>,
    pub skip: u64,
    pub dry_run: bool,
    pub annotation: Option<String>,
    pub concurrency: usize,
    pub destination: DestinationKind,
    pub list_workers: usize,
}

impl MigrateConfig {
    pub fn from_args(args: &MigrateArgs) -> Result<Self> {
        let key_policy = match args.key_policy {
            KeyPolicyArg::Strip => KeyPolicy::StripPrefix(args.strip_prefix.clone()),
            KeyPolicyArg::Raw => KeyPolicy::Raw,
        };
        let content_type_policy = match args.content_type_policy {
            ContentTypeArg::Standard => ContentTypePolicy::PreferStandard,
            ContentTypeArg::Hcp => ContentTypePolicy::PreferHcp,
        };

        let concurrency = args.concurrency.unwrap_or_else(default_concurrency);
        if concurrency == 0 {
            bail!("--concurrency must be at least 1");
        }
        if args.list_workers == 0 {
            bail!("--list-workers must be at least 1");
        }

        let data_dir = args.source.data_dir();
        let input = if args.crawl {
            None
        } else {
            Some(
                args.input
                    .clone()
                    .unwrap_or_else(|| data_dir.join(crate::services::crawler::LISTING_FILE)),
            )
        };

        Ok(Self {
            source: args.source.source_config(key_policy, content_type_policy)?,
            data_dir,
            input,
            skip: args.skip,
            dry_run: args.fake,
            annotation: args.annotation.clone().filter(|name| !name.is_empty()),
            concurrency,
            destination: args.destination,
            list_workers: args.list_workers,
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}
