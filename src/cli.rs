//! Command-line interface definitions for tagstore.
//!
//! All commands operate on one library directory, given before the
//! subcommand. Global options (verbosity, JSON errors, config file) apply to
//! every subcommand.
//!
//! # Example
//!
//! ```bash
//! # Create a library and import a photo
//! tagstore ~/Photos/lib init --name Photos
//! tagstore ~/Photos/lib import lake.png --tag class:lake
//!
//! # Query by tags
//! tagstore ~/Photos/lib query 'class:lake AND NOT name:*draft*'
//!
//! # Rebuild the index from the canonical files
//! tagstore -v ~/Photos/lib rebuild
//! ```

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::model::Tag;
use crate::similarity::PerceptualAlgorithm;

/// File-first media library storage with a rebuildable SQLite index.
///
/// Canonical per-entity JSON files are the source of truth; the index,
/// thumbnails and previews can always be regenerated from them.
#[derive(Debug, Parser)]
#[command(name = "tagstore")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Library directory
    #[arg(value_name = "LIBRARY", env = "TAGSTORE_LIBRARY")]
    pub library: PathBuf,

    /// Increase verbosity level (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Report errors as JSON on stderr
    #[arg(long, global = true)]
    pub json_errors: bool,

    /// Configuration file, replacing the platform default
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Screen-reader friendly progress output
    #[arg(long, global = true)]
    pub accessible: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create the library layout and manifest
    Init(InitArgs),
    /// Show library and index health
    Status,
    /// Copy media files into the library and create their records
    Import(ImportArgs),
    /// Print an entity record
    Show(IdArgs),
    /// Add or remove tags of an entity
    Tag(TagArgs),
    /// List entities matching a tag filter expression
    Query(QueryArgs),
    /// Search tags by text
    Search(SearchArgs),
    /// Move an entity's files to the deleted/ holding area
    Delete(IdArgs),
    /// Regenerate the index from the canonical files
    Rebuild,
    /// Generate (or locate) an entity's thumbnail
    Thumbnail(ArtifactArgs),
    /// Generate (or locate) a downscaled preview
    Preview(PreviewArgs),
    /// Compute an entity's perceptual fingerprint
    Fingerprint(FingerprintArgs),
    /// List entities perceptually similar to one entity
    Similar(SimilarArgs),
    /// Group entities by similarity and record `similar` relations
    Cluster(ClusterArgs),
    /// Print the total size of cached artifacts
    CacheSize,
    /// Delete all cached artifacts
    CacheClear,
    /// Manage saved filters
    #[command(subcommand)]
    Filter(FilterCommand),
}

/// Arguments for `init`.
#[derive(Debug, Args)]
pub struct InitArgs {
    /// Library name written to the manifest
    #[arg(long, default_value = "Library")]
    pub name: String,
}

/// Arguments for `import`.
#[derive(Debug, Args)]
pub struct ImportArgs {
    /// Media files to import
    #[arg(value_name = "FILE", required = true)]
    pub files: Vec<PathBuf>,

    /// Tag to add to every imported entity (category:value, repeatable)
    #[arg(short, long = "tag", value_name = "TAG", value_parser = parse_tag)]
    pub tags: Vec<Tag>,
}

/// A single entity identity.
#[derive(Debug, Args)]
pub struct IdArgs {
    /// Entity identity
    #[arg(value_name = "ID")]
    pub id: String,
}

/// Arguments for `tag`.
#[derive(Debug, Args)]
pub struct TagArgs {
    /// Entity identity
    #[arg(value_name = "ID")]
    pub id: String,

    /// Tags to add (category:value, repeatable)
    #[arg(short, long = "add", value_name = "TAG", value_parser = parse_tag)]
    pub add: Vec<Tag>,

    /// Tags to remove (category:value, repeatable)
    #[arg(short, long = "remove", value_name = "TAG", value_parser = parse_tag)]
    pub remove: Vec<Tag>,
}

/// Arguments for `query`.
#[derive(Debug, Args)]
pub struct QueryArgs {
    /// Filter expression, e.g. 'class:lake AND NOT name:*draft*'
    #[arg(value_name = "EXPR", required_unless_present = "saved")]
    pub expression: Option<String>,

    /// Run a filter saved in the manifest instead
    #[arg(long, value_name = "NAME", conflicts_with = "expression")]
    pub saved: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

/// Arguments for `search`.
#[derive(Debug, Args)]
pub struct SearchArgs {
    /// Words to look for in tags; empty lists the most used tags
    #[arg(value_name = "TEXT", default_value = "")]
    pub text: String,

    /// Maximum number of tags returned
    #[arg(long, default_value = "20")]
    pub limit: usize,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

/// Arguments for `thumbnail`.
#[derive(Debug, Args)]
pub struct ArtifactArgs {
    /// Entity identity
    #[arg(value_name = "ID")]
    pub id: String,

    /// Media file to render from, instead of the one in images/
    #[arg(long, value_name = "PATH")]
    pub source: Option<PathBuf>,
}

/// Arguments for `preview`.
#[derive(Debug, Args)]
pub struct PreviewArgs {
    #[command(flatten)]
    pub artifact: ArtifactArgs,

    /// Longest side in pixels (default from config)
    #[arg(long, value_name = "PIXELS", value_parser = clap::value_parser!(u32).range(1..))]
    pub max_dim: Option<u32>,
}

/// Arguments for `fingerprint`.
#[derive(Debug, Args)]
pub struct FingerprintArgs {
    /// Entity identity
    #[arg(value_name = "ID")]
    pub id: String,

    /// Hashing algorithm (default from config)
    #[arg(short, long, value_enum)]
    pub algorithm: Option<AlgorithmArg>,

    /// Recompute even if a fingerprint is stored
    #[arg(long)]
    pub refresh: bool,
}

/// Arguments for `similar`.
#[derive(Debug, Args)]
pub struct SimilarArgs {
    /// Entity identity
    #[arg(value_name = "ID")]
    pub id: String,

    /// Hashing algorithm (default from config)
    #[arg(short, long, value_enum)]
    pub algorithm: Option<AlgorithmArg>,

    /// Maximum Hamming distance (default depends on the algorithm)
    #[arg(long, value_name = "N")]
    pub max_distance: Option<u32>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

/// Arguments for `cluster`.
#[derive(Debug, Args)]
pub struct ClusterArgs {
    /// Candidate identities; all entities when omitted
    #[arg(value_name = "ID")]
    pub ids: Vec<String>,

    /// Restrict candidates to entities matching a filter expression
    #[arg(long, value_name = "EXPR", conflicts_with = "ids")]
    pub filter: Option<String>,

    /// Hashing algorithm (default from config)
    #[arg(short, long, value_enum)]
    pub algorithm: Option<AlgorithmArg>,

    /// Maximum Hamming distance (default depends on the algorithm)
    #[arg(long, value_name = "N")]
    pub max_distance: Option<u32>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

/// Saved filter management.
#[derive(Debug, Subcommand)]
pub enum FilterCommand {
    /// Save a filter expression under a name
    Save {
        #[arg(value_name = "NAME")]
        name: String,
        #[arg(value_name = "EXPR")]
        expression: String,
    },
    /// List saved filters
    List,
    /// Remove a saved filter
    Remove {
        #[arg(value_name = "NAME")]
        name: String,
    },
}

/// Output format for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One item per line
    Text,
    /// JSON for scripting
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Perceptual hashing algorithm selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AlgorithmArg {
    Phash,
    Dhash,
    Ahash,
}

impl From<AlgorithmArg> for PerceptualAlgorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::Phash => PerceptualAlgorithm::Phash,
            AlgorithmArg::Dhash => PerceptualAlgorithm::Dhash,
            AlgorithmArg::Ahash => PerceptualAlgorithm::Ahash,
        }
    }
}

/// Parse a `category:value` tag argument.
///
/// The first colon separates category from value; the value may itself
/// contain colons.
///
/// # Examples
///
/// ```
/// use tagstore::cli::parse_tag;
///
/// let tag = parse_tag("time:12:30").unwrap();
/// assert_eq!(tag.category, "time");
/// assert_eq!(tag.value, "12:30");
/// assert!(parse_tag("lake").is_err());
/// ```
///
/// # Errors
///
/// Returns an error if there is no colon or either side is empty.
pub fn parse_tag(s: &str) -> Result<Tag, String> {
    let s = s.trim();
    let (category, value) = s
        .split_once(':')
        .ok_or_else(|| format!("Expected category:value, got '{s}'"))?;
    let (category, value) = (category.trim(), value.trim());
    if category.is_empty() {
        return Err(format!("Tag category cannot be empty: '{s}'"));
    }
    if value.is_empty() {
        return Err(format!("Tag value cannot be empty: '{s}'"));
    }
    Ok(Tag::new(category, value))
}
