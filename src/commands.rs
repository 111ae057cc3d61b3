//! Command dispatch for the `tagstore` binary.
//!
//! [`run_app`] sets up logging, configuration and Ctrl+C handling, opens the
//! library named on the command line and runs one subcommand against it.

use anyhow::{Context, Result};
use bytesize::ByteSize;
use serde_json::json;
use std::sync::Arc;

use crate::cli::{
    ArtifactArgs, ClusterArgs, Cli, Commands, FilterCommand, OutputFormat, QueryArgs, SearchArgs,
    SimilarArgs, TagArgs,
};
use crate::config::StoreConfig;
use crate::error::ExitCode;
use crate::library::Library;
use crate::logging::init_logging;
use crate::model::{entity_to_json, Identity};
use crate::progress::{Progress, ProgressCallback};
use crate::signal::{install_handler, CancelFlag};
use crate::similarity::PerceptualAlgorithm;

/// Run the command described by `cli`.
///
/// # Errors
///
/// Any failure that should end the process with a non-zero status. Results
/// that are merely empty or partial are reported through the returned
/// [`ExitCode`] instead.
pub fn run_app(cli: Cli) -> Result<ExitCode> {
    if let Err(e) = init_logging(cli.verbose, cli.quiet) {
        eprintln!("Warning: failed to initialize logging: {}", e);
    }

    let config = StoreConfig::load(cli.config.as_deref())?;
    let accessible = cli.accessible || config.accessible_progress;
    let cancel = match install_handler() {
        Ok(cancel) => cancel,
        Err(e) => {
            log::warn!("{}; Ctrl+C will terminate immediately", e);
            CancelFlag::new()
        }
    };
    let progress: Arc<dyn ProgressCallback> =
        Arc::new(Progress::with_accessible(cli.quiet, accessible));

    if let Commands::Init(args) = &cli.command {
        let library = Library::create(&cli.library, &args.name, config)
            .with_context(|| format!("Failed to create library at {}", cli.library.display()))?;
        println!(
            "Initialized library {:?} at {}",
            library.manifest().library_name,
            library.layout().root().display()
        );
        return Ok(ExitCode::Success);
    }

    let library = Library::open(&cli.library, config)
        .with_context(|| format!("Failed to open library at {}", cli.library.display()))?;
    let runner = Runner {
        library,
        progress,
        cancel,
    };
    runner.dispatch(cli.command)
}

struct Runner {
    library: Library,
    progress: Arc<dyn ProgressCallback>,
    cancel: CancelFlag,
}

impl Runner {
    fn dispatch(&self, command: Commands) -> Result<ExitCode> {
        match command {
            Commands::Init(_) => Ok(ExitCode::Success),
            Commands::Status => self.status(),
            Commands::Import(args) => self.import(&args.files, &args.tags),
            Commands::Show(args) => self.show(&Identity::from(args.id)),
            Commands::Tag(args) => self.tag(args),
            Commands::Query(args) => self.query(args),
            Commands::Search(args) => self.search(args),
            Commands::Delete(args) => self.delete(&Identity::from(args.id)),
            Commands::Rebuild => self.rebuild(),
            Commands::Thumbnail(args) => self.thumbnail(args),
            Commands::Preview(args) => {
                let id = Identity::from(args.artifact.id);
                let path = self.library.request_preview(
                    &id,
                    args.max_dim,
                    args.artifact.source.as_deref(),
                )?;
                println!("{}", path.display());
                Ok(ExitCode::Success)
            }
            Commands::Fingerprint(args) => {
                let algorithm = self.algorithm(args.algorithm.map(Into::into));
                let id = Identity::from(args.id);
                let fingerprint = self.library.compute_fingerprint(&id, algorithm, args.refresh)?;
                println!("{} {}", algorithm.as_str(), fingerprint.to_hex());
                Ok(ExitCode::Success)
            }
            Commands::Similar(args) => self.similar(args),
            Commands::Cluster(args) => self.cluster(args),
            Commands::CacheSize => {
                println!("{}", ByteSize::b(self.library.cache_size()));
                Ok(ExitCode::Success)
            }
            Commands::CacheClear => {
                self.library.clear_cache()?;
                println!("Cache cleared");
                Ok(ExitCode::Success)
            }
            Commands::Filter(command) => self.filter(command),
        }
    }

    fn algorithm(&self, requested: Option<PerceptualAlgorithm>) -> PerceptualAlgorithm {
        requested.unwrap_or(self.library.config().default_algorithm)
    }

    fn status(&self) -> Result<ExitCode> {
        let status = self.library.status();
        println!("Library:     {} ({})", status.library_name, status.root.display());
        println!("Records:     {}", status.records);
        match status.indexed {
            Some(indexed) => println!("Indexed:     {}", indexed),
            None => println!("Indexed:     -"),
        }
        println!("Index:       {}", status.index_state);
        if status.stale > 0 {
            println!("Stale:       {}", status.stale);
        }
        println!(
            "Tag search:  {}",
            if status.full_text_search { "full-text" } else { "substring" }
        );
        println!("Cache:       {}", ByteSize::b(status.cache_bytes));
        Ok(ExitCode::Success)
    }

    fn import(&self, files: &[std::path::PathBuf], tags: &[crate::model::Tag]) -> Result<ExitCode> {
        let mut failed = 0usize;
        for file in files {
            if self.cancel.is_cancelled() {
                return Ok(ExitCode::Interrupted);
            }
            match self.library.import_media(file, tags) {
                Ok(entity) => println!("{}  {}", entity.identity, file.display()),
                Err(e) => {
                    log::warn!("Failed to import {}: {}", file.display(), e);
                    failed += 1;
                }
            }
        }
        Ok(match failed {
            0 => ExitCode::Success,
            n if n == files.len() => anyhow::bail!("No files were imported"),
            _ => ExitCode::PartialSuccess,
        })
    }

    fn show(&self, identity: &Identity) -> Result<ExitCode> {
        let entity = self.library.load_entity(identity)?;
        let bytes = entity_to_json(&entity)
            .with_context(|| format!("Failed to encode record of {}", identity))?;
        println!("{}", String::from_utf8_lossy(&bytes));

        if let Ok(incoming) = self.library.incoming_relations(identity) {
            for (kind, sources) in incoming {
                for source in sources {
                    println!("<- {} {}", kind, source);
                }
            }
        }
        Ok(ExitCode::Success)
    }

    fn tag(&self, args: TagArgs) -> Result<ExitCode> {
        let identity = Identity::from(args.id);
        let mut entity = self.library.load_entity(&identity)?;
        for tag in &args.remove {
            entity.remove_tag(tag);
        }
        for tag in args.add {
            entity.add_tag(tag.category, tag.value);
        }
        let outcome = self.library.save_entity(&entity)?;
        if let Some(warning) = outcome.index_warning {
            eprintln!("Saved, but the index was not updated: {}", warning);
        }
        let tags: Vec<String> = entity.tags.iter().map(|t| t.full()).collect();
        println!("{}", tags.join(", "));
        Ok(ExitCode::Success)
    }

    fn query(&self, args: QueryArgs) -> Result<ExitCode> {
        let found = match (&args.saved, &args.expression) {
            (Some(name), _) => self
                .library
                .query_saved_filter(name)?
                .with_context(|| format!("No saved filter named {:?}", name))?,
            (None, Some(expression)) => self.library.query_by_tag_filter(expression)?,
            (None, None) => self.library.list_identities()?,
        };

        match args.output {
            OutputFormat::Text => {
                for identity in &found {
                    println!("{}", identity);
                }
            }
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&found)?),
        }
        Ok(if found.is_empty() {
            ExitCode::NoResults
        } else {
            ExitCode::Success
        })
    }

    fn search(&self, args: SearchArgs) -> Result<ExitCode> {
        let found = self.library.search_tags(&args.text, args.limit)?;
        match args.output {
            OutputFormat::Text => {
                for hit in &found {
                    println!("{:>6}  {}", hit.count, hit.tag.full());
                }
            }
            OutputFormat::Json => {
                let rows: Vec<_> = found
                    .iter()
                    .map(|hit| json!({ "tag": hit.tag.full(), "count": hit.count }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            }
        }
        Ok(if found.is_empty() {
            ExitCode::NoResults
        } else {
            ExitCode::Success
        })
    }

    fn delete(&self, identity: &Identity) -> Result<ExitCode> {
        let moved = self.library.soft_delete_entity(identity)?;
        for path in &moved {
            println!("{}", path.display());
        }
        log::info!("Moved {} files of {} to deleted/", moved.len(), identity);
        Ok(ExitCode::Success)
    }

    fn rebuild(&self) -> Result<ExitCode> {
        let report = self
            .library
            .rebuild_index(Some(Arc::clone(&self.progress)), Some(self.cancel.flag()))?;
        for entry in &report.corrupt {
            eprintln!("Skipped {}: {}", entry.identity, entry.reason);
        }
        println!(
            "Indexed {} of {} records in {:.2?} ({} fingerprints carried over)",
            report.indexed, report.processed, report.duration, report.fingerprints_carried
        );
        Ok(if report.corrupt.is_empty() {
            ExitCode::Success
        } else {
            ExitCode::PartialSuccess
        })
    }

    fn thumbnail(&self, args: ArtifactArgs) -> Result<ExitCode> {
        let id = Identity::from(args.id);
        let path = self.library.request_thumbnail(&id, args.source.as_deref())?;
        println!("{}", path.display());
        Ok(ExitCode::Success)
    }

    fn similar(&self, args: SimilarArgs) -> Result<ExitCode> {
        let algorithm = self.algorithm(args.algorithm.map(Into::into));
        let id = Identity::from(args.id);
        let found = self.library.find_similar(&id, algorithm, args.max_distance)?;
        match args.output {
            OutputFormat::Text => {
                for (identity, distance) in &found {
                    println!("{:>3}  {}", distance, identity);
                }
            }
            OutputFormat::Json => {
                let rows: Vec<_> = found
                    .iter()
                    .map(|(identity, distance)| json!({ "identity": identity, "distance": distance }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            }
        }
        Ok(if found.is_empty() {
            ExitCode::NoResults
        } else {
            ExitCode::Success
        })
    }

    fn cluster(&self, args: ClusterArgs) -> Result<ExitCode> {
        let algorithm = self.algorithm(args.algorithm.map(Into::into));
        let candidates: Vec<Identity> = if !args.ids.is_empty() {
            args.ids.into_iter().map(Identity::from).collect()
        } else if let Some(expression) = &args.filter {
            self.library.query_by_tag_filter(expression)?
        } else {
            self.library.list_identities()?
        };
        log::info!(
            "Clustering {} candidates with {} ({} threads)",
            candidates.len(),
            algorithm,
            self.library.config().worker_threads
        );

        let report = self.library.cluster_similar(
            &candidates,
            algorithm,
            args.max_distance,
            Some(Arc::clone(&self.progress)),
            Some(self.cancel.flag()),
        )?;
        for (identity, reason) in &report.failures {
            eprintln!("Skipped {}: {}", identity, reason);
        }

        let groups: Vec<&Vec<Identity>> = report
            .clustering
            .clusters
            .iter()
            .filter(|c| c.len() > 1)
            .collect();
        match args.output {
            OutputFormat::Text => {
                for (i, group) in groups.iter().enumerate() {
                    let members: Vec<&str> = group.iter().map(Identity::as_str).collect();
                    println!("Group {}: {}", i + 1, members.join(" "));
                }
                println!(
                    "{} groups, {} entities updated, {} comparisons",
                    groups.len(),
                    report.updated,
                    report.clustering.comparisons
                );
            }
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&groups)?),
        }

        Ok(if !report.failures.is_empty() {
            ExitCode::PartialSuccess
        } else if groups.is_empty() {
            ExitCode::NoResults
        } else {
            ExitCode::Success
        })
    }

    fn filter(&self, command: FilterCommand) -> Result<ExitCode> {
        match command {
            FilterCommand::Save { name, expression } => {
                self.library.save_filter(&name, &expression)?;
                println!("Saved filter {:?}", name);
            }
            FilterCommand::List => {
                let filters = self.library.saved_filters();
                if filters.is_empty() {
                    return Ok(ExitCode::NoResults);
                }
                for (name, expression) in filters {
                    println!("{}\t{}", name, expression);
                }
            }
            FilterCommand::Remove { name } => {
                if !self.library.remove_filter(&name)? {
                    anyhow::bail!("No saved filter named {:?}", name);
                }
                println!("Removed filter {:?}", name);
            }
        }
        Ok(ExitCode::Success)
    }
}
