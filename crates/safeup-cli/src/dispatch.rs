use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use safeup_flex::{
    DataFormat, FileStorage, FlexStorage, FolderStorage, IndexFile, LookupField, UserDirectory,
};
use safeup_upgrade::{
    load_config, Dependencies, NoRegistry, PackageRegistry, RemoteRegistry, SafeUpgradeService,
    SwapRecovery, UpgradeError, UpgradeLayout,
};
use tracing::{debug, info};

use crate::completion::write_completions_script;
use crate::render::{
    format_preflight_lines, format_recovery_line, print_section, print_status, render_object,
    OutputStyle, TerminalProgress,
};
use crate::{Cli, Commands, FlexCommands, FlexTarget, RowFormat};

pub(crate) const EXIT_OK: u8 = 0;
pub(crate) const EXIT_UNAVAILABLE: u8 = 1;
pub(crate) const EXIT_PREFLIGHT_ISSUES: u8 = 2;

const DEFAULT_INDEX_FILE: &str = ".index.json";

pub(crate) fn run_cli(cli: Cli, style: OutputStyle) -> Result<u8> {
    match cli.command {
        Commands::Preflight { json, target } => {
            let service = build_service(cli.root.as_deref(), cli.config.as_deref(), None)?;
            let report = service.preflight(target.as_deref())?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report)
                        .context("failed serializing preflight report")?
                );
            } else {
                print_section(style, "preflight");
                for line in format_preflight_lines(&report, style) {
                    println!("{line}");
                }
            }
            Ok(if report.has_issues() {
                EXIT_PREFLIGHT_ISSUES
            } else {
                EXIT_OK
            })
        }
        Commands::Promote {
            extracted,
            target_version,
            ignore,
        } => {
            let mut service = build_service(
                cli.root.as_deref(),
                cli.config.as_deref(),
                progress_for(style, "promote"),
            )?;
            recover_before_mutation(&mut service, style)?;
            let manifest = service.promote(&extracted, &target_version, &ignore)?;
            match style {
                OutputStyle::Plain => println!("{}", manifest.id),
                OutputStyle::Rich => print_status(
                    style,
                    "ok",
                    &format!(
                        "promoted {} -> {} (manifest {})",
                        manifest.source_version, manifest.target_version, manifest.id
                    ),
                ),
            }
            Ok(EXIT_OK)
        }
        Commands::Rollback { id, list, yes } => {
            let mut service = build_service(
                cli.root.as_deref(),
                cli.config.as_deref(),
                progress_for(style, "rollback"),
            )?;
            if list {
                for line in format_manifest_list(&service)? {
                    println!("{line}");
                }
                return Ok(EXIT_OK);
            }
            let stdin = io::stdin();
            let mut input = stdin.lock();
            let mut output = io::stderr();
            run_rollback(&mut service, id.as_deref(), yes, style, &mut input, &mut output)
        }
        Commands::Snapshot { label } => {
            let mut service = build_service(
                cli.root.as_deref(),
                cli.config.as_deref(),
                progress_for(style, "snapshot"),
            )?;
            recover_before_mutation(&mut service, style)?;
            let manifest = service.create_snapshot(label.as_deref())?;
            match style {
                OutputStyle::Plain => println!("{}", manifest.id),
                OutputStyle::Rich => print_status(
                    style,
                    "ok",
                    &format!("snapshot {} recorded", manifest.id),
                ),
            }
            Ok(EXIT_OK)
        }
        Commands::Recover { unlock } => {
            let mut service = build_service(cli.root.as_deref(), cli.config.as_deref(), None)?;
            if unlock {
                match service.release_stale_lock()? {
                    Some(holder) => {
                        print_status(style, "warn", &format!("released lock held by {holder}"))
                    }
                    None => print_status(style, "ok", "no operation lock to release"),
                }
            }
            let outcome = service.recover_interrupted_swap()?;
            println!("{}", format_recovery_line(&outcome, style));
            Ok(EXIT_OK)
        }
        Commands::Flex { command } => run_flex(command, style),
        Commands::Completions { shell } => {
            let mut stdout = io::stdout();
            write_completions_script(shell, &mut stdout)?;
            Ok(EXIT_OK)
        }
    }
}

/// Loads config and wires the service for the live root.
pub(crate) fn build_service(
    root: Option<&Path>,
    config: Option<&Path>,
    progress: Option<TerminalProgress>,
) -> Result<SafeUpgradeService> {
    let root = resolve_root(root)?;
    let config_path = match config {
        Some(path) => path.to_path_buf(),
        None => UpgradeLayout::for_root(&root)?.default_config_path(),
    };
    let config = load_config(&config_path)?;
    let layout = config.layout(&root)?;
    debug!(
        root = %layout.root().display(),
        staging = %layout.staging_root().display(),
        config = %config_path.display(),
        "resolved upgrade layout"
    );

    let registry: Box<dyn PackageRegistry> = match config.registry_url.as_deref() {
        Some(url) => Box::new(RemoteRegistry::new(url, layout.root())?),
        None => Box::new(NoRegistry),
    };
    let service = SafeUpgradeService::new(layout, config.options(), Dependencies::new(registry));
    Ok(match progress {
        Some(progress) => service.with_progress(Box::new(progress)),
        None => service,
    })
}

fn resolve_root(root: Option<&Path>) -> Result<PathBuf> {
    let root = match root {
        Some(root) => root.to_path_buf(),
        None => std::env::current_dir().context("failed to determine current directory")?,
    };
    root.canonicalize()
        .with_context(|| format!("failed to resolve site root: {}", root.display()))
}

fn progress_for(style: OutputStyle, label: &str) -> Option<TerminalProgress> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(TerminalProgress::new(label)),
    }
}

fn recover_before_mutation(service: &mut SafeUpgradeService, style: OutputStyle) -> Result<()> {
    let outcome = service.recover_interrupted_swap()?;
    if outcome != SwapRecovery::Clean {
        info!("recovered interrupted swap before running command");
        eprintln!("{}", format_recovery_line(&outcome, style));
    }
    Ok(())
}

pub(crate) fn format_manifest_list(service: &SafeUpgradeService) -> Result<Vec<String>> {
    let manifests = service.list_manifests()?;
    if manifests.is_empty() {
        return Ok(vec!["no snapshots available".to_string()]);
    }
    Ok(manifests
        .iter()
        .map(|manifest| match &manifest.label {
            Some(label) => format!("{} {} ({label})", manifest.id, manifest.target_version),
            None => format!("{} {}", manifest.id, manifest.target_version),
        })
        .collect())
}

/// Rollback with confirmation. Missing snapshots and a declined prompt
/// both exit with [`EXIT_UNAVAILABLE`].
pub(crate) fn run_rollback<R: BufRead, W: Write>(
    service: &mut SafeUpgradeService,
    id: Option<&str>,
    assume_yes: bool,
    style: OutputStyle,
    input: &mut R,
    output: &mut W,
) -> Result<u8> {
    recover_before_mutation(service, style)?;

    let Some(manifest) = service.manifest_store().resolve(id)? else {
        let message = match id {
            Some(id) => format!("snapshot {id} not found"),
            None => "no snapshot available".to_string(),
        };
        print_status(style, "err", &message);
        return Ok(EXIT_UNAVAILABLE);
    };

    if !assume_yes {
        let prompt = format!(
            "Restore snapshot {} (version {})? [y/N] ",
            manifest.id, manifest.source_version
        );
        if !confirm(&prompt, input, output)? {
            print_status(style, "warn", "rollback cancelled");
            return Ok(EXIT_UNAVAILABLE);
        }
    }

    match service.rollback(Some(&manifest.id)) {
        Ok(Some(restored)) => {
            service.clear_recovery_flag();
            print_status(
                style,
                "ok",
                &format!(
                    "restored snapshot {} (version {})",
                    restored.id, restored.source_version
                ),
            );
            Ok(EXIT_OK)
        }
        Ok(None) => {
            print_status(style, "err", &format!("snapshot {} not found", manifest.id));
            Ok(EXIT_UNAVAILABLE)
        }
        Err(err) if err.is_not_found() => {
            print_status(style, "err", &err.to_string());
            Ok(EXIT_UNAVAILABLE)
        }
        Err(err) => Err(rollback_failure(err)),
    }
}

fn rollback_failure(err: UpgradeError) -> anyhow::Error {
    if err.is_fatal() {
        anyhow::Error::new(err).context("rollback failed; the live tree needs manual attention")
    } else {
        anyhow::Error::new(err)
    }
}

pub(crate) fn confirm<R: BufRead, W: Write>(
    prompt: &str,
    input: &mut R,
    output: &mut W,
) -> Result<bool> {
    output
        .write_all(prompt.as_bytes())
        .and_then(|_| output.flush())
        .context("failed writing confirmation prompt")?;
    let mut answer = String::new();
    input
        .read_line(&mut answer)
        .context("failed reading confirmation answer")?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

pub(crate) fn run_flex(command: FlexCommands, style: OutputStyle) -> Result<u8> {
    match command {
        FlexCommands::Reindex { target } => {
            let mut directory = open_directory(&target);
            let changes = directory.reindex()?;
            print_status(style, "ok", &changes.summary("user"));
            Ok(EXIT_OK)
        }
        FlexCommands::Find {
            target,
            query,
            fields,
        } => {
            let fields = parse_lookup_fields(&fields)?;
            let mut directory = open_directory(&target);
            let object = directory.find(&query, &fields)?;
            if !object.exists() {
                print_status(style, "err", &format!("no user matches '{query}'"));
                return Ok(EXIT_UNAVAILABLE);
            }
            print_json(&render_object(&object))?;
            Ok(EXIT_OK)
        }
        FlexCommands::Load { target, key } => {
            let mut directory = open_directory(&target);
            let object = directory.load(&key)?;
            print_json(&render_object(&object))?;
            Ok(EXIT_OK)
        }
        FlexCommands::Delete { target, key } => {
            let mut directory = open_directory(&target);
            if directory.delete(&key)? {
                print_status(style, "ok", &format!("deleted user {key}"));
                Ok(EXIT_OK)
            } else {
                print_status(style, "err", &format!("user {key} not found"));
                Ok(EXIT_UNAVAILABLE)
            }
        }
    }
}

pub(crate) fn open_directory(target: &FlexTarget) -> UserDirectory {
    let format = match target.format {
        RowFormat::Yaml => DataFormat::Yaml,
        RowFormat::Json => DataFormat::Json,
    };
    let storage: Box<dyn FlexStorage> = if target.nested {
        Box::new(FolderStorage::new(&target.folder, format).case_insensitive())
    } else {
        Box::new(FileStorage::new(&target.folder, format).case_insensitive())
    };
    let index_path = target
        .index
        .clone()
        .unwrap_or_else(|| target.folder.join(DEFAULT_INDEX_FILE));
    UserDirectory::new(storage, IndexFile::new(index_path))
}

pub(crate) fn parse_lookup_fields(fields: &[String]) -> Result<Vec<LookupField>> {
    if fields.is_empty() {
        return Ok(vec![LookupField::Username, LookupField::Email]);
    }
    fields
        .iter()
        .map(|field| {
            field
                .parse::<LookupField>()
                .with_context(|| format!("invalid lookup field '{field}'"))
        })
        .collect()
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed serializing flex object")?
    );
    Ok(())
}
