//! Command execution against a [`Coordinator`].
//!
//! Every command returns a JSON value that the binary prints.

use std::fs;
use std::sync::Arc;

use anyhow::{bail, Context};
use serde_json::{json, Value};
use study_sync_core::{
    CaseFlagFields, CompletionFields, Coordinator, DocumentBackend, FlagId, Roster, StaticRoster,
};

use crate::cli::{Cli, Command, DomainArg};
use crate::http::HttpBackend;

/// Build the coordinator for `cli`, sign in, and run its command.
///
/// Reconciliation triggered by the sign-in completes before the command
/// runs, and all remote propagation completes before this returns.
///
/// # Errors
///
/// Returns an error if the data directory or remote URL is unusable, or the
/// command itself fails.
pub async fn run(cli: &Cli) -> anyhow::Result<Value> {
    let config = cli.config();
    let backend: Option<Arc<dyn DocumentBackend>> = match &config.remote_url {
        Some(url) => Some(Arc::new(
            HttpBackend::new(url, config.remote_timeout).context("configuring remote store")?,
        )),
        None => None,
    };
    let coordinator = Coordinator::new(&config, backend).context("opening local mirrors")?;

    match cli.identity() {
        Some(identity) => {
            if config.remote_url.is_none() {
                tracing::warn!("no remote configured; changes stay on this device");
            }
            coordinator.sign_in(identity);
            coordinator.flush().await;
        }
        None if config.remote_url.is_some() => {
            tracing::warn!("remote configured but no user given; running local-only");
        }
        None => {}
    }

    let output = execute(&coordinator, &cli.command).await;
    coordinator.flush().await;
    output
}

/// Run one command.
///
/// # Errors
///
/// Returns an error for unreadable input files, rejected imports, an
/// unconfirmed clear, or a sync without identity.
pub async fn execute(coordinator: &Coordinator, command: &Command) -> anyhow::Result<Value> {
    let output = match command {
        Command::Status => status(coordinator),
        Command::Done { id } => {
            let changed = coordinator
                .completions()
                .set_record(id, CompletionFields {});
            json!({ "id": id, "done": changed })
        }
        Command::Undo { id } => {
            let changed = coordinator.completions().clear_record(id);
            json!({ "id": id, "done": false, "changed": changed })
        }
        Command::Toggle { id } => {
            let done = coordinator.completions().toggle(id, CompletionFields {});
            json!({ "id": id, "done": done })
        }
        Command::Flag {
            case_id,
            question,
            text,
        } => {
            let flagged = coordinator.flags().flag_question(case_id, *question, text.clone());
            json!({ "id": FlagId::new(case_id.clone(), *question).subject_id(), "flagged": flagged })
        }
        Command::Unflag { case_id, question } => {
            let changed = coordinator.flags().unflag_question(case_id, *question);
            json!({
                "id": FlagId::new(case_id.clone(), *question).subject_id(),
                "flagged": false,
                "changed": changed,
            })
        }
        Command::FlagCase { case_id } => {
            let flagged = coordinator.case_flags().toggle(case_id, CaseFlagFields {});
            json!({ "caseId": case_id, "flagged": flagged })
        }
        Command::List { domain } => list(coordinator, *domain)?,
        Command::Progress { roster, category } => {
            let json = fs::read_to_string(roster)
                .with_context(|| format!("reading roster {}", roster.display()))?;
            let roster = StaticRoster::from_json(&json).context("parsing roster")?;
            progress(coordinator, &roster, category.as_deref())?
        }
        Command::Export { output } => {
            let backup = serde_json::to_value(coordinator.export_backup())?;
            match output {
                Some(path) => {
                    fs::write(path, serde_json::to_string_pretty(&backup)?)
                        .with_context(|| format!("writing backup {}", path.display()))?;
                    json!({ "written": path.display().to_string() })
                }
                None => backup,
            }
        }
        Command::Import { file } => {
            let json = fs::read_to_string(file)
                .with_context(|| format!("reading backup {}", file.display()))?;
            let summary = coordinator
                .import_backup_json(&json)
                .context("importing backup")?;
            serde_json::to_value(summary)?
        }
        Command::Clear { domain, yes } => {
            if !yes {
                bail!("refusing to clear records without --yes");
            }
            clear(coordinator, *domain);
            json!({ "cleared": domain.map_or("all", domain_name) })
        }
        Command::Sync => sync(coordinator).await?,
        Command::SignOut => {
            coordinator.sign_out();
            json!({ "signedOut": true })
        }
    };
    Ok(output)
}

fn domain_name(domain: DomainArg) -> &'static str {
    match domain {
        DomainArg::Completions => "completions",
        DomainArg::Flags => "flags",
        DomainArg::CaseFlags => "caseFlags",
    }
}

fn status(coordinator: &Coordinator) -> Value {
    let identity = coordinator.remote().current_identity();
    json!({
        "identity": identity,
        "remoteReady": coordinator.remote().is_ready(),
        "completions": coordinator.completions().len(),
        "flags": coordinator.flag_stats(),
    })
}

fn list(coordinator: &Coordinator, domain: DomainArg) -> anyhow::Result<Value> {
    let value = match domain {
        DomainArg::Completions => serde_json::to_value(coordinator.completions().snapshot())?,
        DomainArg::Flags => serde_json::to_value(coordinator.flags().snapshot())?,
        DomainArg::CaseFlags => serde_json::to_value(coordinator.case_flags().snapshot())?,
    };
    Ok(value)
}

fn progress(
    coordinator: &Coordinator,
    roster: &StaticRoster,
    category: Option<&str>,
) -> anyhow::Result<Value> {
    let completions = coordinator.completions();
    if let Some(category) = category {
        if !roster.categories().iter().any(|c| c == category) {
            bail!("unknown category {category:?}");
        }
        return Ok(serde_json::to_value(
            completions.progress_in(roster, category),
        )?);
    }

    let mut categories = serde_json::Map::new();
    for category in roster.categories() {
        let progress = completions.progress_in(roster, &category);
        categories.insert(category, serde_json::to_value(progress)?);
    }
    Ok(json!({
        "overall": completions.progress_overall(roster),
        "categories": categories,
    }))
}

fn clear(coordinator: &Coordinator, domain: Option<DomainArg>) {
    let all = domain.is_none();
    if all || domain == Some(DomainArg::Completions) {
        coordinator.completions().clear_all();
    }
    if all || domain == Some(DomainArg::Flags) {
        coordinator.flags().clear_all();
    }
    if all || domain == Some(DomainArg::CaseFlags) {
        coordinator.case_flags().clear_all();
    }
}

async fn sync(coordinator: &Coordinator) -> anyhow::Result<Value> {
    if coordinator.remote().current_identity().is_none() {
        bail!("sync requires --user");
    }
    let (completions, flags, case_flags) = tokio::join!(
        coordinator.completions().reconcile(),
        coordinator.flags().reconcile(),
        coordinator.case_flags().reconcile(),
    );
    Ok(json!({
        "completions": completions,
        "flags": flags,
        "caseFlags": case_flags,
    }))
}
