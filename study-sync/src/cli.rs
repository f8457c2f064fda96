//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use study_sync_core::{Identity, SyncConfig};

/// Command-line arguments for study-sync.
#[derive(Debug, Clone, Parser)]
#[command(name = "study-sync")]
#[command(about = "Track done and flagged study items, offline first")]
#[command(version)]
pub struct Cli {
    /// Directory holding the local mirrors
    #[arg(long, global = true, env = "STUDY_SYNC_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Base URL of the document service (e.g., <https://docs.example.com/v1>)
    #[arg(long, global = true, env = "STUDY_SYNC_REMOTE_URL")]
    pub remote: Option<String>,

    /// User id to sign in as; without it the run stays local-only
    #[arg(long, global = true, env = "STUDY_SYNC_USER")]
    pub user: Option<String>,

    /// Bearer token for the document service
    #[arg(long, global = true, env = "STUDY_SYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Command to run
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Show identity, connectivity and record counts
    Status,
    /// Mark an item done
    Done {
        /// Item id
        id: String,
    },
    /// Clear the done mark of an item
    Undo {
        /// Item id
        id: String,
    },
    /// Flip the done mark of an item
    Toggle {
        /// Item id
        id: String,
    },
    /// Flag a question
    Flag {
        /// Case the question belongs to
        case_id: String,
        /// Question number within the case
        question: u32,
        /// Note stored with the flag
        #[arg(long, default_value = "")]
        text: String,
    },
    /// Remove a question flag
    Unflag {
        /// Case the question belongs to
        case_id: String,
        /// Question number within the case
        question: u32,
    },
    /// Flip the flag on a whole case
    FlagCase {
        /// Case id
        case_id: String,
    },
    /// List the records of one domain
    List {
        /// Domain to list
        #[arg(value_enum, default_value_t = DomainArg::Completions)]
        domain: DomainArg,
    },
    /// Completion progress against a roster file
    Progress {
        /// JSON roster: {"category": ["item id", ...]}
        #[arg(long)]
        roster: PathBuf,
        /// Restrict to one category
        #[arg(long)]
        category: Option<String>,
    },
    /// Write a backup of every domain
    Export {
        /// Output file; stdout when omitted
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Merge a backup file into every domain it covers
    Import {
        /// Backup file produced by `export`
        file: PathBuf,
    },
    /// Delete records locally and, when signed in, remotely
    Clear {
        /// Domain to clear; every domain when omitted
        #[arg(value_enum)]
        domain: Option<DomainArg>,
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Reconcile every domain with the document service
    Sync,
    /// Discard the local mirrors of the signed-in identity
    SignOut,
}

/// Record domain selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DomainArg {
    /// Done items
    Completions,
    /// Question flags
    Flags,
    /// Case flags
    CaseFlags,
}

impl Cli {
    /// Environment configuration with the command-line overrides applied.
    #[must_use]
    pub fn config(&self) -> SyncConfig {
        let mut config = SyncConfig::from_env();
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(dir.clone());
        }
        if let Some(remote) = &self.remote {
            config.remote_url = Some(remote.clone());
        }
        config
    }

    /// Identity to sign in as, if a user was given.
    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        let user = self.user.as_deref().filter(|u| !u.trim().is_empty())?;
        let identity = Identity::new(user);
        Some(match &self.token {
            Some(token) => identity.with_token(token.clone()),
            None => identity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "study-sync",
            "done",
            "1_1",
            "--user",
            "u1",
            "--token",
            "secret",
        ])
        .expect("parse");
        assert!(matches!(cli.command, Command::Done { ref id } if id == "1_1"));
        let identity = cli.identity().expect("identity");
        assert_eq!(identity.uid, "u1");
        assert_eq!(identity.token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_blank_user_is_no_identity() {
        let cli = Cli::try_parse_from(["study-sync", "--user", " ", "status"]).expect("parse");
        assert!(cli.identity().is_none());
    }

    #[test]
    fn test_flag_arguments() {
        let cli = Cli::try_parse_from(["study-sync", "flag", "2_4", "3", "--text", "why?"])
            .expect("parse");
        match cli.command {
            Command::Flag {
                case_id,
                question,
                text,
            } => {
                assert_eq!(case_id, "2_4");
                assert_eq!(question, 3);
                assert_eq!(text, "why?");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_list_domain_values() {
        let cli = Cli::try_parse_from(["study-sync", "list", "case-flags"]).expect("parse");
        assert!(matches!(
            cli.command,
            Command::List {
                domain: DomainArg::CaseFlags
            }
        ));
        let cli = Cli::try_parse_from(["study-sync", "list"]).expect("parse");
        assert!(matches!(
            cli.command,
            Command::List {
                domain: DomainArg::Completions
            }
        ));
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::try_parse_from([
            "study-sync",
            "--data-dir",
            "/tmp/mirror",
            "--remote",
            "https://docs.example.com",
            "status",
        ])
        .expect("parse");
        let config = cli.config();
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/mirror")));
        assert_eq!(config.remote_url.as_deref(), Some("https://docs.example.com"));
    }
}
