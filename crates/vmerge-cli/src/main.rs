#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use output::{CliError, OutputMode, render_error, resolve_output_mode};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    name = "vmerge",
    author,
    version,
    about = "vmerge: vendor identity resolution and merge engine",
    long_about = None
)]
struct Cli {
    /// Path to the vendor store.
    #[arg(long, global = true, env = "VMERGE_DB", default_value = "vmerge.sqlite3")]
    db: PathBuf,

    /// Engine config file. Defaults to vmerge.toml next to the store.
    #[arg(long, global = true, env = "VMERGE_CONFIG")]
    config: Option<PathBuf>,

    /// Actor recorded on every change and checked for merge permission.
    #[arg(long, global = true, env = "VMERGE_ACTOR")]
    actor: Option<String>,

    /// Output format.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    /// Shorthand for `--format json`.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Setup",
        about = "Create or migrate the vendor store",
        after_help = "EXAMPLES:\n    vmerge init --merge-actor steward@corp"
    )]
    Init(cmd::init::InitArgs),

    #[command(
        next_help_heading = "Identity",
        about = "Add, inspect, and edit vendors"
    )]
    Vendor {
        #[command(subcommand)]
        command: cmd::vendor::VendorCommand,
    },

    #[command(
        next_help_heading = "Identity",
        about = "Map external identifiers to vendors"
    )]
    Key {
        #[command(subcommand)]
        command: cmd::key::KeyCommand,
    },

    #[command(
        next_help_heading = "Identity",
        about = "Resolve vendor ids or keys to their canonical survivor",
        after_help = "EXAMPLES:\n    vmerge resolve v-2 v-7\n    vmerge resolve --key zycus ZY-200"
    )]
    Resolve(cmd::resolve::ResolveArgs),

    #[command(
        next_help_heading = "Stewardship",
        about = "Find duplicate candidates and add them to the review queue",
        after_help = "EXAMPLES:\n    vmerge scan\n    vmerge scan --vendor v-12"
    )]
    Scan(cmd::scan::ScanArgs),

    #[command(
        next_help_heading = "Stewardship",
        about = "Review, approve, and reject merge candidates"
    )]
    Queue {
        #[command(subcommand)]
        command: cmd::queue::QueueCommand,
    },

    #[command(
        next_help_heading = "Merges",
        about = "Run and inspect merges"
    )]
    Merge {
        #[command(subcommand)]
        command: cmd::merge::MergeCommand,
    },

    #[command(
        next_help_heading = "Merges",
        about = "Show the merge history of a vendor"
    )]
    History(cmd::history::HistoryArgs),

    #[command(
        next_help_heading = "Merges",
        about = "Resume or roll back merges left in flight by a crash",
        after_help = "EXAMPLES:\n    vmerge --actor ops recover --older-than-secs 600\n    vmerge --actor ops recover --rollback"
    )]
    Recover(cmd::recover::RecoverArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("VMERGE_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "vmerge=debug,info"
        } else {
            "vmerge=info,warn"
        })
    });

    let format = env::var("VMERGE_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    // stdout carries command output only.
    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn dispatch(cli: Cli, output: OutputMode) -> anyhow::Result<()> {
    let ctx = cmd::Context::new(cli.db, cli.config.as_deref(), cli.actor, output)?;
    match &cli.command {
        Commands::Init(args) => cmd::init::run_init(args, &ctx),
        Commands::Vendor { command } => cmd::vendor::run_vendor(command, &ctx),
        Commands::Key { command } => cmd::key::run_key(command, &ctx),
        Commands::Resolve(args) => cmd::resolve::run_resolve(args, &ctx),
        Commands::Scan(args) => cmd::scan::run_scan(args, &ctx),
        Commands::Queue { command } => cmd::queue::run_queue(command, &ctx),
        Commands::Merge { command } => cmd::merge::run_merge(command, &ctx),
        Commands::History(args) => cmd::history::run_history(args, &ctx),
        Commands::Recover(args) => cmd::recover::run_recover(args, &ctx),
    }
}

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let output = resolve_output_mode(cli.format, cli.json);

    match dispatch(cli, output) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::debug!(error = ?err, "command failed");
            if let Err(render_err) = render_error(output, &CliError::from(&err)) {
                eprintln!("error: {err:#} ({render_err})");
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use vmerge_core::model::candidate::CandidateStatus;
    use vmerge_core::model::vendor::VendorField;
    use vmerge_core::model::{CandidateId, MergeId, VendorId};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_work_after_the_subcommand() {
        let cli = Cli::parse_from([
            "vmerge",
            "scan",
            "--db",
            "/tmp/v.sqlite3",
            "--actor",
            "steward",
            "--json",
        ]);
        assert_eq!(cli.db, PathBuf::from("/tmp/v.sqlite3"));
        assert_eq!(cli.actor.as_deref(), Some("steward"));
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Scan(ref a) if a.vendor_id.is_none()));
    }

    #[test]
    fn vendor_add_parses_fields() {
        let cli = Cli::parse_from([
            "vmerge",
            "vendor",
            "add",
            "Globex Industrial Supplies",
            "--source",
            "peoplesoft",
            "--owner-org",
            "org-7",
        ]);
        let Commands::Vendor {
            command: cmd::vendor::VendorCommand::Add(args),
        } = cli.command else {
            panic!("expected vendor add");
        };
        assert_eq!(args.legal_name, "Globex Industrial Supplies");
        assert_eq!(args.source, "peoplesoft");
        assert_eq!(args.owner_org_id.as_deref(), Some("org-7"));
    }

    #[test]
    fn approve_accepts_prefixed_ids_and_overrides() {
        let cli = Cli::parse_from([
            "vmerge",
            "queue",
            "approve",
            "c-4",
            "--survivor",
            "v-1",
            "--set",
            "risk_tier=high",
            "--set",
            "display_name=",
        ]);
        let Commands::Queue {
            command: cmd::queue::QueueCommand::Approve(args),
        } = cli.command else {
            panic!("expected queue approve");
        };
        assert_eq!(args.candidate_id, CandidateId(4));
        assert_eq!(args.survivor, Some(VendorId(1)));
        assert_eq!(args.overrides.len(), 2);
        assert_eq!(args.overrides[0].field, VendorField::RiskTier);
        assert_eq!(args.overrides[1].value, None);
    }

    #[test]
    fn queue_list_filters() {
        let cli = Cli::parse_from(["vmerge", "queue", "list", "--status", "rejected", "--limit", "5"]);
        let Commands::Queue {
            command: cmd::queue::QueueCommand::List(args),
        } = cli.command else {
            panic!("expected queue list");
        };
        assert_eq!(args.status, Some(CandidateStatus::Rejected));
        assert_eq!(args.limit, Some(5));
    }

    #[test]
    fn unknown_override_field_is_rejected() {
        let parsed = Cli::try_parse_from(["vmerge", "queue", "approve", "c-1", "--set", "tax_id=9"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn resolve_takes_ids_or_a_key() {
        let ids = Cli::parse_from(["vmerge", "resolve", "v-2", "7"]);
        let Commands::Resolve(args) = ids.command else {
            panic!("expected resolve");
        };
        assert_eq!(args.vendor_ids, vec![VendorId(2), VendorId(7)]);

        let key = Cli::parse_from(["vmerge", "resolve", "--key", "zycus", "ZY-200"]);
        let Commands::Resolve(args) = key.command else {
            panic!("expected resolve");
        };
        assert_eq!(args.key, Some(vec!["zycus".to_string(), "ZY-200".to_string()]));

        assert!(Cli::try_parse_from(["vmerge", "resolve"]).is_err());
        assert!(Cli::try_parse_from(["vmerge", "resolve", "v-1", "--key", "a", "b"]).is_err());
    }

    #[test]
    fn merge_direct_requires_reason() {
        assert!(Cli::try_parse_from(["vmerge", "merge", "direct", "v-1", "v-2"]).is_err());
        let cli = Cli::parse_from(["vmerge", "merge", "direct", "v-1", "v-2", "--reason", "dup"]);
        assert!(matches!(
            cli.command,
            Commands::Merge {
                command: cmd::merge::MergeCommand::Direct(ref a)
            } if !a.propose_only
        ));
    }

    #[test]
    fn merge_show_parses_merge_id() {
        let cli = Cli::parse_from(["vmerge", "merge", "show", "m-3"]);
        let Commands::Merge {
            command: cmd::merge::MergeCommand::Show(args),
        } = cli.command else {
            panic!("expected merge show");
        };
        assert_eq!(args.merge_id, MergeId(3));
    }

    #[test]
    fn recover_defaults_to_resume() {
        let cli = Cli::parse_from(["vmerge", "recover"]);
        let Commands::Recover(args) = cli.command else {
            panic!("expected recover");
        };
        assert!(!args.rollback);
        assert_eq!(args.older_than_secs, 300);
    }
}
