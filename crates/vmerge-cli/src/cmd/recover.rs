use crate::cmd::Context;
use crate::output::{pretty_kv, render};
use anyhow::Result;
use clap::Args;
use std::io::Write as _;
use std::time::Duration;
use vmerge_core::merge::recovery::{self, RecoveryPolicy};

/// How long to wait for a concurrent sweep before giving up.
const SWEEP_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Args, Debug)]
pub struct RecoverArgs {
    /// Roll abandoned merges back instead of resuming them.
    #[arg(long)]
    pub rollback: bool,

    /// Only touch events idle for at least this many seconds.
    #[arg(long = "older-than-secs", default_value_t = 300)]
    pub older_than_secs: u64,
}

/// Sweep merge events a crash left in flight.
pub fn run_recover(args: &RecoverArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open()?;
    let orchestrator = ctx.orchestrator();
    orchestrator.authorize(&ctx.token()?)?;
    let policy = if args.rollback {
        RecoveryPolicy::RollBack
    } else {
        RecoveryPolicy::Resume
    };
    let report = recovery::sweep_store(
        &ctx.db,
        &conn,
        &orchestrator,
        policy,
        Duration::from_secs(args.older_than_secs),
        SWEEP_LOCK_TIMEOUT,
    )?;
    render(ctx.output, &report, |r, w| {
        pretty_kv(w, "examined", r.examined.to_string())?;
        pretty_kv(w, "completed", r.completed.len().to_string())?;
        pretty_kv(w, "rolled back", r.rolled_back.len().to_string())?;
        pretty_kv(w, "released", r.released.len().to_string())?;
        for (merge_id, reason) in &r.failed {
            writeln!(w, "  failed {merge_id}: {reason}")?;
        }
        Ok(())
    })
}
