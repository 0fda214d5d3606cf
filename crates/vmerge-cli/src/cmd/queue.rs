use crate::cmd::merge::write_outcome;
use crate::cmd::{Context, parse_override};
use crate::output::{or_dash, pretty_kv, render, timestamp};
use anyhow::{Context as _, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use std::io::{self, Write};
use vmerge_core::config::QueueConfig;
use vmerge_core::model::candidate::{CandidateStatus, MergeCandidate};
use vmerge_core::model::merge::{FieldOverride, MergeMethod};
use vmerge_core::model::{CandidateId, VendorId, now_us};
use vmerge_core::queue::{self, ApproveOptions, CandidateFilter};

#[derive(Subcommand, Debug)]
pub enum QueueCommand {
    /// List queue entries, oldest first.
    List(ListArgs),
    /// Approve a pending entry and merge the pair now.
    #[command(after_help = "EXAMPLES:\n    vmerge --actor steward queue approve c-4 --survivor v-1 \\\n        --set risk_tier=high --reason \"same tax id\"")]
    Approve(ApproveArgs),
    /// Reject an entry. Rejecting twice is a no-op.
    Reject(RejectArgs),
    /// Return a rejected or expired entry to pending.
    Reopen(ReopenArgs),
    /// Expire pending entries untouched past the review SLA.
    Expire(ExpireArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long, value_parser = parse_candidate_status)]
    pub status: Option<CandidateStatus>,
    /// Entries where this vendor is either side of the pair.
    #[arg(long = "vendor", value_name = "ID")]
    pub vendor_id: Option<VendorId>,
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ApproveArgs {
    pub candidate_id: CandidateId,
    /// Vendor that survives. Defaults to the lower id of the pair.
    #[arg(long)]
    pub survivor: Option<VendorId>,
    #[arg(long, value_parser = parse_method)]
    pub method: Option<MergeMethod>,
    #[arg(long)]
    pub reason: Option<String>,
    /// Override the survivorship choice for a field (FIELD=VALUE, repeatable).
    #[arg(long = "set", value_name = "FIELD=VALUE", value_parser = parse_override)]
    pub overrides: Vec<FieldOverride>,
}

#[derive(Args, Debug)]
pub struct RejectArgs {
    pub candidate_id: CandidateId,
    #[arg(long)]
    pub reason: Option<String>,
}

#[derive(Args, Debug)]
pub struct ReopenArgs {
    pub candidate_id: CandidateId,
}

#[derive(Args, Debug)]
pub struct ExpireArgs {
    /// Review window in days. Defaults to `[queue] sla_days`.
    #[arg(long = "sla-days")]
    pub sla_days: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ExpireReport {
    sla_days: u32,
    expired: Vec<CandidateId>,
}

fn parse_candidate_status(raw: &str) -> Result<CandidateStatus, String> {
    raw.parse().map_err(|err| format!("{err}"))
}

fn parse_method(raw: &str) -> Result<MergeMethod, String> {
    raw.parse().map_err(|err| format!("{err}"))
}

pub fn run_queue(command: &QueueCommand, ctx: &Context) -> Result<()> {
    match command {
        QueueCommand::List(args) => run_list(args, ctx),
        QueueCommand::Approve(args) => run_approve(args, ctx),
        QueueCommand::Reject(args) => run_reject(args, ctx),
        QueueCommand::Reopen(args) => run_reopen(args, ctx),
        QueueCommand::Expire(args) => run_expire(args, ctx),
    }
}

fn run_list(args: &ListArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open()?;
    let entries = queue::list(
        &conn,
        &CandidateFilter {
            status: args.status,
            vendor_id: args.vendor_id,
            limit: args.limit,
        },
    )?;
    render(ctx.output, &entries, |list, w| {
        if list.is_empty() {
            return writeln!(w, "queue is empty");
        }
        for entry in list {
            write_row(w, entry)?;
        }
        Ok(())
    })
}

fn run_approve(args: &ApproveArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open()?;
    let orchestrator = ctx.orchestrator();
    let outcome = queue::approve(
        &conn,
        &orchestrator,
        &ctx.token()?,
        args.candidate_id,
        &ApproveOptions {
            survivor: args.survivor,
            method: args.method,
            reason: args.reason.clone(),
            overrides: args.overrides.clone(),
        },
    )
    .with_context(|| format!("approve {}", args.candidate_id))?;
    render(ctx.output, &outcome, |o, w| write_outcome(w, o))
}

fn run_reject(args: &RejectArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open()?;
    let entry = queue::reject(&conn, args.candidate_id, ctx.actor()?, args.reason.as_deref())?;
    render(ctx.output, &entry, |e, w| write_entry(w, e))
}

fn run_reopen(args: &ReopenArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open()?;
    let entry = queue::reopen(&conn, args.candidate_id, ctx.actor()?)?;
    render(ctx.output, &entry, |e, w| write_entry(w, e))
}

fn run_expire(args: &ExpireArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open()?;
    let sla_days = args.sla_days.unwrap_or(ctx.config.queue.sla_days);
    let sla = QueueConfig { sla_days }.sla();
    let report = ExpireReport {
        sla_days,
        expired: queue::expire_stale(&conn, now_us(), sla)?,
    };
    render(ctx.output, &report, |r, w| {
        pretty_kv(w, "sla", format!("{} days", r.sla_days))?;
        pretty_kv(w, "expired", r.expired.len().to_string())
    })
}

fn write_row(w: &mut dyn Write, e: &MergeCandidate) -> io::Result<()> {
    let auto = if e.auto_eligible { " auto" } else { "" };
    writeln!(
        w,
        "{:<6} {:<8} {} ~ {}  {:.2} {}{auto}",
        e.candidate_id.to_string(),
        e.status.as_str(),
        e.vendor_id_a,
        e.vendor_id_b,
        e.confidence_score,
        e.match_basis
    )
}

fn write_entry(w: &mut dyn Write, e: &MergeCandidate) -> io::Result<()> {
    pretty_kv(w, "candidate", e.candidate_id.to_string())?;
    pretty_kv(w, "pair", format!("{} ~ {}", e.vendor_id_a, e.vendor_id_b))?;
    pretty_kv(w, "status", e.status.as_str())?;
    pretty_kv(w, "basis", format!("{} {:.2}", e.match_basis, e.confidence_score))?;
    pretty_kv(w, "decided by", or_dash(e.decided_by.as_deref()))?;
    if let Some(at) = e.decided_at_us {
        pretty_kv(w, "decided at", timestamp(at))?;
    }
    pretty_kv(w, "note", or_dash(e.decision_note.as_deref()))?;
    pretty_kv(w, "reopened", e.reopen_count.to_string())
}
