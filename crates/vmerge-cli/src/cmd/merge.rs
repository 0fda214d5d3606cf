use crate::cmd::{Context, parse_override};
use crate::output::{or_dash, pretty_kv, pretty_section, render, timestamp};
use anyhow::{Context as _, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use std::io::{self, Write};
use vmerge_core::MergeOutcome;
use vmerge_core::lineage;
use vmerge_core::merge::MergeRequest;
use vmerge_core::model::merge::{
    FieldOverride, MergeEvent, MergeMember, SurvivorshipDecision,
};
use vmerge_core::model::{MergeId, VendorId};

#[derive(Subcommand, Debug)]
pub enum MergeCommand {
    /// Merge two vendors without a queue entry.
    #[command(after_help = "EXAMPLES:\n    vmerge --actor admin merge direct v-1 v-2 --reason \"duplicate from import\"")]
    Direct(DirectArgs),
    /// Drive a proposed or interrupted merge on to completion.
    Run(RunArgs),
    /// Show a merge event with its members, snapshots, and decisions.
    Show(ShowArgs),
    /// Cancel a merge that has not captured snapshots yet.
    Cancel(CancelArgs),
}

#[derive(Args, Debug)]
pub struct DirectArgs {
    pub survivor: VendorId,
    pub absorbed: VendorId,
    #[arg(long)]
    pub reason: String,
    #[arg(long = "set", value_name = "FIELD=VALUE", value_parser = parse_override)]
    pub overrides: Vec<FieldOverride>,
    /// Stop after validation and locking; finish with `vmerge merge run`.
    #[arg(long = "propose-only")]
    pub propose_only: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    pub merge_id: MergeId,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    pub merge_id: MergeId,
}

#[derive(Args, Debug)]
pub struct CancelArgs {
    pub merge_id: MergeId,
}

#[derive(Debug, Serialize)]
struct SnapshotView {
    snapshot_id: i64,
    vendor_id: VendorId,
    role: String,
    digest: String,
    intact: Option<bool>,
    captured_at_us: i64,
}

#[derive(Debug, Serialize)]
struct MergeView {
    event: MergeEvent,
    members: Vec<MergeMember>,
    snapshots: Vec<SnapshotView>,
    decisions: Vec<SurvivorshipDecision>,
}

pub fn run_merge(command: &MergeCommand, ctx: &Context) -> Result<()> {
    match command {
        MergeCommand::Direct(args) => run_direct(args, ctx),
        MergeCommand::Run(args) => run_run(args, ctx),
        MergeCommand::Show(args) => run_show(args, ctx),
        MergeCommand::Cancel(args) => run_cancel(args, ctx),
    }
}

fn run_direct(args: &DirectArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open()?;
    let orchestrator = ctx.orchestrator();
    let token = ctx.token()?;
    let request = MergeRequest::manual(args.survivor, args.absorbed, args.reason.clone())
        .with_overrides(args.overrides.clone());

    if args.propose_only {
        let merge_id = orchestrator
            .propose(&conn, &token, &request)
            .with_context(|| format!("propose {} -> {}", args.absorbed, args.survivor))?;
        let event = lineage::require_event(&conn, merge_id)?;
        return render(ctx.output, &event, |e, w| write_event(w, e));
    }

    let outcome = orchestrator
        .execute_direct(&conn, &token, &request)
        .with_context(|| format!("merge {} -> {}", args.absorbed, args.survivor))?;
    render(ctx.output, &outcome, |o, w| write_outcome(w, o))
}

fn run_run(args: &RunArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open()?;
    let orchestrator = ctx.orchestrator();
    orchestrator.authorize(&ctx.token()?)?;
    let outcome = orchestrator
        .run(&conn, args.merge_id)
        .with_context(|| format!("run {}", args.merge_id))?;
    render(ctx.output, &outcome, |o, w| write_outcome(w, o))
}

fn run_show(args: &ShowArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open()?;
    let event = lineage::require_event(&conn, args.merge_id)?;
    let snapshots = lineage::snapshots(&conn, args.merge_id)?
        .into_iter()
        .map(|snapshot| -> vmerge_core::Result<SnapshotView> {
            Ok(SnapshotView {
                intact: lineage::verify_snapshot(&conn, snapshot.snapshot_id)?,
                snapshot_id: snapshot.snapshot_id,
                vendor_id: snapshot.vendor_id,
                role: snapshot.role.to_string(),
                digest: snapshot.digest,
                captured_at_us: snapshot.captured_at_us,
            })
        })
        .collect::<vmerge_core::Result<Vec<_>>>()?;
    let view = MergeView {
        members: lineage::members(&conn, args.merge_id)?,
        decisions: lineage::decisions(&conn, args.merge_id)?,
        event,
        snapshots,
    };

    render(ctx.output, &view, |v, w| {
        write_event(w, &v.event)?;
        writeln!(w)?;
        pretty_section(w, "Members")?;
        for member in &v.members {
            let keys: Vec<String> = member.pre_merge_keys.iter().map(ToString::to_string).collect();
            writeln!(w, "{:<9} {}  keys: {}", member.role.as_str(), member.vendor_id, keys.join(", "))?;
        }
        if !v.snapshots.is_empty() {
            writeln!(w)?;
            pretty_section(w, "Snapshots")?;
            for s in &v.snapshots {
                let state = match s.intact {
                    Some(true) => "intact",
                    Some(false) => "DIGEST MISMATCH",
                    None => "missing",
                };
                writeln!(w, "#{:<5} {:<9} {} {state}", s.snapshot_id, s.role, s.vendor_id)?;
            }
        }
        write_decisions(w, &v.decisions)
    })
}

fn run_cancel(args: &CancelArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open()?;
    let orchestrator = ctx.orchestrator();
    let token = ctx.token()?;
    orchestrator.authorize(&token)?;
    let event = orchestrator.cancel(&conn, args.merge_id, &token.actor)?;
    render(ctx.output, &event, |e, w| write_event(w, e))
}

pub(crate) fn write_event(w: &mut dyn Write, e: &MergeEvent) -> io::Result<()> {
    pretty_kv(w, "merge", e.merge_id.to_string())?;
    pretty_kv(w, "status", e.status.to_string())?;
    pretty_kv(
        w,
        "pair",
        format!("{} -> {}", e.absorbed_vendor_id, e.survivor_vendor_id),
    )?;
    pretty_kv(w, "method", e.merge_method.as_str())?;
    pretty_kv(w, "reason", &e.merge_reason)?;
    pretty_kv(w, "actor", &e.actor)?;
    if let Some(candidate) = e.originating_candidate_id {
        pretty_kv(w, "candidate", candidate.to_string())?;
    }
    if let Some(failed) = e.failed_state {
        pretty_kv(
            w,
            "failed in",
            format!("{failed}: {}", or_dash(e.failure_reason.as_deref())),
        )?;
    }
    pretty_kv(w, "started", timestamp(e.started_at_us))?;
    match e.completed_at_us {
        Some(at) => pretty_kv(w, "completed", timestamp(at)),
        None => pretty_kv(w, "updated", timestamp(e.updated_at_us)),
    }
}

pub(crate) fn write_outcome(w: &mut dyn Write, o: &MergeOutcome) -> io::Result<()> {
    pretty_kv(w, "merge", o.merge_id.to_string())?;
    pretty_kv(w, "status", o.status.to_string())?;
    pretty_kv(w, "survivor", o.survivor.to_string())?;
    pretty_kv(w, "absorbed", o.absorbed.to_string())?;
    pretty_kv(
        w,
        "repointed",
        format!(
            "{} keys, {} claims, {} dependent rows",
            o.repoint.keys,
            o.repoint.claims,
            o.repoint.dependent_rows()
        ),
    )?;
    write_decisions(w, &o.decisions)
}

fn write_decisions(w: &mut dyn Write, decisions: &[SurvivorshipDecision]) -> io::Result<()> {
    if decisions.is_empty() {
        return Ok(());
    }
    writeln!(w)?;
    pretty_section(w, "Survivorship")?;
    for d in decisions {
        writeln!(
            w,
            "{:<16} {:<24} from {} ({})",
            d.field.as_str(),
            or_dash(d.chosen_value.as_deref()),
            d.chosen_vendor_id,
            d.decision_method
        )?;
    }
    Ok(())
}
