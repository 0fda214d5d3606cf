use crate::cmd::Context;
use crate::output::{pretty_kv, render, timestamp};
use anyhow::Result;
use clap::Args;
use serde::Serialize;
use std::io::Write as _;
use vmerge_core::lineage;
use vmerge_core::model::VendorId;
use vmerge_core::model::merge::MergeEvent;
use vmerge_core::resolver::Resolver;
use vmerge_core::store;

#[derive(Args, Debug)]
pub struct HistoryArgs {
    pub vendor_id: VendorId,
}

#[derive(Debug, Serialize)]
struct History {
    vendor_id: VendorId,
    canonical_vendor_id: VendorId,
    events: Vec<MergeEvent>,
}

/// Every merge event the vendor took part in, on either side.
pub fn run_history(args: &HistoryArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open()?;
    store::require_vendor(&conn, args.vendor_id)?;
    let history = History {
        vendor_id: args.vendor_id,
        canonical_vendor_id: Resolver::from_config(&conn, &ctx.config.resolver)
            .resolve(args.vendor_id)?,
        events: lineage::history_for_vendor(&conn, args.vendor_id)?,
    };
    render(ctx.output, &history, |h, w| {
        pretty_kv(w, "vendor", h.vendor_id.to_string())?;
        pretty_kv(w, "canonical", h.canonical_vendor_id.to_string())?;
        if h.events.is_empty() {
            return writeln!(w, "no merges");
        }
        writeln!(w)?;
        for e in &h.events {
            writeln!(
                w,
                "{:<6} {:<22} {} -> {}  by {} at {}",
                e.merge_id.to_string(),
                e.status.to_string(),
                e.absorbed_vendor_id,
                e.survivor_vendor_id,
                e.actor,
                timestamp(e.started_at_us)
            )?;
        }
        Ok(())
    })
}
