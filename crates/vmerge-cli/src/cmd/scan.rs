use crate::cmd::Context;
use crate::output::{pretty_kv, render};
use anyhow::Result;
use clap::Args;
use std::io::Write as _;
use vmerge_core::model::VendorId;
use vmerge_match::{scan_all, scan_vendor};

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Scan one vendor against the population instead of every pair.
    #[arg(long = "vendor", value_name = "ID")]
    pub vendor_id: Option<VendorId>,
}

/// Run the matcher and enqueue what it finds. Nothing is merged.
pub fn run_scan(args: &ScanArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open()?;
    let report = match args.vendor_id {
        Some(vendor_id) => scan_vendor(&conn, vendor_id, &ctx.config.matching)?,
        None => scan_all(&conn, &ctx.config.matching)?,
    };
    render(ctx.output, &report, |r, w| {
        pretty_kv(w, "scanned", r.scanned.to_string())?;
        pretty_kv(w, "candidates", format!("{} ({} exact key)", r.emitted, r.exact))?;
        pretty_kv(w, "enqueued", r.enqueued.len().to_string())?;
        pretty_kv(w, "already open", r.existing.len().to_string())?;
        for id in &r.enqueued {
            writeln!(w, "  new {id}")?;
        }
        Ok(())
    })
}
