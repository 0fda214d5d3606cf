use crate::cmd::Context;
use crate::cmd::vendor::write_key;
use crate::output::{pretty_kv, render};
use anyhow::{Context as _, Result, bail};
use clap::{Args, Subcommand};
use serde::Serialize;
use std::io::Write as _;
use vmerge_core::model::VendorId;
use vmerge_core::model::vendor::{KeyClaim, KeyRef, NewKey, VendorKey, VerificationStatus};
use vmerge_core::store::{self, KeyRegistration};

#[derive(Subcommand, Debug)]
pub enum KeyCommand {
    /// Map an external identifier to a vendor.
    ///
    /// A key already owned by another vendor is kept as a claim and never moved.
    Add(AddArgs),
    /// Set the verification status of a mapping, or of a vendor's claim.
    Verify(VerifyArgs),
}

#[derive(Args, Debug)]
pub struct AddArgs {
    pub vendor_id: VendorId,
    /// Source system (e.g. peoplesoft).
    pub system: String,
    /// Identifier inside that system.
    pub key: String,
    /// Mark the mapping as the vendor's primary record in that system.
    #[arg(long)]
    pub primary: bool,
    #[arg(long, default_value = "pending", value_parser = parse_status)]
    pub status: VerificationStatus,
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    pub system: String,
    pub key: String,
    #[arg(long, default_value = "verified", value_parser = parse_status)]
    pub status: VerificationStatus,
    /// Verify this vendor's claim on the key instead of the current mapping.
    #[arg(long = "claim-of", value_name = "VENDOR")]
    pub claim_of: Option<VendorId>,
}

fn parse_status(raw: &str) -> Result<VerificationStatus, String> {
    raw.parse().map_err(|err| format!("{err}"))
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum KeyView {
    Inserted { key: VendorKey },
    Refreshed { key: VendorKey },
    Claimed { owner: VendorId, claim: KeyClaim },
}

impl From<KeyRegistration> for KeyView {
    fn from(reg: KeyRegistration) -> Self {
        match reg {
            KeyRegistration::Inserted(key) => Self::Inserted { key },
            KeyRegistration::Refreshed(key) => Self::Refreshed { key },
            KeyRegistration::Claimed { owner, claim } => Self::Claimed { owner, claim },
        }
    }
}

pub fn run_key(command: &KeyCommand, ctx: &Context) -> Result<()> {
    match command {
        KeyCommand::Add(args) => run_add(args, ctx),
        KeyCommand::Verify(args) => run_verify(args, ctx),
    }
}

fn run_add(args: &AddArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open()?;
    let new = NewKey {
        key: KeyRef::new(&args.system, &args.key),
        is_primary_source: args.primary,
        verification_status: args.status,
    };
    let view = KeyView::from(
        store::register_key(&conn, args.vendor_id, &new)
            .with_context(|| format!("register {} for {}", new.key, args.vendor_id))?,
    );
    render(ctx.output, &view, |v, w| match v {
        KeyView::Inserted { key } => {
            write!(w, "added ")?;
            write_key(w, key)
        }
        KeyView::Refreshed { key } => {
            write!(w, "refreshed ")?;
            write_key(w, key)
        }
        KeyView::Claimed { owner, claim } => {
            pretty_kv(w, "claim", format!("#{}", claim.claim_id))?;
            pretty_kv(w, "key", format!("{}:{}", claim.source_system, claim.source_key))?;
            pretty_kv(w, "owned by", owner.to_string())
        }
    })
}

fn run_verify(args: &VerifyArgs, ctx: &Context) -> Result<()> {
    let conn = ctx.open()?;
    let key = KeyRef::new(&args.system, &args.key);
    if let Some(vendor_id) = args.claim_of {
        let Some(claim) = store::claims_for(&conn, vendor_id)?
            .into_iter()
            .find(|claim| claim.key_ref() == key)
        else {
            bail!("{vendor_id} has no claim on {key}");
        };
        store::set_claim_verification(&conn, claim.claim_id, args.status)?;
        let updated = KeyClaim {
            verification_status: args.status,
            ..claim
        };
        tracing::info!(%vendor_id, %key, status = %args.status, "claim verification changed");
        return render(ctx.output, &updated, |c, w| {
            writeln!(
                w,
                "claim #{} {}:{} [{}]",
                c.claim_id, c.source_system, c.source_key, c.verification_status
            )
        });
    }

    let updated = store::set_key_verification(&conn, &key, args.status)?;
    tracing::info!(%key, status = %args.status, "key verification changed");
    render(ctx.output, &updated, |k, w| write_key(w, k))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claimed_view_serializes_with_outcome_tag() {
        let view = KeyView::Claimed {
            owner: VendorId(1),
            claim: KeyClaim {
                claim_id: 4,
                vendor_id: VendorId(2),
                source_system: "coupa".into(),
                source_key: "CP-9".into(),
                verification_status: VerificationStatus::Pending,
                observed_at_us: 0,
            },
        };
        let json = serde_json::to_value(&view).expect("serialize");
        assert_eq!(json["outcome"], "claimed");
        assert_eq!(json["owner"], 1);
        assert_eq!(json["claim"]["claim_id"], 4);
    }

    #[test]
    fn status_parses_lowercase_names() {
        assert_eq!(parse_status("verified"), Ok(VerificationStatus::Verified));
        assert!(parse_status("Verified").is_err());
    }
}
