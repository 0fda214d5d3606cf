//! Canonical resolution: any vendor id, old or new, to its current survivor.
//!
//! A [`Resolver`] is meant to live for one read transaction. Every vendor on
//! a walked chain is cached against the survivor, so no chain is walked
//! twice. Nothing is written back: absorbed rows keep their original
//! `merged_into_vendor_id`, and snapshots naming old ids stay valid.

use crate::config::ResolverConfig;
use crate::error::{ChainFault, MergeError, Result, ValidationError};
use crate::model::VendorId;
use crate::model::vendor::KeyRef;
use crate::store;
use rusqlite::{Connection, OptionalExtension as _};
use std::collections::{HashMap, HashSet};

pub struct Resolver<'c> {
    conn: &'c Connection,
    max_depth: usize,
    cache: HashMap<VendorId, VendorId>,
}

impl<'c> Resolver<'c> {
    #[must_use]
    pub fn new(conn: &'c Connection, max_depth: usize) -> Self {
        Self {
            conn,
            max_depth: max_depth.max(1),
            cache: HashMap::new(),
        }
    }

    #[must_use]
    pub fn from_config(conn: &'c Connection, config: &ResolverConfig) -> Self {
        Self::new(conn, config.max_chain_depth)
    }

    /// Resolve `vendor_id` to the canonical survivor of its chain.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::VendorNotFound`] if `vendor_id` does not exist
    /// - [`MergeError::CorruptMergeChain`] on a cycle, a chain longer than
    ///   the configured cap, or a pointer to a missing vendor
    pub fn resolve(&mut self, vendor_id: VendorId) -> Result<VendorId> {
        if let Some(survivor) = self.cache.get(&vendor_id) {
            return Ok(*survivor);
        }

        let mut chain = vec![vendor_id];
        let mut seen: HashSet<VendorId> = HashSet::from([vendor_id]);
        let mut current = vendor_id;

        let survivor = loop {
            let Some(parent) = self.parent_of(current)? else {
                if current == vendor_id {
                    return Err(ValidationError::VendorNotFound(vendor_id).into());
                }
                return Err(self.corrupt(vendor_id, chain, ChainFault::DanglingPointer));
            };

            let Some(next) = parent else {
                break current;
            };

            if let Some(known) = self.cache.get(&next) {
                break *known;
            }
            if !seen.insert(next) {
                chain.push(next);
                return Err(self.corrupt(vendor_id, chain, ChainFault::Cycle));
            }
            chain.push(next);
            if chain.len() > self.max_depth + 1 {
                let max_depth = self.max_depth;
                return Err(self.corrupt(vendor_id, chain, ChainFault::TooDeep { max_depth }));
            }
            current = next;
        };

        for member in chain {
            self.cache.insert(member, survivor);
        }
        Ok(survivor)
    }

    /// Resolve several ids, preserving order.
    ///
    /// # Errors
    ///
    /// Returns the first resolution error encountered.
    pub fn resolve_many(&mut self, vendor_ids: &[VendorId]) -> Result<Vec<VendorId>> {
        vendor_ids.iter().map(|id| self.resolve(*id)).collect()
    }

    /// Resolve the current owner of an external key to its survivor.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup or resolution fails.
    pub fn resolve_key(&mut self, key: &KeyRef) -> Result<Option<VendorId>> {
        match store::lookup_key(self.conn, key)? {
            Some(mapping) => self.resolve(mapping.vendor_id).map(Some),
            None => Ok(None),
        }
    }

    /// Number of cached id -> survivor entries.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// `None` when the vendor row is missing; `Some(None)` for a survivor.
    fn parent_of(&self, vendor_id: VendorId) -> Result<Option<Option<VendorId>>> {
        Ok(self
            .conn
            .query_row(
                "SELECT merged_into_vendor_id FROM vendor WHERE vendor_id = ?1",
                [vendor_id],
                |row| row.get::<_, Option<VendorId>>(0),
            )
            .optional()?)
    }

    fn corrupt(&self, vendor_id: VendorId, chain: Vec<VendorId>, fault: ChainFault) -> MergeError {
        tracing::error!(%vendor_id, ?chain, %fault, max_depth = self.max_depth, "corrupt merge chain");
        MergeError::CorruptMergeChain {
            vendor_id,
            chain,
            fault,
        }
    }
}

/// One-shot resolution without keeping a cache.
///
/// # Errors
///
/// See [`Resolver::resolve`].
pub fn resolve(conn: &Connection, vendor_id: VendorId, max_depth: usize) -> Result<VendorId> {
    Resolver::new(conn, max_depth).resolve(vendor_id)
}
