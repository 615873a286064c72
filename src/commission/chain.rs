//! Sponsor Chain Walker
//!
//! Produces the upline of a starting account one level at a time. The walk
//! is an explicit loop over a cursor, hard-capped at `max_levels` (and never
//! more than `MAX_SUPPORTED_LEVELS`), so a corrupted cyclic sponsor chain
//! still terminates.

use super::schedule::MAX_SUPPORTED_LEVELS;
use crate::models::{Account, AccountId};
use crate::store::AccountDirectory;
use thiserror::Error;

/// One ancestor in the upline.
///
/// `account` is the ancestor's directory record, `None` when the sponsor
/// reference points at an account that does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLink {
    pub level: u32,
    pub account_id: AccountId,
    pub account: Option<Account>,
}

/// A directory read failed mid-walk. The walk is over.
///
/// `level` is the level the failed account would have been emitted at
/// (0 for the starting account itself).
#[derive(Error, Debug)]
#[error("directory read failed for {account_id} at level {level}: {cause:#}")]
pub struct ChainReadError {
    pub level: u32,
    pub account_id: AccountId,
    pub cause: anyhow::Error,
}

/// Lazy, bounded cursor over `(level, ancestor)` pairs.
pub struct SponsorChainWalker<'a> {
    directory: &'a dyn AccountDirectory,
    start_id: AccountId,
    /// Sponsor reference of the last account read; `None` once the top is reached
    next_sponsor: Option<AccountId>,
    next_level: u32,
    max_levels: u32,
    started: bool,
    finished: bool,
}

impl<'a> SponsorChainWalker<'a> {
    pub fn new(directory: &'a dyn AccountDirectory, start_id: &str, max_levels: u32) -> Self {
        Self {
            directory,
            start_id: start_id.to_string(),
            next_sponsor: None,
            next_level: 1,
            max_levels: max_levels.min(MAX_SUPPORTED_LEVELS),
            started: false,
            finished: false,
        }
    }

    /// Advance one level. `Ok(None)` once the chain top or the level cap is
    /// reached; a read error also ends the walk.
    pub async fn next(&mut self) -> Result<Option<ChainLink>, ChainReadError> {
        if self.finished {
            return Ok(None);
        }

        if !self.started {
            self.started = true;
            let start_id = self.start_id.clone();
            let start = self.read(&start_id, 0).await?;
            self.next_sponsor = start.and_then(|a| a.sponsor_id);
        }

        if self.next_level > self.max_levels {
            self.finished = true;
            return Ok(None);
        }

        let Some(ancestor_id) = self.next_sponsor.take() else {
            self.finished = true;
            return Ok(None);
        };

        let account = self.read(&ancestor_id, self.next_level).await?;
        self.next_sponsor = account.as_ref().and_then(|a| a.sponsor_id.clone());

        let link = ChainLink {
            level: self.next_level,
            account_id: ancestor_id,
            account,
        };
        self.next_level += 1;
        Ok(Some(link))
    }

    /// Drain the remaining links.
    pub async fn collect(mut self) -> Result<Vec<ChainLink>, ChainReadError> {
        let mut out = Vec::new();
        while let Some(link) = self.next().await? {
            out.push(link);
        }
        Ok(out)
    }

    async fn read(&mut self, id: &str, level: u32) -> Result<Option<Account>, ChainReadError> {
        self.directory.account(id).await.map_err(|cause| {
            self.finished = true;
            ChainReadError {
                level,
                account_id: id.to_string(),
                cause,
            }
        })
    }
}
