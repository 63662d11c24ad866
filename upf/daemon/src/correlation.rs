//! Correlation Store
//!
//! Maps PFCP sessions to the GTP-U TEIDs they own. The forward map
//! (SEID -> session) and the reverse index (TEID -> SEID) sit behind one
//! `RwLock`, so every upsert or removal is a single write and readers
//! never see one map updated without the other.
//!
//! Invariant: every TEID in the reverse index belongs to a session whose
//! TEID list contains it, every TEID of every session is indexed, and a
//! TEID belongs to at most one session.

use crate::types::{SessionContext, SessionSnapshot};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::{
    collections::{HashMap, HashSet},
    net::Ipv4Addr,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

/// A PFCP session and the tunnels it owns
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub seid: u64,
    pub ue_ip: Option<Ipv4Addr>,
    /// Destination address of the establishment request
    pub upf_ip: Option<Ipv4Addr>,
    pub teids: Vec<u32>,
    pub created_at: DateTime<Utc>,
    pub modified_at: Option<DateTime<Utc>>,
    pub pdr_count: u32,
    pub far_count: u32,
}

impl Session {
    pub fn new(seid: u64) -> Self {
        Self {
            seid,
            ue_ip: None,
            upf_ip: None,
            teids: Vec::new(),
            created_at: Utc::now(),
            modified_at: None,
            pdr_count: 0,
            far_count: 0,
        }
    }

    /// Fields attached to enriched kernel events
    pub fn context(&self) -> SessionContext {
        SessionContext {
            seid: self.seid,
            ue_ip: self.ue_ip,
            created_at: self.created_at,
        }
    }

    /// Latest control-plane activity
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.modified_at.unwrap_or(self.created_at).max(self.created_at)
    }

    /// Snapshot without traffic counts
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            seid: self.seid,
            ue_ip: self.ue_ip,
            upf_ip: self.upf_ip,
            teids: self.teids.clone(),
            created_at: self.created_at,
            modified_at: self.modified_at,
            pdr_count: self.pdr_count,
            far_count: self.far_count,
            packets_ul: 0,
            bytes_ul: 0,
            packets_dl: 0,
            bytes_dl: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Index {
    sessions: HashMap<u64, Session>,
    teids: HashMap<u32, u64>,
}

impl Index {
    fn insert(&mut self, mut session: Session) {
        session.teids = normalise_teids(&session.teids);
        let seid = session.seid;

        if let Some(previous) = self.sessions.get(&seid) {
            let stale: Vec<u32> = previous
                .teids
                .iter()
                .copied()
                .filter(|teid| !session.teids.contains(teid))
                .collect();
            for teid in stale {
                self.teids.remove(&teid);
            }
        }

        for &teid in &session.teids {
            if let Some(owner) = self.teids.insert(teid, seid) {
                if owner != seid {
                    warn!(
                        "TEID 0x{:08x} moved from session 0x{:x} to 0x{:x}",
                        teid, owner, seid
                    );
                    if let Some(prev) = self.sessions.get_mut(&owner) {
                        prev.teids.retain(|t| *t != teid);
                    }
                }
            }
        }

        self.sessions.insert(seid, session);
    }

    fn unindex(&mut self, seid: u64) -> Option<Session> {
        let session = self.sessions.get(&seid)?;
        for teid in &session.teids {
            if self.teids.get(teid) == Some(&seid) {
                self.teids.remove(teid);
            }
        }
        self.sessions.remove(&seid)
    }
}

/// Thread-safe SEID <-> TEID correlation
#[derive(Debug, Default)]
pub struct CorrelationStore {
    inner: RwLock<Index>,
}

/// Drop zero and repeated TEIDs, keeping first-seen order
fn normalise_teids(teids: &[u32]) -> Vec<u32> {
    let mut seen = HashSet::with_capacity(teids.len());
    teids
        .iter()
        .copied()
        .filter(|teid| *teid != 0 && seen.insert(*teid))
        .collect()
}

impl CorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Index> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Index> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace a session together with its full TEID set
    ///
    /// The supplied TEID list is authoritative: TEIDs previously owned by
    /// this session but absent from the list are unindexed. A TEID owned by
    /// another session moves to this one.
    pub fn upsert(&self, session: Session) {
        self.write().insert(session);
    }

    /// Update an existing session in place
    ///
    /// `update` runs under the write lock, so a concurrent removal cannot
    /// interleave with the read-merge-write. Returns `None` without calling
    /// `update` when the SEID is unknown.
    pub fn modify<F, R>(&self, seid: u64, update: F) -> Option<R>
    where
        F: FnOnce(&mut Session) -> R,
    {
        let mut index = self.write();
        let mut session = index.sessions.get(&seid)?.clone();
        let result = update(&mut session);
        session.seid = seid;
        index.insert(session);
        Some(result)
    }

    /// Remove a session and every TEID it owns
    ///
    /// Removing an unknown SEID is a no-op.
    pub fn remove(&self, seid: u64) -> Option<Session> {
        self.write().unindex(seid)
    }

    pub fn get(&self, seid: u64) -> Option<Session> {
        self.read().sessions.get(&seid).cloned()
    }

    pub fn get_by_teid(&self, teid: u32) -> Option<Session> {
        let index = self.read();
        let seid = index.teids.get(&teid)?;
        index.sessions.get(seid).cloned()
    }

    /// Session context for enrichment, without cloning the TEID list
    pub fn context_for_teid(&self, teid: u32) -> Option<SessionContext> {
        if teid == 0 {
            return None;
        }
        let index = self.read();
        let seid = index.teids.get(&teid)?;
        index.sessions.get(seid).map(Session::context)
    }

    /// All sessions, ordered by SEID
    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.read().sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.seid);
        sessions
    }

    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of indexed TEIDs
    pub fn teid_count(&self) -> usize {
        self.read().teids.len()
    }

    /// Remove sessions with no activity since `cutoff`
    ///
    /// A session is active if its control-plane timestamps or the last
    /// kernel update of any of its TEIDs (`teid_activity`) is at or after
    /// the cutoff. Returns the removed SEIDs.
    pub fn remove_idle(
        &self,
        cutoff: DateTime<Utc>,
        teid_activity: &HashMap<u32, DateTime<Utc>>,
    ) -> Vec<u64> {
        let mut index = self.write();

        let idle: Vec<u64> = index
            .sessions
            .values()
            .filter(|session| {
                let traffic = session
                    .teids
                    .iter()
                    .filter_map(|teid| teid_activity.get(teid))
                    .max()
                    .copied();
                let last = match traffic {
                    Some(seen) => seen.max(session.last_activity()),
                    None => session.last_activity(),
                };
                last < cutoff
            })
            .map(|session| session.seid)
            .collect();

        for seid in &idle {
            debug!("Reclaiming idle session 0x{:x}", seid);
            index.unindex(*seid);
        }
        idle
    }

    /// Check the forward map and reverse index agree
    pub fn is_consistent(&self) -> bool {
        let index = self.read();

        let reverse_ok = index.teids.iter().all(|(teid, seid)| {
            index
                .sessions
                .get(seid)
                .is_some_and(|session| session.teids.contains(teid))
        });
        let forward_ok = index.sessions.values().all(|session| {
            session
                .teids
                .iter()
                .all(|teid| index.teids.get(teid) == Some(&session.seid))
        });
        reverse_ok && forward_ok
    }
}
