//! Persistent checkpoint storage using redb.
//!
//! # Table design
//!
//! `STEPS` maps a `u64` step id to the JSON-encoded [`Step`].
//!
//! `CHAIN` is the uniqueness index. Its key is a composite byte string:
//! ```text
//! [ stream: u8 | project_len: u16 BE | project bytes | previous: u64 BE | digest: 32 bytes ]
//! ```
//! One key per (project, stream, previous, fingerprint), so a second insert
//! at the same chain position is detected inside the same write transaction.
//! The previous-step id follows the project prefix directly, which makes the
//! children of any step a single range scan and every step of a stream a
//! wider one.
//!
//! `META` holds the step id counter. Ids only ever grow, and a step's
//! previous must already exist, so following `previous` links strictly
//! decreases the id and always reaches a root.

use std::collections::HashSet;
use std::fmt::Display;
use std::path::Path;

use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info, instrument, warn};

use super::fingerprint::Fingerprint;
use super::step::{Step, StepId, StepPayload, StreamTag};
use crate::error::{PilotError, Result};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const STEPS: TableDefinition<u64, &[u8]> = TableDefinition::new("steps");
const CHAIN: TableDefinition<&[u8], u64> = TableDefinition::new("chain");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_STEP_ID: &str = "next_step_id";
const DIGEST_LEN: usize = 32;

fn db_err(e: impl Display) -> PilotError {
    PilotError::CheckpointDb(e.to_string())
}

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn stream_prefix(project: &str, stream: StreamTag) -> Result<Vec<u8>> {
    let len = u16::try_from(project.len())
        .map_err(|_| db_err(format!("project id longer than {} bytes", u16::MAX)))?;
    let mut key = Vec::with_capacity(3 + project.len() + 8 + DIGEST_LEN);
    key.push(stream.as_byte());
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(project.as_bytes());
    Ok(key)
}

fn chain_key(
    project: &str,
    stream: StreamTag,
    previous: Option<StepId>,
    digest: &[u8],
) -> Result<Vec<u8>> {
    let mut key = stream_prefix(project, stream)?;
    key.extend_from_slice(&StepId::encode_previous(previous).to_be_bytes());
    key.extend_from_slice(digest);
    Ok(key)
}

/// The chain key a stored step was indexed under.
#[cfg(test)]
fn chain_key_of(step: &Step) -> Result<Vec<u8>> {
    let digest = hex::decode(&step.fingerprint).map_err(db_err)?;
    chain_key(&step.project, step.stream, step.previous, &digest)
}

/// Inclusive bounds covering every child of `parent`.
fn children_bounds(
    project: &str,
    stream: StreamTag,
    parent: StepId,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let lower = chain_key(project, stream, Some(parent), &[0x00; DIGEST_LEN])?;
    let upper = chain_key(project, stream, Some(parent), &[0xff; DIGEST_LEN])?;
    Ok((lower, upper))
}

/// Inclusive bounds covering every step of `stream` in `project`.
fn stream_bounds(project: &str, stream: StreamTag) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut lower = stream_prefix(project, stream)?;
    let mut upper = lower.clone();
    lower.extend_from_slice(&[0x00; 8 + DIGEST_LEN]);
    upper.extend_from_slice(&[0xff; 8 + DIGEST_LEN]);
    Ok((lower, upper))
}

// ---------------------------------------------------------------------------
// Table access helpers (shared by read and write transactions)
// ---------------------------------------------------------------------------

fn load_step(table: &impl ReadableTable<u64, &'static [u8]>, id: StepId) -> Result<Option<Step>> {
    match table.get(id.0).map_err(db_err)? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Ok(None),
    }
}

fn require_step(table: &impl ReadableTable<u64, &'static [u8]>, id: StepId) -> Result<Step> {
    load_step(table, id)?.ok_or(PilotError::StepNotFound(id))
}

/// All `(chain key, step id)` pairs within `lower..=upper`.
fn scan_chain(
    table: &impl ReadableTable<&'static [u8], u64>,
    lower: &[u8],
    upper: &[u8],
) -> Result<Vec<(Vec<u8>, StepId)>> {
    let mut entries = Vec::new();
    for entry in table.range(lower..=upper).map_err(db_err)? {
        let (k, v) = entry.map_err(db_err)?;
        entries.push((k.value().to_vec(), StepId(v.value())));
    }
    Ok(entries)
}

/// Ids on the path from `tip` back to its root, inclusive.
fn reachable_from(
    table: &impl ReadableTable<u64, &'static [u8]>,
    tip: StepId,
) -> Result<HashSet<StepId>> {
    let mut reachable = HashSet::new();
    let mut cursor = Some(tip);
    while let Some(id) = cursor {
        let step = require_step(table, id)?;
        if let Some(prev) = step.previous {
            if prev >= id {
                return Err(PilotError::BrokenChain(id));
            }
        }
        reachable.insert(id);
        cursor = step.previous;
    }
    Ok(reachable)
}

// ---------------------------------------------------------------------------
// CheckpointStore
// ---------------------------------------------------------------------------

/// Durable, parent-linked step history for every project and stream.
pub struct CheckpointStore {
    db: Database,
}

impl CheckpointStore {
    /// Open or create the redb database at `path`.
    ///
    /// Creates all tables if they don't already exist.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        // Ensure the tables exist before any reads
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(STEPS).map_err(db_err)?;
        wt.open_table(CHAIN).map_err(db_err)?;
        wt.open_table(META).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    /// Return the step stored at exactly (`previous`, `fingerprint`).
    ///
    /// The stored canonical identity is compared with the fingerprint's; a
    /// digest match with different identifying fields is reported as a miss.
    pub fn lookup(
        &self,
        project: &str,
        stream: StreamTag,
        previous: Option<StepId>,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Step>> {
        let key = chain_key(project, stream, previous, fingerprint.digest())?;
        let rt = self.db.begin_read().map_err(db_err)?;
        let chain = rt.open_table(CHAIN).map_err(db_err)?;
        let Some(id) = chain.get(key.as_slice()).map_err(db_err)?.map(|g| StepId(g.value()))
        else {
            return Ok(None);
        };
        let steps = rt.open_table(STEPS).map_err(db_err)?;
        let step = require_step(&steps, id)?;
        if step.identity != fingerprint.canonical() {
            warn!(
                step = %id,
                fingerprint = %step.fingerprint,
                "fingerprint matched but identifying fields differ, treating as miss"
            );
            return Ok(None);
        }
        Ok(Some(step))
    }

    /// Insert a new step as the child of `previous`.
    ///
    /// The stream is taken from the payload variant. Fails with
    /// [`PilotError::DuplicateStep`] if the chain position is already taken
    /// by the same identifying fields, and with
    /// [`PilotError::FingerprintCollision`] if it is taken by different ones.
    #[instrument(skip_all, fields(project = %project, stream = %payload.stream(), previous = ?previous))]
    pub fn append(
        &self,
        project: &str,
        previous: Option<StepId>,
        fingerprint: &Fingerprint,
        payload: StepPayload,
    ) -> Result<Step> {
        let stream = payload.stream();
        let key = chain_key(project, stream, previous, fingerprint.digest())?;

        let wt = self.db.begin_write().map_err(db_err)?;
        let step = {
            let mut steps = wt.open_table(STEPS).map_err(db_err)?;
            let mut chain = wt.open_table(CHAIN).map_err(db_err)?;
            let mut meta = wt.open_table(META).map_err(db_err)?;

            if let Some(prev) = previous {
                let parent = require_step(&steps, prev)?;
                if parent.project != project {
                    return Err(PilotError::StepNotFound(prev));
                }
                if parent.stream != stream {
                    return Err(PilotError::StreamMismatch {
                        step: prev,
                        expected: stream,
                        actual: parent.stream,
                    });
                }
            }

            let existing = chain
                .get(key.as_slice())
                .map_err(db_err)?
                .map(|g| StepId(g.value()));
            if let Some(existing) = existing {
                let stored = require_step(&steps, existing)?;
                if stored.identity == fingerprint.canonical() {
                    debug!(%existing, "step already recorded");
                    return Err(PilotError::DuplicateStep {
                        stream,
                        previous,
                        existing,
                    });
                }
                return Err(PilotError::FingerprintCollision {
                    stream,
                    fingerprint: fingerprint.hex(),
                });
            }

            let next = meta
                .get(NEXT_STEP_ID)
                .map_err(db_err)?
                .map(|g| g.value())
                .unwrap_or(1);
            meta.insert(NEXT_STEP_ID, next + 1).map_err(db_err)?;

            let step = Step {
                id: StepId(next),
                project: project.to_string(),
                stream,
                previous,
                fingerprint: fingerprint.hex(),
                identity: fingerprint.canonical().to_string(),
                payload,
                created_at: Utc::now(),
            };
            let value = serde_json::to_vec(&step)?;
            steps.insert(next, value.as_slice()).map_err(db_err)?;
            chain.insert(key.as_slice(), next).map_err(db_err)?;
            step
        };
        wt.commit().map_err(db_err)?;
        debug!(step = %step.id, "appended step");
        Ok(step)
    }

    /// Fetch a step by id.
    pub fn get(&self, id: StepId) -> Result<Step> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let steps = rt.open_table(STEPS).map_err(db_err)?;
        require_step(&steps, id)
    }

    /// Every step of `stream` in `project`, in id (creation) order.
    pub fn list_stream(&self, project: &str, stream: StreamTag) -> Result<Vec<Step>> {
        let (lower, upper) = stream_bounds(project, stream)?;
        let rt = self.db.begin_read().map_err(db_err)?;
        let chain = rt.open_table(CHAIN).map_err(db_err)?;
        let steps = rt.open_table(STEPS).map_err(db_err)?;

        let mut result = scan_chain(&chain, &lower, &upper)?
            .into_iter()
            .map(|(_, id)| require_step(&steps, id))
            .collect::<Result<Vec<_>>>()?;
        result.sort_by_key(|s| s.id);
        Ok(result)
    }

    /// Direct children of `id`, in id order.
    pub fn children(&self, id: StepId) -> Result<Vec<Step>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let steps = rt.open_table(STEPS).map_err(db_err)?;
        let chain = rt.open_table(CHAIN).map_err(db_err)?;
        let parent = require_step(&steps, id)?;
        let (lower, upper) = children_bounds(&parent.project, parent.stream, id)?;

        let mut result = scan_chain(&chain, &lower, &upper)?
            .into_iter()
            .map(|(_, child)| require_step(&steps, child))
            .collect::<Result<Vec<_>>>()?;
        result.sort_by_key(|s| s.id);
        Ok(result)
    }

    /// The chain from `id` back to its root, starting with `id` itself.
    pub fn path_to_root(&self, id: StepId) -> Result<Vec<Step>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let steps = rt.open_table(STEPS).map_err(db_err)?;

        let mut path = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let step = require_step(&steps, current)?;
            if let Some(prev) = step.previous {
                if prev >= current {
                    return Err(PilotError::BrokenChain(current));
                }
            }
            cursor = step.previous;
            path.push(step);
        }
        Ok(path)
    }

    /// Delete every step of `stream` in `project` that is not on the path
    /// from `tip` to the root. With no tip, the whole stream is cleared.
    ///
    /// Returns the number of steps deleted.
    #[instrument(skip(self))]
    pub fn prune_unreachable(
        &self,
        project: &str,
        stream: StreamTag,
        tip: Option<StepId>,
    ) -> Result<usize> {
        let (lower, upper) = stream_bounds(project, stream)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        let deleted = {
            let mut steps = wt.open_table(STEPS).map_err(db_err)?;
            let mut chain = wt.open_table(CHAIN).map_err(db_err)?;

            let reachable = match tip {
                Some(tip) => {
                    let tip_step = require_step(&steps, tip)?;
                    if tip_step.project != project {
                        return Err(PilotError::StepNotFound(tip));
                    }
                    if tip_step.stream != stream {
                        return Err(PilotError::StreamMismatch {
                            step: tip,
                            expected: stream,
                            actual: tip_step.stream,
                        });
                    }
                    reachable_from(&steps, tip)?
                }
                None => HashSet::new(),
            };

            let doomed: Vec<(Vec<u8>, StepId)> = scan_chain(&chain, &lower, &upper)?
                .into_iter()
                .filter(|(_, id)| !reachable.contains(id))
                .collect();
            for (key, id) in &doomed {
                chain.remove(key.as_slice()).map_err(db_err)?;
                steps.remove(id.0).map_err(db_err)?;
            }
            doomed.len()
        };
        wt.commit().map_err(db_err)?;
        if deleted > 0 {
            info!(deleted, "pruned unreachable steps");
        }
        Ok(deleted)
    }

    /// Delete every descendant of `id` (children, grandchildren, ...),
    /// keeping `id` itself.
    ///
    /// Returns the number of steps deleted.
    #[instrument(skip(self))]
    pub fn delete_descendants_after(&self, id: StepId) -> Result<usize> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let deleted = {
            let mut steps = wt.open_table(STEPS).map_err(db_err)?;
            let mut chain = wt.open_table(CHAIN).map_err(db_err)?;
            let root = require_step(&steps, id)?;

            let mut doomed: Vec<(Vec<u8>, StepId)> = Vec::new();
            let mut frontier = vec![id];
            while let Some(parent) = frontier.pop() {
                let (lower, upper) = children_bounds(&root.project, root.stream, parent)?;
                for (key, child) in scan_chain(&chain, &lower, &upper)? {
                    frontier.push(child);
                    doomed.push((key, child));
                }
            }
            for (key, child) in &doomed {
                chain.remove(key.as_slice()).map_err(db_err)?;
                steps.remove(child.0).map_err(db_err)?;
            }
            doomed.len()
        };
        wt.commit().map_err(db_err)?;
        if deleted > 0 {
            info!(deleted, "deleted descendant steps");
        }
        Ok(deleted)
    }

    /// Remove one step and its index entry. Test helper for corrupting chains.
    #[cfg(test)]
    fn remove_raw(&self, step: &Step) -> Result<()> {
        let key = chain_key_of(step)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut steps = wt.open_table(STEPS).map_err(db_err)?;
            let mut chain = wt.open_table(CHAIN).map_err(db_err)?;
            steps.remove(step.id.0).map_err(db_err)?;
            chain.remove(key.as_slice()).map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
