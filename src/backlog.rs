//! In-memory buffer of due jobs for one job type.
//!
//! Entries are snapshots read from storage and are never written back. Claiming happens
//! against storage, so a stale entry only costs a lost claim.

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::job::Job;

type EntryKey = (DateTime<Utc>, Reverse<i32>, u64);

#[derive(Debug)]
pub struct Backlog {
    capacity: usize,
    low_water: usize,
    entries: BTreeMap<EntryKey, Job>,
    ids: HashSet<String>,
    next_seq: u64,
    last_refill: Option<DateTime<Utc>>,
}

impl Backlog {
    /// `low_water` is a fraction of `capacity`.
    pub fn new(capacity: usize, low_water: f64) -> Self {
        let capacity = capacity.max(1);
        let low_water = ((capacity as f64) * low_water).ceil() as usize;
        Self {
            capacity,
            low_water: low_water.clamp(1, capacity),
            entries: BTreeMap::new(),
            ids: HashSet::new(),
            next_seq: 0,
            last_refill: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Room left, used as the limit of the next storage read.
    pub fn spare(&self) -> usize {
        self.capacity - self.entries.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn last_refill(&self) -> Option<DateTime<Utc>> {
        self.last_refill
    }

    /// Below the low-water mark and not refilled within `min_interval`.
    pub fn needs_refill(&self, now: DateTime<Utc>, min_interval: Duration) -> bool {
        if self.entries.len() >= self.low_water {
            return false;
        }
        match self.last_refill {
            None => true,
            Some(at) => now
                .signed_duration_since(at)
                .to_std()
                .map(|elapsed| elapsed >= min_interval)
                .unwrap_or(false),
        }
    }

    /// Admits a freshly submitted job if it is already due and there is room.
    pub fn offer(&mut self, job: &Job, now: DateTime<Utc>) -> bool {
        if job.desired_run_time > now || self.spare() == 0 || self.ids.contains(&job.id) {
            return false;
        }
        self.push(job.clone());
        true
    }

    /// Appends jobs read from storage at `read_at`, skipping ids already buffered.
    ///
    /// Returns how many were added.
    pub fn refill(&mut self, jobs: Vec<Job>, read_at: DateTime<Utc>) -> usize {
        let mut added = 0;
        for job in jobs {
            if self.spare() == 0 {
                break;
            }
            if job.desired_run_time > read_at || self.ids.contains(&job.id) {
                continue;
            }
            self.push(job);
            added += 1;
        }
        self.last_refill = Some(read_at);
        added
    }

    /// Next entry by desired run time, then priority, then arrival order.
    pub fn take(&mut self, now: DateTime<Utc>) -> Option<Job> {
        let (key, _) = self.entries.first_key_value()?;
        if key.0 > now {
            return None;
        }
        let (_, job) = self.entries.pop_first()?;
        self.ids.remove(&job.id);
        Some(job)
    }

    /// Drops an entry, e.g. after the job was cancelled.
    pub fn remove(&mut self, id: &str) -> bool {
        if !self.ids.remove(id) {
            return false;
        }
        self.entries.retain(|_, job| job.id != id);
        true
    }

    fn push(&mut self, job: Job) {
        let key = (job.desired_run_time, Reverse(job.priority), self.next_seq);
        self.next_seq += 1;
        self.ids.insert(job.id.clone());
        self.entries.insert(key, job);
    }
}
