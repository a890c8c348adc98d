//! Reconciliation engine.
//!
//! Folds three independently arriving inputs into the display list:
//!
//! - classification batches, which need an enrichment round-trip and replace
//!   the classification portion of the list when their response lands;
//! - pothole signals, which append a canned record immediately;
//! - polled snapshots, which replace the whole list.
//!
//! Enrichment responses may complete out of order. Every request carries a
//! sequence number and a response is applied only if its number is higher
//! than that of every response applied so far; anything else is stale and
//! dropped. Failed responses never move the watermark.
//!
//! A snapshot also drops pothole records appended since the previous poll.
//! That is the documented behavior: the snapshot is authoritative.
//!
//! The engine does no I/O. The controller issues the requests and feeds the
//! completions back in.

use crate::error::ServiceError;
use crate::transport::DetectionEvent;
use crate::SignRecord;

/// An enrichment request to issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentTicket {
    pub seq: u64,
    pub labels: Vec<String>,
}

/// What happened to an enrichment completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichmentOutcome {
    Applied { seq: u64, records: usize },
    /// A newer response was already applied. Not an error.
    Stale { seq: u64, applied: u64 },
    Failed { seq: u64, error: ServiceError },
}

#[derive(Debug, Default)]
pub struct ReconciliationEngine {
    classified: Vec<SignRecord>,
    potholes: Vec<SignRecord>,
    current_classes: Vec<String>,
    last_issued: u64,
    last_applied: u64,
    revision: u64,
}

impl ReconciliationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one stream event. Returns the enrichment request it requires,
    /// if any.
    pub fn apply_event(&mut self, event: DetectionEvent) -> Option<EnrichmentTicket> {
        match event {
            DetectionEvent::Classification(labels) => self.begin_enrichment(labels),
            DetectionEvent::Pothole(present) => {
                self.record_pothole(present);
                None
            }
        }
    }

    /// Record the batch as the current detection classes and allocate the
    /// next sequence number. Empty batches are ignored.
    pub fn begin_enrichment(&mut self, labels: Vec<String>) -> Option<EnrichmentTicket> {
        if labels.is_empty() {
            return None;
        }
        self.current_classes = labels.clone();
        self.last_issued += 1;
        self.revision += 1;
        Some(EnrichmentTicket {
            seq: self.last_issued,
            labels,
        })
    }

    pub fn complete_enrichment(
        &mut self,
        seq: u64,
        response: Result<Vec<SignRecord>, ServiceError>,
    ) -> EnrichmentOutcome {
        let records = match response {
            Ok(records) => records,
            Err(error) => return EnrichmentOutcome::Failed { seq, error },
        };
        if seq <= self.last_applied {
            return EnrichmentOutcome::Stale {
                seq,
                applied: self.last_applied,
            };
        }
        self.last_applied = seq;
        self.classified = records;
        self.revision += 1;
        EnrichmentOutcome::Applied {
            seq,
            records: self.classified.len(),
        }
    }

    pub fn record_pothole(&mut self, present: bool) {
        self.potholes.push(SignRecord::pothole(present));
        self.revision += 1;
    }

    /// Replace the whole display list with the authoritative snapshot.
    pub fn replace_with_snapshot(&mut self, snapshot: Vec<SignRecord>) {
        self.classified = snapshot;
        self.potholes.clear();
        self.revision += 1;
    }

    /// Classification portion followed by the pothole portion.
    pub fn display_list(&self) -> Vec<SignRecord> {
        self.classified
            .iter()
            .chain(self.potholes.iter())
            .cloned()
            .collect()
    }

    pub fn current_classes(&self) -> &[String] {
        &self.current_classes
    }

    /// Changes on every mutation of the display list or current classes.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }
}
