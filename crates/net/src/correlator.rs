//! Request correlation
//!
//! Every outbound request that expects a reply gets a reference id. The
//! reply carries the same id back; the correlator hands it to whoever is
//! waiting. Entries leave the table exactly once: on reply, on timeout, or
//! when the connection fails them all.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Internal handshake steps that wait on a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    Authenticate,
    Announce(String),
    Snapshot,
}

/// Who receives the reply
#[derive(Debug)]
pub(crate) enum Completion {
    /// A facade caller suspended on `send`
    Caller(oneshot::Sender<Result<Value>>),
    /// The connection task itself
    Internal(Step),
}

/// One request awaiting its reply
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub reference: String,
    pub event: String,
    pub created_at: Instant,
    pub deadline: Instant,
    completion: Completion,
}

impl PendingRequest {
    /// Deliver the outcome. Caller completions are fulfilled here; internal
    /// ones are handed back for the connection task to act on.
    pub fn complete(self, result: Result<Value>) -> Option<(Step, Result<Value>)> {
        match self.completion {
            Completion::Caller(tx) => {
                // Caller may have given up (dropped its future)
                let _ = tx.send(result);
                None
            }
            Completion::Internal(step) => Some((step, result)),
        }
    }

    pub fn step(&self) -> Option<&Step> {
        match &self.completion {
            Completion::Internal(step) => Some(step),
            Completion::Caller(_) => None,
        }
    }
}

/// Table of outstanding requests keyed by reference id
#[derive(Debug, Default)]
pub(crate) struct Correlator {
    pending: HashMap<String, PendingRequest>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new request and return its reference id
    pub fn register(
        &mut self,
        event: impl Into<String>,
        completion: Completion,
        timeout: Duration,
    ) -> String {
        let mut reference = Uuid::new_v4().to_string();
        while self.pending.contains_key(&reference) {
            reference = Uuid::new_v4().to_string();
        }

        let now = Instant::now();
        self.pending.insert(
            reference.clone(),
            PendingRequest {
                reference: reference.clone(),
                event: event.into(),
                created_at: now,
                deadline: now + timeout,
                completion,
            },
        );
        reference
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.pending.contains_key(reference)
    }

    /// Remove the entry for a reply
    pub fn take(&mut self, reference: &str) -> Option<PendingRequest> {
        self.pending.remove(reference)
    }

    /// Complete the matching entry. Replies with no entry are late or
    /// duplicated and are ignored.
    pub fn resolve(
        &mut self,
        reference: &str,
        result: Result<Value>,
    ) -> Option<(Step, Result<Value>)> {
        match self.take(reference) {
            Some(entry) => {
                debug!(
                    reference = %reference,
                    event = %entry.event,
                    elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                    "Reply matched"
                );
                entry.complete(result)
            }
            None => {
                debug!(reference = %reference, "Reply with no pending request, ignoring");
                None
            }
        }
    }

    /// Fail every outstanding request and clear the table
    ///
    /// Returns the internal steps that were cut short.
    pub fn fail_all(&mut self, error: &Error) -> Vec<Step> {
        self.pending
            .drain()
            .filter_map(|(_, entry)| entry.complete(Err(error.clone())))
            .map(|(step, _)| step)
            .collect()
    }

    /// Remove and fail every entry whose deadline has passed
    ///
    /// Callers get `RequestTimeout`; timed out internal steps are returned.
    pub fn expire(&mut self, now: Instant) -> Vec<Step> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(reference, _)| reference.clone())
            .collect();

        let mut steps = Vec::new();
        for reference in expired {
            if let Some(entry) = self.pending.remove(&reference) {
                debug!(reference = %entry.reference, event = %entry.event, "Request timed out");
                let error = Error::RequestTimeout {
                    event: entry.event.clone(),
                };
                if let Some((step, _)) = entry.complete(Err(error)) {
                    steps.push(step);
                }
            }
        }
        steps
    }

    /// Earliest deadline among outstanding requests
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|entry| entry.deadline).min()
    }

    /// Whether any internal step is still outstanding
    pub fn has_internal(&self) -> bool {
        self.pending.values().any(|entry| entry.step().is_some())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
