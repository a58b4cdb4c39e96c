//! Distribution Engine
//!
//! Maps one arrived [`Envelope`] to zero or more webhook deliveries.
//!
//! # Reverse matching
//!
//! Subscription patterns are never compiled or evaluated against the arrived
//! topic. Instead the engine constructs every key that could match the topic
//! and probes the [`SubscriptionTable`] for each one:
//!
//! ```text
//! topic "home/kitchen/light"
//!   1. home/kitchen/light      (exact)
//!   2. home/kitchen/#
//!   3. home/#
//!   4. #
//! ```
//!
//! Every hit is dispatched, in exactly that order. The cost is proportional
//! to the depth of the topic, independent of the number of subscriptions.
//! Single-level wildcards (`+`) are never constructed and so never match.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::envelope::Envelope;
use crate::metrics::Metrics;
use crate::subscription::{SubscriptionDefinition, SubscriptionTable};


/// Multi-level wildcard key probed once no `/` boundary remains
pub const ROOT_WILDCARD: &str = "#";

/// Receiver of matched (pattern, envelope) pairs.
///
/// Implementations contain their own failures: the engine never observes
/// an error from a dispatch and always continues with the next match.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(
        &self,
        pattern: &str,
        definition: &SubscriptionDefinition,
        envelope: &Envelope,
    );
}

#[async_trait]
impl<D: Dispatch + ?Sized> Dispatch for Arc<D> {
    async fn dispatch(
        &self,
        pattern: &str,
        definition: &SubscriptionDefinition,
        envelope: &Envelope,
    ) {
        (**self).dispatch(pattern, definition, envelope).await
    }
}

/// Candidate keys for a topic, most specific first.
pub fn candidate_patterns(topic: &str) -> CandidatePatterns<'_> {
    CandidatePatterns {
        topic,
        stage: Stage::Exact,
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Exact,
    /// Scanning for `/` boundaries left of this byte offset
    Ancestors(usize),
    Done,
}

/// Iterator over the table keys probed for one topic.
///
/// Yields the topic itself, then `prefix/#` for every `/` boundary from right
/// to left, and finally the bare `#`.
#[derive(Debug, Clone)]
pub struct CandidatePatterns<'a> {
    topic: &'a str,
    stage: Stage,
}

impl<'a> Iterator for CandidatePatterns<'a> {
    type Item = Cow<'a, str>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.stage {
            Stage::Exact => {
                self.stage = Stage::Ancestors(self.topic.len());
                Some(Cow::Borrowed(self.topic))
            }
            Stage::Ancestors(end) => match self.topic[..end].rfind('/') {
                Some(boundary) => {
                    self.stage = Stage::Ancestors(boundary);
                    Some(Cow::Owned(format!("{}/#", &self.topic[..boundary])))
                }
                None => {
                    self.stage = Stage::Done;
                    Some(Cow::Borrowed(ROOT_WILDCARD))
                }
            },
            Stage::Done => None,
        }
    }
}

/// The subscription distribution engine
pub struct DistributionEngine<D> {
    table: Arc<SubscriptionTable>,
    dispatcher: D,
    metrics: Arc<Metrics>,
}

impl<D: Dispatch> DistributionEngine<D> {
    pub fn new(table: Arc<SubscriptionTable>, dispatcher: D, metrics: Arc<Metrics>) -> Self {
        Self {
            table,
            dispatcher,
            metrics,
        }
    }

    pub fn table(&self) -> &SubscriptionTable {
        &self.table
    }

    /// Dispatch the envelope to every matching subscription.
    ///
    /// Returns the number of dispatches performed.
    pub async fn distribute(&self, envelope: &Envelope) -> usize {
        self.metrics.message_received();

        let mut dispatched = 0;
        for candidate in candidate_patterns(envelope.topic()) {
            match self.table.get(&candidate) {
                Some(definition) => {
                    self.dispatcher
                        .dispatch(&candidate, definition, envelope)
                        .await;
                    dispatched += 1;
                }
                None => trace!("Discarded subscription topic: {}", candidate),
            }
        }

        if dispatched == 0 {
            self.metrics.message_unmatched();
            debug!("No subscription matched topic '{}'", envelope.topic());
        }

        dispatched
    }
}

/// Body of the message-handling task.
///
/// Envelopes are distributed one at a time, each running to completion
/// before the next is taken from the channel. Returns when every sender has
/// been dropped.
pub async fn run_distribution<D: Dispatch>(
    engine: DistributionEngine<D>,
    mut rx: mpsc::Receiver<Envelope>,
) {
    info!(
        "Distribution started with {} subscription(s)",
        engine.table().len()
    );

    while let Some(envelope) = rx.recv().await {
        engine.distribute(&envelope).await;
    }

    info!("Distribution stopped");
}
