use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::types::ChangePayload;

/// Receiving side of a change feed, owned by the single consuming task.
pub type ChangeReceiver = mpsc::Receiver<RelationChange>;

/// A change tagged with the relation (producer) it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationChange {
    pub relation: String,
    pub change: ChangePayload,
}

/// Errors returned by change feed producers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChangeFeedError {
    /// The consumer has gone away.
    #[error("change feed consumer is closed")]
    Closed,
    /// The consumer is behind; the change was dropped.
    #[error("change feed is full, change for '{0}' dropped")]
    Full(String),
}

/// Fan-in channel: one producer per subscribed relation, one consumer.
#[derive(Clone, Debug)]
pub struct ChangeFeed {
    tx: mpsc::Sender<RelationChange>,
}

impl ChangeFeed {
    /// Create a feed and return it with its receiver.
    pub fn new(buffer: usize) -> (Self, ChangeReceiver) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    /// Producer handle bound to one relation.
    pub fn producer(&self, relation: impl Into<String>) -> ChangeProducer {
        ChangeProducer {
            relation: relation.into(),
            tx: self.tx.clone(),
        }
    }
}

/// Sending half bound to one relation. Sends never block, so it can be used
/// from synchronous payload callbacks.
#[derive(Clone, Debug)]
pub struct ChangeProducer {
    relation: String,
    tx: mpsc::Sender<RelationChange>,
}

impl ChangeProducer {
    pub fn relation(&self) -> &str {
        &self.relation
    }

    pub fn push(&self, change: ChangePayload) -> Result<(), ChangeFeedError> {
        let tagged = RelationChange {
            relation: self.relation.clone(),
            change,
        };
        self.tx.try_send(tagged).map_err(|err| match err {
            TrySendError::Full(_) => ChangeFeedError::Full(self.relation.clone()),
            TrySendError::Closed(_) => ChangeFeedError::Closed,
        })
    }
}
