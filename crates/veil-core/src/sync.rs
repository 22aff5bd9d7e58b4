//! Sync maps and transfer planning.
//!
//! A [`SyncMap`] records, per sender, the newest message timestamp a node
//! holds. Comparing our log against a peer's map yields exactly the
//! messages the peer lacks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use veil_shared::{Fingerprint, Message, Timestamp};

/// `sender -> newest timestamp held`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMap(BTreeMap<Fingerprint, Timestamp>);

impl SyncMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, sender: &Fingerprint) -> Option<Timestamp> {
        self.0.get(sender).copied()
    }

    /// Raise the entry for `sender` to `timestamp`. Entries never move back.
    /// Returns whether the map changed.
    pub fn advance(&mut self, sender: &Fingerprint, timestamp: Timestamp) -> bool {
        match self.0.get_mut(sender) {
            Some(current) if *current >= timestamp => false,
            Some(current) => {
                *current = timestamp;
                true
            }
            None => {
                self.0.insert(sender.clone(), timestamp);
                true
            }
        }
    }

    /// Pointwise maximum with `other`.
    pub fn merge(&mut self, other: &SyncMap) {
        for (sender, ts) in &other.0 {
            self.advance(sender, *ts);
        }
    }

    /// True when every entry of `other` is matched or exceeded here.
    pub fn covers(&self, other: &SyncMap) -> bool {
        other
            .0
            .iter()
            .all(|(sender, ts)| self.get(sender).is_some_and(|own| own >= *ts))
    }

    /// Whether a peer advertising this map lacks `message`.
    pub fn is_missing(&self, message: &Message) -> bool {
        self.get(&message.sender)
            .map_or(true, |held| held < message.timestamp)
    }

    /// Newest timestamp across all senders.
    pub fn latest(&self) -> Option<Timestamp> {
        self.0.values().max().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Fingerprint, &Timestamp)> {
        self.0.iter()
    }
}

/// Messages of `log` that a peer advertising `remote` lacks, in log order.
///
/// Log order keeps each sender's messages in sequence and places every
/// membership command before the messages of the member it admits.
pub fn messages_to_send<'a, I>(log: I, remote: &SyncMap) -> Vec<&'a Message>
where
    I: IntoIterator<Item = &'a Message>,
{
    log.into_iter().filter(|m| remote.is_missing(m)).collect()
}

/// What the serving side of a sync session advertises: the newest message it
/// holds per sender, and the members whose messages it will accept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOffer {
    pub held: SyncMap,
    pub members: Vec<Fingerprint>,
}

impl SyncOffer {
    pub fn knows(&self, sender: &Fingerprint) -> bool {
        self.members.contains(sender)
    }
}

/// One outbound sync: the messages to push and the peer's confirmed state.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pending: Vec<Message>,
    confirmed: SyncMap,
}

impl SyncPlan {
    pub fn new<'a, I>(log: I, remote: &SyncMap) -> Self
    where
        I: IntoIterator<Item = &'a Message>,
    {
        Self {
            pending: messages_to_send(log, remote).into_iter().cloned().collect(),
            confirmed: remote.clone(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.pending
    }

    /// Hold back every message whose sender fails `keep`. Messages of a
    /// sender are all kept or all dropped, so per-sender order survives.
    pub fn retain_senders<F>(&mut self, mut keep: F)
    where
        F: FnMut(&Fingerprint) -> bool,
    {
        self.pending.retain(|m| keep(&m.sender));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Record that the peer acknowledged `message`.
    pub fn confirm(&mut self, message: &Message) {
        self.confirmed.advance(&message.sender, message.timestamp);
    }

    /// What the peer is known to hold: its advertised map plus every
    /// confirmed delivery.
    pub fn confirmed(&self) -> &SyncMap {
        &self.confirmed
    }
}
