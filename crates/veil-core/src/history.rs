use std::collections::HashSet;

use veil_shared::{Fingerprint, Message, Timestamp};

/// Append-only message log of one room.
///
/// A message is identified by `(sender, timestamp)`: senders never reuse a
/// timestamp, so a second message under the same pair is either a replay or
/// an equivocation and is dropped either way.
#[derive(Debug, Default, Clone)]
pub struct MessageLog {
    messages: Vec<Message>,
    seen: HashSet<(Fingerprint, Timestamp)>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, message: &Message) -> bool {
        self.seen
            .contains(&(message.sender.clone(), message.timestamp))
    }

    /// Append `message` unless it is already present. Returns whether it was
    /// appended.
    pub fn append(&mut self, message: Message) -> bool {
        if !self.seen.insert((message.sender.clone(), message.timestamp)) {
            return false;
        }
        self.messages.push(message);
        true
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl<'a> IntoIterator for &'a MessageLog {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}
