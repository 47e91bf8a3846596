use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use crate::net::Message;

/// The messages received over a whole protocol run, grouped by type.
///
/// A message can arrive before the state which needs it is reached, for
/// example when another member is ahead of us. States record everything they
/// receive here, and pass the history on to the states they create, so
/// nothing gets lost. Clones share the same history.
#[derive(Clone, Default)]
pub struct MessageHistory {
    messages: Arc<Mutex<HashMap<String, Vec<Message>>>>,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receive_to_history(&self, message: Message) {
        self.messages
            .lock()
            .entry(message.message_type().to_string())
            .or_default()
            .push(message);
    }

    /// Every message of a type received so far, in arrival order.
    pub fn all_received(&self, message_type: &str) -> Vec<Message> {
        self.messages
            .lock()
            .get(message_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(&self, message_type: &str) -> usize {
        self.messages
            .lock()
            .get(message_type)
            .map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for MessageHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let messages = self.messages.lock();
        let mut map = f.debug_map();
        for (message_type, received) in messages.iter() {
            map.entry(message_type, &received.len());
        }
        map.finish()
    }
}
