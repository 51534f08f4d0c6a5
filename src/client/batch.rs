use crate::broker::OutboundMessage;
use crate::utils::Result;

/// Default ceiling for one transport call.
pub const DEFAULT_MAX_BATCH_SIZE_BYTES: usize = 256 * 1024;

/// An ordered, size-bounded group of serialized messages bound for a single
/// transport call.
///
/// The sum of the serialized sizes of its messages never exceeds
/// `max_size_in_bytes`.
#[derive(Debug, Clone)]
pub struct MessageBatch {
    max_size_in_bytes: usize,
    size_in_bytes: usize,
    messages: Vec<Vec<u8>>,
}

impl MessageBatch {
    pub fn new(max_size_in_bytes: usize) -> Self {
        Self {
            max_size_in_bytes,
            size_in_bytes: 0,
            messages: Vec::new(),
        }
    }

    /// Appends `message` if it fits. Returns `false` and leaves the batch
    /// untouched otherwise; a message bigger than the ceiling never fits,
    /// not even in an empty batch.
    pub fn try_add_message(&mut self, message: &OutboundMessage) -> Result<bool> {
        let bytes = message.to_bytes()?;
        if self.size_in_bytes + bytes.len() > self.max_size_in_bytes {
            return Ok(false);
        }
        self.size_in_bytes += bytes.len();
        self.messages.push(bytes);
        Ok(true)
    }

    pub fn count(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    pub fn max_size_in_bytes(&self) -> usize {
        self.max_size_in_bytes
    }

    pub(crate) fn into_messages(self) -> Vec<Vec<u8>> {
        self.messages
    }
}
