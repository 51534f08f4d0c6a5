use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::utils::BusError;

const DEFERRED_SUFFIX: &str = "$deferred";
const DEAD_LETTER_SUFFIX: &str = "$deadletterqueue";

/// Which logical stream of a queue an address points at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubQueue {
    #[default]
    Main,
    /// Deferred messages, reachable only by sequence number.
    Deferred,
    DeadLetter,
}

/// A queue name plus a sub-queue selector.
///
/// Printed and parsed as `name`, `name/$deferred` or `name/$deadletterqueue`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueAddress {
    pub name: String,
    pub sub_queue: SubQueue,
}

impl QueueAddress {
    pub fn main(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sub_queue: SubQueue::Main,
        }
    }

    pub fn deferred(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sub_queue: SubQueue::Deferred,
        }
    }

    pub fn dead_letter(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sub_queue: SubQueue::DeadLetter,
        }
    }

    pub fn with_sub_queue(&self, sub_queue: SubQueue) -> Self {
        Self {
            name: self.name.clone(),
            sub_queue,
        }
    }
}

impl fmt::Display for QueueAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sub_queue {
            SubQueue::Main => write!(f, "{}", self.name),
            SubQueue::Deferred => write!(f, "{}/{}", self.name, DEFERRED_SUFFIX),
            SubQueue::DeadLetter => write!(f, "{}/{}", self.name, DEAD_LETTER_SUFFIX),
        }
    }
}

impl FromStr for QueueAddress {
    type Err = BusError;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let (name, sub_queue) = match path.split_once('/') {
            None => (path, SubQueue::Main),
            Some((name, suffix)) if suffix.eq_ignore_ascii_case(DEFERRED_SUFFIX) => {
                (name, SubQueue::Deferred)
            }
            Some((name, suffix)) if suffix.eq_ignore_ascii_case(DEAD_LETTER_SUFFIX) => {
                (name, SubQueue::DeadLetter)
            }
            Some(_) => return Err(BusError::InvalidAddress(path.to_string())),
        };

        if name.is_empty() {
            return Err(BusError::InvalidAddress(path.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            sub_queue,
        })
    }
}
