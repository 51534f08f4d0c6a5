//! Request handling for the WebSocket front-end.
//!
//! Every connection gets a [`Session`] that remembers the locked messages it
//! was handed, keyed by lock token, so a later `release` or `renew_lock` can
//! name a message by its token alone. When the connection goes away the
//! session abandons whatever it still holds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{OutboundMessage, ReceivedMessage, SubQueue};
use crate::client::{BusClient, DedupPolicy, Receiver, ReceiverOptions};
use crate::config::BusSettings;
use crate::persistence::DeferredLedger;
use crate::transport::message::{ClientMessage, ReceiverName, ReleaseAction, ServerMessage};
use crate::utils::{BusError, Result};

const DEFAULT_MAX_COUNT: usize = 10;

/// Shared state behind every connection: the client, its long-lived
/// receivers and the deferred ledger.
pub struct AppState {
    pub client: BusClient,
    pub settings: BusSettings,
    pub primary: Arc<dyn Receiver>,
    pub secondary: Arc<dyn Receiver>,
    pub dead_letter: Arc<dyn Receiver>,
    pub ledger: DeferredLedger,
}

impl AppState {
    /// Opens the receivers on the configured queue. The primary receiver
    /// auto-renews its locks and drops redelivered duplicates.
    pub async fn new(client: BusClient, settings: BusSettings, ledger: DeferredLedger) -> Result<Self> {
        let queue = settings.queue.clone();

        let mut primary_options =
            ReceiverOptions::peek_lock().with_auto_lock_renewal(settings.max_auto_lock_renewal());
        if let Some(policy) = DedupPolicy::bounded(
            settings.dedup_capacity,
            Duration::from_secs(settings.dedup_window_secs),
        ) {
            primary_options = primary_options.with_dedup(policy);
        }

        let primary = client.create_receiver(&queue, primary_options).await?;
        let secondary = client
            .create_receiver(&queue, ReceiverOptions::peek_lock())
            .await?;
        let dead_letter = client
            .create_receiver(
                &queue,
                ReceiverOptions::receive_and_delete().with_sub_queue(SubQueue::DeadLetter),
            )
            .await?;

        Ok(Self {
            client,
            settings,
            primary,
            secondary,
            dead_letter,
            ledger,
        })
    }

    fn receiver(&self, name: ReceiverName) -> &Arc<dyn Receiver> {
        match name {
            ReceiverName::Primary => &self.primary,
            ReceiverName::Secondary => &self.secondary,
        }
    }

    fn queue(&self) -> &str {
        &self.settings.queue
    }
}

struct Held {
    receiver: ReceiverName,
    message: ReceivedMessage,
}

/// Locked messages handed to one connection.
#[derive(Default)]
pub struct Session {
    held: HashMap<Uuid, Held>,
}

impl Session {
    pub fn held(&self) -> usize {
        self.held.len()
    }

    fn hold(&mut self, receiver: ReceiverName, messages: &[ReceivedMessage]) {
        for message in messages {
            if let Some(lock_token) = message.lock_token {
                self.held.insert(
                    lock_token,
                    Held {
                        receiver,
                        message: message.clone(),
                    },
                );
            }
        }
    }

    fn lookup(&self, lock_token: &Uuid) -> Result<&Held> {
        self.held.get(lock_token).ok_or_else(|| {
            BusError::unsupported(format!("lock token {lock_token} is not held by this connection"))
        })
    }

    /// Abandons every message still held so other consumers see it before
    /// its lock would lapse.
    pub async fn release_all(&mut self, state: &AppState) {
        for (_, held) in self.held.drain() {
            if let Err(e) = state.receiver(held.receiver).abandon_message(&held.message).await {
                debug!(
                    "Could not abandon message {} on disconnect: {}",
                    held.message.sequence_number, e
                );
            }
        }
    }
}

pub async fn handle_client_message(
    state: &AppState,
    session: &mut Session,
    request: ClientMessage,
) -> ServerMessage {
    match dispatch(state, session, request).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Request failed: {}", e);
            e.into()
        }
    }
}

async fn dispatch(
    state: &AppState,
    session: &mut Session,
    request: ClientMessage,
) -> Result<ServerMessage> {
    match request {
        ClientMessage::Produce { body } => {
            let sender = state.client.create_sender(state.queue()).await?;
            let sent = sender.send_message(OutboundMessage::new(body)).await;
            sender.close().await?;
            Ok(ServerMessage::Produced {
                sequence_numbers: vec![sent?],
            })
        }

        ClientMessage::ProduceBatch { bodies } => {
            let messages: Vec<OutboundMessage> = bodies.into_iter().map(OutboundMessage::new).collect();
            let sender = state.client.create_sender(state.queue()).await?;
            let sent = sender.send_messages(&messages).await;
            sender.close().await?;
            let sequence_numbers = sent?;
            info!("Produced {} message(s) to {}", sequence_numbers.len(), state.queue());
            Ok(ServerMessage::Produced { sequence_numbers })
        }

        ClientMessage::Schedule { bodies, delay_secs } => {
            let delay = delay_secs.unwrap_or(state.settings.schedule_delay_secs);
            let delay = i64::try_from(delay)
                .ok()
                .and_then(TimeDelta::try_seconds)
                .ok_or_else(|| BusError::unsupported(format!("schedule delay of {delay}s")))?;
            let release_at = Utc::now() + delay;

            let messages: Vec<OutboundMessage> = bodies.into_iter().map(OutboundMessage::new).collect();
            let sender = state.client.create_sender(state.queue()).await?;
            let scheduled = sender.schedule_messages(&messages, release_at).await;
            sender.close().await?;
            Ok(ServerMessage::Scheduled {
                sequence_numbers: scheduled?,
                release_at,
            })
        }

        ClientMessage::CancelScheduled { sequence_numbers } => {
            let sender = state.client.create_sender(state.queue()).await?;
            let cancelled = sender.cancel_scheduled_messages(&sequence_numbers).await;
            sender.close().await?;
            match cancelled {
                Ok(()) => Ok(ServerMessage::Cancelled {
                    sequence_numbers,
                    already_released: Vec::new(),
                }),
                Err(BusError::AlreadyReleased {
                    sequence_numbers: released,
                }) => {
                    warn!("Scheduled message(s) {:?} were already released", released);
                    Ok(ServerMessage::Cancelled {
                        sequence_numbers: sequence_numbers
                            .into_iter()
                            .filter(|seq| !released.contains(seq))
                            .collect(),
                        already_released: released,
                    })
                }
                Err(e) => Err(e),
            }
        }

        ClientMessage::Receive {
            receiver,
            max_count,
            max_wait_ms,
        } => {
            let max_wait = max_wait_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| state.settings.receive_wait());
            let messages = state
                .receiver(receiver)
                .receive_messages(max_count.unwrap_or(DEFAULT_MAX_COUNT), max_wait)
                .await?;
            session.hold(receiver, &messages);
            Ok(ServerMessage::Messages {
                source: receiver.as_str().to_string(),
                messages,
            })
        }

        ClientMessage::Peek {
            from_sequence_number,
            count,
        } => {
            let messages = state
                .primary
                .peek_messages(count.unwrap_or(DEFAULT_MAX_COUNT), from_sequence_number)
                .await?;
            Ok(ServerMessage::Messages {
                source: "peek".to_string(),
                messages,
            })
        }

        ClientMessage::ReceiveDeferred { sequence_numbers } => {
            let sequence_numbers = match sequence_numbers {
                Some(sequence_numbers) => sequence_numbers,
                None => state.ledger.sequence_numbers(state.queue())?,
            };
            let messages = state
                .primary
                .receive_deferred_messages(&sequence_numbers)
                .await?;
            session.hold(ReceiverName::Primary, &messages);
            Ok(ServerMessage::Messages {
                source: "deferred".to_string(),
                messages,
            })
        }

        ClientMessage::Release {
            lock_token,
            action,
            reason,
            description,
        } => {
            let held = session.lookup(&lock_token)?;
            let receiver = state.receiver(held.receiver);
            let message = &held.message;
            let settled = match action {
                ReleaseAction::Complete => receiver.complete_message(message).await,
                ReleaseAction::Abandon => receiver.abandon_message(message).await,
                ReleaseAction::Defer => receiver.defer_message(message).await,
                ReleaseAction::DeadLetter => {
                    receiver
                        .dead_letter_message(message, reason, description)
                        .await
                }
            };

            match settled {
                Ok(()) => {
                    // Abandoning a deferred message leaves it deferred, so its
                    // number stays recorded until it is settled for good.
                    match action {
                        ReleaseAction::Defer => state.ledger.record(
                            state.queue(),
                            message.sequence_number,
                            &message.message_id,
                        )?,
                        ReleaseAction::Complete | ReleaseAction::DeadLetter => {
                            state.ledger.remove(state.queue(), message.sequence_number)?;
                        }
                        ReleaseAction::Abandon => {}
                    }
                    session.held.remove(&lock_token);
                    Ok(ServerMessage::Released { lock_token, action })
                }
                Err(e @ BusError::LockLost { .. }) => {
                    session.held.remove(&lock_token);
                    Err(e)
                }
                Err(e) => Err(e),
            }
        }

        ClientMessage::RenewLock { lock_token } => {
            let held = session.lookup(&lock_token)?;
            let renewed = state
                .receiver(held.receiver)
                .renew_message_lock(&held.message)
                .await;
            match renewed {
                Ok(locked_until) => {
                    if let Some(held) = session.held.get_mut(&lock_token) {
                        held.message.locked_until = Some(locked_until);
                    }
                    Ok(ServerMessage::LockRenewed {
                        lock_token,
                        locked_until,
                    })
                }
                Err(e @ BusError::LockLost { .. }) => {
                    session.held.remove(&lock_token);
                    Err(e)
                }
                Err(e) => Err(e),
            }
        }

        ClientMessage::ReceiveDeadLetter {
            max_count,
            max_wait_ms,
        } => {
            let max_wait = max_wait_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| state.settings.receive_wait());
            let messages = state
                .dead_letter
                .receive_messages(max_count.unwrap_or(DEFAULT_MAX_COUNT), max_wait)
                .await?;
            Ok(ServerMessage::Messages {
                source: "dead_letter".to_string(),
                messages,
            })
        }

        ClientMessage::PeekDeadLetter {
            from_sequence_number,
            count,
        } => {
            let messages = state
                .dead_letter
                .peek_messages(count.unwrap_or(DEFAULT_MAX_COUNT), from_sequence_number)
                .await?;
            Ok(ServerMessage::Messages {
                source: "dead_letter".to_string(),
                messages,
            })
        }
    }
}
