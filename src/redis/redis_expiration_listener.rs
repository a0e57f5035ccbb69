use std::time::Duration;

use async_channel::{Sender, TrySendError};
use futures::StreamExt;
use redis::Client;

use crate::TallymanError;

/// How long to wait for an event before checking whether the subscriber went away.
const CLOSED_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Forwards one database's `expired` keyevent notifications into an expiration
/// subscription.
///
/// Each listener owns one pub/sub connection. When the connection drops it reconnects
/// after `reconnect_delay`; events published while disconnected are lost. The listener
/// stops once the receiving side of `sender` is closed.
pub(crate) struct RedisExpirationListener {
    client: Client,
    channel: String,
    sender: Sender<String>,
    reconnect_delay: Duration,
}

impl RedisExpirationListener {
    pub(crate) fn new(
        client: Client,
        database: i64,
        sender: Sender<String>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            client,
            channel: format!("__keyevent@{database}__:expired"),
            sender,
            reconnect_delay,
        }
    }

    pub(crate) fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(self) {
        while !self.sender.is_closed() {
            match self.listen().await {
                Ok(()) => {
                    tracing::debug!("Expiration listener stopped");
                    return;
                }
                Err(err) => {
                    tracing::warn!(
                        error = ?err,
                        reconnect_delay_ms = self.reconnect_delay.as_millis() as u64,
                        "Expiration listener disconnected, events may be lost until it reconnects"
                    );
                }
            }

            tokio::time::sleep(self.reconnect_delay).await;
        }
    } // end method run

    /// Returns `Ok` once the subscriber is closed, `Err` when the connection fails.
    async fn listen(&self) -> Result<(), TallymanError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.channel.as_str()).await?;

        tracing::info!(channel = %self.channel, "Listening for key expirations");

        let mut messages = pubsub.on_message();

        loop {
            let message = match tokio::time::timeout(CLOSED_CHECK_INTERVAL, messages.next()).await
            {
                Err(_) if self.sender.is_closed() => return Ok(()),
                Err(_) => continue,
                Ok(None) => {
                    return Err(TallymanError::StoreUnavailable(
                        "expiration event stream ended".to_string(),
                    ));
                }
                Ok(Some(message)) => message,
            };

            let key: String = match message.get_payload() {
                Ok(key) => key,
                Err(err) => {
                    tracing::warn!(error = ?err, "Ignoring malformed expiration event");
                    continue;
                }
            };

            match self.sender.try_send(key) {
                Ok(()) => {}
                Err(TrySendError::Full(key)) => {
                    tracing::warn!(key = %key, "Dropped expiration event, subscription is full");
                }
                Err(TrySendError::Closed(_)) => return Ok(()),
            }
        }
    } // end method listen
}
