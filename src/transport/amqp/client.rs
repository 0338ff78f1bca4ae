//! Impure I/O for the AMQP transport, backed by lapin

use super::connection::{build_connection_uri, classify_connect_error};
use super::message_handler::{confirm_outcome, to_basic_properties, to_delivery};
use crate::credential::Credential;
use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerTransport, ChannelMode, ConfirmOutcome, Delivery,
    EstablishedConnection, OutgoingMessage, TransportError, TransportEvent,
};
use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicPublishOptions, BasicQosOptions, BasicRejectOptions,
    ConfirmSelectOptions,
};
use lapin::{Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

const REPLY_SUCCESS: u16 = 200;

fn channel_error(error: lapin::Error) -> TransportError {
    match error {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            TransportError::ChannelClosed
        }
        other => TransportError::Channel(other.to_string()),
    }
}

/// Opens lapin connections to one broker, one per credential
#[derive(Debug, Clone)]
pub struct LapinTransport {
    base_url: String,
    poll_interval: Duration,
}

impl LapinTransport {
    /// `poll_interval` paces `basic.get` retries while waiting for a message
    pub fn new(base_url: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            poll_interval,
        }
    }
}

#[async_trait]
impl BrokerTransport for LapinTransport {
    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<EstablishedConnection, TransportError> {
        let uri = build_connection_uri(&self.base_url, credential)?;

        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| classify_connect_error(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let principal = credential.principal().to_string();
        connection.on_error(move |error| {
            warn!(principal = %principal, error = %error, "Broker connection error");
            let _ = events_tx.send(TransportEvent::ConnectionLost(error.to_string()));
        });

        debug!(principal = %credential.principal(), "Broker connection established");

        Ok(EstablishedConnection {
            connection: Arc::new(LapinConnection {
                inner: connection,
                poll_interval: self.poll_interval,
            }),
            events: events_rx,
        })
    }
}

struct LapinConnection {
    inner: Connection,
    poll_interval: Duration,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(
        &self,
        mode: ChannelMode,
    ) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let channel = self.inner.create_channel().await.map_err(channel_error)?;

        match mode {
            ChannelMode::Publish => channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(channel_error)?,
            ChannelMode::Consume { prefetch } => channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(channel_error)?,
        }

        Ok(Arc::new(LapinChannel {
            inner: channel,
            poll_interval: self.poll_interval,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "bridge closing session")
            .await
            .map_err(|e| TransportError::Close(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}

struct LapinChannel {
    inner: Channel,
    poll_interval: Duration,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn publish_with_confirm(
        &self,
        message: OutgoingMessage,
    ) -> Result<ConfirmOutcome, TransportError> {
        let properties = to_basic_properties(&message.properties);
        let options = BasicPublishOptions {
            mandatory: message.mandatory,
            ..BasicPublishOptions::default()
        };

        let confirm = self
            .inner
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                options,
                &message.body,
                properties,
            )
            .await
            .map_err(channel_error)?;

        let confirmation = confirm.await.map_err(channel_error)?;
        Ok(confirm_outcome(confirmation))
    }

    async fn get_one(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, TransportError> {
        let deadline = Instant::now() + timeout;

        loop {
            let message = self
                .inner
                .basic_get(queue, BasicGetOptions { no_ack: false })
                .await
                .map_err(channel_error)?;

            if let Some(message) = message {
                return Ok(Some(to_delivery(message.delivery)));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(channel_error)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "bridge closing channel")
            .await
            .map_err(|e| TransportError::Close(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}
