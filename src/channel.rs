// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! lapin implementation of the broker primitives. This module establishes connections,
//! creates channels on them, and translates lapin failures into the crate's error
//! taxonomy so the engine above can tell contention and timeouts apart from definitive
//! failures.

use crate::{
    broker::{BrokerChannel, BrokerDelivery, BrokerSession, BrokerTransport, DeliveryStream},
    errors::HutchError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{io, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;

/// Connects to RabbitMQ through lapin.
#[derive(Debug, Default, Clone)]
pub struct LapinTransport;

#[async_trait]
impl BrokerTransport for LapinTransport {
    async fn connect(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerSession>, HutchError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        let conn = match Connection::connect(uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(classify_connect_error(&err))
            }
        }?;
        debug!("amqp connected");

        let (lost, _) = watch::channel(None);
        let lost = Arc::new(lost);
        let on_error = lost.clone();
        conn.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection lost");
            on_error.send_replace(Some(HutchError::ConnectionError(err.to_string())));
        });

        Ok(Arc::new(LapinSession { conn, lost }))
    }
}

/// An established lapin connection.
pub struct LapinSession {
    conn: Connection,
    lost: Arc<watch::Sender<Option<HutchError>>>,
}

#[async_trait]
impl BrokerSession for LapinSession {
    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, HutchError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(HutchError::ChannelError(err.to_string()))
            }
        }
    }

    async fn closed(&self) -> HutchError {
        let mut rx = self.lost.subscribe();
        let cause = match rx.wait_for(|lost| lost.is_some()).await {
            Ok(lost) => lost.clone(),
            Err(_) => None,
        };

        cause.unwrap_or_else(|| HutchError::ConnectionError("connection lost".to_owned()))
    }

    async fn close(&self) -> Result<(), HutchError> {
        if !self.conn.status().connected() {
            return Ok(());
        }

        match self.conn.close(REPLY_SUCCESS, "hutch shutdown").await {
            Err(err) => {
                error!(error = err.to_string(), "error to close the connection");
                Err(HutchError::ConnectionError(err.to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// A lapin channel.
pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), HutchError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(HutchError::TopologyError(err.to_string()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), HutchError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(HutchError::TopologyError(err.to_string()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), HutchError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(HutchError::TopologyError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn qos(&self, prefetch: u16) -> Result<(), HutchError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                HutchError::QoSDeclarationError(err.to_string())
            })
    }

    async fn confirm_select(&self) -> Result<(), HutchError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable publisher confirms");
                HutchError::ChannelError(err.to_string())
            })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        exclusive: bool,
    ) -> Result<DeliveryStream, HutchError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) if exclusive && is_exclusive_denial(&err) => {
                debug!(error = err.to_string(), queue, "exclusive consumer denied");
                Err(HutchError::AcquisitionContention(queue.to_owned()))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(HutchError::ConsumerError(err.to_string()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result
                    .map(into_broker_delivery)
                    .map_err(|err| HutchError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), HutchError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| HutchError::ChannelError(err.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), HutchError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                HutchError::PublishingError(err.to_string())
            })?
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error waiting publisher confirm");
                HutchError::PublishingError(err.to_string())
            })?;

        if confirm.is_nack() {
            return Err(HutchError::PublishingError(
                "publisher confirm NACK".to_owned(),
            ));
        }

        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), HutchError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                HutchError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), HutchError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                HutchError::NackMessageError
            })
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), HutchError> {
        self.channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to delete the queue");
                HutchError::DeleteError(err.to_string())
            })
    }

    async fn delete_exchange(&self, exchange: &str) -> Result<(), HutchError> {
        self.channel
            .exchange_delete(exchange, ExchangeDeleteOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), exchange, "error to delete the exchange");
                HutchError::DeleteError(err.to_string())
            })
    }

    async fn close(&self) -> Result<(), HutchError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        match self.channel.close(REPLY_SUCCESS, "closed by hutch").await {
            Err(err) if self.channel.status().connected() => {
                error!(error = err.to_string(), "error to close the channel");
                Err(HutchError::ChannelError(err.to_string()))
            }
            _ => Ok(()),
        }
    }
}

fn into_broker_delivery(delivery: Delivery) -> BrokerDelivery {
    BrokerDelivery {
        delivery_tag: delivery.delivery_tag,
        data: delivery.data,
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties: delivery.properties,
    }
}

/// RabbitMQ answers a competing exclusive consume with RESOURCE_LOCKED or, for queues
/// already in exclusive use, ACCESS_REFUSED mentioning the exclusive use. Any other
/// ACCESS_REFUSED is a permission failure.
fn is_exclusive_denial(err: &lapin::Error) -> bool {
    let lapin::Error::ProtocolError(amqp) = err else {
        return false;
    };

    match amqp.kind() {
        AMQPErrorKind::Soft(AMQPSoftError::RESOURCELOCKED) => true,
        AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED) => {
            let reply = amqp.get_message().as_str().to_lowercase();
            reply.contains("exclusive") || reply.contains("locked")
        }
        _ => false,
    }
}

fn classify_connect_error(err: &lapin::Error) -> HutchError {
    match err {
        lapin::Error::IOError(io_err) if io_err.kind() == io::ErrorKind::TimedOut => {
            HutchError::ConnectionTimeout(err.to_string())
        }
        _ => HutchError::ConnectionError(err.to_string()),
    }
}
