// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Publishes serialized bodies through a lazily opened channel with publisher confirms.
//! The topology of every `(exchange, queue)` pair is asserted before its first publish;
//! the channel is reopened, and the topology asserted again, after any failure.

use crate::{
    broker::{BrokerChannel, BrokerSession},
    errors::HutchError,
    options::ChannelOptions,
    otel,
    topology::{AmqpTopology, Topology},
};
use lapin::{types::ShortString, BasicProperties};
use std::{
    collections::HashSet,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

const TRANSIENT_DELIVERY_MODE: u8 = 1;
const PERSISTENT_DELIVERY_MODE: u8 = 2;

pub(crate) struct Publisher {
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    provisioned: Mutex<HashSet<(String, String)>>,
}

impl Publisher {
    pub(crate) fn new() -> Publisher {
        Publisher {
            channel: Mutex::new(None),
            provisioned: Mutex::new(HashSet::default()),
        }
    }

    pub(crate) async fn publish(
        &self,
        session: Arc<dyn BrokerSession>,
        opts: &ChannelOptions,
        payload: &[u8],
    ) -> Result<(), HutchError> {
        let channel = self.channel(&session).await?;

        if let Err(err) = self.provision(&channel, opts).await {
            self.reset(&channel).await;
            return Err(err);
        }

        let result = channel
            .publish(
                &opts.exchange.name,
                opts.publish_routing_key(),
                payload,
                properties(opts),
            )
            .await;

        match result {
            Ok(()) => {
                debug!(
                    exchange = opts.exchange.name.as_str(),
                    routing_key = opts.publish_routing_key(),
                    "message published"
                );
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                self.reset(&channel).await;
                Err(err)
            }
        }
    }

    /// Forgets the asserted topology touching `queue` or `exchange`.
    pub(crate) async fn forget(&self, queue: &str, exchange: &str) {
        self.provisioned
            .lock()
            .await
            .retain(|(e, q)| e != exchange && q != queue);
    }

    async fn channel(
        &self,
        session: &Arc<dyn BrokerSession>,
    ) -> Result<Arc<dyn BrokerChannel>, HutchError> {
        let mut current = self.channel.lock().await;

        if let Some(channel) = current.as_ref().filter(|channel| channel.is_open()) {
            return Ok(channel.clone());
        }

        debug!("opening publish channel");
        let channel = session.open_channel().await?;
        channel.confirm_select().await?;

        self.provisioned.lock().await.clear();
        *current = Some(channel.clone());

        Ok(channel)
    }

    async fn provision(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        opts: &ChannelOptions,
    ) -> Result<(), HutchError> {
        let key = (opts.exchange.name.clone(), opts.queue.name.clone());

        if self.provisioned.lock().await.contains(&key) {
            return Ok(());
        }

        AmqpTopology::from_options(channel.clone(), opts)
            .install()
            .await?;

        self.provisioned.lock().await.insert(key);
        Ok(())
    }

    async fn reset(&self, failed: &Arc<dyn BrokerChannel>) {
        let mut current = self.channel.lock().await;

        if current
            .as_ref()
            .is_some_and(|channel| Arc::ptr_eq(channel, failed))
        {
            current.take();
            if let Err(err) = failed.close().await {
                warn!(error = err.to_string(), "error to close the publish channel");
            }
        }
    }
}

fn properties(opts: &ChannelOptions) -> BasicProperties {
    let delivery_mode = if opts.publish.persistent {
        PERSISTENT_DELIVERY_MODE
    } else {
        TRANSIENT_DELIVERY_MODE
    };

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();

    let props = BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_timestamp(timestamp)
        .with_delivery_mode(delivery_mode)
        .with_headers(otel::inject_current());

    match opts.publish.expiration {
        Some(ttl) => props.with_expiration(ShortString::from(ttl.to_string())),
        None => props,
    }
}
