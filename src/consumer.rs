// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Recovering Consumers
//!
//! Consumers registered through a recovering channel are wrapped so they keep
//! receiving deliveries after the channel is replaced. Delivery tags restart
//! at 1 on every new channel, so the wrapper shifts them by the highest tag
//! seen on previous channels. Applications therefore observe tags that keep
//! increasing for the lifetime of the recovering channel.

use crate::{
    client::{ConsumeArguments, Consumer, Delivery},
    errors::ShutdownSignal,
    queue::QueueDeclaration,
};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tracing::debug;

/// Delivery tag offset of a recovering channel.
#[derive(Debug, Default)]
pub(crate) struct DeliveryTags {
    previous_max: AtomicU64,
    max: AtomicU64,
}

impl DeliveryTags {
    /// Maps a tag of the current channel to the application-visible tag.
    pub(crate) fn on_delivery(&self, delivery_tag: u64) -> u64 {
        let tag = delivery_tag + self.previous_max.load(Ordering::SeqCst);
        self.max.fetch_max(tag, Ordering::SeqCst);
        tag
    }

    /// Starts a new channel: tags seen so far belong to previous channels.
    pub(crate) fn rebase(&self) {
        self.previous_max
            .store(self.max.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    /// Maps an application-visible tag back to the current channel.
    ///
    /// Returns `None` for tags delivered on a previous channel, which can no
    /// longer be acknowledged. Tag 0 with `multiple` set stands for all
    /// outstanding deliveries and is passed through.
    pub(crate) fn to_channel(&self, delivery_tag: u64, multiple: bool) -> Option<u64> {
        if delivery_tag == 0 && multiple {
            return Some(0);
        }
        let offset = self.previous_max.load(Ordering::SeqCst);
        (delivery_tag > offset).then(|| delivery_tag - offset)
    }
}

/// Wraps an application consumer registered on a recovering channel.
pub(crate) struct ConsumerDelegate {
    inner: Arc<dyn Consumer>,
    tags: Arc<DeliveryTags>,
    cancelled: AtomicBool,
}

impl ConsumerDelegate {
    pub(crate) fn new(inner: Arc<dyn Consumer>, tags: Arc<DeliveryTags>) -> ConsumerDelegate {
        ConsumerDelegate {
            inner,
            tags,
            cancelled: AtomicBool::new(false),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<dyn Consumer> {
        &self.inner
    }

    /// Stops forwarding deliveries once the application cancelled the consumer.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Consumer for ConsumerDelegate {
    async fn handle_delivery(&self, consumer_tag: &str, mut delivery: Delivery) {
        if self.cancelled.load(Ordering::SeqCst) {
            debug!(consumer_tag, "dropping delivery for cancelled consumer");
            return;
        }
        delivery.delivery_tag = self.tags.on_delivery(delivery.delivery_tag);
        self.inner.handle_delivery(consumer_tag, delivery).await;
    }

    async fn handle_cancel(&self, consumer_tag: &str) {
        self.inner.handle_cancel(consumer_tag).await;
    }

    async fn handle_shutdown(&self, consumer_tag: &str, signal: &ShutdownSignal) {
        self.inner.handle_shutdown(consumer_tag, signal).await;
    }
}

/// A consumer remembered for recovery.
pub(crate) struct ConsumerDeclaration {
    queue: Option<Arc<QueueDeclaration>>,
    arguments: ConsumeArguments,
    delegate: Arc<ConsumerDelegate>,
}

impl ConsumerDeclaration {
    /// # Parameters
    /// * `queue` - The registered queue the consumer reads from, if the queue is recorded for recovery
    /// * `arguments` - The consume arguments, carrying the tag the broker assigned
    /// * `delegate` - The wrapper forwarding to the application consumer
    pub(crate) fn new(
        queue: Option<Arc<QueueDeclaration>>,
        arguments: ConsumeArguments,
        delegate: Arc<ConsumerDelegate>,
    ) -> ConsumerDeclaration {
        ConsumerDeclaration {
            queue,
            arguments,
            delegate,
        }
    }

    pub(crate) fn queue(&self) -> Option<&Arc<QueueDeclaration>> {
        self.queue.as_ref()
    }

    /// Consume arguments pointing at the queue's current name.
    pub(crate) fn arguments(&self) -> ConsumeArguments {
        let mut arguments = self.arguments.clone();
        if let Some(queue) = &self.queue {
            arguments.queue = queue.name();
        }
        arguments
    }

    pub(crate) fn delegate(&self) -> &Arc<ConsumerDelegate> {
        &self.delegate
    }
}
