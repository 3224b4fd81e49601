// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Registry and Replay
//!
//! The connection remembers every exchange and queue declared through it that
//! would be lost with the connection, together with all bindings. After the
//! connection recovers the recorded topology is declared again, in order:
//!
//! 1. exchanges
//! 2. exchange-to-exchange bindings
//! 3. queues (server-named queues may come back under a new name)
//! 4. queue bindings
//!
//! Replay failures other than a connection closure are logged and skipped.

use crate::{
    client::{AmqpChannel, AmqpConnection},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::QueueDeclaration,
};
use lapin::types::FieldTable;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, error, info};

/// A binding from a source exchange to a destination exchange or queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub(crate) source: String,
    pub(crate) destination: String,
    pub(crate) routing_key: String,
    pub(crate) arguments: FieldTable,
}

impl Binding {
    /// Creates a binding routing messages from `source` to `destination`.
    ///
    /// # Parameters
    /// * `source` - The exchange messages are published to
    /// * `destination` - The exchange or queue receiving the messages
    /// * `routing_key` - The routing key, or pattern for topic exchanges
    pub fn new(source: &str, destination: &str, routing_key: &str) -> Binding {
        Binding {
            source: source.to_owned(),
            destination: destination.to_owned(),
            routing_key: routing_key.to_owned(),
            arguments: FieldTable::default(),
        }
    }

    pub fn arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }
}

/// Declarations recorded for replay, keyed by name.
#[derive(Debug, Default)]
pub(crate) struct TopologyRegistry {
    exchanges: HashMap<String, ExchangeDefinition>,
    exchange_bindings: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, Arc<QueueDeclaration>>,
    queue_bindings: HashMap<String, Vec<Binding>>,
}

fn add_binding(bindings: &mut HashMap<String, Vec<Binding>>, binding: Binding) {
    let entries = bindings.entry(binding.destination.clone()).or_default();
    if !entries.contains(&binding) {
        entries.push(binding);
    }
}

fn remove_binding(bindings: &mut HashMap<String, Vec<Binding>>, binding: &Binding) {
    if let Some(entries) = bindings.get_mut(&binding.destination) {
        entries.retain(|entry| entry != binding);
        if entries.is_empty() {
            bindings.remove(&binding.destination);
        }
    }
}

fn remove_sourced_from(bindings: &mut HashMap<String, Vec<Binding>>, source: &str) {
    bindings.retain(|_, entries| {
        entries.retain(|entry| entry.source != source);
        !entries.is_empty()
    });
}

impl TopologyRegistry {
    pub(crate) fn add_exchange(&mut self, definition: ExchangeDefinition) {
        self.exchanges.insert(definition.name.clone(), definition);
    }

    /// Forgets an exchange and every binding it takes part in.
    pub(crate) fn remove_exchange(&mut self, name: &str) {
        self.exchanges.remove(name);
        self.exchange_bindings.remove(name);
        remove_sourced_from(&mut self.exchange_bindings, name);
        remove_sourced_from(&mut self.queue_bindings, name);
    }

    pub(crate) fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        self.exchanges.get(name).cloned()
    }

    pub(crate) fn exchanges(&self) -> Vec<ExchangeDefinition> {
        self.exchanges.values().cloned().collect()
    }

    pub(crate) fn add_exchange_binding(&mut self, binding: Binding) {
        add_binding(&mut self.exchange_bindings, binding);
    }

    pub(crate) fn remove_exchange_binding(&mut self, binding: &Binding) {
        remove_binding(&mut self.exchange_bindings, binding);
    }

    pub(crate) fn exchange_bindings(&self) -> Vec<Binding> {
        self.exchange_bindings.values().flatten().cloned().collect()
    }

    pub(crate) fn add_queue(&mut self, declaration: Arc<QueueDeclaration>) {
        self.queues.insert(declaration.name(), declaration);
    }

    pub(crate) fn queue(&self, name: &str) -> Option<Arc<QueueDeclaration>> {
        self.queues.get(name).cloned()
    }

    pub(crate) fn queues(&self) -> Vec<Arc<QueueDeclaration>> {
        self.queues.values().cloned().collect()
    }

    /// Forgets a queue and its bindings.
    pub(crate) fn remove_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.queue_bindings.remove(name);
    }

    pub(crate) fn add_queue_binding(&mut self, binding: Binding) {
        add_binding(&mut self.queue_bindings, binding);
    }

    pub(crate) fn remove_queue_binding(&mut self, binding: &Binding) {
        remove_binding(&mut self.queue_bindings, binding);
    }

    pub(crate) fn queue_bindings_for(&self, queue: &str) -> Vec<Binding> {
        self.queue_bindings.get(queue).cloned().unwrap_or_default()
    }

    pub(crate) fn queue_bindings(&self) -> Vec<Binding> {
        self.queue_bindings.values().flatten().cloned().collect()
    }

    /// Moves a queue and its bindings to the name the broker assigned on redeclaration.
    pub(crate) fn rename_queue(&mut self, from: &str, to: &str) {
        if let Some(declaration) = self.queues.remove(from) {
            declaration.rename(to);
            self.queues.insert(to.to_owned(), declaration);
        }
        if let Some(mut bindings) = self.queue_bindings.remove(from) {
            for binding in bindings.iter_mut() {
                binding.destination = to.to_owned();
            }
            self.queue_bindings.insert(to.to_owned(), bindings);
        }
    }
}

pub(crate) fn lock_registry(registry: &Mutex<TopologyRegistry>) -> MutexGuard<'_, TopologyRegistry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A channel used only to replay topology, reopened when the broker closes it.
pub(crate) struct AdminChannel {
    connection: Arc<dyn AmqpConnection>,
    channel: Option<Arc<dyn AmqpChannel>>,
}

impl AdminChannel {
    pub(crate) fn new(connection: Arc<dyn AmqpConnection>) -> AdminChannel {
        AdminChannel {
            connection,
            channel: None,
        }
    }

    pub(crate) async fn channel(&mut self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if let Some(channel) = self.channel.as_ref().filter(|channel| channel.is_open()) {
            return Ok(channel.clone());
        }
        let channel = self.connection.create_channel(None).await?;
        self.channel = Some(channel.clone());
        Ok(channel)
    }

    pub(crate) async fn close(self) {
        if let Some(channel) = self.channel {
            channel.abort().await;
        }
    }
}

/// One replay of the registry over a freshly recovered connection.
///
/// Each exchange and queue is declared at most once per replay, whether it is
/// reached through the full replay or through a consumer's queue.
pub(crate) struct TopologyReplay<'a> {
    registry: &'a Mutex<TopologyRegistry>,
    admin: AdminChannel,
    exchanges: HashSet<String>,
    queues: HashSet<String>,
}

impl<'a> TopologyReplay<'a> {
    pub(crate) fn new(
        registry: &'a Mutex<TopologyRegistry>,
        connection: Arc<dyn AmqpConnection>,
    ) -> TopologyReplay<'a> {
        TopologyReplay {
            registry,
            admin: AdminChannel::new(connection),
            exchanges: HashSet::new(),
            queues: HashSet::new(),
        }
    }

    /// Replays the whole registry.
    ///
    /// # Returns
    /// Ok(()) unless the connection was closed during the replay
    pub(crate) async fn install(&mut self) -> Result<(), AmqpError> {
        self.install_exchanges().await?;
        self.binding_exchanges().await?;
        self.install_queues().await?;
        self.binding_queues().await
    }

    pub(crate) async fn finish(self) {
        self.admin.close().await;
    }

    fn tolerate<T>(
        result: Result<T, AmqpError>,
        action: &'static str,
        name: &str,
    ) -> Result<Option<T>, AmqpError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_connection_closure() => Err(err),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    action, name, "failure to recover topology entry"
                );
                Ok(None)
            }
        }
    }

    async fn install_exchanges(&mut self) -> Result<(), AmqpError> {
        let exchanges = lock_registry(self.registry).exchanges();
        for exchange in exchanges {
            self.recover_exchange(&exchange).await?;
        }
        Ok(())
    }

    async fn recover_exchange(&mut self, exchange: &ExchangeDefinition) -> Result<(), AmqpError> {
        if !self.exchanges.insert(exchange.name.clone()) {
            return Ok(());
        }
        debug!(name = exchange.name, "recovering exchange");
        let channel = self.admin.channel().await?;
        Self::tolerate(
            channel.exchange_declare(exchange).await,
            "declare exchange",
            &exchange.name,
        )?;
        Ok(())
    }

    async fn binding_exchanges(&mut self) -> Result<(), AmqpError> {
        let bindings = lock_registry(self.registry).exchange_bindings();
        for binding in bindings {
            debug!(
                source = binding.source,
                destination = binding.destination,
                "recovering exchange binding"
            );
            let channel = self.admin.channel().await?;
            Self::tolerate(
                channel.exchange_bind(&binding).await,
                "bind exchange",
                &binding.destination,
            )?;
        }
        Ok(())
    }

    async fn install_queues(&mut self) -> Result<(), AmqpError> {
        let queues = lock_registry(self.registry).queues();
        for queue in queues {
            self.declare_queue(&queue).await?;
        }
        Ok(())
    }

    async fn declare_queue(&mut self, queue: &Arc<QueueDeclaration>) -> Result<(), AmqpError> {
        let name = queue.name();
        if !self.queues.insert(name.clone()) {
            return Ok(());
        }
        debug!(name, "recovering queue");
        let channel = self.admin.channel().await?;
        let declared = Self::tolerate(
            channel.queue_declare(queue.definition()).await,
            "declare queue",
            &name,
        )?;

        if let Some(new_name) = declared.filter(|declared| *declared != name) {
            info!(from = name, to = new_name, "queue name changed during recovery");
            lock_registry(self.registry).rename_queue(&name, &new_name);
            self.queues.insert(new_name);
        }
        Ok(())
    }

    async fn binding_queues(&mut self) -> Result<(), AmqpError> {
        let bindings = lock_registry(self.registry).queue_bindings();
        for binding in bindings {
            self.bind_queue(&binding).await?;
        }
        Ok(())
    }

    async fn bind_queue(&mut self, binding: &Binding) -> Result<(), AmqpError> {
        debug!(
            source = binding.source,
            queue = binding.destination,
            "recovering queue binding"
        );
        let channel = self.admin.channel().await?;
        Self::tolerate(
            channel.queue_bind(binding).await,
            "bind queue",
            &binding.destination,
        )?;
        Ok(())
    }

    /// Declares a consumer's queue together with its bindings and their
    /// source exchanges, unless already done during this replay.
    pub(crate) async fn recover_queue(
        &mut self,
        queue: &Arc<QueueDeclaration>,
    ) -> Result<(), AmqpError> {
        if self.queues.contains(&queue.name()) {
            return Ok(());
        }
        self.declare_queue(queue).await?;

        let bindings = lock_registry(self.registry).queue_bindings_for(&queue.name());
        for binding in bindings {
            let source = lock_registry(self.registry).exchange(&binding.source);
            if let Some(exchange) = source {
                self.recover_exchange(&exchange).await?;
            }
            self.bind_queue(&binding).await?;
        }
        Ok(())
    }
}
