//! Client registry and connection acquisition.

use super::connection::Connection;
use crate::config::Config;
use crate::engine::MediaEngine;
use crate::options::ConnectionOptions;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A client and its transports.
#[derive(Debug)]
pub struct Client {
    id: String,
    single_pc: bool,
    connections: HashMap<String, Connection>,
    next_connection: u64,
}

impl Client {
    fn new(id: &str, single_pc: bool) -> Self {
        Self {
            id: id.to_string(),
            single_pc,
            connections: HashMap::new(),
            next_connection: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn single_pc(&self) -> bool {
        self.single_pc
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// Maps client ids to their connections.
pub struct ClientRegistry {
    clients: HashMap<String, Client>,
    /// connection id -> client id
    owners: HashMap<String, String>,
    config: Arc<Config>,
    engine: Arc<dyn MediaEngine>,
}

impl ClientRegistry {
    #[must_use]
    pub fn new(config: Arc<Config>, engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            clients: HashMap::new(),
            owners: HashMap::new(),
            config,
            engine,
        }
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.owners.len()
    }

    #[must_use]
    pub fn client(&self, client_id: &str) -> Option<&Client> {
        self.clients.get(client_id)
    }

    /// Existing connection of a single-PC client, or a new one. The client is
    /// created on first reference. Returns the connection id.
    pub fn get_or_create_connection(
        &mut self,
        client_id: &str,
        options: &ConnectionOptions,
    ) -> String {
        let client = self
            .clients
            .entry(client_id.to_string())
            .or_insert_with(|| Client::new(client_id, options.single_pc));

        if client.single_pc {
            if let Some(existing) = client.connections.keys().next() {
                debug!(
                    target: "sfu.registry",
                    client_id = %client_id,
                    connection_id = %existing,
                    "Reusing connection"
                );
                return existing.clone();
            }
        }

        let connection_id = loop {
            client.next_connection += 1;
            let candidate = format!("{client_id}_{}", client.next_connection);
            if !self.owners.contains_key(&candidate) {
                break candidate;
            }
        };

        let connection = Connection::new(
            connection_id.clone(),
            client_id.to_string(),
            options.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.engine),
        );
        client
            .connections
            .insert(connection_id.clone(), connection);
        self.owners
            .insert(connection_id.clone(), client_id.to_string());

        debug!(
            target: "sfu.registry",
            client_id = %client_id,
            connection_id = %connection_id,
            "Connection created"
        );
        connection_id
    }

    #[must_use]
    pub fn connection(&self, connection_id: &str) -> Option<&Connection> {
        let client_id = self.owners.get(connection_id)?;
        self.clients.get(client_id)?.connections.get(connection_id)
    }

    pub fn connection_mut(&mut self, connection_id: &str) -> Option<&mut Connection> {
        let client_id = self.owners.get(connection_id)?;
        self.clients
            .get_mut(client_id)?
            .connections
            .get_mut(connection_id)
    }

    /// Close and drop the connection if it carries no media stream. Drops
    /// the client with its last connection. Returns the client's remaining
    /// connection count, or `None` for an unknown connection.
    pub fn maybe_close_connection(&mut self, connection_id: &str) -> Option<usize> {
        let Some(client_id) = self.owners.get(connection_id).cloned() else {
            warn!(
                target: "sfu.registry",
                connection_id = %connection_id,
                "Close requested for unregistered connection"
            );
            return None;
        };
        let client = self.clients.get_mut(&client_id)?;

        let idle = client
            .connections
            .get(connection_id)
            .is_some_and(|c| c.media_stream_count() == 0);
        if idle {
            if let Some(mut connection) = client.connections.remove(connection_id) {
                connection.close();
            }
            self.owners.remove(connection_id);
        }

        let remaining = client.connections.len();
        if remaining == 0 {
            self.clients.remove(&client_id);
            debug!(
                target: "sfu.registry",
                client_id = %client_id,
                "Client removed"
            );
        }
        Some(remaining)
    }

    /// Close every connection and forget every client.
    pub fn close_all(&mut self) {
        for client in self.clients.values_mut() {
            for connection in client.connections.values_mut() {
                connection.close();
            }
        }
        self.clients.clear();
        self.owners.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::mock::MockMediaEngine;
    use crate::engine::StreamRole;

    fn registry() -> (ClientRegistry, Arc<MockMediaEngine>) {
        let engine = Arc::new(MockMediaEngine::new());
        let registry = ClientRegistry::new(
            Arc::new(Config::default()),
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
        );
        (registry, engine)
    }

    fn single_pc() -> ConnectionOptions {
        ConnectionOptions {
            single_pc: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_connection_ids_append_counter() {
        let (mut registry, _engine) = registry();
        let options = ConnectionOptions::default();
        assert_eq!(registry.get_or_create_connection("c1", &options), "c1_1");
        assert_eq!(registry.get_or_create_connection("c1", &options), "c1_2");
        assert_eq!(registry.client("c1").unwrap().connection_count(), 2);
        assert_eq!(registry.connection_count(), 2);
    }

    #[test]
    fn test_single_pc_reuses_connection() {
        let (mut registry, _engine) = registry();
        let first = registry.get_or_create_connection("c1", &single_pc());
        let second = registry.get_or_create_connection("c1", &single_pc());
        assert_eq!(first, second);
        assert!(registry.client("c1").unwrap().single_pc());
    }

    #[test]
    fn test_generated_id_skips_ids_in_use() {
        let (mut registry, _engine) = registry();
        registry
            .owners
            .insert("c1_1".to_string(), "someone-else".to_string());

        let id = registry.get_or_create_connection("c1", &ConnectionOptions::default());
        assert_eq!(id, "c1_2");
    }

    #[test]
    fn test_idle_connection_evicted_with_client() {
        let (mut registry, engine) = registry();
        let id = registry.get_or_create_connection("c1", &ConnectionOptions::default());
        {
            let conn = registry.connection_mut(&id).unwrap();
            conn.init().unwrap();
            conn.add_media_stream("c1_s1", None, StreamRole::Publisher)
                .unwrap();
        }

        // Still carrying a stream: kept
        assert_eq!(registry.maybe_close_connection(&id), Some(1));
        assert_eq!(registry.client_count(), 1);

        registry.connection_mut(&id).unwrap().remove_media_stream("c1_s1");
        assert_eq!(registry.maybe_close_connection(&id), Some(0));
        assert_eq!(registry.client_count(), 0);
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(engine.transport_count(), 0);
    }

    #[test]
    fn test_client_kept_while_other_connection_remains() {
        let (mut registry, _engine) = registry();
        let options = ConnectionOptions::default();
        let first = registry.get_or_create_connection("c1", &options);
        let _second = registry.get_or_create_connection("c1", &options);

        assert_eq!(registry.maybe_close_connection(&first), Some(1));
        assert!(registry.client("c1").is_some());
    }

    #[test]
    fn test_unknown_connection_is_noop() {
        let (mut registry, _engine) = registry();
        assert_eq!(registry.maybe_close_connection("ghost_1"), None);
    }
}
