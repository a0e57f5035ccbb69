use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use redis::{Client, aio::ConnectionManager};

use crate::TallymanError;

/// A [`redis::Client`] plus a round-robin set of [`redis::aio::ConnectionManager`]s.
///
/// Commands and scripts go through the connection managers; the client itself is kept
/// to open dedicated pub/sub connections for expiration events.
#[derive(Debug)]
pub struct TallymanRedisClient {
    client: Client,
    connection_managers: Arc<Vec<ConnectionManager>>,
    track_index: AtomicUsize,
}

impl TallymanRedisClient {
    /// Create a client with a single connection manager.
    pub async fn default_from_client(client: Client) -> Result<Self, TallymanError> {
        Self::from_client(client, 1).await
    }

    /// Create a client with `connection_count` connection managers.
    pub async fn from_client(
        client: Client,
        connection_count: usize,
    ) -> Result<Self, TallymanError> {
        if connection_count == 0 {
            return Err(TallymanError::InvalidConfig(
                "connection count must be > 0".to_string(),
            ));
        }

        let mut connection_managers = Vec::with_capacity(connection_count);

        for _ in 0..connection_count {
            connection_managers.push(client.get_connection_manager().await?);
        }

        Ok(Self {
            client,
            connection_managers: Arc::new(connection_managers),
            track_index: AtomicUsize::new(0),
        })
    }

    /// Get a [`redis::aio::ConnectionManager`] from the pool.
    pub(crate) fn get(&self) -> ConnectionManager {
        let index = self.track_index.fetch_add(1, Ordering::Relaxed);
        self.connection_managers[index % self.connection_managers.len()].clone()
    } // end method get

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }
} // end impl TallymanRedisClient

impl Clone for TallymanRedisClient {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            connection_managers: self.connection_managers.clone(),
            track_index: AtomicUsize::new(0),
        }
    }
}
