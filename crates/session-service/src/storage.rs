//! Session and device persistence
//!
//! Every transition reads the full session, mutates it and writes it back.
//! Redis layout:
//!
//! | key | value |
//! |---|---|
//! | `session:{id}` | session JSON |
//! | `sessions:renter:{renter_id}` | set of session ids |
//! | `sessions:device:{device_id}` | set of session ids |
//! | `device:{id}` | device JSON |
//! | `devices:owner:{owner_id}` | set of device ids |

use std::collections::HashMap;

use async_trait::async_trait;
use exec_common::{Device, Error, Result, Session};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, id: &str) -> Result<Option<Session>>;

    /// Insert or replace the whole session record
    async fn save_session(&self, session: &Session) -> Result<()>;

    /// Newest first
    async fn sessions_for_renter(&self, renter_id: &str) -> Result<Vec<Session>>;

    /// Newest first
    async fn sessions_for_device(&self, device_id: &str) -> Result<Vec<Session>>;

    async fn get_device(&self, id: &str) -> Result<Option<Device>>;

    async fn save_device(&self, device: &Device) -> Result<()>;

    async fn devices_for_owner(&self, owner_id: &str) -> Result<Vec<Device>>;
}

fn newest_first(sessions: &mut [Session]) {
    sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

fn storage_error(e: redis::RedisError) -> Error {
    Error::Storage(e.to_string())
}

/// Redis-backed store
#[derive(Clone)]
pub struct RedisSessionStore {
    conn: ConnectionManager,
}

impl RedisSessionStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Storage(format!("Failed to create Redis client: {}", e)))?;

        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::Storage(format!("Failed to connect to Redis: {}", e)))?;

        info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    async fn load_sessions(&self, index_key: &str) -> Result<Vec<Session>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(index_key).await.map_err(storage_error)?;

        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = self.get_session(&id).await? {
                sessions.push(session);
            }
        }

        newest_first(&mut sessions);
        Ok(sessions)
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn
            .get(format!("session:{}", id))
            .await
            .map_err(storage_error)?;

        match json {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(session)?;

        let _: () = conn
            .set(format!("session:{}", session.id), json)
            .await
            .map_err(storage_error)?;
        let _: () = conn
            .sadd(format!("sessions:renter:{}", session.renter_id), &session.id)
            .await
            .map_err(storage_error)?;
        let _: () = conn
            .sadd(format!("sessions:device:{}", session.device_id), &session.id)
            .await
            .map_err(storage_error)?;

        debug!(
            session_id = %session.id,
            status = ?session.status,
            execution_status = ?session.execution_status,
            "Saved session"
        );
        Ok(())
    }

    async fn sessions_for_renter(&self, renter_id: &str) -> Result<Vec<Session>> {
        self.load_sessions(&format!("sessions:renter:{}", renter_id))
            .await
    }

    async fn sessions_for_device(&self, device_id: &str) -> Result<Vec<Session>> {
        self.load_sessions(&format!("sessions:device:{}", device_id))
            .await
    }

    async fn get_device(&self, id: &str) -> Result<Option<Device>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn
            .get(format!("device:{}", id))
            .await
            .map_err(storage_error)?;

        match json {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn save_device(&self, device: &Device) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(device)?;

        let _: () = conn
            .set(format!("device:{}", device.id), json)
            .await
            .map_err(storage_error)?;
        let _: () = conn
            .sadd(format!("devices:owner:{}", device.owner_id), &device.id)
            .await
            .map_err(storage_error)?;

        Ok(())
    }

    async fn devices_for_owner(&self, owner_id: &str) -> Result<Vec<Device>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(format!("devices:owner:{}", owner_id))
            .await
            .map_err(storage_error)?;

        let mut devices = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(device) = self.get_device(&id).await? {
                devices.push(device);
            }
        }
        devices.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(devices)
    }
}

/// In-process store for development and tests
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    devices: RwLock<HashMap<String, Device>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn sessions_for_renter(&self, renter_id: &str) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.renter_id == renter_id)
            .cloned()
            .collect();
        newest_first(&mut sessions);
        Ok(sessions)
    }

    async fn sessions_for_device(&self, device_id: &str) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.device_id == device_id)
            .cloned()
            .collect();
        newest_first(&mut sessions);
        Ok(sessions)
    }

    async fn get_device(&self, id: &str) -> Result<Option<Device>> {
        Ok(self.devices.read().await.get(id).cloned())
    }

    async fn save_device(&self, device: &Device) -> Result<()> {
        self.devices
            .write()
            .await
            .insert(device.id.clone(), device.clone());
        Ok(())
    }

    async fn devices_for_owner(&self, owner_id: &str) -> Result<Vec<Device>> {
        let mut devices: Vec<Device> = self
            .devices
            .read()
            .await
            .values()
            .filter(|d| d.owner_id == owner_id)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn device(id: &str, owner: &str) -> Device {
        Device {
            id: id.to_string(),
            owner_id: owner.to_string(),
            name: format!("{} box", id),
            hourly_price: 2.0,
            available: true,
        }
    }

    async fn exercise_store(store: &dyn SessionStore, suffix: &str) {
        let owner = format!("owner-{}", suffix);
        let renter = format!("renter-{}", suffix);
        let device_id = format!("device-{}", suffix);

        store.save_device(&device(&device_id, &owner)).await.unwrap();
        assert_eq!(store.devices_for_owner(&owner).await.unwrap().len(), 1);
        assert!(store.get_device("missing").await.unwrap().is_none());

        let mut older = Session::new(renter.clone(), device_id.clone(), "k1".to_string());
        older.created_at = older.created_at - Duration::hours(1);
        let newer = Session::new(renter.clone(), device_id.clone(), "k2".to_string());
        store.save_session(&older).await.unwrap();
        store.save_session(&newer).await.unwrap();

        let by_renter = store.sessions_for_renter(&renter).await.unwrap();
        assert_eq!(by_renter.len(), 2);
        assert_eq!(by_renter[0].id, newer.id);

        let by_device = store.sessions_for_device(&device_id).await.unwrap();
        assert_eq!(by_device.len(), 2);

        let mut updated = store.get_session(&older.id).await.unwrap().unwrap();
        updated.output = "done".to_string();
        store.save_session(&updated).await.unwrap();
        assert_eq!(
            store.get_session(&older.id).await.unwrap().unwrap().output,
            "done"
        );
        assert_eq!(store.sessions_for_renter(&renter).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySessionStore::new();
        exercise_store(&store, "mem").await;
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_store() {
        let store = RedisSessionStore::new("redis://127.0.0.1:6379/15")
            .await
            .unwrap();
        let suffix = uuid::Uuid::new_v4().to_string();
        exercise_store(&store, &suffix).await;
    }
}
