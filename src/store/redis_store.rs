//! Redis-backed implementation of [`super::StoreFacade`].
//!
//! Mirrors the split read/write client layout of the original shared-store
//! client: a [`ConnectionManager`] for the hot read path (auto-reconnecting,
//! cheaply cloneable) and a dedicated connection for writes, pipelines and
//! `WATCH`/`MULTI`/`EXEC` transactions.

use super::{BackendListing, DeadNotice, HealthSpec, StoreError, StoreFacade, TlsMaterial};
use crate::config::RedisOptions;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::{Connection, ConnectionManager};
use redis::{AsyncCommands, Client};
use std::collections::HashSet;
use std::time::Duration;

/// Re-assertion TTL used by `re_add_dead`, distinct from the configurable
/// `dead_backend_ttl` used by `mark_dead`: a probe that is still failing
/// re-flags the backend on a short fixed cadence regardless of what TTL
/// operators have configured for the initial mark.
const PROBE_REASSERT_TTL_SECS: i64 = 30;

fn build_url(opts: &RedisOptions) -> String {
    let auth = opts
        .password
        .as_ref()
        .map(|p| format!(":{}@", p))
        .unwrap_or_default();
    format!("redis://{}{}:{}/{}", auth, opts.host, opts.port, opts.db)
}

pub struct RedisStore {
    read: ConnectionManager,
    write_client: Client,
}

impl RedisStore {
    pub async fn connect(read_opts: &RedisOptions, write_opts: &RedisOptions) -> anyhow::Result<Self> {
        let read_client = Client::open(build_url(read_opts))?;
        let read = ConnectionManager::new(read_client).await?;
        let write_client = Client::open(build_url(write_opts))?;
        Ok(Self { read, write_client })
    }

    async fn write_conn(&self) -> Result<Connection, StoreError> {
        self.write_client
            .get_async_connection()
            .await
            .map_err(|e| StoreError::Transport(e.into()))
    }
}

#[async_trait]
impl StoreFacade for RedisStore {
    async fn healthcheck(&self) -> Result<(), StoreError> {
        let mut con = self.read.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut con)
            .await
            .map_err(|e| StoreError::Transport(e.into()))?;
        Ok(())
    }

    async fn list_backends(&self, host: &str) -> Result<BackendListing, StoreError> {
        let mut con = self.read.clone();
        let frontend_key = format!("frontend:{}", host);
        let dead_key = format!("dead:{}", host);

        let mut pipe = redis::pipe();
        pipe.lrange(&frontend_key, 0, -1).smembers(&dead_key);

        let (list, dead): (Vec<String>, HashSet<String>) = pipe
            .query_async(&mut con)
            .await
            .map_err(|e| StoreError::Transport(e.into()))?;

        if list.len() < 2 {
            return Err(StoreError::NoBackends);
        }

        let label = list[0].clone();
        let upstreams = list[1..].to_vec();
        let dead = dead.iter().filter_map(|s| s.parse::<u32>().ok()).collect();

        Ok(BackendListing {
            label,
            upstreams,
            dead,
        })
    }

    async fn mark_dead(
        &self,
        host: &str,
        upstream_url: &str,
        position: u32,
        list_len: u32,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut con = self.write_conn().await?;
        let dead_key = format!("dead:{}", host);
        let notice = DeadNotice {
            host: host.to_string(),
            upstream_url: upstream_url.to_string(),
            position,
            list_len,
        }
        .render();

        redis::pipe()
            .sadd(&dead_key, position)
            .ignore()
            .expire(&dead_key, ttl.as_secs() as i64)
            .ignore()
            .publish("dead", notice)
            .ignore()
            .query_async(&mut con)
            .await
            .map_err(|e| StoreError::Transport(e.into()))
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, DeadNotice>, StoreError> {
        let conn = self
            .write_client
            .get_async_connection()
            .await
            .map_err(|e| StoreError::Transport(e.into()))?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe("dead")
            .await
            .map_err(|e| StoreError::Transport(e.into()))?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                let payload: String = msg.get_payload().ok()?;
                DeadNotice::parse(&payload)
            })
            .boxed();

        Ok(stream)
    }

    async fn acquire_lease(
        &self,
        host: &str,
        upstream_url: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let key = format!("dead:{}:{}", host, upstream_url);
        let mut con = self.write_conn().await?;

        loop {
            redis::cmd("WATCH")
                .arg(&key)
                .query_async::<_, ()>(&mut con)
                .await
                .map_err(|e| StoreError::Transport(e.into()))?;

            let current: Option<String> = con
                .get(&key)
                .await
                .map_err(|e| StoreError::Transport(e.into()))?;

            if let Some(owner) = &current {
                if owner != holder_id {
                    let _: Result<(), _> = redis::cmd("UNWATCH").query_async(&mut con).await;
                    return Ok(false);
                }
            }

            let mut pipe = redis::pipe();
            pipe.atomic()
                .set_ex(&key, holder_id, ttl.as_secs())
                .ignore();

            let result: Option<()> = pipe
                .query_async(&mut con)
                .await
                .map_err(|e| StoreError::Transport(e.into()))?;

            if result.is_some() {
                return Ok(true);
            }
            // WATCH was invalidated by a concurrent writer; retry the CAS.
        }
    }

    async fn release_lease(&self, host: &str, upstream_url: &str) -> Result<(), StoreError> {
        let key = format!("dead:{}:{}", host, upstream_url);
        let mut con = self.write_conn().await?;
        let _: () = con
            .del(&key)
            .await
            .map_err(|e| StoreError::Transport(e.into()))?;
        Ok(())
    }

    async fn clear_dead(&self, host: &str, upstream_url: &str) -> Result<(), StoreError> {
        self.mutate_dead_for_url(host, upstream_url, false).await
    }

    async fn re_add_dead(&self, host: &str, upstream_url: &str) -> Result<(), StoreError> {
        self.mutate_dead_for_url(host, upstream_url, true).await
    }

    async fn read_health_spec(&self, host: &str) -> Result<HealthSpec, StoreError> {
        let mut con = self.read.clone();
        let key = format!("healthcheck:{}", host);
        let fields: std::collections::HashMap<String, String> = con
            .hgetall(&key)
            .await
            .map_err(|e| StoreError::Transport(e.into()))?;

        Ok(HealthSpec {
            path: fields.get("path").cloned().unwrap_or_default(),
            expected_body_substring: fields.get("body").cloned().unwrap_or_default(),
            expected_status: fields
                .get("status")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        })
    }

    async fn read_tls_material(&self, host: &str) -> Result<Option<TlsMaterial>, StoreError> {
        let mut con = self.read.clone();
        let key = format!("tls:{}", host);
        let fields: std::collections::HashMap<String, String> = con
            .hgetall(&key)
            .await
            .map_err(|e| StoreError::Transport(e.into()))?;

        if fields.is_empty() {
            return Ok(None);
        }

        let certificate_pem = fields.get("certificate").cloned().unwrap_or_default();
        let key_pem = fields.get("key").cloned().unwrap_or_default();
        if certificate_pem.is_empty() || key_pem.is_empty() {
            return Ok(None);
        }

        Ok(Some(TlsMaterial {
            certificate_pem,
            key_pem,
        }))
    }
}

impl RedisStore {
    async fn mutate_dead_for_url(
        &self,
        host: &str,
        upstream_url: &str,
        mark_dead: bool,
    ) -> Result<(), StoreError> {
        let frontend_key = format!("frontend:{}", host);
        let dead_key = format!("dead:{}", host);
        let mut con = self.write_conn().await?;

        loop {
            redis::cmd("WATCH")
                .arg(&frontend_key)
                .query_async::<_, ()>(&mut con)
                .await
                .map_err(|e| StoreError::Transport(e.into()))?;

            let list: Vec<String> = con
                .lrange(&frontend_key, 0, -1)
                .await
                .map_err(|e| StoreError::Transport(e.into()))?;

            let position = list.iter().skip(1).position(|u| u == upstream_url);
            let position = match position {
                Some(p) => p as u32,
                None => {
                    let _: Result<(), _> = redis::cmd("UNWATCH").query_async(&mut con).await;
                    return Err(StoreError::BackendNotInList);
                }
            };

            let mut pipe = redis::pipe();
            pipe.atomic();
            if mark_dead {
                pipe.sadd(&dead_key, position)
                    .ignore()
                    .expire(&dead_key, PROBE_REASSERT_TTL_SECS)
                    .ignore();
            } else {
                pipe.srem(&dead_key, position).ignore();
            }

            let result: Option<()> = pipe
                .query_async(&mut con)
                .await
                .map_err(|e| StoreError::Transport(e.into()))?;

            if result.is_some() {
                return Ok(());
            }
        }
    }
}
