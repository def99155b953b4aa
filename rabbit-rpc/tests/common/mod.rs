#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rabbit_rpc::{async_trait, rpc_interface, rpc_type, Settings};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short intervals so recovery shows up within a test
pub fn settings(service_name: &str) -> Settings {
    init_tracing();
    Settings {
        service_name: service_name.to_string(),
        reply_timeout_ms: 2_000,
        recovery_interval_ms: 50,
        reconcile_interval_ms: 60_000,
        idle_timeout_ms: 200,
        allowed_patterns: vec!["app.*".to_string()],
        ..Settings::default()
    }
}

/// Poll `condition` every 10ms for up to two seconds
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
}

rpc_type!(User => "app.User");

#[derive(Debug, Error)]
#[error("user {0} not found")]
pub struct UserNotFound(pub i64);

#[rpc_interface(exchange = "users-x", queue = "users-q", routing = "users", concurrency = "2-4")]
pub trait UserService {
    async fn get_user(&self, #[not_null] id: Option<i64>) -> anyhow::Result<User>;

    async fn find_user(&self, name: String) -> anyhow::Result<Option<User>>;

    #[rpc(name = "process")]
    async fn process_text(&self, text: String, count: i32) -> anyhow::Result<String>;

    #[rpc(name = "process")]
    async fn process_count(&self, count: i32, text: String) -> anyhow::Result<String>;

    async fn rename(&self, id: i64, #[not_blank] name: String) -> anyhow::Result<()>;

    #[fire_and_forget]
    async fn touch(&self, id: i64) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct Users {
    pub touched: Mutex<Vec<i64>>,
    pub renamed: Mutex<Vec<(i64, String)>>,
    pub touch_seen: Notify,
}

#[async_trait]
impl UserService for Users {
    async fn get_user(&self, id: Option<i64>) -> anyhow::Result<User> {
        let id = id.ok_or_else(|| anyhow::anyhow!("id is required"))?;
        if id == 404 {
            return Err(UserNotFound(id).into());
        }
        if id == 500 {
            anyhow::bail!("database unavailable");
        }
        Ok(User {
            id,
            name: format!("user-{}", id),
        })
    }

    async fn find_user(&self, name: String) -> anyhow::Result<Option<User>> {
        Ok((name != "nobody").then(|| User { id: 1, name }))
    }

    async fn process_text(&self, text: String, count: i32) -> anyhow::Result<String> {
        Ok(format!("text:{}x{}", text, count))
    }

    async fn process_count(&self, count: i32, text: String) -> anyhow::Result<String> {
        Ok(format!("count:{}x{}", count, text))
    }

    async fn rename(&self, id: i64, name: String) -> anyhow::Result<()> {
        self.renamed.lock().push((id, name));
        Ok(())
    }

    async fn touch(&self, id: i64) -> anyhow::Result<()> {
        self.touched.lock().push(id);
        self.touch_seen.notify_one();
        if id < 0 {
            anyhow::bail!("negative id {}", id);
        }
        Ok(())
    }
}

pub fn users() -> Arc<Users> {
    Arc::new(Users::default())
}
