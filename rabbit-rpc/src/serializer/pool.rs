use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::codec::{CodecInstance, Format};
use super::SerializationError;

/// Minimum pre-warmed instances when no concurrency hint is given
pub const DEFAULT_MIN_INSTANCES: usize = 2;
/// Floor for the maximum number of live instances
pub const DEFAULT_MAX_INSTANCES: usize = 200;
/// How long `acquire` waits for a free instance
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Sizing for a [`CodecPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub min: usize,
    pub max: usize,
    pub acquire_timeout: Duration,
}

impl PoolConfig {
    /// Size a pool for the consumer range of the contract it serves.
    ///
    /// `min` follows the low end of the range and `max` never drops below
    /// [`DEFAULT_MAX_INSTANCES`].
    pub fn for_concurrency(min: usize, max: usize) -> Self {
        Self {
            min: min.max(1),
            max: max.max(DEFAULT_MAX_INSTANCES),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    pub fn with_acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: DEFAULT_MIN_INSTANCES,
            max: DEFAULT_MAX_INSTANCES,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

struct PoolInner {
    format: Format,
    idle: Mutex<Vec<CodecInstance>>,
    permits: Arc<Semaphore>,
    config: PoolConfig,
}

/// Bounded pool of codec instances.
///
/// At most `max` instances are ever checked out at once; callers beyond
/// that wait up to `acquire_timeout` and then fail with
/// [`SerializationError::PoolExhausted`].
#[derive(Clone)]
pub struct CodecPool {
    inner: Arc<PoolInner>,
}

impl CodecPool {
    pub fn new(format: Format, config: PoolConfig) -> Self {
        let max = config.max.max(1);
        let min = config.min.min(max);
        let idle = (0..min).map(|_| CodecInstance::new(format)).collect();

        debug!(
            "Codec pool for {} warmed with {} instances (max {})",
            format.content_type(),
            min,
            max
        );

        Self {
            inner: Arc::new(PoolInner {
                format,
                idle: Mutex::new(idle),
                permits: Arc::new(Semaphore::new(max)),
                config: PoolConfig { min, max, ..config },
            }),
        }
    }

    /// Check out an instance, waiting at most the configured timeout
    pub async fn acquire(&self) -> Result<PooledCodec, SerializationError> {
        let wait = self.inner.config.acquire_timeout;
        let permit = tokio::time::timeout(wait, self.inner.permits.clone().acquire_owned())
            .await
            .map_err(|_| SerializationError::PoolExhausted {
                waited_ms: wait.as_millis() as u64,
            })?
            .map_err(|_| SerializationError::PoolClosed)?;

        let codec = self
            .inner
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| CodecInstance::new(self.inner.format));

        Ok(PooledCodec {
            codec: Some(codec),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    pub fn content_type(&self) -> &'static str {
        self.inner.format.content_type()
    }

    pub fn format(&self) -> Format {
        self.inner.format
    }

    pub fn config(&self) -> PoolConfig {
        self.inner.config
    }

    /// Instances currently idle in the pool
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Instances currently checked out
    pub fn in_use(&self) -> usize {
        self.inner.config.max - self.inner.permits.available_permits()
    }
}

impl std::fmt::Debug for CodecPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecPool")
            .field("format", &self.inner.format)
            .field("config", &self.inner.config)
            .field("idle", &self.idle_count())
            .finish()
    }
}

/// A checked-out codec; goes back to the pool when dropped
pub struct PooledCodec {
    codec: Option<CodecInstance>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledCodec {
    type Target = CodecInstance;

    fn deref(&self) -> &Self::Target {
        self.codec.as_ref().unwrap_or_else(|| unreachable!("codec taken before drop"))
    }
}

impl DerefMut for PooledCodec {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.codec.as_mut().unwrap_or_else(|| unreachable!("codec taken before drop"))
    }
}

impl Drop for PooledCodec {
    fn drop(&mut self) {
        if let Some(codec) = self.codec.take() {
            let mut idle = self.pool.idle.lock();
            if idle.len() < self.pool.config.max {
                idle.push(codec);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::codec::Codec;

    #[tokio::test]
    async fn instances_are_returned_on_drop() {
        let pool = CodecPool::new(Format::Bincode, PoolConfig::default());
        assert_eq!(pool.idle_count(), DEFAULT_MIN_INSTANCES);

        {
            let mut codec = pool.acquire().await.unwrap();
            assert_eq!(pool.in_use(), 1);
            let bytes = codec.encode(&42u32).unwrap();
            assert_eq!(codec.decode::<u32>(&bytes).unwrap(), 42);
        }

        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.idle_count(), DEFAULT_MIN_INSTANCES);
    }

    #[tokio::test]
    async fn instance_is_returned_when_the_caller_fails() {
        let pool = CodecPool::new(Format::Json, PoolConfig::default());
        let attempt = async {
            let mut codec = pool.acquire().await?;
            codec.decode::<u32>(b"not json")
        };
        assert!(attempt.await.is_err());
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn acquire_waits_a_bounded_time_when_exhausted() {
        let config = PoolConfig {
            min: 1,
            max: 1,
            acquire_timeout: Duration::from_millis(20),
        };
        let pool = CodecPool::new(Format::Bincode, config);
        let held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, SerializationError::PoolExhausted { waited_ms: 20 }));

        drop(held);
        assert!(pool.acquire().await.is_ok());
    }

    #[test]
    fn sizing_follows_the_consumer_range() {
        let small = PoolConfig::for_concurrency(3, 5);
        assert_eq!((small.min, small.max), (3, DEFAULT_MAX_INSTANCES));

        let large = PoolConfig::for_concurrency(10, 500);
        assert_eq!((large.min, large.max), (10, 500));
    }
}
