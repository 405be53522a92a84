//! Resource pool for reusable handles to an external resource
//!
//! The pool keeps at most `capacity` idle handles. Borrowing is never capped:
//! when no idle handle is available a new one is built by the
//! [`ResourceFactory`]. Only retention on release is bounded, so a burst of
//! borrowers may transiently hold more handles than the pool will keep.

use super::error::ResilienceError;
use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Factory trait for creating, validating and closing resource handles
#[async_trait::async_trait]
pub trait ResourceFactory<T: Send + 'static>: Send + Sync {
    /// Create a new handle
    async fn create(&self) -> Result<T, ResilienceError>;

    /// Check whether a returned handle may be kept for reuse
    fn is_healthy(&self, _resource: &T) -> bool {
        true
    }

    /// Dispose of a handle that will not be retained
    fn close(&self, resource: T) {
        drop(resource);
    }
}

/// Bounded pool of idle resource handles
///
/// # Example
/// ```no_run
/// use strand_core_resilience::{ResourceFactory, ResourcePool, ResilienceError};
/// use std::sync::Arc;
///
/// struct Connection;
/// struct ConnectionFactory;
///
/// #[async_trait::async_trait]
/// impl ResourceFactory<Connection> for ConnectionFactory {
///     async fn create(&self) -> Result<Connection, ResilienceError> {
///         Ok(Connection)
///     }
/// }
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let pool = ResourcePool::new(Arc::new(ConnectionFactory), 8);
///
/// let conn = pool.borrow().await?;
/// // Use connection...
/// pool.release(conn);
///
/// // Or let a lease hand the handle back when it goes out of scope
/// let lease = pool.lease().await?;
/// # drop(lease);
/// # Ok(())
/// # }
/// ```
pub struct ResourcePool<T: Send + 'static> {
    capacity: usize,
    factory: Arc<dyn ResourceFactory<T>>,
    idle: Mutex<Vec<T>>,
    counters: PoolCounters,
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
    borrowed: AtomicU64,
}

impl<T: Send + 'static> fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("capacity", &self.capacity)
            .field("idle", &self.idle.lock().len())
            .field("counters", &self.counters)
            .finish()
    }
}

impl<T: Send + 'static> ResourcePool<T> {
    /// Create a pool retaining at most `capacity` idle handles
    pub fn new(factory: Arc<dyn ResourceFactory<T>>, capacity: usize) -> Self {
        Self {
            capacity,
            factory,
            idle: Mutex::new(Vec::with_capacity(capacity.min(64))),
            counters: PoolCounters::default(),
        }
    }

    /// Take an idle handle, or build a new one when none is idle.
    ///
    /// Factory errors are returned as-is; nothing is retried here.
    pub async fn borrow(&self) -> Result<T, ResilienceError> {
        // Lock is released before the factory runs
        let reused = self.idle.lock().pop();

        let resource = match reused {
            Some(resource) => {
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
                resource
            }
            None => {
                let resource = self.factory.create().await?;
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                resource
            }
        };

        self.counters.borrowed.fetch_add(1, Ordering::Relaxed);
        Ok(resource)
    }

    /// Return a handle to the idle set, or close it when the set is full
    /// or the factory reports it unhealthy.
    pub fn release(&self, resource: T) {
        self.counters.borrowed.fetch_sub(1, Ordering::Relaxed);

        if !self.factory.is_healthy(&resource) {
            self.discard(resource);
            return;
        }

        let mut idle = self.idle.lock();
        if idle.len() < self.capacity {
            idle.push(resource);
        } else {
            drop(idle);
            self.discard(resource);
        }
    }

    /// Borrow a handle wrapped in a [`Lease`] that releases it on drop
    pub async fn lease(&self) -> Result<Lease<'_, T>, ResilienceError> {
        let resource = self.borrow().await?;
        Ok(Lease {
            pool: self,
            resource: Some(resource),
        })
    }

    /// Close every idle handle
    pub fn clear_idle(&self) {
        let idle = std::mem::take(&mut *self.idle.lock());
        for resource in idle {
            self.discard(resource);
        }
    }

    /// Maximum number of retained idle handles
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get current pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.lock().len(),
            borrowed: self.counters.borrowed.load(Ordering::Relaxed),
            created: self.counters.created.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            capacity: self.capacity,
        }
    }

    fn discard(&self, resource: T) {
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        self.factory.close(resource);
    }
}

/// A borrowed handle that goes back to its pool when dropped
pub struct Lease<'a, T: Send + 'static> {
    pool: &'a ResourcePool<T>,
    resource: Option<T>,
}

impl<T: Send + 'static> Lease<'_, T> {
    /// Keep the handle out of the pool entirely; it will not be released.
    pub fn detach(mut self) -> Option<T> {
        let resource = self.resource.take();
        if resource.is_some() {
            self.pool.counters.borrowed.fetch_sub(1, Ordering::Relaxed);
        }
        resource
    }
}

impl<T: Send + 'static> Deref for Lease<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `detach` and `drop` take the resource, and both consume the lease
        self.resource.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Send + 'static> DerefMut for Lease<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.resource.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Send + 'static> Drop for Lease<'_, T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(resource);
        }
    }
}

impl<T: Send + fmt::Debug + 'static> fmt::Debug for Lease<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Lease").field(&self.resource).finish()
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Handles currently idle
    pub idle: usize,
    /// Handles currently out on loan
    pub borrowed: u64,
    /// Handles built by the factory since creation
    pub created: u64,
    /// Borrows served from the idle set
    pub reused: u64,
    /// Handles closed on release (over capacity or unhealthy)
    pub discarded: u64,
    /// Idle capacity
    pub capacity: usize,
}
