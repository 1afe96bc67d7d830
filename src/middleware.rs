//! Around-style interceptor chains.
//!
//! A [`Chain`] wraps a final action with an ordered list of interceptors.
//! Each interceptor receives the invocation context and a [`Next`] handle;
//! it may run code before and after `next.run(ctx)`, or return without
//! calling it to short-circuit the rest of the chain.
//!
//! ```text
//! invoke(ctx, final)
//!   A.before ─► B.before ─► final ─► B.after ─► A.after
//! ```
//!
//! Interceptors are registered as factories and deduplicated by type. The
//! instantiated chain is cached until the registration list changes.

use std::any::{type_name, TypeId};
use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::error::Result;

/// An interceptor around an action producing `T` for context `C`.
#[async_trait]
pub trait Middleware<C, T>: Send + Sync {
    /// Runs the interceptor. Call `next.run(ctx)` to continue the chain.
    async fn call(&self, ctx: &C, next: Next<'_, C, T>) -> Result<T>;
}

/// The remainder of a chain.
pub struct Next<'n, C, T> {
    rest: &'n [Arc<dyn Middleware<C, T>>],
    last: Box<dyn FnOnce() -> BoxFuture<'n, Result<T>> + Send + 'n>,
}

impl<'n, C, T> Next<'n, C, T> {
    /// Continues with the next interceptor, or the final action.
    pub fn run<'c>(self, ctx: &'c C) -> BoxFuture<'c, Result<T>>
    where
        'n: 'c,
        C: 'c,
        T: 'c,
    {
        let Next { rest, last } = self;
        match rest.split_first() {
            Some((head, rest)) => head.call(ctx, Next { rest, last }),
            None => last(),
        }
    }
}

type Factory<C, T> = Arc<dyn Fn() -> Arc<dyn Middleware<C, T>> + Send + Sync>;

struct Entry<C, T> {
    type_id: TypeId,
    name: &'static str,
    factory: Factory<C, T>,
}

/// Ordered, type-deduplicated interceptor chain.
pub struct Chain<C, T> {
    entries: RwLock<Vec<Entry<C, T>>>,
    cache: RwLock<Option<Arc<[Arc<dyn Middleware<C, T>>]>>>,
}

impl<C, T> Default for Chain<C, T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            cache: RwLock::new(None),
        }
    }
}

impl<C: 'static, T: 'static> Chain<C, T> {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an interceptor built with `Default`. Ignored if an
    /// interceptor of the same type is already registered.
    pub fn add<M>(&self) -> bool
    where
        M: Middleware<C, T> + Default + 'static,
    {
        self.add_with(M::default)
    }

    /// Appends an interceptor built by `factory`. Ignored if an
    /// interceptor of the same type is already registered.
    pub fn add_with<M, F>(&self, factory: F) -> bool
    where
        M: Middleware<C, T> + 'static,
        F: Fn() -> M + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<M>();
        let mut entries = self.entries_mut();
        if entries.iter().any(|e| e.type_id == type_id) {
            debug!(middleware = type_name::<M>(), "Middleware already registered");
            return false;
        }
        entries.push(Entry {
            type_id,
            name: type_name::<M>(),
            factory: Arc::new(move || Arc::new(factory()) as Arc<dyn Middleware<C, T>>),
        });
        self.invalidate();
        true
    }

    /// Removes the interceptor of type `M`. Returns `true` if it was present.
    pub fn remove<M: 'static>(&self) -> bool {
        let type_id = TypeId::of::<M>();
        let mut entries = self.entries_mut();
        let before = entries.len();
        entries.retain(|e| e.type_id != type_id);
        let removed = entries.len() != before;
        if removed {
            self.invalidate();
        }
        removed
    }

    /// Returns `true` if an interceptor of type `M` is registered.
    pub fn exists<M: 'static>(&self) -> bool {
        let type_id = TypeId::of::<M>();
        self.entries().iter().any(|e| e.type_id == type_id)
    }

    /// Removes every interceptor.
    pub fn clear(&self) {
        self.entries_mut().clear();
        self.invalidate();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Type names of the registered interceptors, in order.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries().iter().map(|e| e.name).collect()
    }

    /// Returns the instantiated chain, building it if needed.
    pub fn retrieve(&self) -> Arc<[Arc<dyn Middleware<C, T>>]> {
        if let Some(chain) = self.read_cache().as_ref() {
            return Arc::clone(chain);
        }
        // entries stay locked until the cache is written
        let entries = self.entries();
        let chain: Arc<[Arc<dyn Middleware<C, T>>]> =
            entries.iter().map(|e| (e.factory)()).collect();
        *self.write_cache() = Some(Arc::clone(&chain));
        chain
    }

    /// Runs `last` wrapped by every interceptor.
    pub async fn invoke<F, Fut>(&self, ctx: &C, last: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let chain = self.retrieve();
        let next = Next {
            rest: &chain[..],
            last: Box::new(move || last().boxed()),
        };
        next.run(ctx).await
    }

    fn invalidate(&self) {
        *self.write_cache() = None;
    }

    fn entries(&self) -> RwLockReadGuard<'_, Vec<Entry<C, T>>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn entries_mut(&self) -> RwLockWriteGuard<'_, Vec<Entry<C, T>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_cache(&self) -> RwLockReadGuard<'_, Option<Arc<[Arc<dyn Middleware<C, T>>]>>> {
        self.cache.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, Option<Arc<[Arc<dyn Middleware<C, T>>]>>> {
        self.cache.write().unwrap_or_else(|e| e.into_inner())
    }
}
