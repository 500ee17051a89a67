// Copyright 2026 Joyent, Inc.

//! Recycling of request-token containers.
//!
//! Sustained request traffic would otherwise allocate one container per
//! message. `get` never blocks; an empty free list just allocates. The
//! checkout is a guard, so the container goes back to the pool, reset, on
//! every exit path.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};

use crate::protocol::RequestTokens;

pub struct RequestPool {
    free: Mutex<Vec<RequestTokens>>,
}

impl RequestPool {
    pub fn new() -> RequestPool {
        RequestPool {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Checks a container out of the pool, allocating if none is free.
    /// The guard holds exclusive access until it is dropped.
    pub fn get(&self) -> PooledRequest<'_> {
        let tokens = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default();
        PooledRequest {
            pool: self,
            tokens: Some(tokens),
        }
    }

    /// Number of containers currently sitting on the free list.
    pub fn idle(&self) -> usize {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn put_back(&self, mut tokens: RequestTokens) {
        tokens.reset();
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tokens);
    }
}

impl Default for RequestPool {
    fn default() -> RequestPool {
        RequestPool::new()
    }
}

/// Exclusive checkout of one pooled container.
pub struct PooledRequest<'a> {
    pool: &'a RequestPool,
    tokens: Option<RequestTokens>,
}

impl Deref for PooledRequest<'_> {
    type Target = RequestTokens;

    fn deref(&self) -> &RequestTokens {
        self.tokens.as_ref().expect("container present until drop")
    }
}

impl DerefMut for PooledRequest<'_> {
    fn deref_mut(&mut self) -> &mut RequestTokens {
        self.tokens.as_mut().expect("container present until drop")
    }
}

impl Drop for PooledRequest<'_> {
    fn drop(&mut self) {
        if let Some(tokens) = self.tokens.take() {
            self.pool.put_back(tokens);
        }
    }
}
