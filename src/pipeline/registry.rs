// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Accounting of the decoders alive at the same time.
//!
//! The hardware only supports a handful of concurrent contexts. Each running pipeline holds an
//! [`InstanceGuard`] from a shared [`InstanceRegistry`] and gives it back when it stops.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use thiserror::Error;

use crate::config::DEFAULT_MAX_INSTANCES;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("all {0} decoder instances are in use")]
    Exhausted(usize),
}

#[derive(Debug)]
pub struct InstanceRegistry {
    max_instances: usize,
    active: AtomicUsize,
    next_id: AtomicUsize,
}

impl InstanceRegistry {
    pub fn new(max_instances: usize) -> Self {
        Self {
            max_instances,
            active: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
        }
    }

    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    /// Number of guards currently alive.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn acquire(self: &Arc<Self>) -> Result<InstanceGuard, RegistryError> {
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < self.max_instances).then_some(active + 1)
            })
            .map_err(|_| RegistryError::Exhausted(self.max_instances))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        log::debug!("decoder instance {} acquired ({}/{})", id, self.active(), self.max_instances);

        Ok(InstanceGuard { registry: Arc::clone(self), id })
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INSTANCES)
    }
}

/// A slot in the registry, released on drop.
#[derive(Debug)]
pub struct InstanceGuard {
    registry: Arc<InstanceRegistry>,
    id: usize,
}

impl InstanceGuard {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.registry.active.fetch_sub(1, Ordering::SeqCst);
        log::debug!("decoder instance {} released", self.id);
    }
}
