// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

use super::types::{Error, Name, Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Counts the live BOs of a buffer manager that are bound to each global name.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    names: Mutex<HashMap<Name, u32>>,
}

impl Registry {
    fn names(&self) -> MutexGuard<'_, HashMap<Name, u32>> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds a BO to `name`.  Returns the new count.
    pub fn acquire(&self, name: Name) -> u32 {
        let mut names = self.names();
        let count = names.entry(name).or_insert(0);
        *count += 1;

        *count
    }

    /// Unbinds a BO from `name`.  Returns the new count.  The entry is removed when the count
    /// reaches zero.
    pub fn release(&self, name: Name) -> Result<u32> {
        let mut names = self.names();
        let count = names
            .get_mut(&name)
            .ok_or(Error::RegistryInconsistency(name))?;

        *count -= 1;
        let count = *count;
        if count == 0 {
            names.remove(&name);
        }

        Ok(count)
    }

    pub fn refcount(&self, name: Name) -> u32 {
        self.names().get(&name).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.names().len()
    }
}
