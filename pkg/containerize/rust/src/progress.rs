// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use log::debug;
use uuid::Uuid;

use crate::errors::Error;

/// Percentage of completion of running conversions, by caller-chosen token.
pub trait ProgressStore: Send + Sync {
    fn get(&self, key: &str) -> Option<u8>;
    fn set(&self, key: &str, percent: u8);
    fn delete(&self, key: &str);
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryProgressStore {
    entries: Arc<RwLock<HashMap<String, u8>>>,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressStore for InMemoryProgressStore {
    fn get(&self, key: &str) -> Option<u8> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    fn set(&self, key: &str, percent: u8) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), percent.min(100));
    }

    fn delete(&self, key: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// A fresh opaque progress token.
pub fn generate_key() -> String {
    Uuid::new_v4().to_string()
}

pub fn status(store: &dyn ProgressStore, key: &str) -> Result<u8, Error> {
    store
        .get(key)
        .ok_or_else(|| Error::ProgressKey(key.to_string()))
}

/// Reports the progress of one conversion. The token is removed when the
/// reporter is dropped, however the conversion ended.
pub struct ProgressReporter {
    store: Arc<dyn ProgressStore>,
    key: Option<String>,
    stages: usize,
    completed: usize,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn ProgressStore>, key: Option<String>, stages: usize) -> Self {
        if let Some(key) = &key {
            store.set(key, 0);
        }
        ProgressReporter {
            store,
            key,
            stages: stages.max(1),
            completed: 0,
        }
    }

    pub fn stage_completed(&mut self, stage: &str) {
        self.completed += 1;
        let percent = u8::try_from(self.completed * 100 / self.stages).unwrap_or(100);
        debug!("stage {stage} completed ({percent}%)");
        if self.completed < self.stages
            && let Some(key) = &self.key
        {
            self.store.set(key, percent);
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if let Some(key) = &self.key {
            self.store.delete(key);
        }
    }
}
