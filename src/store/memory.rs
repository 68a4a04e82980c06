//! In-process pipeline store with Redis list/string semantics.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{PipelineStore, StoreOp, Transaction};
use crate::error::StoreError;

#[derive(Debug, Clone)]
enum Entry {
    List(VecDeque<String>),
    Str(String),
}

/// Thread-safe in-memory store.
///
/// All commands run under one mutex, so transactions are trivially atomic.
/// Shares nothing across processes; use [`super::RedisStore`] for that.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether a key currently exists.
    pub async fn contains_key(&self, key: &str) -> bool {
        self.entries.lock().await.contains_key(key)
    }
}

fn list_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut VecDeque<String>, StoreError> {
    match entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::List(VecDeque::new()))
    {
        Entry::List(list) => Ok(list),
        Entry::Str(_) => Err(StoreError::WrongType {
            key: key.to_string(),
        }),
    }
}

fn pop_front(
    entries: &mut HashMap<String, Entry>,
    key: &str,
    count: usize,
) -> Result<Vec<String>, StoreError> {
    let popped: Vec<String> = match entries.get_mut(key) {
        None => return Ok(Vec::new()),
        Some(Entry::Str(_)) => {
            return Err(StoreError::WrongType {
                key: key.to_string(),
            })
        }
        Some(Entry::List(list)) => {
            let n = count.min(list.len());
            list.drain(..n).collect()
        }
    };

    // Redis drops a list once its last element is gone
    if matches!(entries.get(key), Some(Entry::List(list)) if list.is_empty()) {
        entries.remove(key);
    }
    Ok(popped)
}

/// Resolves a Redis-style inclusive range against a list of `len` elements.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn list_right_push(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock().await;
        let list = list_mut(&mut entries, key)?;
        list.push_back(value.to_string());
        Ok(list.len())
    }

    async fn list_left_push(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock().await;
        let list = list_mut(&mut entries, key)?;
        list.push_front(value.to_string());
        Ok(list.len())
    }

    async fn list_left_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock().await;
        Ok(pop_front(&mut entries, key, 1)?.into_iter().next())
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let entries = self.entries.lock().await;
        match entries.get(key) {
            None => Ok(0),
            Some(Entry::List(list)) => Ok(list.len()),
            Some(Entry::Str(_)) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().await;
        let list = match entries.get(key) {
            None => return Ok(Vec::new()),
            Some(Entry::List(list)) => list,
            Some(Entry::Str(_)) => {
                return Err(StoreError::WrongType {
                    key: key.to_string(),
                })
            }
        };

        Ok(match resolve_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn string_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().await;
        match entries.get(key) {
            None => Ok(None),
            Some(Entry::Str(value)) => Ok(Some(value.clone())),
            Some(Entry::List(_)) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn string_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), Entry::Str(value.to_string()));
        Ok(())
    }

    async fn key_delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock().await;
        Ok(keys.iter().filter(|k| entries.remove(*k).is_some()).count())
    }

    async fn execute(&self, transaction: Transaction) -> Result<Vec<String>, StoreError> {
        let mut entries = self.entries.lock().await;

        // Work on a copy so a failing command leaves the store untouched
        let mut staged = entries.clone();
        let mut popped = Vec::new();
        for op in transaction.ops() {
            match op {
                StoreOp::ListLeftPop { key, count } => {
                    popped.extend(pop_front(&mut staged, key, *count)?);
                }
                StoreOp::StringSet { key, value } => {
                    staged.insert(key.clone(), Entry::Str(value.clone()));
                }
                StoreOp::KeyDelete { keys } => {
                    for key in keys {
                        staged.remove(key);
                    }
                }
            }
        }

        *entries = staged;
        Ok(popped)
    }
}
