use std::future::Future;

use futures::stream::{self, StreamExt};
use serde_json::Value;

use crate::error::Result;

/// Concatenate two streamed chunks.
///
/// Strings append, arrays extend, objects merge key by key (recursively),
/// and `null` is the identity. Any other pairing returns `None`.
pub fn concat_values(left: Value, right: Value) -> Option<Value> {
    match (left, right) {
        (Value::Null, right) => Some(right),
        (left, Value::Null) => Some(left),
        (Value::String(mut left), Value::String(right)) => {
            left.push_str(&right);
            Some(Value::String(left))
        }
        (Value::Array(mut left), Value::Array(right)) => {
            left.extend(right);
            Some(Value::Array(left))
        }
        (Value::Object(mut left), Value::Object(right)) => {
            for (key, value) in right {
                let merged = match left.remove(&key) {
                    Some(existing) => concat_values(existing, value)?,
                    None => value,
                };
                left.insert(key, merged);
            }
            Some(Value::Object(left))
        }
        _ => None,
    }
}

/// Folds streamed chunks into a single value.
///
/// Once two chunks cannot be concatenated, aggregation is abandoned and the
/// result is the last chunk seen.
#[derive(Debug, Default, Clone)]
pub struct ChunkAggregator {
    acc: Option<Value>,
    last: Option<Value>,
    unsupported: bool,
}

impl ChunkAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: Value) {
        if !self.unsupported {
            self.acc = match self.acc.take() {
                None => Some(chunk.clone()),
                Some(acc) => {
                    let merged = concat_values(acc, chunk.clone());
                    if merged.is_none() {
                        self.unsupported = true;
                    }
                    merged
                }
            };
        }
        self.last = Some(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_none()
    }

    /// The aggregate, the last chunk if aggregation was abandoned, or
    /// `null` when nothing was pushed.
    pub fn finish(self) -> Value {
        if self.unsupported {
            self.last.unwrap_or_default()
        } else {
            self.acc.unwrap_or_default()
        }
    }
}

/// Run futures with at most `limit` in flight, failing fast.
///
/// Results keep the order of `futures`. The first error to occur is
/// returned and the futures still in flight are dropped.
pub async fn try_gather_with_concurrency<T, F>(limit: usize, futures: Vec<F>) -> Result<Vec<T>>
where
    F: Future<Output = Result<T>>,
{
    let len = futures.len();
    let mut slots: Vec<Option<T>> = (0..len).map(|_| None).collect();
    let mut results = stream::iter(
        futures
            .into_iter()
            .enumerate()
            .map(|(index, fut)| async move { (index, fut.await) }),
    )
    .buffer_unordered(limit.max(1));

    while let Some((index, result)) = results.next().await {
        slots[index] = Some(result?);
    }
    Ok(slots.into_iter().flatten().collect())
}

/// Run futures with at most `limit` in flight, keeping every outcome.
pub async fn gather_with_concurrency<T, F>(limit: usize, futures: Vec<F>) -> Vec<T>
where
    F: Future<Output = T>,
{
    stream::iter(futures)
        .buffered(limit.max(1))
        .collect()
        .await
}

/// The last path segment of a type name, without generic arguments.
pub fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
