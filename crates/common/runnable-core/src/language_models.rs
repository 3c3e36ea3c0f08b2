//! A fake chat model for tests and demos.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::messages::{AIMessage, AIMessageChunk};
use crate::runnables::{
    RunHandle, Runnable, RunnableConfig, call_with_config, once_stream,
    transform_stream_with_config,
};
use crate::signal::sleep_with_signal;
use crate::tracers::schemas::RunType;

#[derive(Debug, Clone, thiserror::Error)]
#[error("FakeListChatModelError")]
pub struct FakeListChatModelError;

/// Replies with canned responses, cycling through them in order.
///
/// Streaming emits one character per chunk. A `stop` kwarg (a string or a
/// list of strings) truncates the response at the first stop sequence.
#[derive(Debug)]
pub struct FakeListChatModel {
    responses: Vec<String>,
    sleep: Option<Duration>,
    index: AtomicUsize,
    error_on_chunk_number: Option<usize>,
}

impl Clone for FakeListChatModel {
    fn clone(&self) -> Self {
        Self {
            responses: self.responses.clone(),
            sleep: self.sleep,
            index: AtomicUsize::new(self.index.load(Ordering::SeqCst)),
            error_on_chunk_number: self.error_on_chunk_number,
        }
    }
}

fn stop_sequences(stop: Option<&Value>) -> Vec<String> {
    match stop {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn apply_stop(mut text: String, stop: &[String]) -> String {
    if let Some(cut) = stop.iter().filter_map(|s| text.find(s.as_str())).min() {
        text.truncate(cut);
    }
    text
}

impl FakeListChatModel {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            sleep: None,
            index: AtomicUsize::new(0),
            error_on_chunk_number: None,
        }
    }

    /// Sleep before replying, and between streamed chunks.
    pub fn with_sleep(mut self, duration: Duration) -> Self {
        self.sleep = Some(duration);
        self
    }

    /// Fail the stream when it reaches chunk `chunk_number` (zero based).
    pub fn with_error_on_chunk(mut self, chunk_number: usize) -> Self {
        self.error_on_chunk_number = Some(chunk_number);
        self
    }

    pub fn current_index(&self) -> usize {
        self.index.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.index.store(0, Ordering::SeqCst);
    }

    fn next_response(&self) -> Result<String> {
        if self.responses.is_empty() {
            return Err(Error::InvalidConfig(
                "FakeListChatModel has no responses".to_string(),
            ));
        }
        let i = self
            .index
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |i| {
                Some((i + 1) % self.responses.len())
            })
            .unwrap_or_default();
        Ok(self.responses[i % self.responses.len()].clone())
    }

    async fn pause(&self, run: &RunHandle) -> Result<()> {
        match self.sleep {
            Some(duration) => sleep_with_signal(duration, run.signal()).await,
            None => Ok(()),
        }
    }

    fn respond(&self, run: &RunHandle) -> Result<String> {
        let response = self.next_response()?;
        Ok(apply_stop(response, &stop_sequences(run.kwarg("stop"))))
    }
}

#[async_trait]
impl Runnable for FakeListChatModel {
    type Input = String;
    type Output = AIMessage;

    fn name(&self) -> Option<String> {
        Some("FakeListChatModel".to_string())
    }

    fn run_type(&self) -> RunType {
        RunType::Llm
    }

    async fn invoke(&self, input: String, config: Option<RunnableConfig>) -> Result<AIMessage> {
        call_with_config(self, input, config, |_input, run| async move {
            self.pause(&run).await?;
            Ok(AIMessage::new(self.respond(&run)?))
        })
        .await
    }

    fn stream<'a>(
        &'a self,
        input: String,
        config: Option<RunnableConfig>,
    ) -> BoxStream<'a, Result<AIMessage>> {
        transform_stream_with_config(self, once_stream(input), config, move |mut inputs, run| {
            Box::pin(async_stream::stream! {
                if let Some(Err(error)) = inputs.next().await {
                    yield Err(error);
                    return;
                }
                let response = match self.respond(&run) {
                    Ok(response) => response,
                    Err(error) => {
                        yield Err(error);
                        return;
                    }
                };
                for (index, c) in response.chars().enumerate() {
                    if let Err(error) = self.pause(&run).await {
                        yield Err(error);
                        return;
                    }
                    if self.error_on_chunk_number == Some(index) {
                        yield Err(Error::unit(FakeListChatModelError));
                        return;
                    }
                    let chunk = AIMessageChunk::new(c.to_string());
                    run.on_chunk(&serde_json::to_value(&chunk).unwrap_or_default()).await;
                    yield Ok(AIMessage::from(chunk));
                }
            })
        })
    }
}
