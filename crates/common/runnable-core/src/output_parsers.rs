//! Output parsers: units that turn model messages into plain values.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::messages::AIMessage;
use crate::runnables::{
    Runnable, RunnableConfig, call_with_config, once_stream, transform_stream_with_config,
};
use crate::tracers::schemas::RunType;

/// Extracts the text content of a message.
///
/// Streams chunk by chunk: each incoming message chunk becomes one string
/// chunk.
#[derive(Debug, Clone, Default)]
pub struct StrOutputParser {
    _private: (),
}

impl StrOutputParser {
    pub fn new() -> Self {
        Self { _private: () }
    }
}

#[async_trait]
impl Runnable for StrOutputParser {
    type Input = AIMessage;
    type Output = String;

    fn run_type(&self) -> RunType {
        RunType::Parser
    }

    fn supports_transform(&self) -> bool {
        true
    }

    async fn invoke(&self, input: AIMessage, config: Option<RunnableConfig>) -> Result<String> {
        call_with_config(self, input, config, |input, _run| async move { Ok(input.content) }).await
    }

    fn stream<'a>(
        &'a self,
        input: AIMessage,
        config: Option<RunnableConfig>,
    ) -> BoxStream<'a, Result<String>> {
        self.transform(once_stream(input), config)
    }

    fn transform<'a>(
        &'a self,
        input: BoxStream<'a, Result<AIMessage>>,
        config: Option<RunnableConfig>,
    ) -> BoxStream<'a, Result<String>> {
        transform_stream_with_config(self, input, config, |input, _run| {
            input
                .map(|chunk| chunk.map(|message| message.content))
                .boxed()
        })
    }
}
