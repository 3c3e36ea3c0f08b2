use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Tool,
    #[default]
    Chain,
    Llm,
    Retriever,
    Prompt,
    Parser,
    ChatModel,
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunType::Tool => write!(f, "tool"),
            RunType::Chain => write!(f, "chain"),
            RunType::Llm => write!(f, "llm"),
            RunType::Retriever => write!(f, "retriever"),
            RunType::Prompt => write!(f, "prompt"),
            RunType::Parser => write!(f, "parser"),
            RunType::ChatModel => write!(f, "chat_model"),
        }
    }
}

impl From<&str> for RunType {
    fn from(s: &str) -> Self {
        match s {
            "tool" => RunType::Tool,
            "llm" => RunType::Llm,
            "retriever" => RunType::Retriever,
            "prompt" => RunType::Prompt,
            "parser" => RunType::Parser,
            "chat_model" => RunType::ChatModel,
            _ => RunType::Chain,
        }
    }
}

/// A timestamped lifecycle event recorded on a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEvent {
    pub name: String,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kwargs: Option<Value>,
}

impl RunEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            time: Utc::now(),
            kwargs: None,
        }
    }

    pub fn with_kwargs(name: impl Into<String>, kwargs: Value) -> Self {
        Self {
            name: name.into(),
            time: Utc::now(),
            kwargs: Some(kwargs),
        }
    }
}

/// A single execution of a runnable.
///
/// A run ends with either `outputs` or `error`, never both, and its
/// `end_time` is never earlier than its `start_time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,

    pub name: String,

    pub run_type: RunType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,

    /// Id of the root run of this trace.
    pub trace_id: Uuid,

    /// `<start><id>` segments from the root down to this run, joined by `.`.
    pub dotted_order: String,

    pub start_time: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    pub inputs: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub metadata: IndexMap<String, Value>,

    #[serde(default)]
    pub events: Vec<RunEvent>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_runs: Vec<Run>,
}

impl Run {
    /// Start a root run.
    pub fn new(id: Uuid, name: impl Into<String>, run_type: RunType, inputs: Value) -> Self {
        let start_time = Utc::now();
        Self {
            id,
            name: name.into(),
            run_type,
            parent_run_id: None,
            trace_id: id,
            dotted_order: dotted_order_segment(start_time, id),
            start_time,
            end_time: None,
            inputs,
            outputs: None,
            error: None,
            tags: Vec::new(),
            metadata: IndexMap::new(),
            events: vec![RunEvent::with_time("start", start_time)],
            child_runs: Vec::new(),
        }
    }

    /// Attach this run below `parent`, inheriting its trace.
    pub fn with_parent(
        mut self,
        parent_run_id: Uuid,
        trace_id: Uuid,
        parent_dotted_order: &str,
    ) -> Self {
        self.parent_run_id = Some(parent_run_id);
        self.trace_id = trace_id;
        self.dotted_order = format!("{parent_dotted_order}.{}", self.dotted_order);
        self
    }

    /// Add tags, skipping ones already present.
    pub fn add_tags<'a>(&mut self, tags: impl IntoIterator<Item = &'a String>) {
        for tag in tags {
            if !self.tags.contains(tag) {
                self.tags.push(tag.clone());
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn add_event(&mut self, event: RunEvent) {
        self.events.push(event);
    }

    /// Complete the run with its output snapshot.
    pub fn set_outputs(&mut self, outputs: Value) {
        self.error = None;
        self.outputs = Some(outputs);
        self.finish("end");
    }

    /// Complete the run with an error.
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.outputs = None;
        self.error = Some(error.into());
        self.finish("error");
    }

    fn finish(&mut self, event: &str) {
        let now = Utc::now().max(self.start_time);
        self.end_time = Some(now);
        self.events.push(RunEvent::with_time(event, now));
    }

    pub fn add_child(&mut self, child: Run) {
        self.child_runs.push(child);
    }
}

impl RunEvent {
    fn with_time(name: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            time,
            kwargs: None,
        }
    }
}

fn dotted_order_segment(start_time: DateTime<Utc>, id: Uuid) -> String {
    format!("{}Z{}", start_time.format("%Y%m%dT%H%M%S%6f"), id)
}
