use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{Stream, StreamExt, TryStreamExt};
use serde_json::{Map, Value};

use crate::tee::{tee, Tee};

/// Failure to produce a line of the build log: the body could not be read or
/// a line was not a JSON object. Cloneable so both views of a log can carry
/// it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct LogError {
    pub message: String,
}

impl LogError {
    pub fn new(message: impl fmt::Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// A raw line of the daemon's event stream
pub type LogLine = Result<String, LogError>;

/// One decoded line of the daemon's event stream
#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
    /// `{"stream": "..."}`, progress text including its trailing newline
    Stream(String),
    /// `{"error": "..."}`, with `errorDetail` if the daemon sent one
    Error {
        message: String,
        detail: Option<Value>,
    },
    /// Anything else the daemon emits (`aux`, `status`, ...)
    Other(Map<String, Value>),
}

impl BuildEvent {
    /// Decodes one line. An `error` field takes precedence over `stream`.
    pub fn parse(line: &str) -> Result<Self, LogError> {
        let mut map: Map<String, Value> = serde_json::from_str(line)
            .map_err(|e| LogError::new(format!("malformed build event {line:?}: {e}")))?;
        if let Some(error) = map.remove("error") {
            let message = match error {
                Value::String(s) => s,
                other => other.to_string(),
            };
            return Ok(BuildEvent::Error {
                message,
                detail: map.remove("errorDetail"),
            })
        }
        match map.remove("stream") {
            Some(Value::String(s)) => Ok(BuildEvent::Stream(s)),
            Some(other) => {
                map.insert("stream".to_owned(), other);
                Ok(BuildEvent::Other(map))
            }
            None => Ok(BuildEvent::Other(map)),
        }
    }

    /// The progress text of a [BuildEvent::Stream]
    pub fn stream_text(&self) -> Option<&str> {
        match self {
            BuildEvent::Stream(s) => Some(s),
            _ => None,
        }
    }
}

/// The replayable build log handed back to callers.
///
/// This is an independent view of the daemon's event stream. It yields every
/// event in the order the daemon sent it, no matter how far the outcome scan
/// has gotten, and it can be consumed while the build is still running.
pub struct BuildLog {
    lines: Tee<LogLine>,
}

impl BuildLog {
    /// Forks `lines` into a scanning view and a [BuildLog]
    pub(crate) fn fork<S>(lines: S) -> (Tee<LogLine>, Self)
    where
        S: Stream<Item = LogLine> + Send + 'static,
    {
        let (scan, replay) = tee(lines);
        (scan, Self { lines: replay })
    }

    /// A log with no events
    pub fn empty() -> Self {
        Self::fork(futures::stream::empty()).1
    }

    /// The undecoded lines, exactly as the daemon sent them
    pub fn into_lines(self) -> impl Stream<Item = LogLine> + Send {
        self.lines
    }

    /// Drains the log, stopping at the first line that could not be read or
    /// decoded
    pub async fn collect_events(self) -> Result<Vec<BuildEvent>, LogError> {
        self.try_collect().await
    }

    /// Drains the log into the concatenated `stream` texts, the human readable
    /// part of a build
    pub async fn collect_text(self) -> Result<String, LogError> {
        self.try_fold(String::new(), |mut acc, event| async move {
            if let Some(text) = event.stream_text() {
                acc.push_str(text);
            }
            Ok(acc)
        })
        .await
    }
}

impl Stream for BuildLog {
    type Item = Result<BuildEvent, LogError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.lines
            .poll_next_unpin(cx)
            .map(|line| line.map(|line| line.and_then(|line| BuildEvent::parse(&line))))
    }
}

impl fmt::Debug for BuildLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildLog").field("lines", &self.lines).finish()
    }
}
