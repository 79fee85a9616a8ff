use std::sync::LazyLock;

use futures::{Stream, StreamExt};
use regex::Regex;

use crate::{
    error::{BuildError, Result},
    events::{BuildEvent, BuildLog, LogError, LogLine},
    image::{Image, ImageLookup},
    transport::LineStream,
};

/// A `stream` value that is exactly a lowercase hex id and one newline
/// reports the id of the built image
static IMAGE_ID_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9a-f]+)\n$").expect("invalid image id regex"));

/// Message of a failure when the stream ends with no id and no lines at all
pub const UNKNOWN_FAILURE: &str = "Unknown";

/// How a build ended, as far as the event stream tells
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The last image id the stream reported
    Built(String),
    /// The first error event, or the last raw line when no id was reported
    Failed(String),
}

/// The image id in a `stream` text, if it is one
pub fn image_id_marker(text: &str) -> Option<&str> {
    IMAGE_ID_MARKER
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Consumes `lines` up to the first error event, or to the end.
///
/// Every `stream` text matching the image id marker replaces the id found so
/// far. A line that cannot be read or decoded ends the scan as a failure.
pub async fn scan_events<S>(mut lines: S) -> ScanOutcome
where
    S: Stream<Item = LogLine> + Unpin,
{
    let mut image_id = None;
    let mut last_line = None;
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LogError { message }) => return ScanOutcome::Failed(message),
        };
        let event = match BuildEvent::parse(&line) {
            Ok(event) => event,
            Err(LogError { message }) => return ScanOutcome::Failed(message),
        };
        match event {
            BuildEvent::Error { message, .. } => {
                tracing::debug!("build error event: {message}");
                return ScanOutcome::Failed(message)
            }
            BuildEvent::Stream(text) => {
                tracing::debug!("{}", text.trim_end());
                if let Some(id) = image_id_marker(&text) {
                    image_id = Some(id.to_owned());
                }
            }
            BuildEvent::Other(_) => (),
        }
        last_line = Some(line);
    }
    match image_id {
        Some(id) => ScanOutcome::Built(id),
        None => ScanOutcome::Failed(last_line.unwrap_or_else(|| UNKNOWN_FAILURE.to_owned())),
    }
}

/// Reads the outcome of a build from the daemon's response lines.
///
/// The lines are forked so that the returned [BuildLog] replays all of them
/// from the start, whether the build succeeded or failed.
#[tracing::instrument(skip_all)]
pub async fn interpret<L>(lines: LineStream, lookup: &L) -> Result<(Image, BuildLog)>
where
    L: ImageLookup + ?Sized,
{
    let lines = lines.map(|line| line.map_err(|e| LogError::new(format!("{e:?}"))));
    let (scan, log) = BuildLog::fork(lines);
    match scan_events(scan).await {
        ScanOutcome::Built(id) => {
            tracing::info!("build reported image {id}");
            let image = lookup.get_image(&id).await?;
            Ok((image, log))
        }
        ScanOutcome::Failed(message) => {
            tracing::warn!("build failed: {message}");
            Err(BuildError::Build { message, log })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, io, sync::Mutex};

    use async_trait::async_trait;
    use futures::stream;
    use stacked_errors::StackableErr;

    use super::*;

    #[derive(Default)]
    struct Lookups {
        known: BTreeMap<String, Image>,
        asked: Mutex<Vec<String>>,
    }

    impl Lookups {
        fn with(ids: &[&str]) -> Self {
            Self {
                known: ids.iter().map(|id| (id.to_string(), Image::new(*id))).collect(),
                asked: Mutex::default(),
            }
        }

        fn asked(&self) -> Vec<String> {
            self.asked.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ImageLookup for Lookups {
        async fn get_image(&self, id: &str) -> Result<Image> {
            self.asked.lock().unwrap().push(id.to_owned());
            self.known
                .get(id)
                .cloned()
                .ok_or_else(|| BuildError::NotFound {
                    message: format!("no image {id}"),
                })
        }
    }

    fn lines(lines: &[&str]) -> LineStream {
        stream::iter(
            lines
                .iter()
                .map(|l| Ok(l.to_string()))
                .collect::<Vec<stacked_errors::Result<String>>>(),
        )
        .boxed()
    }

    async fn replay(log: BuildLog) -> Vec<String> {
        log.into_lines().map(|l| l.unwrap()).collect().await
    }

    #[tokio::test]
    async fn reports_image_and_replays() {
        let raw = [
            r#"{"stream":"STEP 1/1: FROM scratch\n"}"#,
            r#"{"stream":"COMMIT myimage:latest\n"}"#,
            r#"{"stream":"deadbeef12\n"}"#,
        ];
        let lookup = Lookups::with(&["deadbeef12"]);
        let (image, log) = interpret(lines(&raw), &lookup).await.unwrap();
        assert_eq!(image.id(), "deadbeef12");
        assert_eq!(lookup.asked(), ["deadbeef12"]);
        assert_eq!(replay(log).await, raw);
    }

    #[tokio::test]
    async fn first_error_fails_at_any_position() {
        let raw = [
            r#"{"stream":"a\n"}"#,
            r#"{"stream":"abc123\n"}"#,
            r#"{"stream":"b\n"}"#,
        ];
        for i in 0..=raw.len() {
            let mut with_error: Vec<&str> = raw.to_vec();
            with_error.insert(i, r#"{"error":"boom","errorDetail":{"message":"boom"}}"#);
            with_error.push(r#"{"error":"second"}"#);
            let lookup = Lookups::with(&["abc123"]);
            let err = interpret(lines(&with_error), &lookup).await.unwrap_err();
            assert!(lookup.asked().is_empty());
            let BuildError::Build { message, log } = err else {
                panic!("expected a build failure")
            };
            assert_eq!(message, "boom");
            // the log is complete, not only what the scan got to
            assert_eq!(replay(log).await, with_error);
        }
    }

    #[tokio::test]
    async fn empty_stream_is_unknown() {
        let lookup = Lookups::default();
        let err = interpret(lines(&[]), &lookup).await.unwrap_err();
        assert!(matches!(err, BuildError::Build { ref message, .. } if message == UNKNOWN_FAILURE));
        assert!(replay(err.into_log().unwrap()).await.is_empty());
    }

    #[tokio::test]
    async fn last_marker_wins() {
        let raw = [
            r#"{"stream":"aaaa\n"}"#,
            r#"{"stream":"not an id\n"}"#,
            r#"{"stream":"bbbb\n"}"#,
            r#"{"aux":{"ID":"sha256:bbbb"}}"#,
        ];
        let lookup = Lookups::with(&["aaaa", "bbbb"]);
        let (image, _) = interpret(lines(&raw), &lookup).await.unwrap();
        assert_eq!(image.id(), "bbbb");
        assert_eq!(lookup.asked(), ["bbbb"]);
    }

    #[tokio::test]
    async fn no_marker_fails_with_last_line() {
        let raw = [r#"{"stream":"STEP 1/1\n"}"#, r#"{"status":"done"}"#];
        let err = interpret(lines(&raw), &Lookups::default())
            .await
            .unwrap_err();
        let BuildError::Build { message, log } = err else {
            panic!("expected a build failure")
        };
        assert_eq!(message, r#"{"status":"done"}"#);
        assert_eq!(replay(log).await, raw);
    }

    #[tokio::test]
    async fn malformed_line_fails() {
        let raw = [r#"{"stream":"abc\n"}"#, "garbage", r#"{"stream":"def\n"}"#];
        let err = interpret(lines(&raw), &Lookups::with(&["abc", "def"]))
            .await
            .unwrap_err();
        let BuildError::Build { message, log } = err else {
            panic!("expected a build failure")
        };
        assert!(message.contains("garbage"));
        assert_eq!(replay(log).await, raw);
    }

    #[tokio::test]
    async fn read_error_fails_and_is_replayed() {
        let items: Vec<stacked_errors::Result<String>> = vec![
            Ok(r#"{"stream":"abc\n"}"#.to_owned()),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"))
                .stack_err("reading response body"),
        ];
        let err = interpret(stream::iter(items).boxed(), &Lookups::with(&["abc"]))
            .await
            .unwrap_err();
        let log = err.into_log().unwrap();
        let replayed: Vec<LogLine> = log.into_lines().collect().await;
        assert_eq!(replayed.len(), 2);
        assert!(replayed[0].is_ok());
        assert!(replayed[1]
            .as_ref()
            .unwrap_err()
            .message
            .contains("connection reset"));
    }

    #[test]
    fn marker_is_strict() {
        assert_eq!(image_id_marker("deadbeef12\n"), Some("deadbeef12"));
        assert_eq!(image_id_marker("deadbeef12"), None);
        assert_eq!(image_id_marker("deadbeef12\n\n"), None);
        assert_eq!(image_id_marker("DEADBEEF\n"), None);
        assert_eq!(image_id_marker(" abc\n"), None);
        assert_eq!(image_id_marker("\n"), None);
    }

    #[tokio::test]
    async fn lookup_failure_propagates() {
        let raw = [r#"{"stream":"abc\n"}"#];
        let err = interpret(lines(&raw), &Lookups::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
