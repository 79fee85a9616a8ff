use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use stacked_errors::{Result, StackableErr};

use crate::{
    options::BuildParams,
    transport::{Transport, TransportRequest, TransportResponse},
};

/// A request as the mock daemon saw it, with the body read out
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub path: String,
    pub query: BuildParams,
    pub body: Option<Vec<u8>>,
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl RecordedRequest {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Names of the entries in the body, which must be a plain tarball
    pub fn archive_entries(&self) -> Vec<String> {
        let body = self.body.as_deref().unwrap_or_default();
        tar::Archive::new(body)
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_str().unwrap().to_owned())
            .collect()
    }
}

/// A daemon with canned responses that records every request
#[derive(Debug)]
pub struct MockTransport {
    build_status: u16,
    build_lines: Vec<String>,
    images: BTreeMap<String, serde_json::Value>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockTransport {
    /// Answers builds with status 200 and `lines`
    pub fn building(lines: &[&str]) -> Self {
        Self {
            build_status: 200,
            build_lines: lines.iter().map(|l| l.to_string()).collect(),
            images: BTreeMap::new(),
            requests: Mutex::default(),
        }
    }

    /// Answers builds with a non-success status and `body`
    pub fn failing(status: u16, body: &str) -> Self {
        Self {
            build_status: status,
            build_lines: vec![body.to_owned()],
            images: BTreeMap::new(),
            requests: Mutex::default(),
        }
    }

    /// Makes `id` known to image inspection
    pub fn with_image(mut self, id: &str, tags: &[&str]) -> Self {
        self.images.insert(
            id.to_owned(),
            serde_json::json!({"Id": id, "RepoTags": tags, "Labels": null}),
        );
        self
    }

    pub fn requests(&self) -> MutexGuard<'_, Vec<RecordedRequest>> {
        self.requests.lock().unwrap()
    }

    /// The recorded `POST`s
    pub fn posts(&self) -> Vec<RecordedRequest> {
        self.requests()
            .iter()
            .filter(|r| r.method == "POST")
            .cloned()
            .collect()
    }

    fn respond(status: u16, lines: Vec<String>) -> TransportResponse {
        TransportResponse {
            status,
            headers: vec![],
            lines: stream::iter(lines.into_iter().map(Ok)).boxed(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn post(&self, request: TransportRequest) -> Result<TransportResponse> {
        let body = match request.body {
            Some(body) => Some(body.read_all().await.stack()?),
            None => None,
        };
        self.requests().push(RecordedRequest {
            method: "POST",
            path: request.path,
            query: request.query,
            body,
            headers: request.headers,
            timeout: request.timeout,
        });
        Ok(Self::respond(self.build_status, self.build_lines.clone()))
    }

    async fn get(&self, path: &str, query: &BuildParams) -> Result<TransportResponse> {
        self.requests().push(RecordedRequest {
            method: "GET",
            path: path.to_owned(),
            query: query.clone(),
            body: None,
            headers: vec![],
            timeout: None,
        });
        let id = path
            .strip_prefix("/images/")
            .and_then(|rest| rest.strip_suffix("/json"));
        Ok(match id.and_then(|id| self.images.get(id)) {
            Some(image) => Self::respond(200, vec![image.to_string()]),
            None => Self::respond(404, vec![
                r#"{"cause":"image not known","message":"no such image","response":404}"#
                    .to_owned(),
            ]),
        })
    }
}
