//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use amanakshar::net::{FetchRequest, FetchResponse, Network, NetworkError};
use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use bytes::Bytes;
use tokio::time::Instant;
use url::Url;

pub const ORIGIN: &str = "https://amanakshar.example";

/// 1x1 transparent PNG.
pub const PNG_1X1: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

pub fn origin() -> Url {
    Url::parse(ORIGIN).expect("origin url")
}

pub fn url(path: &str) -> String {
    format!("{ORIGIN}{path}")
}

#[derive(Clone)]
pub enum Reply {
    Respond(FetchResponse),
    Fail,
    Delayed(Duration, Box<Reply>),
}

impl Reply {
    pub fn status(status: StatusCode, body: &str) -> Self {
        Self::Respond(FetchResponse::new(status, body.to_string()))
    }

    pub fn ok(body: &str) -> Self {
        Self::status(StatusCode::OK, body)
    }

    pub fn after(delay: Duration, reply: Reply) -> Self {
        Self::Delayed(delay, Box::new(reply))
    }
}

/// In-memory origin: answers from a script, records every call.
#[derive(Default)]
pub struct FakeNetwork {
    once: Mutex<HashMap<String, VecDeque<Reply>>>,
    always: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<(Method, String, Bytes, Instant)>>,
    offline: AtomicBool,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always(&self, url: &str, reply: Reply) {
        self.always
            .lock()
            .expect("always lock")
            .insert(url.to_string(), reply);
    }

    pub fn once(&self, url: &str, reply: Reply) {
        self.once
            .lock()
            .expect("once lock")
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.call_times(url).len()
    }

    pub fn call_times(&self, url: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|(_, called, _, _)| called == url)
            .map(|(_, _, _, at)| *at)
            .collect()
    }

    /// Request bodies sent to `url`, in call order.
    pub fn bodies_to(&self, url: &str) -> Vec<Bytes> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|(_, called, _, _)| called == url)
            .map(|(_, _, body, _)| body.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<(Method, String)> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(method, url, _, _)| (method.clone(), url.clone()))
            .collect()
    }

    fn next_reply(&self, url: &str) -> Option<Reply> {
        let queued = self
            .once
            .lock()
            .expect("once lock")
            .get_mut(url)
            .and_then(VecDeque::pop_front);
        queued.or_else(|| self.always.lock().expect("always lock").get(url).cloned())
    }
}

#[async_trait]
impl Network for FakeNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetworkError> {
        let key = request.url.to_string();
        self.calls
            .lock()
            .expect("calls lock")
            .push((
                request.method.clone(),
                key.clone(),
                request.body.clone(),
                Instant::now(),
            ));

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetworkError::connect(&request.url, "offline"));
        }

        let mut reply = self
            .next_reply(&key)
            .unwrap_or_else(|| Reply::status(StatusCode::NOT_FOUND, "not scripted"));
        loop {
            match reply {
                Reply::Respond(response) => return Ok(response),
                Reply::Fail => return Err(NetworkError::connect(&request.url, "refused")),
                Reply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
            }
        }
    }
}
