//! Scripted [`Network`] used by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use tokio::time::Instant;

use super::{FetchRequest, FetchResponse, Network, NetworkError};

/// 1x1 transparent PNG.
pub(crate) const PNG_1X1: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

#[derive(Clone)]
pub(crate) enum Reply {
    Respond(FetchResponse),
    Fail,
    Delayed(Duration, Box<Reply>),
}

impl Reply {
    pub(crate) fn status(status: StatusCode, body: &str) -> Self {
        Self::Respond(FetchResponse::new(status, body.to_string()))
    }
}

#[derive(Default)]
pub(crate) struct ScriptedNetwork {
    once: Mutex<HashMap<String, VecDeque<Reply>>>,
    always: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<(Method, String, Instant)>>,
    offline: AtomicBool,
}

impl ScriptedNetwork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Answer every request for `url` with `reply`.
    pub(crate) fn always(&self, url: &str, reply: Reply) {
        self.always
            .lock()
            .expect("always lock")
            .insert(url.to_string(), reply);
    }

    /// Answer the next request for `url` with `reply`, ahead of `always`.
    pub(crate) fn once(&self, url: &str, reply: Reply) {
        self.once
            .lock()
            .expect("once lock")
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub(crate) fn calls_to(&self, url: &str) -> usize {
        self.call_times(url).len()
    }

    pub(crate) fn call_times(&self, url: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|(_, called, _)| called == url)
            .map(|(_, _, at)| *at)
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
impl Network for ScriptedNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetworkError> {
        let url = request.url.to_string();
        self.calls.lock().expect("calls lock").push((
            request.method.clone(),
            url.clone(),
            Instant::now(),
        ));

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetworkError::connect(&request.url, "offline"));
        }

        let mut reply = self.next_reply(&url);
        loop {
            match reply {
                Some(Reply::Respond(response)) => return Ok(response),
                Some(Reply::Delayed(delay, inner)) => {
                    tokio::time::sleep(delay).await;
                    reply = Some(*inner);
                }
                Some(Reply::Fail) | None => {
                    return Err(NetworkError::connect(&request.url, "unreachable"));
                }
            }
        }
    }
}
