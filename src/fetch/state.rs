//! Request state machines for pages: a query that refetches on demand and a
//! mutation invoked explicitly.
//!
//! State is published on a `watch` channel. A request is in exactly one
//! [`RequestStatus`] at a time, so the loading, error and success flags are
//! mutually exclusive by construction.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::http::Method;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::util::lock::mutex_lock;

use super::{ApiClient, ApiRequestError, error_message};

const SOURCE: &str = "fetch::state";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestState<T> {
    pub status: RequestStatus,
    /// Last successful data; kept while reloading and after a failure.
    pub data: Option<T>,
    pub error: Option<ApiRequestError>,
}

impl<T> Default for RequestState<T> {
    fn default() -> Self {
        Self {
            status: RequestStatus::Idle,
            data: None,
            error: None,
        }
    }
}

impl<T> RequestState<T> {
    pub fn is_idle(&self) -> bool {
        self.status == RequestStatus::Idle
    }

    pub fn is_loading(&self) -> bool {
        self.status == RequestStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == RequestStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == RequestStatus::Error
    }

    /// Hindi message for the current error.
    pub fn message(&self) -> Option<&'static str> {
        self.error.as_ref().map(error_message)
    }

    fn start(&mut self) {
        self.status = RequestStatus::Loading;
        self.error = None;
    }

    fn succeed(&mut self, data: T) {
        self.status = RequestStatus::Success;
        self.data = Some(data);
        self.error = None;
    }

    fn fail(&mut self, error: ApiRequestError) {
        self.status = RequestStatus::Error;
        self.error = Some(error);
    }
}

type SuccessHook<T> = Arc<dyn Fn(&T) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&ApiRequestError) + Send + Sync>;

#[derive(Debug, Default)]
struct Inflight {
    generation: u64,
    token: Option<CancellationToken>,
}

/// GET query bound to one API path. The last call to
/// [`execute`](ApiQuery::execute) wins; earlier calls are cancelled and
/// resolve to `None` without touching state.
pub struct ApiQuery<T> {
    client: ApiClient,
    path: String,
    immediate: bool,
    on_success: Option<SuccessHook<T>>,
    on_error: Option<ErrorHook>,
    state: watch::Sender<RequestState<T>>,
    inflight: Mutex<Inflight>,
    mounted: AtomicBool,
}

impl<T> ApiQuery<T>
where
    T: Clone + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(client: ApiClient, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
            immediate: false,
            on_success: None,
            on_error: None,
            state: watch::Sender::new(RequestState::default()),
            inflight: Mutex::new(Inflight::default()),
            mounted: AtomicBool::new(true),
        }
    }

    /// Execute on [`mount`](ApiQuery::mount).
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    pub fn on_success(mut self, hook: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&ApiRequestError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn state(&self) -> RequestState<T> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RequestState<T>> {
        self.state.subscribe()
    }

    pub async fn mount(&self) -> Option<T> {
        self.mounted.store(true, Ordering::Release);
        if self.immediate {
            self.execute().await
        } else {
            None
        }
    }

    /// Cancel the in-flight call and stop publishing state.
    pub fn unmount(&self) {
        self.mounted.store(false, Ordering::Release);
        let mut inflight = mutex_lock(&self.inflight, SOURCE, "unmount");
        inflight.generation += 1;
        if let Some(token) = inflight.token.take() {
            token.cancel();
        }
    }

    pub async fn execute(&self) -> Option<T> {
        if !self.mounted.load(Ordering::Acquire) {
            return None;
        }

        let token = CancellationToken::new();
        let generation = {
            let mut inflight = mutex_lock(&self.inflight, SOURCE, "execute");
            if let Some(previous) = inflight.token.replace(token.clone()) {
                previous.cancel();
            }
            inflight.generation += 1;
            self.state.send_modify(RequestState::start);
            inflight.generation
        };

        let result = self
            .client
            .get_cancellable::<T>(&self.path, &token)
            .await;

        {
            let mut inflight = mutex_lock(&self.inflight, SOURCE, "settle");
            if inflight.generation != generation {
                debug!(path = %self.path, "superseded query ignored");
                return None;
            }
            inflight.token = None;
            match &result {
                Ok(data) => self.state.send_modify(|state| state.succeed(data.clone())),
                Err(ApiRequestError::Aborted) => return None,
                Err(err) => self.state.send_modify(|state| state.fail(err.clone())),
            }
        }

        match result {
            Ok(data) => {
                if let Some(hook) = &self.on_success {
                    hook(&data);
                }
                Some(data)
            }
            Err(err) => {
                if let Some(hook) = &self.on_error {
                    hook(&err);
                }
                None
            }
        }
    }
}

type MutationFn<T, V> =
    Arc<dyn Fn(V) -> BoxFuture<'static, Result<T, ApiRequestError>> + Send + Sync>;
type MutationSuccessHook<T, V> = Arc<dyn Fn(&T, &V) + Send + Sync>;
type MutationErrorHook<V> = Arc<dyn Fn(&ApiRequestError, &V) + Send + Sync>;
type SettledHook<T, V> = Arc<dyn Fn(Option<&T>, Option<&ApiRequestError>, &V) + Send + Sync>;

/// Explicitly invoked write. Each call makes exactly one attempt.
pub struct Mutation<T, V> {
    mutation_fn: MutationFn<T, V>,
    on_success: Option<MutationSuccessHook<T, V>>,
    on_error: Option<MutationErrorHook<V>>,
    on_settled: Option<SettledHook<T, V>>,
    state: watch::Sender<RequestState<T>>,
}

impl<T, V> Mutation<T, V>
where
    T: Clone + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    pub fn new<F, Fut>(mutation_fn: F) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiRequestError>> + Send + 'static,
    {
        Self {
            mutation_fn: Arc::new(move |variables| mutation_fn(variables).boxed()),
            on_success: None,
            on_error: None,
            on_settled: None,
            state: watch::Sender::new(RequestState::default()),
        }
    }

    pub fn on_success(mut self, hook: impl Fn(&T, &V) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&ApiRequestError, &V) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Runs after `on_success` or `on_error`, whatever the outcome.
    pub fn on_settled(
        mut self,
        hook: impl Fn(Option<&T>, Option<&ApiRequestError>, &V) + Send + Sync + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(hook));
        self
    }

    pub fn state(&self) -> RequestState<T> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RequestState<T>> {
        self.state.subscribe()
    }

    /// Like [`mutate_async`](Mutation::mutate_async) but resolves to `None`
    /// on failure; the error stays in the state.
    pub async fn mutate(&self, variables: V) -> Option<T> {
        self.mutate_async(variables).await.ok()
    }

    pub async fn mutate_async(&self, variables: V) -> Result<T, ApiRequestError> {
        self.state.send_modify(RequestState::start);
        let result = (self.mutation_fn)(variables.clone()).await;

        match &result {
            Ok(data) => {
                self.state.send_modify(|state| state.succeed(data.clone()));
                if let Some(hook) = &self.on_success {
                    hook(data, &variables);
                }
            }
            Err(err) => {
                self.state.send_modify(|state| state.fail(err.clone()));
                if let Some(hook) = &self.on_error {
                    hook(err, &variables);
                }
            }
        }
        if let Some(hook) = &self.on_settled {
            hook(result.as_ref().ok(), result.as_ref().err(), &variables);
        }
        result
    }

    pub fn reset(&self) {
        self.state.send_replace(RequestState::default());
    }
}

impl<T, V> Mutation<T, V>
where
    T: Clone + DeserializeOwned + Send + Sync + 'static,
    V: Clone + Serialize + Send + Sync + 'static,
{
    /// Mutation sending `variables` as the JSON body of one request.
    pub fn json(client: ApiClient, method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(move |variables: V| {
            let client = client.clone();
            let method = method.clone();
            let path = path.clone();
            async move {
                let request = client.request(method, &path, Some(&variables))?;
                client.send_once(&request).await
            }
        })
    }
}
