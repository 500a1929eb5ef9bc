//! Client for the student persistence API.
//!
//! Every authenticated call takes a [`Session`]. A 401 from any call expires
//! the session, which cancels calls still waiting on the network or on a retry
//! delay and makes later calls fail fast with [`ApiError::SessionExpired`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, instrument, warn};

use crate::config::ApiConfig;
use crate::models::{AttainmentReport, NewStudent, Student, StudentUpdate};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("session expired; log in again")]
    SessionExpired,
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Http(_) => true,
            ApiError::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            ApiError::SessionExpired | ApiError::Rejected(_) => false,
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    expired: AtomicBool,
    notify: Notify,
}

/// Bearer token plus a shared expiry signal.
#[derive(Debug, Clone)]
pub struct Session {
    token: Arc<str>,
    state: Arc<SessionState>,
}

impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Arc::from(token.into()),
            state: Arc::default(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expire(&self) {
        if !self.state.expired.swap(true, Ordering::SeqCst) {
            warn!("session expired; cancelling pending requests");
        }
        self.state.notify.notify_waiters();
    }

    pub fn is_expired(&self) -> bool {
        self.state.expired.load(Ordering::SeqCst)
    }

    /// Resolves once the session has expired.
    pub async fn expired(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_expired() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// retries are spent. Session expiry cancels the call and any pending delay.
    pub async fn run<T, F, Fut>(
        &self,
        session: &Session,
        label: &str,
        mut op: F,
    ) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 0;
        loop {
            if session.is_expired() {
                return Err(ApiError::SessionExpired);
            }
            let result = tokio::select! {
                result = op() => result,
                _ = session.expired() => return Err(ApiError::SessionExpired),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(ApiError::SessionExpired) => {
                    session.expire();
                    return Err(ApiError::SessionExpired);
                }
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(label, attempt, error = %err, "retrying request");
                    tokio::select! {
                        _ = tokio::time::sleep(self.delay) => {}
                        _ = session.expired() => return Err(ApiError::SessionExpired),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Fetches one item per id in order, spacing requests by `throttle`.
///
/// A failed fetch records `None` for that id and the loop continues; an
/// expired session stops the whole batch.
pub async fn fetch_each<T, F, Fut>(
    session: &Session,
    ids: &[String],
    retry: &RetryPolicy,
    throttle: Duration,
    fetch: F,
) -> Result<BTreeMap<String, Option<T>>, ApiError>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut results = BTreeMap::new();
    for (index, id) in ids.iter().enumerate() {
        if index > 0 && !throttle.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(throttle) => {}
                _ = session.expired() => return Err(ApiError::SessionExpired),
            }
        }
        match retry.run(session, id, || fetch(id.clone())).await {
            Ok(value) => {
                results.insert(id.clone(), Some(value));
            }
            Err(ApiError::SessionExpired) => return Err(ApiError::SessionExpired),
            Err(err) => {
                warn!(
                    student = %id,
                    error = %err,
                    "fetch failed; continuing with remaining students"
                );
                results.insert(id.clone(), None);
            }
        }
    }
    Ok(results)
}

#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

async fn error_message(resp: Response) -> String {
    let status = resp.status();
    resp.json::<ErrorBody>()
        .await
        .ok()
        .and_then(|body| body.error)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_string())
}

async fn check(resp: Response) -> Result<Response, ApiError> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::SessionExpired);
    }
    if status.is_success() {
        return Ok(resp);
    }
    Err(ApiError::Status {
        status: status.as_u16(),
        message: error_message(resp).await,
    })
}

pub struct ApiClient {
    http: Client,
    base_url: String,
    retry: RetryPolicy,
    throttle: Duration,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            retry: RetryPolicy::default(),
            throttle: Duration::from_millis(100),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    #[instrument(
        name = "api_authenticate",
        skip(self, credentials),
        fields(email = %credentials.email)
    )]
    pub async fn authenticate(
        &self,
        credentials: &Credentials,
        signup: bool,
    ) -> Result<String, ApiError> {
        let path = if signup { "signup" } else { "login" };
        let resp = self.http.post(self.url(path)).json(credentials).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ApiError::Rejected(error_message(resp).await));
        }
        let body: AuthResponse = resp.json().await?;
        match body.token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(ApiError::Rejected(
                body.error.unwrap_or_else(|| "invalid credentials".to_string()),
            )),
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        session: &Session,
        path: &str,
    ) -> Result<T, ApiError> {
        let resp = self
            .http
            .get(self.url(path))
            .bearer_auth(session.token())
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        session: &Session,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<(), ApiError> {
        let mut request = self
            .http
            .request(method, self.url(path))
            .bearer_auth(session.token());
        if let Some(body) = body {
            request = request.json(body);
        }
        check(request.send().await?).await.map(|_| ())
    }

    #[instrument(name = "api_list_students", skip(self, session))]
    pub async fn list_students(&self, session: &Session) -> Result<Vec<Student>, ApiError> {
        let students: Vec<Student> = self
            .retry
            .run(session, "students", || self.get_json::<Vec<Student>>(session, "students"))
            .await?;

        let total = students.len();
        let valid: Vec<Student> = students
            .into_iter()
            .filter(|student| {
                let ok = student.has_valid_id();
                if !ok {
                    warn!(name = %student.name, "ignoring student record without a student_id");
                }
                ok
            })
            .collect();
        debug!(total, valid = valid.len(), "fetched students");
        Ok(valid)
    }

    fn attainment_path(student_id: &str) -> String {
        format!("students/calculate-co-po/{student_id}")
    }

    #[instrument(name = "api_fetch_attainment", skip(self, session))]
    pub async fn fetch_attainment(
        &self,
        session: &Session,
        student_id: &str,
    ) -> Result<AttainmentReport, ApiError> {
        let path = Self::attainment_path(student_id);
        self.retry
            .run(session, student_id, || self.get_json::<AttainmentReport>(session, &path))
            .await
    }

    /// Server-side attainment for many students; failed lookups come back as
    /// `None`.
    pub async fn fetch_attainment_for_all(
        &self,
        session: &Session,
        student_ids: &[String],
    ) -> Result<BTreeMap<String, Option<AttainmentReport>>, ApiError> {
        fetch_each(session, student_ids, &self.retry, self.throttle, |id| async move {
            self.get_json::<AttainmentReport>(session, &Self::attainment_path(&id))
                .await
        })
        .await
    }

    #[instrument(
        name = "api_create_student",
        skip(self, session, student),
        fields(student = %student.student_id)
    )]
    pub async fn create_student(
        &self,
        session: &Session,
        student: &NewStudent,
    ) -> Result<(), ApiError> {
        self.retry
            .run(session, &student.student_id, || {
                self.send(session, Method::POST, "students", Some(student))
            })
            .await
    }

    #[instrument(name = "api_update_student", skip(self, session, update))]
    pub async fn update_student(
        &self,
        session: &Session,
        student_id: &str,
        update: &StudentUpdate,
    ) -> Result<(), ApiError> {
        let path = format!("students/{student_id}");
        self.retry
            .run(session, student_id, || {
                self.send(session, Method::PUT, &path, Some(update))
            })
            .await
    }

    #[instrument(name = "api_delete_student", skip(self, session))]
    pub async fn delete_student(
        &self,
        session: &Session,
        student_id: &str,
    ) -> Result<(), ApiError> {
        let path = format!("students/{student_id}");
        self.retry
            .run(session, student_id, || {
                self.send::<()>(session, Method::DELETE, &path, None)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            delay: Duration::ZERO,
        }
    }

    fn server_error() -> ApiError {
        ApiError::Status {
            status: 503,
            message: "unavailable".to_string(),
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let session = Session::new("token");
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result = quick_retry()
            .run(&session, "test", || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(server_error())
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_retries() {
        let session = Session::new("token");
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result = quick_retry()
            .run(&session, "test", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(server_error())
            })
            .await;
        assert!(matches!(result, Err(ApiError::Status { status: 503, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let session = Session::new("token");
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result = quick_retry()
            .run(&session, "test", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ApiError::Status {
                    status: 404,
                    message: "missing".to_string(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unauthorized_expires_the_session() {
        let session = Session::new("token");
        let result = quick_retry()
            .run(&session, "test", || async { Err::<(), _>(ApiError::SessionExpired) })
            .await;
        assert!(matches!(result, Err(ApiError::SessionExpired)));
        assert!(session.is_expired());
    }

    #[tokio::test]
    async fn expiry_cancels_in_flight_call() {
        let session = Session::new("token");
        let other = session.clone();
        let pending = tokio::spawn(async move {
            quick_retry()
                .run(&other, "slow", || async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok::<_, ApiError>(())
                })
                .await
        });
        tokio::task::yield_now().await;
        session.expire();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(ApiError::SessionExpired)));
    }

    #[tokio::test]
    async fn batch_continues_past_individual_failures() {
        let session = Session::new("token");
        let ids: Vec<String> = ["S1", "S2", "S3"].iter().map(|s| s.to_string()).collect();
        let results = fetch_each(&session, &ids, &quick_retry(), Duration::ZERO, |id| async move {
            if id == "S2" {
                Err(server_error())
            } else {
                Ok::<_, ApiError>(id.len())
            }
        })
        .await
        .unwrap();

        assert_eq!(results["S1"], Some(2));
        assert_eq!(results["S2"], None);
        assert_eq!(results["S3"], Some(2));
    }

    #[tokio::test]
    async fn batch_stops_on_expired_session() {
        let session = Session::new("token");
        let ids: Vec<String> = ["S1", "S2", "S3"].iter().map(|s| s.to_string()).collect();
        let calls = AtomicUsize::new(0);
        let result = fetch_each(&session, &ids, &quick_retry(), Duration::ZERO, |id| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if id == "S2" {
                    Err(ApiError::SessionExpired)
                } else {
                    Ok::<_, ApiError>(())
                }
            }
        })
        .await;

        assert!(matches!(result, Err(ApiError::SessionExpired)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(session.is_expired());
    }

    #[tokio::test]
    async fn batch_spaces_requests_by_throttle() {
        let session = Session::new("token");
        let ids: Vec<String> = ["S1", "S2", "S3"].iter().map(|s| s.to_string()).collect();
        let throttle = Duration::from_millis(20);
        let started = tokio::time::Instant::now();
        let results = fetch_each(&session, &ids, &quick_retry(), throttle, |_| async {
            Ok::<_, ApiError>(())
        })
        .await
        .unwrap();

        assert_eq!(results.len(), 3);
        assert!(started.elapsed() >= throttle * 2);
    }

    #[tokio::test]
    async fn expiry_interrupts_throttle_delay() {
        let session = Session::new("token");
        let ids: Vec<String> = ["S1", "S2"].iter().map(|s| s.to_string()).collect();
        let calls = AtomicUsize::new(0);
        let expirer = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            expirer.expire();
        });
        let hour = Duration::from_secs(3600);
        let retry = quick_retry();
        let batch = fetch_each(&session, &ids, &retry, hour, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ApiError>(()) }
        });
        let result = tokio::time::timeout(Duration::from_secs(5), batch)
            .await
            .unwrap();
        assert!(matches!(result, Err(ApiError::SessionExpired)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retryable_classification() {
        assert!(server_error().is_retryable());
        assert!(!ApiError::SessionExpired.is_retryable());
        assert!(!ApiError::Rejected("bad".to_string()).is_retryable());
        assert!(ApiError::Status {
            status: 429,
            message: String::new()
        }
        .is_retryable());
    }
}
