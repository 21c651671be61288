//! Request executor: per-attempt timeouts, idempotent retry, classification,
//! breadcrumbs and error reporting around one HTTP transport.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use padel_core::{AppError, HttpMethod, RawFailure, attempts_for_method, classify};
use padel_platform::{
    Breadcrumb, ConnectivityProbe, ErrorReporter, ReportContext, TracingErrorReporter,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::{
    endpoint::ProjectEndpoint,
    query::{Query, parse_content_range},
    session::SessionStore,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(15_000);

/// A fully prepared request handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl OutboundRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body parsed as JSON, falling back to a JSON string of the raw text.
    pub fn body_value(&self) -> Option<Value> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        let text = || Value::String(String::from_utf8_lossy(&self.body).into_owned());
        Some(serde_json::from_slice(&self.body).unwrap_or_else(|_| text()))
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The network could not be reached at all.
    #[error("network unreachable: {0}")]
    Offline(String),
    /// The attempt's cancellation token fired.
    #[error("request aborted")]
    Aborted,
    #[error("transport failure: {0}")]
    Other(String),
}

/// One HTTP exchange. Implementations must return `Aborted` promptly once
/// `cancel` fires.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(
        &self,
        request: OutboundRequest,
        cancel: CancellationToken,
    ) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("padel-supabase/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| TransportError::Other(err.to_string()))?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        request: OutboundRequest,
        cancel: CancellationToken,
    ) -> Result<TransportResponse, TransportError> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };
        let mut builder = self.client.request(method, request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let exchange = async {
            let response = builder.send().await.map_err(map_reqwest_error)?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_owned(), value.to_owned()))
                })
                .collect();
            let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();
            Ok(TransportResponse {
                status,
                headers,
                body,
            })
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Aborted),
            result = exchange => result,
        }
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_connect() {
        TransportError::Offline(err.to_string())
    } else if err.is_timeout() {
        TransportError::Aborted
    } else {
        TransportError::Other(err.to_string())
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Per-attempt timeout; the executor default applies when unset.
    pub timeout: Option<Duration>,
    /// Caller-owned cancellation. Cancelled calls are never retried.
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn caller_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

pub struct RequestExecutor {
    endpoint: ProjectEndpoint,
    transport: Arc<dyn HttpTransport>,
    session: SessionStore,
    reporter: Arc<dyn ErrorReporter>,
    connectivity: ConnectivityProbe,
    request_timeout: Duration,
}

impl RequestExecutor {
    pub fn new(
        endpoint: ProjectEndpoint,
        transport: Arc<dyn HttpTransport>,
        session: SessionStore,
    ) -> Self {
        Self {
            endpoint,
            transport,
            session,
            reporter: Arc::new(TracingErrorReporter),
            connectivity: ConnectivityProbe::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_connectivity(mut self, connectivity: ConnectivityProbe) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &ProjectEndpoint {
        &self.endpoint
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    /// Send a JSON request and decode the JSON response.
    pub async fn request<T>(
        &self,
        method: HttpMethod,
        url: Url,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<T, AppError>
    where
        T: DeserializeOwned,
    {
        let path = url.path().to_owned();
        let response = self.execute(method, url, body, &[], options).await?;
        self.decode(&path, &response)
    }

    /// Call an edge function. Always a single attempt.
    pub async fn invoke<T>(
        &self,
        function: &str,
        body: Value,
        options: RequestOptions,
    ) -> Result<T, AppError>
    where
        T: DeserializeOwned,
    {
        let url = self.endpoint.function(function);
        self.request(HttpMethod::Post, url, Some(body), options).await
    }

    /// Call a database procedure. Always a single attempt.
    pub async fn rpc<T>(
        &self,
        function: &str,
        args: Value,
        options: RequestOptions,
    ) -> Result<T, AppError>
    where
        T: DeserializeOwned,
    {
        let url = self.endpoint.rpc(function);
        self.request(HttpMethod::Post, url, Some(args), options).await
    }

    pub async fn select<T>(
        &self,
        query: &Query,
        options: RequestOptions,
    ) -> Result<Vec<T>, AppError>
    where
        T: DeserializeOwned,
    {
        self.request(HttpMethod::Get, query.to_url(&self.endpoint), None, options)
            .await
    }

    /// Exact row count of `query` without transferring rows.
    pub async fn count(&self, query: &Query, options: RequestOptions) -> Result<u64, AppError> {
        let url = query.to_url(&self.endpoint);
        let path = url.path().to_owned();
        let response = self
            .execute(HttpMethod::Head, url, None, &[("Prefer", "count=exact")], options)
            .await?;

        match response.header("content-range").and_then(parse_content_range) {
            Some(total) => Ok(total),
            None => {
                let err = AppError::unknown(format!(
                    "missing or unparseable content-range for {}",
                    query.relation()
                ))
                .with_status(response.status);
                self.reporter
                    .report(&err, &ReportContext::new(path, Some(response.status)));
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        method: HttpMethod,
        url: Url,
        body: Option<Value>,
        extra_headers: &[(&str, &str)],
        options: RequestOptions,
    ) -> Result<TransportResponse, AppError> {
        let request = self.prepare(method, url, body, extra_headers);
        let attempts = attempts_for_method(method);
        let timeout = options.timeout.unwrap_or(self.request_timeout);

        let mut attempt = 0;
        let failure = loop {
            attempt += 1;
            match self.attempt(&request, timeout, options.cancel.as_ref()).await {
                Ok(response) => return Ok(response),
                Err(failure) if attempt < attempts && !options.caller_cancelled() => {
                    debug!(
                        method = %request.method,
                        url = %request.url,
                        attempt,
                        ?failure,
                        "request attempt failed; retrying"
                    );
                }
                Err(failure) => break failure,
            }
        };

        Err(self.fail(&request, failure))
    }

    fn prepare(
        &self,
        method: HttpMethod,
        url: Url,
        body: Option<Value>,
        extra_headers: &[(&str, &str)],
    ) -> OutboundRequest {
        let mut headers = vec![("Accept".to_owned(), "application/json".to_owned())];
        if body.is_some() {
            headers.push(("Content-Type".to_owned(), "application/json".to_owned()));
        }
        if self.endpoint.owns(&url) {
            let bearer = self
                .session
                .access_token()
                .unwrap_or_else(|| self.endpoint.anon_key().to_owned());
            headers.push(("apikey".to_owned(), self.endpoint.anon_key().to_owned()));
            headers.push(("Authorization".to_owned(), format!("Bearer {bearer}")));
        }
        headers.extend(
            extra_headers
                .iter()
                .map(|(name, value)| ((*name).to_owned(), (*value).to_owned())),
        );

        OutboundRequest {
            method,
            url,
            headers,
            body,
        }
    }

    async fn attempt(
        &self,
        request: &OutboundRequest,
        timeout: Duration,
        parent: Option<&CancellationToken>,
    ) -> Result<TransportResponse, RawFailure> {
        let token = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(TransportError::Aborted),
            result = self.transport.send(request.clone(), token.clone()) => result,
            _ = tokio::time::sleep(timeout) => {
                token.cancel();
                Err(TransportError::Aborted)
            }
        };

        let status = outcome.as_ref().ok().map(|response| response.status);
        let duration_ms = started.elapsed().as_millis() as u64;
        self.reporter.add_breadcrumb(Breadcrumb {
            method: request.method,
            url: request.url.to_string(),
            status,
            duration_ms,
        });
        debug!(
            method = %request.method,
            url = %request.url,
            status = ?status,
            duration_ms,
            "request attempt finished"
        );

        let response = outcome.map_err(|err| match err {
            TransportError::Offline(message) => RawFailure::Offline(message),
            TransportError::Aborted => RawFailure::Cancelled,
            TransportError::Other(message) => RawFailure::Other(message),
        })?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(RawFailure::Status {
                status: response.status,
                body: response.body_value(),
            })
        }
    }

    fn fail(&self, request: &OutboundRequest, failure: RawFailure) -> AppError {
        let err = classify(failure, self.connectivity.is_offline());
        warn!(
            method = %request.method,
            endpoint = request.url.path(),
            code = err.code.as_str(),
            status = ?err.status,
            "request failed"
        );
        self.reporter
            .report(&err, &ReportContext::new(request.url.path(), err.status));
        if err.requires_sign_out() && self.session.expire() {
            debug!("session expired after auth failure");
        }
        err
    }

    fn decode<T: DeserializeOwned>(
        &self,
        path: &str,
        response: &TransportResponse,
    ) -> Result<T, AppError> {
        let decoded = match response.body_value() {
            None => serde_json::from_value(Value::Null),
            Some(_) => serde_json::from_slice(&response.body),
        };
        decoded.map_err(|err| {
            let err = AppError::unknown(format!("invalid response body: {err}"))
                .with_status(response.status);
            self.reporter
                .report(&err, &ReportContext::new(path, Some(response.status)));
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use padel_core::AppErrorCode;
    use padel_platform::InMemoryErrorReporter;
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::session::{AuthSession, AuthUser};

    enum Step {
        Respond(TransportResponse),
        Fail(TransportError),
        Hang,
    }

    #[derive(Default, Clone)]
    struct ScriptedTransport {
        steps: Arc<Mutex<VecDeque<Step>>>,
        sent: Arc<Mutex<Vec<OutboundRequest>>>,
    }

    impl ScriptedTransport {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Arc::new(Mutex::new(steps.into())),
                sent: Arc::default(),
            }
        }

        fn sent(&self) -> Vec<OutboundRequest> {
            self.sent.lock().expect("sent lock").clone()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(
            &self,
            request: OutboundRequest,
            cancel: CancellationToken,
        ) -> Result<TransportResponse, TransportError> {
            self.sent.lock().expect("sent lock").push(request);
            let step = self.steps.lock().expect("steps lock").pop_front();
            match step {
                Some(Step::Respond(response)) => Ok(response),
                Some(Step::Fail(err)) => Err(err),
                Some(Step::Hang) | None => {
                    cancel.cancelled().await;
                    Err(TransportError::Aborted)
                }
            }
        }
    }

    fn json_response(status: u16, body: Value) -> Step {
        Step::Respond(TransportResponse::new(status, body.to_string()))
    }

    struct Harness {
        executor: RequestExecutor,
        transport: ScriptedTransport,
        reporter: InMemoryErrorReporter,
        session: SessionStore,
    }

    fn harness(steps: Vec<Step>) -> Harness {
        let transport = ScriptedTransport::new(steps);
        let reporter = InMemoryErrorReporter::default();
        let session = SessionStore::new();
        let endpoint =
            ProjectEndpoint::new("https://club.example.co", "anon-key").expect("endpoint");
        let executor = RequestExecutor::new(endpoint, Arc::new(transport.clone()), session.clone())
            .with_reporter(Arc::new(reporter.clone()));
        Harness {
            executor,
            transport,
            reporter,
            session,
        }
    }

    fn signed_in() -> AuthSession {
        AuthSession {
            access_token: "user-jwt".into(),
            refresh_token: None,
            expires_at: None,
            user: AuthUser {
                id: "user-1".into(),
                email: None,
            },
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Team {
        id: String,
    }

    #[tokio::test]
    async fn get_retries_once_and_returns_payload() {
        let h = harness(vec![
            json_response(503, json!({ "message": "busy" })),
            json_response(200, json!([{ "id": "t1" }])),
        ]);

        let teams: Vec<Team> = h
            .executor
            .select(&Query::from("teams"), RequestOptions::default())
            .await
            .expect("second attempt succeeds");

        assert_eq!(teams, vec![Team { id: "t1".into() }]);
        assert_eq!(h.transport.sent().len(), 2);
        assert_eq!(h.reporter.breadcrumbs().len(), 2);
        assert!(h.reporter.reports().is_empty());
    }

    #[tokio::test]
    async fn post_is_attempted_once_and_reported() {
        let h = harness(vec![
            json_response(500, json!({ "message": "boom" })),
            json_response(200, json!({})),
        ]);

        let err = h
            .executor
            .invoke::<Value>("send-challenge", json!({ "to": "t2" }), RequestOptions::default())
            .await
            .expect_err("single attempt fails");

        assert_eq!(err.code, AppErrorCode::ServerError);
        assert_eq!(err.status, Some(500));
        assert_eq!(h.transport.sent().len(), 1);
        let reports = h.reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].1.endpoint, "/functions/v1/send-challenge");
        assert_eq!(reports[0].1.status, Some(500));
    }

    #[tokio::test]
    async fn attaches_project_headers() {
        let h = harness(vec![json_response(200, json!({ "ok": true }))]);
        h.session.set(signed_in());

        let _: Value = h
            .executor
            .rpc("delete_team_cascade", json!({ "team_id": "t1" }), RequestOptions::default())
            .await
            .expect("rpc succeeds");

        let sent = h.transport.sent();
        let request = &sent[0];
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.url.path(), "/rest/v1/rpc/delete_team_cascade");
        assert_eq!(request.header("apikey"), Some("anon-key"));
        assert_eq!(request.header("authorization"), Some("Bearer user-jwt"));
        assert_eq!(request.header("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn foreign_urls_get_no_credentials() {
        let h = harness(vec![json_response(200, json!(null))]);
        let url = Url::parse("https://weather.example/today").expect("url");

        let _: Value = h
            .executor
            .request(HttpMethod::Get, url, None, RequestOptions::default())
            .await
            .expect("request succeeds");

        let sent = h.transport.sent();
        assert_eq!(sent[0].header("apikey"), None);
        assert_eq!(sent[0].header("authorization"), None);
    }

    #[tokio::test]
    async fn validation_failures_carry_body_details() {
        let body = json!({ "message": "score is invalid", "code": "23514" });
        let h = harness(vec![json_response(422, body.clone())]);

        let err = h
            .executor
            .request::<Value>(
                HttpMethod::Patch,
                h.executor.endpoint().rest("matches"),
                Some(json!({ "score": "x" })),
                RequestOptions::default(),
            )
            .await
            .expect_err("validation error");

        assert_eq!(err.code, AppErrorCode::Validation);
        assert_eq!(err.details, Some(body));
    }

    #[tokio::test]
    async fn connect_failures_classify_as_offline() {
        let h = harness(vec![
            Step::Fail(TransportError::Offline("dns".into())),
            Step::Fail(TransportError::Offline("dns".into())),
        ]);

        let err = h
            .executor
            .count(&Query::from("matches"), RequestOptions::default())
            .await
            .expect_err("offline");
        assert_eq!(err.code, AppErrorCode::Offline);
        assert_eq!(h.transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn offline_probe_overrides_status_mapping() {
        let mut h = harness(vec![json_response(500, json!({})), json_response(500, json!({}))]);
        let probe = ConnectivityProbe::new(false);
        h.executor = h.executor.with_connectivity(probe);

        let err = h
            .executor
            .select::<Value>(&Query::from("teams"), RequestOptions::default())
            .await
            .expect_err("offline");
        assert_eq!(err.code, AppErrorCode::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn per_attempt_timeout_yields_timeout_after_two_attempts() {
        let h = harness(vec![Step::Hang, Step::Hang]);
        let started = Instant::now();

        let err = h
            .executor
            .select::<Value>(
                &Query::from("teams"),
                RequestOptions::default().with_timeout(Duration::from_secs(2)),
            )
            .await
            .expect_err("timeout");

        assert_eq!(err.code, AppErrorCode::Timeout);
        assert_eq!(h.transport.sent().len(), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn caller_cancellation_is_not_retried() {
        let h = harness(vec![Step::Hang, json_response(200, json!([]))]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = h
            .executor
            .select::<Value>(&Query::from("teams"), RequestOptions::default().with_cancel(cancel))
            .await
            .expect_err("cancelled");

        assert_eq!(err.code, AppErrorCode::Timeout);
        assert_eq!(h.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn auth_expiry_signs_the_session_out() {
        let h = harness(vec![json_response(401, json!({ "message": "JWT expired" }))]);
        h.session.set(signed_in());

        let err = h
            .executor
            .invoke::<Value>("ladder-move", json!({}), RequestOptions::default())
            .await
            .expect_err("auth expired");

        assert_eq!(err.code, AppErrorCode::AuthExpired);
        assert_eq!(h.session.current(), None);
    }

    #[tokio::test]
    async fn count_reads_content_range() {
        let h = harness(vec![Step::Respond(
            TransportResponse::new(200, Vec::new()).with_header("Content-Range", "*/7"),
        )]);

        let total = h
            .executor
            .count(
                &Query::from("match_requests").eq("recipient_team_id", "t1"),
                RequestOptions::default(),
            )
            .await
            .expect("count");

        assert_eq!(total, 7);
        let sent = h.transport.sent();
        assert_eq!(sent[0].method, HttpMethod::Head);
        assert_eq!(sent[0].header("prefer"), Some("count=exact"));
    }

    #[tokio::test]
    async fn reqwest_transport_talks_http() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/rest/v1/teams")
            .match_query(mockito::Matcher::UrlEncoded("select".into(), "id".into()))
            .match_header("apikey", "anon-key")
            .match_header("authorization", "Bearer anon-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id":"t9"}]"#)
            .create_async()
            .await;

        let endpoint = ProjectEndpoint::new(&server.url(), "anon-key").expect("endpoint");
        let executor = RequestExecutor::new(
            endpoint,
            Arc::new(ReqwestTransport::new().expect("client")),
            SessionStore::new(),
        );

        let teams: Vec<Team> = executor
            .select(&Query::from("teams").select("id"), RequestOptions::default())
            .await
            .expect("select over http");

        assert_eq!(teams, vec![Team { id: "t9".into() }]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn reqwest_transport_maps_http_errors() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/functions/v1/ladder-move")
            .with_status(403)
            .with_body("not your ladder")
            .create_async()
            .await;

        let endpoint = ProjectEndpoint::new(&server.url(), "anon-key").expect("endpoint");
        let executor = RequestExecutor::new(
            endpoint,
            Arc::new(ReqwestTransport::new().expect("client")),
            SessionStore::new(),
        );

        let err = executor
            .invoke::<Value>("ladder-move", json!({}), RequestOptions::default())
            .await
            .expect_err("forbidden");
        assert_eq!(err.code, AppErrorCode::Forbidden);
    }
}
