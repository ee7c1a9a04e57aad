use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    axum::{
        Router,
        extract::{Query, State},
        http::StatusCode,
        response::{Html, IntoResponse, Response},
        routing::get,
    },
    tokio::{
        net::TcpListener,
        sync::oneshot,
        task::JoinHandle,
        time::{Instant, sleep_until},
    },
    tracing::{debug, error, info, warn},
    url::Url,
};

use crate::{
    Error, Result,
    flow::CodeExchanger,
    templates::{ERROR_PAGE, MISSING_CODE_BODY, SUCCESS_PAGE},
    types::TokenResponse,
};

/// Default time to wait for the authorization callback.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// How long in-flight responses get to drain once the attempt is over.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Listening,
    Exchanging,
    Done,
}

/// Shared by the request handler and the waiting side of one attempt.
struct Attempt {
    exchanger: Arc<dyn CodeExchanger>,
    phase: Mutex<Phase>,
    outcome: Mutex<Option<oneshot::Sender<Result<TokenResponse>>>>,
}

impl Attempt {
    /// Move from `from` to `to`; false if another transition got there first.
    fn advance(&self, from: Phase, to: Phase) -> bool {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if *phase == from {
            *phase = to;
            true
        } else {
            false
        }
    }

    /// Publish the terminal result. Only the first call has any effect.
    fn finish(&self, result: Result<TokenResponse>) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = Phase::Done;
        let tx = self
            .outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
    }
}

/// One-shot local listener for the provider's redirect.
///
/// Bound for exactly one authorization attempt and released on every exit
/// path of [`CallbackListener::wait`], including when that future is dropped.
pub struct CallbackListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    bound_at: Instant,
}

impl CallbackListener {
    /// Bind to the host and port of `redirect_uri`.
    pub async fn bind(redirect_uri: &Url) -> Result<Self> {
        let host = redirect_uri
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .ok_or_else(|| Error::configuration(format!("redirect URI {redirect_uri} has no host")))?;
        let port = redirect_uri
            .port_or_known_default()
            .ok_or_else(|| Error::configuration(format!("redirect URI {redirect_uri} has no port")))?;

        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|source| Error::Bind {
                addr: format!("{host}:{port}"),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| Error::Bind {
            addr: format!("{host}:{port}"),
            source,
        })?;

        info!(addr = %local_addr, "callback listener bound");
        Ok(Self {
            listener,
            local_addr,
            bound_at: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve callbacks until one code-bearing request has been handled or
    /// `timeout`, counted from [`CallbackListener::bind`], elapses with none
    /// accepted.
    ///
    /// Requests without a `code` get a 400 and the listener keeps waiting. The
    /// first request with a `code` ends the attempt: a `state` mismatch fails
    /// it without contacting the token endpoint, otherwise the code is
    /// exchanged. Once a code is accepted the timeout no longer applies.
    pub async fn wait(
        self,
        exchanger: Arc<dyn CodeExchanger>,
        timeout: Duration,
    ) -> Result<TokenResponse> {
        let (outcome_tx, mut outcome_rx) = oneshot::channel();
        let attempt = Arc::new(Attempt {
            exchanger,
            phase: Mutex::new(Phase::Listening),
            outcome: Mutex::new(Some(outcome_tx)),
        });

        let app = Router::new()
            .route("/", get(handle_callback))
            .route("/{*path}", get(handle_callback))
            .with_state(Arc::clone(&attempt));

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = axum::serve(self.listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        let mut handle = ServerHandle {
            shutdown: Some(shutdown_tx),
            task: Some(tokio::spawn(async move { server.await })),
        };

        let timer = sleep_until(self.bound_at + timeout);
        tokio::pin!(timer);
        let mut timer_armed = true;

        let result = loop {
            tokio::select! {
                result = &mut outcome_rx => {
                    break result.unwrap_or_else(|_| {
                        Err(Error::message("callback listener stopped without a result"))
                    });
                },
                () = &mut timer, if timer_armed => {
                    if attempt.advance(Phase::Listening, Phase::Done) {
                        warn!(timeout_secs = timeout.as_secs(), "no authorization callback received, giving up");
                        break Err(Error::Timeout(timeout));
                    }
                    debug!("timeout reached after a code was accepted, waiting for the exchange");
                    timer_armed = false;
                },
            }
        };

        handle.close().await;
        result
    }
}

/// The spawned server task plus its shutdown trigger.
struct ServerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

impl ServerHandle {
    /// Stop accepting, drain briefly, then force the listener closed.
    /// Safe to call more than once.
    async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let Some(mut task) = self.task.take() else {
            return;
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
            Ok(Ok(Err(e))) => warn!(error = %e, "callback listener stopped with an error"),
            Ok(_) => {},
            Err(_) => {
                debug!("callback listener did not drain in time, aborting it");
                task.abort();
                let _ = task.await;
            },
        }
        debug!("callback listener closed");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn handle_callback(
    State(attempt): State<Arc<Attempt>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(code) = params.get("code").cloned() else {
        if let Some(error) = params.get("error") {
            warn!(
                error = %error,
                description = params.get("error_description").map_or("", String::as_str),
                "provider redirected with an error, still waiting for a code"
            );
        } else {
            debug!("ignoring request without an authorization code");
        }
        return (StatusCode::BAD_REQUEST, MISSING_CODE_BODY).into_response();
    };

    if !attempt.advance(Phase::Listening, Phase::Exchanging) {
        debug!("authorization callback already handled, rejecting duplicate");
        return (StatusCode::CONFLICT, "Authorization callback already handled").into_response();
    }

    if params.get("state").map(String::as_str) != Some(attempt.exchanger.expected_state()) {
        warn!("callback state does not match this attempt, rejecting it");
        attempt.finish(Err(Error::callback("state parameter does not match")));
        return (StatusCode::BAD_REQUEST, Html(ERROR_PAGE)).into_response();
    }

    info!("authorization code received, exchanging it for tokens");

    // The exchange runs detached so a browser disconnect cannot strand the
    // attempt in the exchanging phase.
    let exchange = tokio::spawn({
        let attempt = Arc::clone(&attempt);
        async move {
            match attempt.exchanger.exchange(&code).await {
                Ok(tokens) => {
                    attempt.finish(Ok(tokens));
                    true
                },
                Err(e) => {
                    error!(error = %e, "token exchange failed");
                    attempt.finish(Err(e));
                    false
                },
            }
        }
    });

    match exchange.await {
        Ok(true) => (StatusCode::OK, Html(SUCCESS_PAGE)).into_response(),
        Ok(false) => (StatusCode::INTERNAL_SERVER_ERROR, Html(ERROR_PAGE)).into_response(),
        Err(e) => {
            error!(error = %e, "token exchange task failed");
            attempt.finish(Err(Error::exchange("token exchange task failed")));
            (StatusCode::INTERNAL_SERVER_ERROR, Html(ERROR_PAGE)).into_response()
        },
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        async_trait::async_trait,
        secrecy::{ExposeSecret, Secret},
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    struct FakeExchanger {
        state: String,
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl FakeExchanger {
        fn new(state: &str) -> Self {
            Self {
                state: state.into(),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl CodeExchanger for FakeExchanger {
        fn expected_state(&self) -> &str {
            &self.state
        }

        async fn exchange(&self, code: &str) -> Result<TokenResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::exchange("invalid_grant"));
            }
            Ok(TokenResponse {
                access_token: Secret::new(format!("token-for-{code}")),
                token_type: Some("Bearer".into()),
                expires_in: Some(60),
                refresh_token: None,
                id_token: None,
                scope: None,
            })
        }
    }

    async fn bind_ephemeral() -> CallbackListener {
        CallbackListener::bind(&Url::parse("http://127.0.0.1:0/callback").unwrap())
            .await
            .unwrap()
    }

    fn spawn_wait(
        listener: CallbackListener,
        exchanger: Arc<FakeExchanger>,
        timeout: Duration,
    ) -> JoinHandle<Result<TokenResponse>> {
        tokio::spawn(listener.wait(exchanger, timeout))
    }

    #[tokio::test]
    async fn code_with_matching_state_is_exchanged() {
        let listener = bind_ephemeral().await;
        let addr = listener.local_addr();
        let exchanger = Arc::new(FakeExchanger::new("S"));
        let waiting = spawn_wait(listener, Arc::clone(&exchanger), Duration::from_secs(5));

        let resp = reqwest::get(format!("http://{addr}/callback?code=abc&state=S"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.text().await.unwrap().contains("Authentication successful"));

        let tokens = waiting.await.unwrap().unwrap();
        assert_eq!(tokens.access_token.expose_secret(), "token-for-abc");
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn state_mismatch_fails_without_exchange() {
        let listener = bind_ephemeral().await;
        let addr = listener.local_addr();
        let exchanger = Arc::new(FakeExchanger::new("S"));
        let waiting = spawn_wait(listener, Arc::clone(&exchanger), Duration::from_secs(5));

        let resp = reqwest::get(format!("http://{addr}/callback?code=abc&state=evil"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(resp.text().await.unwrap().contains("Authentication failed"));

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::CallbackValidation { .. }));
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_state_is_a_mismatch() {
        let listener = bind_ephemeral().await;
        let addr = listener.local_addr();
        let exchanger = Arc::new(FakeExchanger::new("S"));
        let waiting = spawn_wait(listener, Arc::clone(&exchanger), Duration::from_secs(5));

        reqwest::get(format!("http://{addr}/callback?code=abc"))
            .await
            .unwrap();
        assert!(waiting.await.unwrap().is_err());
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn request_without_code_is_rejected_and_listener_keeps_waiting() {
        let listener = bind_ephemeral().await;
        let addr = listener.local_addr();
        let exchanger = Arc::new(FakeExchanger::new("S"));
        let waiting = spawn_wait(listener, Arc::clone(&exchanger), Duration::from_secs(5));

        let resp = reqwest::get(format!("http://{addr}/favicon.ico")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(resp.text().await.unwrap(), MISSING_CODE_BODY);

        let resp = reqwest::get(format!(
            "http://{addr}/callback?error=access_denied&state=S"
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(!waiting.is_finished());

        let resp = reqwest::get(format!("http://{addr}/callback?code=late&state=S"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let tokens = waiting.await.unwrap().unwrap();
        assert_eq!(tokens.access_token.expose_secret(), "token-for-late");
    }

    #[tokio::test]
    async fn failed_exchange_renders_error_page() {
        let listener = bind_ephemeral().await;
        let addr = listener.local_addr();
        let mut fake = FakeExchanger::new("S");
        fake.fail = true;
        let waiting = spawn_wait(listener, Arc::new(fake), Duration::from_secs(5));

        let resp = reqwest::get(format!("http://{addr}/callback?code=abc&state=S"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(resp.text().await.unwrap().contains("Authentication failed"));

        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Exchange { .. }));
    }

    #[tokio::test]
    async fn timeout_closes_listener() {
        let listener = bind_ephemeral().await;
        let addr = listener.local_addr();
        let exchanger = Arc::new(FakeExchanger::new("S"));

        let err = listener
            .wait(exchanger, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        // The port is free again.
        std::net::TcpListener::bind(addr).unwrap();
    }

    #[tokio::test]
    async fn timeout_counts_from_bind() {
        let listener = bind_ephemeral().await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = std::time::Instant::now();
        let err = listener
            .wait(Arc::new(FakeExchanger::new("S")), Duration::from_millis(400))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() < Duration::from_millis(350));
    }

    #[tokio::test]
    async fn timeout_during_exchange_does_not_win() {
        let listener = bind_ephemeral().await;
        let addr = listener.local_addr();
        let mut fake = FakeExchanger::new("S");
        fake.delay = Duration::from_millis(400);
        let waiting = spawn_wait(listener, Arc::new(fake), Duration::from_millis(150));

        let resp = reqwest::get(format!("http://{addr}/callback?code=abc&state=S"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let tokens = waiting.await.unwrap().unwrap();
        assert_eq!(tokens.access_token.expose_secret(), "token-for-abc");
    }

    #[tokio::test]
    async fn second_code_during_exchange_is_conflict() {
        let listener = bind_ephemeral().await;
        let addr = listener.local_addr();
        let mut fake = FakeExchanger::new("S");
        fake.delay = Duration::from_millis(500);
        let exchanger = Arc::new(fake);
        let waiting = spawn_wait(listener, Arc::clone(&exchanger), Duration::from_secs(5));

        let first = tokio::spawn(reqwest::get(format!(
            "http://{addr}/callback?code=abc&state=S"
        )));
        tokio::time::sleep(Duration::from_millis(150)).await;

        let second = reqwest::get(format!("http://{addr}/callback?code=other&state=S"))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let tokens = waiting.await.unwrap().unwrap();
        assert_eq!(tokens.access_token.expose_secret(), "token-for-abc");
        assert_eq!(exchanger.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bind_conflict_is_bind_error() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let uri = Url::parse(&format!("http://127.0.0.1:{port}/callback")).unwrap();

        let err = CallbackListener::bind(&uri).await.err().unwrap();
        assert!(matches!(err, Error::Bind { .. }));
    }
}
