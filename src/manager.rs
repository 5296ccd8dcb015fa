//! The socket manager.
//!
//! Owns the two persistent channels (authenticated and unauthenticated),
//! decides when to reconnect, rotates the unauthenticated channel, and routes
//! application requests onto the right channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use http::{HeaderMap, HeaderValue};
use secrecy::ExposeSecret as _;
use tokio::sync::{OnceCell, broadcast, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::Result;
use crate::auth::{CredentialProvider, Credentials};
use crate::backoff::{BackoffPolicy, BackoffPreset};
use crate::error::{ConnectError, Error};
use crate::process::{ConnectOutcome, ConnectionProcess};
use crate::registry::{HandlerId, RequestHandler, RequestHandlerRegistry};
use crate::resource::{ConnectionResource, OutgoingRequest, ResourceOptions, Response};
use crate::transport::{
    ConnectOptions, FeatureFlagProvider, ProxyAgent, ProxyResolver, ReleaseChannel, Transport,
    TransportVariant, connect_with_variant, select_transport_variant,
};

const SOCKET_PATH: &str = "/v1/websocket/";
const KEEPALIVE_PATH: &str = "/v1/keepalive";

/// Advertises that this client terminates server-pushed requests itself.
const CAPABILITY_HEADER: &str = "x-client-capabilities";
const CAPABILITY_VALUE: &str = "inbound-requests";

/// The unauthenticated channel is torn down and reopened this long after its
/// first use, so its lifetime cannot be used to correlate requests.
const UNAUTHENTICATED_ROTATION: Duration = Duration::from_secs(5 * 60);

/// Keep-alive probe timeout while the device believes it is offline. A probe
/// against a dead network should fail fast.
const OFFLINE_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Coarse connection state of the authenticated channel.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    Closed,
    Connecting,
    Open,
}

/// Notifications emitted alongside status changes.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// Connectivity regained after a period offline
    Online,
    /// The manager now believes the device is offline
    Offline,
    /// The server rejected the stored credentials. No automatic retry until
    /// new credentials arrive.
    AuthError { status: u16, headers: HeaderMap },
}

/// Static configuration for a [`SocketManager`].
#[non_exhaustive]
#[derive(Debug, Clone, bon::Builder)]
pub struct SocketManagerConfig {
    /// Base server URL; channel paths are joined onto it
    pub url: Url,
    /// Client version string sent on every connect
    pub version: String,
    pub user_agent: String,
    /// Proxy to route all connections through, if any
    pub proxy_url: Option<String>,
    /// PEM bundle overriding the system trust store
    pub certificate_authority: Option<String>,
    pub release_channel: ReleaseChannel,
    /// Host suffix identifying production servers; experiments stay off
    /// everything else
    pub production_host_suffix: Option<String>,
}

struct State {
    credentials: Option<Credentials>,
    authenticated: Option<Arc<ConnectionProcess>>,
    unauthenticated: Option<Arc<ConnectionProcess>>,
    reconnect: Option<CancellationToken>,
    rotation: Option<CancellationToken>,
}

/// Outcome of creating or joining the authenticated connection attempt.
///
/// Side effects (status, backoff, close watcher, reconnect scheduling) are
/// applied through the attempt's settlement, not by the caller, so these
/// variants only shape the caller's return value.
enum AuthAttempt {
    Connected(Arc<dyn ConnectionResource>),
    /// This call created the attempt and it failed.
    Failed(ConnectError),
    /// Another caller's attempt failed; joiners report it without treating it
    /// as their own.
    JoinedFailure(ConnectError),
}

struct Inner {
    config: SocketManagerConfig,
    transport: Arc<dyn Transport>,
    credential_provider: Arc<dyn CredentialProvider>,
    flags: Arc<dyn FeatureFlagProvider>,
    proxy_resolver: Option<Arc<dyn ProxyResolver>>,
    proxy_agent: OnceCell<Arc<dyn ProxyAgent>>,

    state: Mutex<State>,
    backoff: Mutex<BackoffPolicy>,
    registry: RequestHandlerRegistry,

    status_tx: watch::Sender<SocketStatus>,
    event_tx: broadcast::Sender<SocketEvent>,

    offline: AtomicBool,
    expired: AtomicBool,
    attempt_counter: AtomicU64,
}

/// Connection manager for the persistent channels to the chat server.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct SocketManager {
    inner: Arc<Inner>,
}

impl SocketManager {
    #[must_use]
    pub fn new(
        config: SocketManagerConfig,
        transport: Arc<dyn Transport>,
        credential_provider: Arc<dyn CredentialProvider>,
        flags: Arc<dyn FeatureFlagProvider>,
        proxy_resolver: Option<Arc<dyn ProxyResolver>>,
    ) -> Self {
        let (status_tx, _) = watch::channel(SocketStatus::Closed);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                credential_provider,
                flags,
                proxy_resolver,
                proxy_agent: OnceCell::new(),
                state: Mutex::new(State {
                    credentials: None,
                    authenticated: None,
                    unauthenticated: None,
                    reconnect: None,
                    rotation: None,
                }),
                backoff: Mutex::new(BackoffPolicy::default()),
                registry: RequestHandlerRegistry::new(),
                status_tx,
                event_tx,
                offline: AtomicBool::new(false),
                expired: AtomicBool::new(false),
                attempt_counter: AtomicU64::new(0),
            }),
        }
    }

    /// Current authenticated-channel status.
    #[must_use]
    pub fn status(&self) -> SocketStatus {
        *self.inner.status_tx.borrow()
    }

    /// Watch status transitions.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<SocketStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Receive [`SocketEvent`] notifications.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SocketEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Open (or reuse) the authenticated channel with these credentials.
    ///
    /// Calling again with the credentials of a live or in-flight connection is
    /// a cheap no-op. Changed credentials abort the previous connection and
    /// open a fresh one.
    pub async fn authenticate(&self, credentials: Credentials) -> Result<()> {
        let inner = &self.inner;
        if inner.expired.load(Ordering::SeqCst) {
            return Err(Error::expired());
        }
        if credentials.is_empty() {
            tracing::info!("authenticate called with empty credentials; ignoring");
            return Ok(());
        }

        match inner.open_authenticated(credentials).await? {
            AuthAttempt::Connected(_) => Ok(()),
            AuthAttempt::Failed(error) => Err(error.into()),
            AuthAttempt::JoinedFailure(error) => {
                tracing::debug!(%error, "joined a failing connection attempt");
                Ok(())
            }
        }
    }

    /// The authenticated channel's resource, connecting first if necessary.
    ///
    /// Falls back to the credential provider when no credentials have been
    /// stored by a previous [`authenticate`](Self::authenticate) call.
    pub async fn get_authenticated_resource(&self) -> Result<Arc<dyn ConnectionResource>> {
        let inner = &self.inner;
        if inner.expired.load(Ordering::SeqCst) {
            return Err(Error::expired());
        }

        let credentials = inner
            .lock_state()
            .credentials
            .clone()
            .or_else(|| inner.credential_provider.credentials())
            .filter(|credentials| !credentials.is_empty())
            .ok_or_else(|| Error::validation("no credentials available"))?;

        match inner.open_authenticated(credentials).await? {
            AuthAttempt::Connected(resource) => Ok(resource),
            AuthAttempt::Failed(error) | AuthAttempt::JoinedFailure(error) => Err(error.into()),
        }
    }

    /// The unauthenticated channel's resource, connecting first if necessary.
    ///
    /// This channel never reconnects on its own; a closed or rotated channel
    /// is reopened by the next call.
    pub async fn get_unauthenticated_resource(&self) -> Result<Arc<dyn ConnectionResource>> {
        self.inner.open_unauthenticated().await
    }

    /// Send a request, routed onto the authenticated channel when its Basic
    /// authorization header matches the stored credentials and onto the
    /// unauthenticated channel otherwise.
    pub async fn fetch(&self, url: &str, mut request: OutgoingRequest) -> Result<Response> {
        let parsed = Url::parse(url)?;
        let mut path = parsed.path().to_owned();
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }
        request.path = path;

        let authenticated = {
            let state = self.inner.lock_state();
            state
                .credentials
                .as_ref()
                .is_some_and(|credentials| credentials.matches_basic_auth(&request.headers))
        };

        if authenticated {
            let resource = self.get_authenticated_resource().await?;
            resource.send_request(request).await
        } else {
            let resource = self.get_unauthenticated_resource().await?;
            let response = resource.send_request(request).await?;
            self.inner.arm_rotation();
            Ok(response)
        }
    }

    /// Add a handler for server-pushed requests. The first handler receives
    /// the buffered backlog in arrival order.
    pub fn register_request_handler(&self, handler: Arc<dyn RequestHandler>) -> HandlerId {
        self.inner.registry.register(handler)
    }

    pub fn unregister_request_handler(&self, id: HandlerId) {
        self.inner.registry.unregister(id);
    }

    /// Force an immediate keep-alive probe on every live channel. While the
    /// device believes it is offline the probe runs with a shortened timeout.
    pub fn check(&self) {
        let inner = &self.inner;
        let timeout = inner
            .offline
            .load(Ordering::SeqCst)
            .then_some(OFFLINE_KEEPALIVE_TIMEOUT);

        let state = inner.lock_state();
        for process in [&state.authenticated, &state.unauthenticated]
            .into_iter()
            .flatten()
        {
            if let Some(resource) = process.resource_if_connected() {
                resource.force_keepalive(timeout);
            }
        }
    }

    /// Host environment reports network connectivity regained.
    pub fn on_navigator_online(&self) {
        let inner = Arc::clone(&self.inner);
        inner.lock_backoff().reset(Some(BackoffPreset::Normal));
        inner.cancel_reconnect();

        let credentials = inner.lock_state().credentials.clone();
        if let Some(credentials) = credentials {
            drop(tokio::spawn(async move {
                if let Err(error) = inner.open_authenticated(credentials).await {
                    tracing::warn!(%error, "reconnect after online signal failed");
                }
            }));
        }
    }

    /// Host environment reports network connectivity lost. Switches to the
    /// extended backoff sequence and probes the live channels so they notice
    /// quickly.
    pub fn on_navigator_offline(&self) {
        self.inner
            .lock_backoff()
            .reset(Some(BackoffPreset::Extended));
        self.inner.mark_offline();
        self.check();
    }

    /// The server declared this installation expired. Absorbing: every later
    /// connection attempt fails until the process restarts.
    pub fn on_remote_expiration(&self) {
        self.inner.expired.store(true, Ordering::SeqCst);
        self.inner.cancel_reconnect();
        tracing::warn!("remote expiration received; refusing further connections");
    }

    /// Drop credentials and close the authenticated channel. No reconnect.
    pub fn logout(&self) {
        let inner = &self.inner;
        inner.cancel_reconnect();

        let process = {
            let mut state = inner.lock_state();
            state.credentials = None;
            state.authenticated.take()
        };
        if let Some(process) = process {
            process.abort();
        }
        inner.set_status(SocketStatus::Closed);
    }

    /// Tear down both channels and, if credentials are stored, immediately
    /// open a fresh authenticated connection.
    pub fn reconnect(&self) {
        let inner = &self.inner;
        inner.cancel_reconnect();

        let (authenticated, unauthenticated, credentials) = {
            let mut state = inner.lock_state();
            if let Some(rotation) = state.rotation.take() {
                rotation.cancel();
            }
            (
                state.authenticated.take(),
                state.unauthenticated.take(),
                state.credentials.clone(),
            )
        };
        if let Some(process) = authenticated {
            process.abort();
        }
        if let Some(process) = unauthenticated {
            process.abort();
        }
        inner.lock_backoff().reset(None);

        if let Some(credentials) = credentials {
            let inner = Arc::clone(inner);
            drop(tokio::spawn(async move {
                if let Err(error) = inner.open_authenticated(credentials).await {
                    tracing::warn!(%error, "manual reconnect failed");
                }
            }));
        } else {
            inner.set_status(SocketStatus::Closed);
        }
    }
}

impl std::fmt::Debug for SocketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketManager")
            .field("status", &self.status())
            .field("offline", &self.inner.offline.load(Ordering::SeqCst))
            .field("expired", &self.inner.expired.load(Ordering::SeqCst))
            .finish()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_backoff(&self) -> MutexGuard<'_, BackoffPolicy> {
        match self.backoff.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_status(&self, status: SocketStatus) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            tracing::debug!(?status, "socket status changed");
        }
    }

    fn mark_offline(&self) {
        if !self.offline.swap(true, Ordering::SeqCst) {
            let _ = self.event_tx.send(SocketEvent::Offline);
        }
    }

    fn mark_online(&self) {
        if self.offline.swap(false, Ordering::SeqCst) {
            let _ = self.event_tx.send(SocketEvent::Online);
        }
    }

    fn cancel_reconnect(&self) {
        if let Some(token) = self.lock_state().reconnect.take() {
            token.cancel();
        }
    }

    fn notify_auth_error(&self, error: &ConnectError) {
        let _ = self.event_tx.send(SocketEvent::AuthError {
            status: error.status,
            headers: error.headers.clone(),
        });
    }

    /// Resolve the configured proxy, at most once per manager.
    async fn proxy_agent(&self) -> Result<Option<Arc<dyn ProxyAgent>>> {
        let Some(proxy_url) = &self.config.proxy_url else {
            return Ok(None);
        };
        let Some(resolver) = &self.proxy_resolver else {
            return Err(Error::validation("proxy URL configured without a proxy resolver"));
        };
        let agent = self
            .proxy_agent
            .get_or_try_init(|| resolver.resolve(proxy_url))
            .await?;
        Ok(Some(Arc::clone(agent)))
    }

    /// Create the authenticated connection attempt, or join the live one if
    /// the credentials are unchanged. Synchronous under the state lock, so
    /// concurrent callers cannot race a second connection into existence.
    fn authenticated_process(
        self: &Arc<Self>,
        credentials: &Credentials,
        proxy_agent: Option<Arc<dyn ProxyAgent>>,
    ) -> Result<(Arc<ConnectionProcess>, bool)> {
        let url = authenticated_url(&self.config, credentials)?;
        let mut extra_headers = HeaderMap::new();
        extra_headers.insert(CAPABILITY_HEADER, HeaderValue::from_static(CAPABILITY_VALUE));

        let mut state = self.lock_state();

        if state.credentials.as_ref() == Some(credentials) {
            if let Some(existing) = &state.authenticated {
                if !existing.failed() {
                    return Ok((Arc::clone(existing), false));
                }
            }
        }

        let name = format!(
            "authenticated:{}",
            self.attempt_counter.fetch_add(1, Ordering::Relaxed)
        );
        let registry = self.registry.clone();
        let options = ConnectOptions {
            name: name.clone(),
            url,
            version: self.config.version.clone(),
            user_agent: self.config.user_agent.clone(),
            proxy_agent,
            extra_headers,
            certificate_authority: self.config.certificate_authority.clone(),
        };
        let resource = ResourceOptions {
            name: "authenticated",
            keepalive_path: KEEPALIVE_PATH.to_owned(),
            handle_request: Some(Arc::new(move |request| registry.dispatch(request))),
            variant: TransportVariant::Original,
        };

        let connect = self.transport.connect(options, resource);
        let process = Arc::new(ConnectionProcess::spawn(name, connect));

        state.credentials = Some(credentials.clone());
        let previous = state.authenticated.replace(Arc::clone(&process));
        drop(state);

        if let Some(previous) = previous {
            previous.abort();
        }
        self.set_status(SocketStatus::Connecting);

        // Settlement must not ride on any caller's future: a caller cancelled
        // mid-await (timeout, dropped task) would otherwise leave a connected
        // resource with no close watcher and the status stuck on Connecting.
        let settler = Arc::clone(self);
        let attempt = Arc::clone(&process);
        drop(tokio::spawn(async move {
            let outcome = attempt.result().await;
            settler.settle_authenticated(&attempt, &outcome);
        }));

        Ok((process, true))
    }

    /// Drive the authenticated attempt to completion. The attempt's side
    /// effects are applied by [`settle_authenticated`](Self::settle_authenticated)
    /// whether or not this caller survives to observe the outcome.
    async fn open_authenticated(
        self: &Arc<Self>,
        credentials: Credentials,
    ) -> Result<AuthAttempt> {
        let proxy_agent = self.proxy_agent().await?;
        let (process, created) = self.authenticated_process(&credentials, proxy_agent)?;

        let outcome = process.result().await;
        self.settle_authenticated(&process, &outcome);

        match outcome {
            Ok(resource) => Ok(AuthAttempt::Connected(resource)),
            Err(error) if created => Ok(AuthAttempt::Failed(error)),
            Err(error) => Ok(AuthAttempt::JoinedFailure(error)),
        }
    }

    /// Apply a finished authenticated attempt's side effects, exactly once
    /// per attempt. On success the manager goes OPEN, the backoff resets, and
    /// a close watcher is installed; failures route through
    /// [`handle_connect_failure`](Self::handle_connect_failure).
    fn settle_authenticated(
        self: &Arc<Self>,
        process: &Arc<ConnectionProcess>,
        outcome: &ConnectOutcome,
    ) {
        if !process.claim_settlement() {
            return;
        }

        let still_current = self
            .lock_state()
            .authenticated
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, process));
        if !still_current {
            // Superseded while connecting; abort() owns the teardown.
            return;
        }

        match outcome {
            Ok(resource) => {
                self.set_status(SocketStatus::Open);
                self.lock_backoff().reset(None);
                self.mark_online();
                self.watch_authenticated_close(process, Arc::clone(resource));
            }
            Err(error) => self.handle_connect_failure(error),
        }
    }

    /// Route a failed attempt: credential rejections surface as an event and
    /// stop, transient failures arm the next backoff delay, aborts are
    /// silent.
    fn handle_connect_failure(self: &Arc<Self>, error: &ConnectError) {
        if error.is_aborted() {
            return;
        }
        if error.is_credential_rejection() {
            tracing::warn!(status = error.status, "server rejected credentials");
            self.set_status(SocketStatus::Closed);
            self.notify_auth_error(error);
            return;
        }
        if error.is_transient() {
            tracing::info!(%error, "connect failed; scheduling reconnect");
            self.mark_offline();
            self.schedule_reconnect();
            return;
        }
        tracing::warn!(%error, "connect failed with a non-retryable error");
        self.set_status(SocketStatus::Closed);
    }

    /// Arm one backoff delay and retry the authenticated connection when it
    /// elapses. A transient failure of that attempt chains the next delay
    /// through the attempt's settlement, so retries continue until one
    /// connects, is cancelled, or fails non-transiently. Replaces any timer
    /// already armed; never arms after remote expiration.
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.expired.load(Ordering::SeqCst) {
            return;
        }

        let token = CancellationToken::new();
        let previous = {
            let mut state = self.lock_state();
            state.reconnect.replace(token.clone())
        };
        if let Some(previous) = previous {
            previous.cancel();
        }

        let delay = self.lock_backoff().next();
        let inner = Arc::clone(self);
        drop(tokio::spawn(async move {
            tracing::debug!(?delay, "waiting before reconnect");
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }

            if inner.expired.load(Ordering::SeqCst) {
                return;
            }
            let Some(credentials) = inner.lock_state().credentials.clone() else {
                return;
            };

            if let Err(error) = inner.open_authenticated(credentials).await {
                tracing::warn!(%error, "reconnect attempt failed");
            }
        }));
    }

    fn watch_authenticated_close(
        self: &Arc<Self>,
        process: &Arc<ConnectionProcess>,
        resource: Arc<dyn ConnectionResource>,
    ) {
        let inner = Arc::clone(self);
        let process = Arc::clone(process);
        drop(tokio::spawn(async move {
            let frame = resource.closed().await;

            // A newer attempt may already own the slot.
            {
                let mut state = inner.lock_state();
                match &state.authenticated {
                    Some(current) if Arc::ptr_eq(current, &process) => {
                        state.authenticated = None;
                    }
                    _ => return,
                }
            }

            tracing::info!(code = frame.code, reason = %frame.reason, "authenticated channel closed");
            inner.set_status(SocketStatus::Closed);

            if frame.suppresses_reconnect() {
                return;
            }
            inner.schedule_reconnect();
        }));
    }

    /// The unauthenticated channel's resource, connecting first if necessary.
    async fn open_unauthenticated(self: &Arc<Self>) -> Result<Arc<dyn ConnectionResource>> {
        if self.expired.load(Ordering::SeqCst) {
            return Err(Error::expired());
        }

        let proxy_agent = self.proxy_agent().await?;
        let (process, _created) = self.unauthenticated_process(proxy_agent)?;

        let outcome = process.result().await;
        self.settle_unauthenticated(&process, &outcome);
        outcome.map_err(Error::from)
    }

    /// Apply a finished unauthenticated attempt's side effects, exactly once
    /// per attempt: install the close watcher on success, free the slot on
    /// failure so the next caller retries.
    fn settle_unauthenticated(
        self: &Arc<Self>,
        process: &Arc<ConnectionProcess>,
        outcome: &ConnectOutcome,
    ) {
        if !process.claim_settlement() {
            return;
        }

        match outcome {
            Ok(resource) => {
                let still_current = self
                    .lock_state()
                    .unauthenticated
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, process));
                if still_current {
                    self.watch_unauthenticated_close(process, Arc::clone(resource));
                }
            }
            Err(_) => {
                let mut state = self.lock_state();
                if state
                    .unauthenticated
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, process))
                {
                    state.unauthenticated = None;
                }
            }
        }
    }

    fn unauthenticated_process(
        self: &Arc<Self>,
        proxy_agent: Option<Arc<dyn ProxyAgent>>,
    ) -> Result<(Arc<ConnectionProcess>, bool)> {
        let url = unauthenticated_url(&self.config)?;
        let host = url.host_str().unwrap_or_default().to_owned();
        let variant = select_transport_variant(
            self.config.release_channel,
            self.flags.as_ref(),
            proxy_agent.is_some(),
            &host,
            self.config.production_host_suffix.as_deref(),
        );

        let mut state = self.lock_state();
        if let Some(existing) = &state.unauthenticated {
            if !existing.failed() {
                return Ok((Arc::clone(existing), false));
            }
        }

        let name = format!(
            "unauthenticated:{}",
            self.attempt_counter.fetch_add(1, Ordering::Relaxed)
        );
        let options = ConnectOptions {
            name: name.clone(),
            url,
            version: self.config.version.clone(),
            user_agent: self.config.user_agent.clone(),
            proxy_agent,
            extra_headers: HeaderMap::new(),
            certificate_authority: self.config.certificate_authority.clone(),
        };
        let resource = ResourceOptions {
            name: "unauthenticated",
            keepalive_path: KEEPALIVE_PATH.to_owned(),
            handle_request: None,
            variant,
        };

        let connect = connect_with_variant(&self.transport, options, resource);
        let process = Arc::new(ConnectionProcess::spawn(name, connect));

        let previous = state.unauthenticated.replace(Arc::clone(&process));
        drop(state);

        if let Some(previous) = previous {
            previous.abort();
        }

        // Same rule as the authenticated channel: settlement survives a
        // cancelled caller.
        let settler = Arc::clone(self);
        let attempt = Arc::clone(&process);
        drop(tokio::spawn(async move {
            let outcome = attempt.result().await;
            settler.settle_unauthenticated(&attempt, &outcome);
        }));

        Ok((process, true))
    }

    fn watch_unauthenticated_close(
        self: &Arc<Self>,
        process: &Arc<ConnectionProcess>,
        resource: Arc<dyn ConnectionResource>,
    ) {
        let inner = Arc::clone(self);
        let process = Arc::clone(process);
        drop(tokio::spawn(async move {
            let frame = resource.closed().await;

            let rotation = {
                let mut state = inner.lock_state();
                match &state.unauthenticated {
                    Some(current) if Arc::ptr_eq(current, &process) => {
                        state.unauthenticated = None;
                        state.rotation.take()
                    }
                    _ => return,
                }
            };
            if let Some(rotation) = rotation {
                rotation.cancel();
            }

            tracing::debug!(code = frame.code, reason = %frame.reason, "unauthenticated channel closed");
        }));
    }

    /// Start the rotation timer for the unauthenticated channel, once per
    /// connection. When it fires the channel is torn down and eagerly
    /// reopened.
    fn arm_rotation(self: &Arc<Self>) {
        let (process, token) = {
            let mut state = self.lock_state();
            if state.rotation.is_some() {
                return;
            }
            let Some(process) = state.unauthenticated.clone() else {
                return;
            };
            let token = CancellationToken::new();
            state.rotation = Some(token.clone());
            (process, token)
        };

        let inner = Arc::clone(self);
        drop(tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(UNAUTHENTICATED_ROTATION) => {}
            }

            {
                let mut state = inner.lock_state();
                state.rotation = None;
                match &state.unauthenticated {
                    Some(current) if Arc::ptr_eq(current, &process) => {
                        state.unauthenticated = None;
                    }
                    _ => return,
                }
            }

            tracing::debug!("rotating unauthenticated channel");
            process.abort();

            if let Err(error) = inner.open_unauthenticated().await {
                tracing::info!(%error, "eager reopen after rotation failed");
            }
        }));
    }
}

fn authenticated_url(config: &SocketManagerConfig, credentials: &Credentials) -> Result<Url> {
    let mut url = config.url.join(SOCKET_PATH)?;
    url.query_pairs_mut()
        .append_pair("login", credentials.username())
        .append_pair("password", credentials.password().expose_secret())
        .append_pair("agent", &config.user_agent)
        .append_pair("version", &config.version);
    Ok(url)
}

fn unauthenticated_url(config: &SocketManagerConfig) -> Result<Url> {
    let mut url = config.url.join(SOCKET_PATH)?;
    url.query_pairs_mut()
        .append_pair("agent", &config.user_agent)
        .append_pair("version", &config.version);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SocketManagerConfig {
        SocketManagerConfig::builder()
            .url(Url::parse("wss://chat.example.org").expect("valid url"))
            .version("7.4.1".to_owned())
            .user_agent("TestClient".to_owned())
            .release_channel(ReleaseChannel::Stable)
            .build()
    }

    #[test]
    fn authenticated_url_carries_credentials_and_client_info() {
        let credentials = Credentials::new("alice".to_owned(), "hunter2".to_owned());
        let url = authenticated_url(&config(), &credentials).expect("url builds");

        assert_eq!(url.path(), "/v1/websocket/");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("login".to_owned(), "alice".to_owned())));
        assert!(pairs.contains(&("password".to_owned(), "hunter2".to_owned())));
        assert!(pairs.contains(&("agent".to_owned(), "TestClient".to_owned())));
        assert!(pairs.contains(&("version".to_owned(), "7.4.1".to_owned())));
    }

    #[test]
    fn unauthenticated_url_has_no_credentials() {
        let url = unauthenticated_url(&config()).expect("url builds");

        assert_eq!(url.path(), "/v1/websocket/");
        assert!(url.query_pairs().all(|(key, _)| key != "login" && key != "password"));
        assert!(url.query_pairs().any(|(key, _)| key == "agent"));
    }
}
