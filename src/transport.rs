//! Transport selection and the experiment ("shadow") machinery.
//!
//! The unauthenticated channel can run on the legacy transport, on a fully
//! switched experimental transport, or in a shadow mode that opens both: the
//! legacy connection is the connection of record and the experimental one is
//! observed only for diagnostics.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt as _;
use http::HeaderMap;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::ConnectError;
use crate::process::ConnectFuture;
use crate::resource::{CloseFrame, ConnectionResource, OutgoingRequest, ResourceOptions, Response};

/// Fraction of connection attempts that open a shadow connection in
/// low-intensity mode. High-intensity mode shadows every attempt.
const SHADOW_LOW_SAMPLE_RATE: f64 = 0.1;

/// Which transport the unauthenticated connection uses. Chosen once per
/// connection attempt; fixed for that connection's lifetime.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportVariant {
    /// Legacy transport only
    Original,
    /// Experimental transport carries the connection of record
    ExperimentalPrimary,
    /// Legacy connection of record, experimental shadow on every attempt
    ShadowHigh,
    /// Legacy connection of record, experimental shadow on a sample of attempts
    ShadowLow,
}

/// Release channel of the running build, as reported by the environment
/// classifier.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseChannel {
    Stable,
    Alpha,
    Beta,
    Staging,
}

/// Remote-config flags consulted when picking a transport variant.
pub trait FeatureFlagProvider: Send + Sync {
    /// User or remote opt-out from the fully switched experimental transport.
    fn experiment_opt_out(&self) -> bool;

    /// Remote flag enabling shadow mode on the stable channel.
    fn shadowing_enabled(&self) -> bool;
}

/// Pick the transport variant for an unauthenticated connection attempt.
///
/// Proxy usage forces the legacy variant, as does any host outside the
/// recognized production suffix.
#[must_use]
pub fn select_transport_variant(
    release: ReleaseChannel,
    flags: &dyn FeatureFlagProvider,
    uses_proxy: bool,
    host: &str,
    production_suffix: Option<&str>,
) -> TransportVariant {
    if uses_proxy {
        return TransportVariant::Original;
    }

    let recognized = production_suffix.is_some_and(|suffix| host.ends_with(suffix));
    if !recognized {
        return TransportVariant::Original;
    }

    match release {
        ReleaseChannel::Staging => TransportVariant::ExperimentalPrimary,
        ReleaseChannel::Alpha => {
            if flags.experiment_opt_out() {
                TransportVariant::ShadowHigh
            } else {
                TransportVariant::ExperimentalPrimary
            }
        }
        ReleaseChannel::Beta => {
            if flags.experiment_opt_out() {
                TransportVariant::ShadowLow
            } else {
                TransportVariant::ShadowHigh
            }
        }
        ReleaseChannel::Stable => {
            if flags.shadowing_enabled() {
                TransportVariant::ShadowLow
            } else {
                TransportVariant::Original
            }
        }
    }
}

/// Opaque proxy-aware transport agent produced by a [`ProxyResolver`].
pub trait ProxyAgent: Send + Sync + fmt::Debug {}

/// Resolves the configured proxy URL to a transport agent. The manager
/// resolves at most once and caches the result.
#[async_trait]
pub trait ProxyResolver: Send + Sync {
    async fn resolve(&self, proxy_url: &str) -> Result<Arc<dyn ProxyAgent>, ConnectError>;
}

/// Parameters for opening one transport-level connection.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Diagnostic name of the attempt
    pub name: String,
    /// Fully resolved endpoint, including any query parameters
    pub url: Url,
    pub version: String,
    pub user_agent: String,
    pub proxy_agent: Option<Arc<dyn ProxyAgent>>,
    pub extra_headers: HeaderMap,
    pub certificate_authority: Option<String>,
}

/// The Connection Resource adapter: opens a transport-level connection and
/// wraps it in a [`ConnectionResource`].
pub trait Transport: Send + Sync {
    fn connect(&self, options: ConnectOptions, resource: ResourceOptions) -> ConnectFuture;
}

/// Open a connection honoring the variant in `resource.variant`.
///
/// Shadow variants open the legacy connection as the connection of record and
/// fire off a second, experimental connection whose outcome is only logged.
pub(crate) fn connect_with_variant(
    transport: &Arc<dyn Transport>,
    options: ConnectOptions,
    resource: ResourceOptions,
) -> ConnectFuture {
    let variant = resource.variant;
    match variant {
        TransportVariant::Original | TransportVariant::ExperimentalPrimary => {
            transport.connect(options, resource)
        }
        TransportVariant::ShadowHigh | TransportVariant::ShadowLow => {
            if !shadow_sampled(variant) {
                let resource = ResourceOptions {
                    variant: TransportVariant::Original,
                    ..resource
                };
                return transport.connect(options, resource);
            }

            let shadow_token = CancellationToken::new();
            spawn_shadow(
                Arc::clone(transport),
                &options,
                &resource,
                shadow_token.clone(),
            );

            let resource = ResourceOptions {
                variant: TransportVariant::Original,
                ..resource
            };
            let primary = transport.connect(options, resource);

            async move {
                match primary.await {
                    Ok(resource) => {
                        let shadowing: Arc<dyn ConnectionResource> =
                            Arc::new(ShadowingResource::new(resource, shadow_token));
                        Ok(shadowing)
                    }
                    Err(error) => {
                        // No connection of record to own the shadow anymore.
                        shadow_token.cancel();
                        Err(error)
                    }
                }
            }
            .boxed()
        }
    }
}

fn shadow_sampled(variant: TransportVariant) -> bool {
    match variant {
        TransportVariant::ShadowHigh => true,
        TransportVariant::ShadowLow => rand::random::<f64>() < SHADOW_LOW_SAMPLE_RATE,
        TransportVariant::Original | TransportVariant::ExperimentalPrimary => false,
    }
}

/// Fire-and-forget experimental connection. Its outcome never joins the
/// primary result; success and failure are observed only in logs.
fn spawn_shadow(
    transport: Arc<dyn Transport>,
    options: &ConnectOptions,
    resource: &ResourceOptions,
    token: CancellationToken,
) {
    let name = format!("{}-shadow", options.name);
    let options = ConnectOptions {
        name: name.clone(),
        ..options.clone()
    };
    let resource = ResourceOptions {
        name: resource.name,
        keepalive_path: resource.keepalive_path.clone(),
        handle_request: None,
        variant: TransportVariant::ExperimentalPrimary,
    };

    drop(tokio::spawn(async move {
        let outcome = tokio::select! {
            () = token.cancelled() => return,
            outcome = transport.connect(options, resource) => outcome,
        };

        match outcome {
            Ok(connection) => {
                tracing::debug!(name, "shadow connection established");
                // Held open for comparison until the connection of record goes
                // away.
                token.cancelled().await;
                connection.shutdown().await;
            }
            Err(error) => tracing::debug!(name, %error, "shadow connection failed"),
        }
    }));
}

/// Decorator tying a shadow task's lifetime to the connection of record.
#[derive(Debug)]
struct ShadowingResource {
    primary: Arc<dyn ConnectionResource>,
    shadow: CancellationToken,
}

impl ShadowingResource {
    fn new(primary: Arc<dyn ConnectionResource>, shadow: CancellationToken) -> Self {
        Self { primary, shadow }
    }
}

#[async_trait]
impl ConnectionResource for ShadowingResource {
    async fn send_request(&self, request: OutgoingRequest) -> crate::Result<Response> {
        self.primary.send_request(request).await
    }

    async fn closed(&self) -> CloseFrame {
        let frame = self.primary.closed().await;
        self.shadow.cancel();
        frame
    }

    async fn shutdown(&self) {
        self.shadow.cancel();
        self.primary.shutdown().await;
    }

    fn force_keepalive(&self, timeout_override: Option<std::time::Duration>) {
        self.primary.force_keepalive(timeout_override);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::FutureExt as _;
    use tokio::sync::watch;

    use super::*;

    struct Flags {
        opt_out: bool,
        shadowing: bool,
    }

    impl FeatureFlagProvider for Flags {
        fn experiment_opt_out(&self) -> bool {
            self.opt_out
        }

        fn shadowing_enabled(&self) -> bool {
            self.shadowing
        }
    }

    const SUFFIX: Option<&str> = Some(".chat.example.org");
    const HOST: &str = "server.chat.example.org";

    fn select(release: ReleaseChannel, opt_out: bool, shadowing: bool) -> TransportVariant {
        let flags = Flags { opt_out, shadowing };
        select_transport_variant(release, &flags, false, HOST, SUFFIX)
    }

    #[test]
    fn proxy_forces_legacy_transport() {
        let flags = Flags {
            opt_out: false,
            shadowing: true,
        };
        let variant =
            select_transport_variant(ReleaseChannel::Staging, &flags, true, HOST, SUFFIX);
        assert_eq!(variant, TransportVariant::Original);
    }

    #[test]
    fn unrecognized_host_forces_legacy_transport() {
        let flags = Flags {
            opt_out: false,
            shadowing: true,
        };
        assert_eq!(
            select_transport_variant(ReleaseChannel::Staging, &flags, false, "other.net", SUFFIX),
            TransportVariant::Original
        );
        assert_eq!(
            select_transport_variant(ReleaseChannel::Staging, &flags, false, HOST, None),
            TransportVariant::Original
        );
    }

    #[test]
    fn staging_always_switches_fully() {
        assert_eq!(
            select(ReleaseChannel::Staging, true, false),
            TransportVariant::ExperimentalPrimary
        );
    }

    #[test]
    fn alpha_switches_unless_opted_out() {
        assert_eq!(
            select(ReleaseChannel::Alpha, false, false),
            TransportVariant::ExperimentalPrimary
        );
        assert_eq!(
            select(ReleaseChannel::Alpha, true, false),
            TransportVariant::ShadowHigh
        );
    }

    #[test]
    fn beta_shadows_by_default() {
        assert_eq!(
            select(ReleaseChannel::Beta, false, false),
            TransportVariant::ShadowHigh
        );
        assert_eq!(
            select(ReleaseChannel::Beta, true, false),
            TransportVariant::ShadowLow
        );
    }

    #[test]
    fn stable_follows_remote_flag() {
        assert_eq!(
            select(ReleaseChannel::Stable, false, true),
            TransportVariant::ShadowLow
        );
        assert_eq!(
            select(ReleaseChannel::Stable, false, false),
            TransportVariant::Original
        );
    }

    #[derive(Debug, Default)]
    struct StubResource {
        shutdown: AtomicBool,
    }

    #[async_trait]
    impl ConnectionResource for StubResource {
        async fn send_request(&self, _request: OutgoingRequest) -> crate::Result<Response> {
            Err(crate::Error::validation("not used in this test"))
        }

        async fn closed(&self) -> CloseFrame {
            std::future::pending().await
        }

        async fn shutdown(&self) {
            self.shutdown.store(true, Ordering::SeqCst);
        }

        fn force_keepalive(&self, _timeout_override: Option<Duration>) {}
    }

    #[tokio::test]
    async fn shadowing_resource_shutdown_cancels_shadow_and_primary() {
        let primary = Arc::new(StubResource::default());
        let token = CancellationToken::new();
        let shadowing =
            ShadowingResource::new(Arc::clone(&primary) as Arc<dyn ConnectionResource>, token.clone());

        shadowing.shutdown().await;

        assert!(token.is_cancelled());
        assert!(primary.shutdown.load(Ordering::SeqCst));
    }

    /// Resource whose close event the test triggers.
    #[derive(Debug)]
    struct ClosableResource {
        shutdown: AtomicBool,
        close_tx: watch::Sender<bool>,
    }

    impl ClosableResource {
        fn new() -> Arc<Self> {
            let (close_tx, _) = watch::channel(false);
            Arc::new(Self {
                shutdown: AtomicBool::new(false),
                close_tx,
            })
        }

        fn close(&self) {
            let _ = self.close_tx.send(true);
        }

        fn was_shut_down(&self) -> bool {
            self.shutdown.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConnectionResource for ClosableResource {
        async fn send_request(&self, _request: OutgoingRequest) -> crate::Result<Response> {
            Err(crate::Error::validation("not used in this test"))
        }

        async fn closed(&self) -> CloseFrame {
            let mut rx = self.close_tx.subscribe();
            let _ = rx.wait_for(|closed| *closed).await;
            CloseFrame::new(1006, "connection reset")
        }

        async fn shutdown(&self) {
            self.shutdown.store(true, Ordering::SeqCst);
            self.close(); // a shut-down connection also closes
        }

        fn force_keepalive(&self, _timeout_override: Option<Duration>) {}
    }

    enum ShadowBehavior {
        Fail,
        Hang,
        Connect(Arc<ClosableResource>),
    }

    /// Routes connects by variant: the legacy connect gets the primary
    /// resource, the experimental one follows the scripted behavior.
    struct SplitTransport {
        primary: Arc<ClosableResource>,
        shadow: ShadowBehavior,
        shadow_connects: AtomicUsize,
    }

    impl SplitTransport {
        fn new(primary: Arc<ClosableResource>, shadow: ShadowBehavior) -> Arc<Self> {
            Arc::new(Self {
                primary,
                shadow,
                shadow_connects: AtomicUsize::new(0),
            })
        }
    }

    impl Transport for SplitTransport {
        fn connect(&self, _options: ConnectOptions, resource: ResourceOptions) -> ConnectFuture {
            if resource.variant == TransportVariant::ExperimentalPrimary {
                self.shadow_connects.fetch_add(1, Ordering::SeqCst);
                return match &self.shadow {
                    ShadowBehavior::Fail => {
                        async { Err(ConnectError::unreachable("experimental endpoint down")) }
                            .boxed()
                    }
                    ShadowBehavior::Hang => {
                        std::future::pending::<crate::process::ConnectOutcome>().boxed()
                    }
                    ShadowBehavior::Connect(shadow) => {
                        let shadow: Arc<dyn ConnectionResource> = Arc::clone(shadow) as _;
                        async move { Ok(shadow) }.boxed()
                    }
                };
            }

            let primary: Arc<dyn ConnectionResource> = Arc::clone(&self.primary) as _;
            async move { Ok(primary) }.boxed()
        }
    }

    fn connect_options(name: &str) -> ConnectOptions {
        ConnectOptions {
            name: name.to_owned(),
            url: Url::parse("wss://server.chat.example.org/v1/websocket/").expect("valid url"),
            version: "7.4.1".to_owned(),
            user_agent: "TestClient".to_owned(),
            proxy_agent: None,
            extra_headers: HeaderMap::new(),
            certificate_authority: None,
        }
    }

    fn shadow_high_options() -> ResourceOptions {
        ResourceOptions {
            name: "unauthenticated",
            keepalive_path: "/v1/keepalive".to_owned(),
            handle_request: None,
            variant: TransportVariant::ShadowHigh,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_shadow_connect_leaves_the_primary_untouched() {
        let primary = ClosableResource::new();
        let transport = SplitTransport::new(Arc::clone(&primary), ShadowBehavior::Fail);
        let as_dyn: Arc<dyn Transport> = Arc::clone(&transport) as _;

        let connected =
            connect_with_variant(&as_dyn, connect_options("unauthenticated:1"), shadow_high_options())
                .await
                .expect("connection of record established");

        // The shadow failure is final: no retry, no effect on the primary.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.shadow_connects.load(Ordering::SeqCst), 1);
        assert!(!primary.was_shut_down());
        connected.force_keepalive(None);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_shadow_connect_does_not_delay_the_primary() {
        let primary = ClosableResource::new();
        let transport = SplitTransport::new(Arc::clone(&primary), ShadowBehavior::Hang);
        let as_dyn: Arc<dyn Transport> = Arc::clone(&transport) as _;

        let connected = tokio::time::timeout(
            Duration::from_secs(1),
            connect_with_variant(&as_dyn, connect_options("unauthenticated:2"), shadow_high_options()),
        )
        .await
        .expect("primary resolves while the shadow hangs")
        .expect("connection of record established");

        assert_eq!(transport.shadow_connects.load(Ordering::SeqCst), 1);
        assert!(!primary.was_shut_down());
        drop(connected);
    }

    #[tokio::test(start_paused = true)]
    async fn primary_close_tears_the_shadow_connection_down() {
        let primary = ClosableResource::new();
        let shadow = ClosableResource::new();
        let transport = SplitTransport::new(
            Arc::clone(&primary),
            ShadowBehavior::Connect(Arc::clone(&shadow)),
        );
        let as_dyn: Arc<dyn Transport> = Arc::clone(&transport) as _;

        let connected =
            connect_with_variant(&as_dyn, connect_options("unauthenticated:3"), shadow_high_options())
                .await
                .expect("connection of record established");

        // Give the shadow task a chance to establish its connection.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.shadow_connects.load(Ordering::SeqCst), 1);
        assert!(!shadow.was_shut_down());

        primary.close();
        let frame = connected.closed().await;
        assert_eq!(frame.code, 1006);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(shadow.was_shut_down());
    }
}
