use crate::engine::AcknowledgedEngine;
use crate::engine::Discovery;
use crate::engine::DiscoveryEngine;
use crate::engine::FindAttributes;
use crate::engine::FindServiceTypes;
use crate::engine::FindServices;
use crate::engine::Flow;
use crate::engine::FoundService;
use crate::engine::Reply;
use crate::engine::RetryPolicy;
use crate::engine::Session;
use crate::engine::SharedTransport;
use crate::lifetime::LifetimeManager;
use crate::lifetime::Registration;
use crate::property::Properties;
use crate::transport::Target;
use crate::transport::Transport;
use crate::transport::UdpTransport;
use crate::xid::SequentialXidGenerator;
use crate::xid::XidGenerator;
use futures_channel::oneshot;
use futures_util::Future;
use slp_protocol::pdu::Body;
use slp_protocol::pdu::NamingAuthority;
use slp_protocol::pdu::ServiceDeregistration;
use slp_protocol::pdu::ServiceRegistration;
use slp_protocol::pdu::UrlEntry;
use slp_protocol::ServiceUrl;
use slp_protocol::SlpError;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Identifies one operation started on a [`Handle`].
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct RequestId(u64);

/// An operation that was accepted and may still be running.
#[derive(Debug)]
pub struct PendingRequest {
    id: RequestId,
    completion: oneshot::Receiver<()>,
}

impl PendingRequest {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Resolves once the operation has delivered its last callback, or was
    /// cancelled, and its state is released.
    pub async fn finished(self) {
        let _ = self.completion.await;
    }
}

/// A session with the SLP network.
///
/// Clones share the same session. In synchronous mode every operation
/// returns once its callbacks have run and only one operation may run at a
/// time. In asynchronous mode operations run on spawned tasks, so a Tokio
/// runtime is required either way.
///
/// All operations share one socket. An operation waits for the listening
/// cycle of another one to end before its first send, unless the handle is
/// closed in the meantime.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<Inner>,
}

struct Inner {
    language: String,
    is_async: bool,
    scopes: Vec<String>,
    properties: Properties,
    transport: SharedTransport,
    xids: Box<dyn XidGenerator + Send + Sync>,
    lifetimes: LifetimeManager,
    requests: std::sync::Mutex<HashMap<RequestId, CancellationToken>>,
    next_request_id: AtomicU64,
    closed: AtomicBool,
    busy: AtomicBool,
}

impl Inner {
    fn requests(&self) -> MutexGuard<'_, HashMap<RequestId, CancellationToken>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bookkeeping of a running operation, released on drop.
struct RequestGuard {
    inner: Arc<Inner>,
    id: RequestId,
    exclusive: bool,
    _completion: oneshot::Sender<()>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.inner.requests().remove(&self.id);
        if self.exclusive {
            self.inner.busy.store(false, Ordering::SeqCst);
        }
        log::trace!("Released request {:?}", self.id);
    }
}

impl Handle {
    /// Opens a handle configured by [`Properties::global`].
    ///
    /// An empty `language` selects `net.slp.locale`.
    pub fn open(language: &str, is_async: bool) -> Result<Self, SlpError> {
        Self::open_with(Properties::global(), language, is_async)
    }

    pub fn open_with(
        properties: &Properties,
        language: &str,
        is_async: bool,
    ) -> Result<Self, SlpError> {
        let transport = UdpTransport::bind(properties).map_err(|e| {
            log::error!("Failed to bind the SLP socket: {}", e);
            SlpError::NetworkInitFailed
        })?;
        Self::from_parts(
            properties.clone(),
            language,
            is_async,
            transport,
            SequentialXidGenerator::default(),
        )
    }

    fn from_parts(
        properties: Properties,
        language: &str,
        is_async: bool,
        transport: impl Transport + Send + Sync + 'static,
        xids: impl XidGenerator + Send + Sync + 'static,
    ) -> Result<Self, SlpError> {
        let language = if language.is_empty() {
            properties.locale()
        } else {
            language.to_string()
        };
        if !is_language_tag(&language) {
            return Err(SlpError::LanguageNotSupported);
        }
        let transport: Box<dyn Transport + Send + Sync> = Box::new(transport);
        let inner = Inner {
            scopes: properties.scopes(),
            lifetimes: LifetimeManager::new(properties.min_refresh_interval()),
            language,
            is_async,
            properties,
            transport: Arc::new(Mutex::new(transport)),
            xids: Box::new(xids),
            requests: Default::default(),
            next_request_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            busy: AtomicBool::new(false),
        };
        log::info!(
            "Opened {} SLP handle for language {}",
            if is_async { "asynchronous" } else { "synchronous" },
            inner.language
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Cancels every running operation. The handle is unusable afterwards.
    pub fn close(&self) -> Result<(), SlpError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(SlpError::TypeError);
        }
        let requests = self.inner.requests();
        for token in requests.values() {
            token.cancel();
        }
        log::info!("Closed SLP handle, cancelled {} requests", requests.len());
        Ok(())
    }

    /// Returns `true` when a running operation was cancelled.
    pub fn cancel(&self, id: RequestId) -> bool {
        match self.inner.requests().get(&id) {
            Some(token) if !token.is_cancelled() => {
                log::debug!("Cancelling request {:?}", id);
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Searches for services of `service_type`.
    ///
    /// An empty `scopes` selects the scopes of the handle.
    pub async fn find_services<F>(
        &self,
        service_type: &str,
        scopes: &str,
        filter: &str,
        callback: F,
    ) -> Result<PendingRequest, SlpError>
    where
        F: FnMut(Result<Reply<FoundService>, SlpError>) -> Flow + Send + 'static,
    {
        if service_type.is_empty() {
            return Err(SlpError::ParameterBad);
        }
        let discovery = FindServices {
            service_type: service_type.into(),
            scopes: self.scopes_or_default(scopes),
            predicate: filter.into(),
        };
        self.discover(discovery, callback).await
    }

    /// Searches for service types. `*` selects every naming authority and
    /// an empty string selects IANA.
    pub async fn find_service_types<F>(
        &self,
        naming_authority: &str,
        scopes: &str,
        callback: F,
    ) -> Result<PendingRequest, SlpError>
    where
        F: FnMut(Result<Reply<String>, SlpError>) -> Flow + Send + 'static,
    {
        let discovery = FindServiceTypes {
            naming_authority: NamingAuthority::from_api(naming_authority),
            scopes: self.scopes_or_default(scopes),
        };
        self.discover(discovery, callback).await
    }

    pub async fn find_attributes<F>(
        &self,
        url_or_type: &str,
        scopes: &str,
        attribute_ids: &str,
        callback: F,
    ) -> Result<PendingRequest, SlpError>
    where
        F: FnMut(Result<Reply<String>, SlpError>) -> Flow + Send + 'static,
    {
        if url_or_type.is_empty() {
            return Err(SlpError::ParameterBad);
        }
        let discovery = FindAttributes {
            url: url_or_type.into(),
            scopes: self.scopes_or_default(scopes),
            tags: attribute_ids.into(),
        };
        self.discover(discovery, callback).await
    }

    /// Advertises a service with the local Service Agent or the first
    /// configured Directory Agent.
    pub async fn register<F>(
        &self,
        url: &str,
        lifetime: u16,
        attributes: &str,
        fresh: bool,
        callback: F,
    ) -> Result<PendingRequest, SlpError>
    where
        F: FnOnce(Result<(), SlpError>) + Send + 'static,
    {
        let service_url = ServiceUrl::parse(url)?;
        if lifetime == 0 {
            return Err(SlpError::ParameterBad);
        }
        let minimum = self.inner.lifetimes.minimum_refresh_interval();
        if u32::from(lifetime) < minimum {
            log::debug!(
                "Lifetime {} of {} is below the minimum refresh interval {}, agents will likely reject it",
                lifetime,
                url,
                minimum
            );
        }
        let body = Body::ServiceRegistration(ServiceRegistration {
            url: UrlEntry {
                lifetime,
                url: url.into(),
            },
            service_type: service_url.full_service_type(),
            scopes: self.scopes_or_default(""),
            attributes: attributes.into(),
        });

        let inner = self.inner.clone();
        let attributes = attributes.to_string();
        self.acknowledged(body, fresh, move |result| {
            if result.is_ok() {
                inner.lifetimes.record(Registration {
                    url: service_url,
                    lifetime,
                    attributes,
                    fresh,
                    registered_at: Instant::now(),
                });
            }
            callback(result);
        })
        .await
    }

    pub async fn deregister<F>(&self, url: &str, callback: F) -> Result<PendingRequest, SlpError>
    where
        F: FnOnce(Result<(), SlpError>) + Send + 'static,
    {
        let service_url = ServiceUrl::parse(url)?;
        let body = Body::ServiceDeregistration(ServiceDeregistration {
            scopes: self.scopes_or_default(""),
            url: UrlEntry {
                lifetime: 0,
                url: url.into(),
            },
            tags: String::default(),
        });

        let inner = self.inner.clone();
        self.acknowledged(body, false, move |result| {
            if result.is_ok() {
                inner.lifetimes.forget(&service_url);
            }
            callback(result);
        })
        .await
    }

    /// Removes the listed attribute tags from a registered service.
    pub async fn delete_attributes<F>(
        &self,
        url: &str,
        attributes: &str,
        callback: F,
    ) -> Result<PendingRequest, SlpError>
    where
        F: FnOnce(Result<(), SlpError>) + Send + 'static,
    {
        ServiceUrl::parse(url)?;
        if attributes.is_empty() {
            return Err(SlpError::ParameterBad);
        }
        let body = Body::ServiceDeregistration(ServiceDeregistration {
            scopes: self.scopes_or_default(""),
            url: UrlEntry {
                lifetime: 0,
                url: url.into(),
            },
            tags: attributes.into(),
        });
        self.acknowledged(body, false, callback).await
    }

    /// Scopes this handle uses, comma separated.
    pub fn find_scopes(&self) -> Result<String, SlpError> {
        self.ensure_open()?;
        Ok(self.inner.scopes.join(","))
    }

    /// Minimum lifetime in seconds agents are expected to accept.
    pub fn refresh_interval(&self) -> u32 {
        self.inner.lifetimes.minimum_refresh_interval()
    }

    /// Registrations acknowledged through this handle and not deregistered.
    pub fn registrations(&self) -> Vec<Registration> {
        self.inner.lifetimes.registrations()
    }

    /// Registrations whose lease ends within `margin` from now.
    pub fn due_for_refresh(&self, margin: Duration) -> Vec<Registration> {
        self.inner.lifetimes.due_for_refresh(Instant::now(), margin)
    }

    async fn discover<D, F>(&self, discovery: D, callback: F) -> Result<PendingRequest, SlpError>
    where
        D: Discovery,
        F: FnMut(Result<Reply<D::Item>, SlpError>) -> Flow + Send + 'static,
    {
        let (guard, pending, session) = self.begin()?;
        let properties = &self.inner.properties;
        let target = if properties.is_broadcast_only() {
            Target::Broadcast
        } else {
            Target::Multicast
        };
        let engine =
            DiscoveryEngine::start(session, discovery, target, RetryPolicy::multicast(properties))
                .await?;
        self.dispatch(guard, engine.run(callback)).await;
        Ok(pending)
    }

    async fn acknowledged<F>(
        &self,
        body: Body,
        fresh: bool,
        callback: F,
    ) -> Result<PendingRequest, SlpError>
    where
        F: FnOnce(Result<(), SlpError>) + Send + 'static,
    {
        let (guard, pending, session) = self.begin()?;
        let properties = &self.inner.properties;
        let engine = AcknowledgedEngine::start(
            session,
            body,
            fresh,
            self.registration_destination(),
            RetryPolicy::unicast(properties),
        )
        .await?;
        self.dispatch(guard, engine.run(callback)).await;
        Ok(pending)
    }

    fn begin(&self) -> Result<(RequestGuard, PendingRequest, Session), SlpError> {
        self.ensure_open()?;
        let exclusive = !self.inner.is_async;
        if exclusive && self.inner.busy.swap(true, Ordering::SeqCst) {
            return Err(SlpError::HandleInUse);
        }

        let id = RequestId(self.inner.next_request_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = oneshot::channel();
        let guard = RequestGuard {
            inner: self.inner.clone(),
            id,
            exclusive,
            _completion: sender,
        };
        let cancellation = CancellationToken::new();
        self.inner.requests().insert(id, cancellation.clone());
        self.ensure_open()?;

        let session = Session {
            transport: self.inner.transport.clone(),
            language: self.inner.language.clone(),
            xid: self.inner.xids.generate(),
            mtu: self.inner.properties.mtu(),
            cancellation,
        };
        log::debug!("Starting request {:?} with XID {}", id, session.xid);
        let pending = PendingRequest {
            id,
            completion: receiver,
        };
        Ok((guard, pending, session))
    }

    async fn dispatch(&self, guard: RequestGuard, task: impl Future<Output = ()> + Send + 'static) {
        let task = async move {
            task.await;
            drop(guard);
        };
        if self.inner.is_async {
            tokio::spawn(task);
        } else {
            task.await;
        }
    }

    fn ensure_open(&self) -> Result<(), SlpError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(SlpError::TypeError)
        } else {
            Ok(())
        }
    }

    fn scopes_or_default(&self, scopes: &str) -> String {
        if scopes.trim().is_empty() {
            self.inner.scopes.join(",")
        } else {
            scopes.into()
        }
    }

    fn registration_destination(&self) -> SocketAddr {
        let properties = &self.inner.properties;
        properties
            .directory_agents()
            .first()
            .copied()
            .unwrap_or_else(|| (Ipv4Addr::LOCALHOST, properties.port()).into())
    }
}

/// Checks the RFC 1766 form `1*8ALPHA *("-" 1*8ALPHANUM)`.
fn is_language_tag(tag: &str) -> bool {
    let mut parts = tag.split('-');
    let valid = |part: &str, primary: bool| {
        (1..=8).contains(&part.len())
            && part.chars().all(|c| {
                if primary {
                    c.is_ascii_alphabetic()
                } else {
                    c.is_ascii_alphanumeric()
                }
            })
    };
    parts.next().is_some_and(|primary| valid(primary, true)) && parts.all(|part| valid(part, false))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::reply_from;
    use crate::test::scripted_transport;
    use crate::test::silent_transport;
    use crate::transport::MockTransport;
    use crate::xid::MockXidGenerator;
    use futures_util::FutureExt;
    use mockall::predicate::always;
    use mockall::predicate::eq;
    use slp_protocol::pdu::Message;
    use slp_protocol::pdu::ServiceAcknowledge;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    const XID: u16 = 42;

    fn xids() -> MockXidGenerator {
        let mut xids = MockXidGenerator::new();
        xids.expect_generate().return_const(XID);
        xids
    }

    fn properties() -> Properties {
        Properties::default()
            .with("net.slp.multicastMaximumWait", "2000")
            .with("net.slp.unicastMaximumWait", "2000")
    }

    fn acknowledgement(error_code: u16) -> crate::transport::Datagram {
        reply_from(
            "127.0.0.1:427",
            XID,
            Body::ServiceAcknowledge(ServiceAcknowledge { error_code }),
        )
    }

    type Outcome = Arc<StdMutex<Option<Result<(), SlpError>>>>;

    fn outcome() -> (Outcome, impl FnOnce(Result<(), SlpError>) + Send + 'static) {
        let outcome: Outcome = Default::default();
        let outcome_clone = outcome.clone();
        (outcome, move |result| {
            *outcome_clone.lock().unwrap() = Some(result)
        })
    }

    #[test]
    fn language_tags() {
        for tag in ["en", "en-US", "i-klingon", "x-a1b2c3d4"] {
            assert!(is_language_tag(tag), "{}", tag);
        }
        for tag in ["", "e1", "-en", "en-", "toolonglang", "en-abcdefghi", "en_US"] {
            assert!(!is_language_tag(tag), "{}", tag);
        }
    }

    #[tokio::test]
    async fn open() -> anyhow::Result<()> {
        crate::test::init();

        let handle = Handle::from_parts(properties(), "", true, silent_transport(), xids())?;
        assert_eq!(handle.inner.language, "en");
        assert_eq!(handle.find_scopes()?, "DEFAULT");
        assert_eq!(handle.refresh_interval(), 0);

        let e = Handle::from_parts(properties(), "englishlanguage", true, silent_transport(), xids())
            .err();
        assert_eq!(e, Some(SlpError::LanguageNotSupported));
        Ok(())
    }

    #[tokio::test]
    async fn open_binds_a_socket() -> anyhow::Result<()> {
        crate::test::init();

        let handle = Handle::open_with(&properties(), "de", false)?;

        handle.close()?;
        Ok(())
    }

    #[test]
    fn open_outside_runtime() {
        crate::test::init();

        let result = Handle::open_with(&properties(), "en", false);

        assert_eq!(result.err(), Some(SlpError::NetworkInitFailed));
    }

    #[tokio::test]
    async fn closed_handle() -> anyhow::Result<()> {
        crate::test::init();

        let handle = Handle::from_parts(properties(), "en", true, silent_transport(), xids())?;

        // When
        handle.close()?;

        // Then
        assert_eq!(handle.close(), Err(SlpError::TypeError));
        assert_eq!(handle.find_scopes(), Err(SlpError::TypeError));
        let e = handle
            .find_services("service:printer", "", "", |_| Flow::Continue)
            .await
            .err();
        assert_eq!(e, Some(SlpError::TypeError));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn synchronous_handle_in_use() -> anyhow::Result<()> {
        crate::test::init();

        let sent = Arc::new(Notify::new());
        let sent_clone = sent.clone();
        let mut transport = MockTransport::new();
        transport.expect_send().returning(move |_, _| {
            sent_clone.notify_one();
            async { Ok(()) }.boxed()
        });
        transport.expect_receive().returning(|timeout| {
            async move {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
            .boxed()
        });
        let handle = Handle::from_parts(properties(), "en", false, transport, xids())?;
        let handle_clone = handle.clone();
        let first = tokio::spawn(async move {
            handle_clone
                .find_services("service:printer", "", "", |_| Flow::Continue)
                .await
                .map(|_| ())
        });
        sent.notified().await;

        // When
        let second = handle
            .find_services("service:printer", "", "", |_| Flow::Continue)
            .await;

        // Then
        assert_eq!(second.err(), Some(SlpError::HandleInUse));
        first.await??;
        let third = handle
            .find_services("service:printer", "", "", |_| Flow::Stop)
            .await;
        assert!(third.is_ok());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn asynchronous_handle_accepts_concurrent_operations() -> anyhow::Result<()> {
        crate::test::init();

        let handle = Handle::from_parts(properties(), "en", true, silent_transport(), xids())?;
        let last_calls = Arc::new(StdMutex::new(0));
        let callback = |last_calls: Arc<StdMutex<i32>>| {
            move |result: Result<Reply<FoundService>, SlpError>| {
                if result == Ok(Reply::LastCall) {
                    *last_calls.lock().unwrap() += 1;
                }
                Flow::Continue
            }
        };

        // When
        let first = handle
            .find_services("service:printer", "", "", callback(last_calls.clone()))
            .await?;
        let second = handle
            .find_services("service:scanner", "", "", callback(last_calls.clone()))
            .await?;

        // Then
        assert_ne!(first.id(), second.id());
        first.finished().await;
        second.finished().await;
        assert_eq!(*last_calls.lock().unwrap(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancel() -> anyhow::Result<()> {
        crate::test::init();

        let handle = Handle::from_parts(properties(), "en", true, silent_transport(), xids())?;
        let deliveries = Arc::new(StdMutex::new(0));
        let deliveries_clone = deliveries.clone();
        let pending = handle
            .find_service_types("*", "", move |_| {
                *deliveries_clone.lock().unwrap() += 1;
                Flow::Continue
            })
            .await?;
        let id = pending.id();
        tokio::time::sleep(Duration::from_millis(700)).await;

        // When
        assert!(handle.cancel(id));
        pending.finished().await;

        // Then
        assert_eq!(*deliveries.lock().unwrap(), 0);
        assert_eq!(Arc::strong_count(&deliveries), 1);
        assert!(!handle.cancel(id));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_running_requests() -> anyhow::Result<()> {
        crate::test::init();

        let handle = Handle::from_parts(properties(), "en", true, silent_transport(), xids())?;
        let (outcome, callback) = outcome();
        let pending = handle
            .deregister("service:printer://a", callback)
            .await?;

        // When
        handle.close()?;
        pending.finished().await;

        // Then
        assert_eq!(*outcome.lock().unwrap(), None);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn close_releases_operation_waiting_for_transport() -> anyhow::Result<()> {
        crate::test::init();

        let handle = Handle::from_parts(properties(), "en", true, silent_transport(), xids())?;
        let first = handle
            .find_services("service:printer", "", "", |_| Flow::Continue)
            .await?;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let started = Instant::now();
        let handle_clone = handle.clone();
        let second = tokio::spawn(async move {
            handle_clone
                .find_services("service:scanner", "", "", |_| Flow::Continue)
                .await
                .map(|pending| pending.id())
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // When
        handle.close()?;
        let second = second.await?;

        // Then
        assert_eq!(second, Err(SlpError::TypeError));
        assert!(started.elapsed() < Duration::from_millis(500));
        first.finished().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn register() -> anyhow::Result<()> {
        crate::test::init();

        let mut transport = MockTransport::new();
        let mut reply = Some(acknowledgement(0));
        transport
            .expect_send()
            .withf(|target, packet| {
                if *target != Target::Unicast((Ipv4Addr::LOCALHOST, 427).into()) {
                    return false;
                }
                let Ok(message) = Message::decode(packet) else {
                    return false;
                };
                matches!(
                    message.body,
                    Body::ServiceRegistration(ServiceRegistration { ref service_type, .. })
                        if service_type == "service:printer:lpr"
                )
            })
            .times(1)
            .returning(|_, _| async { Ok(()) }.boxed());
        transport
            .expect_receive()
            .returning(move |_| {
                let reply = reply.take();
                async move { Ok(reply) }.boxed()
            });
        let handle = Handle::from_parts(properties(), "en", false, transport, xids())?;
        let (outcome, callback) = outcome();

        // When
        handle
            .register(
                "service:printer:lpr://host/queue",
                600,
                "(color=true)",
                true,
                callback,
            )
            .await?;

        // Then
        assert_eq!(*outcome.lock().unwrap(), Some(Ok(())));
        let registrations = handle.registrations();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].lifetime, 600);
        assert_eq!(registrations[0].attributes, "(color=true)");
        assert!(handle.due_for_refresh(Duration::from_secs(60)).is_empty());
        assert_eq!(handle.due_for_refresh(Duration::from_secs(600)).len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_registration_is_not_tracked() -> anyhow::Result<()> {
        crate::test::init();

        let transport = scripted_transport(vec![acknowledgement(3)]);
        let handle = Handle::from_parts(properties(), "en", false, transport, xids())?;
        let (outcome, callback) = outcome();

        // When
        handle
            .register("service:printer://host", 600, "", false, callback)
            .await?;

        // Then
        assert_eq!(
            *outcome.lock().unwrap(),
            Some(Err(SlpError::InvalidRegistration))
        );
        assert!(handle.registrations().is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn registration_times_out() -> anyhow::Result<()> {
        crate::test::init();

        let handle = Handle::from_parts(properties(), "en", false, silent_transport(), xids())?;
        let (outcome, callback) = outcome();

        handle
            .register("service:printer://host", 600, "", false, callback)
            .await?;

        assert_eq!(*outcome.lock().unwrap(), Some(Err(SlpError::NetworkTimedOut)));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn short_lifetime_is_still_sent() -> anyhow::Result<()> {
        crate::test::init();

        let properties = properties().with("net.slp.minRefreshInterval", "3600");
        let transport = scripted_transport(vec![acknowledgement(0)]);
        let handle = Handle::from_parts(properties, "en", false, transport, xids())?;
        let (outcome, callback) = outcome();

        // When
        handle
            .register("service:printer://host", 60, "", false, callback)
            .await?;

        // Then
        assert_eq!(handle.refresh_interval(), 3600);
        assert_eq!(*outcome.lock().unwrap(), Some(Ok(())));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_registrations() -> anyhow::Result<()> {
        crate::test::init();

        let mut transport = MockTransport::new();
        transport.expect_send().never();
        let handle = Handle::from_parts(properties(), "en", false, transport, xids())?;

        let e = handle
            .register("service:printer://host", 0, "", false, |_| {})
            .await
            .err();
        assert_eq!(e, Some(SlpError::ParameterBad));

        let e = handle.register("printer", 600, "", false, |_| {}).await.err();
        assert_eq!(e, Some(SlpError::ParseError));

        let e = handle
            .delete_attributes("service:printer://host", "", |_| {})
            .await
            .err();
        assert_eq!(e, Some(SlpError::ParameterBad));

        let e = handle
            .find_services("", "", "", |_| Flow::Continue)
            .await
            .err();
        assert_eq!(e, Some(SlpError::ParameterBad));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn deregister_forgets() -> anyhow::Result<()> {
        crate::test::init();

        let properties = properties().with("net.slp.DAAddresses", "127.0.0.1");
        let transport = scripted_transport(vec![acknowledgement(0), acknowledgement(0)]);
        let handle = Handle::from_parts(properties, "en", false, transport, xids())?;
        handle
            .register("service:printer://host", 600, "", false, |_| {})
            .await?;
        assert_eq!(handle.registrations().len(), 1);
        let (outcome, callback) = outcome();

        // When
        handle.deregister("service:printer://host", callback).await?;

        // Then
        assert_eq!(*outcome.lock().unwrap(), Some(Ok(())));
        assert!(handle.registrations().is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn registers_with_directory_agent() -> anyhow::Result<()> {
        crate::test::init();

        let properties = properties().with("net.slp.DAAddresses", "192.0.2.7:1427");
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .with(eq(Target::Unicast("192.0.2.7:1427".parse()?)), always())
            .times(1)
            .returning(|_, _| async { Ok(()) }.boxed());
        let mut reply = Some(reply_from(
            "192.0.2.7:1427",
            XID,
            Body::ServiceAcknowledge(ServiceAcknowledge { error_code: 0 }),
        ));
        transport.expect_receive().returning(move |_| {
            let reply = reply.take();
            async move { Ok(reply) }.boxed()
        });
        let handle = Handle::from_parts(properties, "en", false, transport, xids())?;
        let (outcome, callback) = outcome();

        // When
        handle
            .delete_attributes("service:printer://host", "color", callback)
            .await?;

        // Then
        assert_eq!(*outcome.lock().unwrap(), Some(Ok(())));
        Ok(())
    }

    #[tokio::test]
    async fn first_send_failure_is_returned() -> anyhow::Result<()> {
        crate::test::init();

        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .return_once(|_, _| async { Err(std::io::ErrorKind::ConnectionRefused.into()) }.boxed());
        let handle = Handle::from_parts(properties(), "en", true, transport, xids())?;
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        // When
        let e = handle
            .find_attributes("service:printer://host", "", "", move |_| {
                called_clone.store(true, Ordering::SeqCst);
                Flow::Continue
            })
            .await
            .err();

        // Then
        assert_eq!(e, Some(SlpError::NetworkError));
        assert!(!called.load(Ordering::SeqCst));
        assert!(handle.inner.requests().is_empty());
        Ok(())
    }
}
