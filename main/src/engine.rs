//! Drives one request from the first transmission to its last callback.

use crate::property::Properties;
use crate::transport::network_error;
use crate::transport::Datagram;
use crate::transport::Target;
use crate::transport::Transport;
use sha2::Digest;
use sha2::Sha256;
use slp_protocol::pdu::AttributeRequest;
use slp_protocol::pdu::Body;
use slp_protocol::pdu::Flags;
use slp_protocol::pdu::Message;
use slp_protocol::pdu::NamingAuthority;
use slp_protocol::pdu::ServiceRequest;
use slp_protocol::pdu::ServiceTypeRequest;
use slp_protocol::SlpError;
use std::collections::HashSet;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub type SharedTransport = Arc<Mutex<Box<dyn Transport + Send + Sync>>>;

/// Whether a discovery callback wants more results.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Flow {
    Continue,
    Stop,
}

/// One delivery of a multi-response operation.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Reply<T> {
    Found(T),
    /// No more results will follow.
    LastCall,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FoundService {
    pub url: String,
    pub lifetime: u16,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum State {
    Building,
    Sending,
    AwaitingResponses,
    Completed,
    Cancelled,
    Failed,
}

/// Retransmission schedule of a request.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub maximum: Duration,
    pub total: Duration,
}

impl RetryPolicy {
    pub fn multicast(properties: &Properties) -> Self {
        Self::from_timeouts(
            &properties.multicast_timeouts(),
            properties.multicast_maximum_wait(),
        )
    }

    pub fn unicast(properties: &Properties) -> Self {
        Self::from_timeouts(
            &properties.unicast_timeouts(),
            properties.unicast_maximum_wait(),
        )
    }

    fn from_timeouts(timeouts: &[Duration], total: Duration) -> Self {
        let initial = timeouts
            .first()
            .copied()
            .unwrap_or(Duration::from_millis(500));
        let maximum = timeouts.iter().copied().max().unwrap_or(initial);
        Self {
            initial,
            maximum,
            total,
        }
    }

    fn next_interval(&self, interval: Duration) -> Duration {
        (interval * 2).min(self.maximum)
    }
}

/// What every request shares with its handle.
pub struct Session {
    pub transport: SharedTransport,
    pub language: String,
    pub xid: u16,
    pub mtu: usize,
    pub cancellation: CancellationToken,
}

impl Session {
    fn encode(&self, body: Body, flags: Flags) -> Result<Arc<[u8]>, SlpError> {
        let mut message = Message::new(self.xid, self.language.as_str(), body);
        message.header.flags = flags;
        let packet = message.encode()?;
        if packet.len() > self.mtu {
            log::debug!(
                "Request of {} bytes exceeds the MTU of {} bytes",
                packet.len(),
                self.mtu
            );
            return Err(SlpError::BufferOverflow);
        }
        Ok(packet[..].into())
    }

    /// Waits for the transport unless the request is cancelled first.
    ///
    /// Only closing the handle cancels a request before its first send, so
    /// that case is reported as `TypeError`.
    async fn lock_transport(
        &self,
    ) -> Result<OwnedMutexGuard<Box<dyn Transport + Send + Sync>>, SlpError> {
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => {
                log::debug!("XID {} cancelled before its first send", self.xid);
                Err(SlpError::TypeError)
            }
            transport = self.transport.clone().lock_owned() => Ok(transport),
        }
    }
}

/// A multicast request answered by any number of agents.
pub trait Discovery: Send + Sync + 'static {
    type Item: Send;

    fn request(&self, previous_responders: &str) -> Body;

    /// `None` when `body` is not the reply to this kind of request.
    fn reply(body: Body) -> Option<Result<Vec<Self::Item>, SlpError>>;
}

pub struct FindServices {
    pub service_type: String,
    pub scopes: String,
    pub predicate: String,
}

impl Discovery for FindServices {
    type Item = FoundService;

    fn request(&self, previous_responders: &str) -> Body {
        Body::ServiceRequest(ServiceRequest {
            previous_responders: previous_responders.into(),
            service_type: self.service_type.clone(),
            scopes: self.scopes.clone(),
            predicate: self.predicate.clone(),
            spi: String::default(),
        })
    }

    fn reply(body: Body) -> Option<Result<Vec<FoundService>, SlpError>> {
        let Body::ServiceReply(reply) = body else {
            return None;
        };
        Some(SlpError::from_wire(reply.error_code).map(|()| {
            reply
                .urls
                .into_iter()
                .map(|entry| FoundService {
                    url: entry.url,
                    lifetime: entry.lifetime,
                })
                .collect()
        }))
    }
}

pub struct FindServiceTypes {
    pub naming_authority: NamingAuthority,
    pub scopes: String,
}

impl Discovery for FindServiceTypes {
    type Item = String;

    fn request(&self, previous_responders: &str) -> Body {
        Body::ServiceTypeRequest(ServiceTypeRequest {
            previous_responders: previous_responders.into(),
            naming_authority: self.naming_authority.clone(),
            scopes: self.scopes.clone(),
        })
    }

    fn reply(body: Body) -> Option<Result<Vec<String>, SlpError>> {
        let Body::ServiceTypeReply(reply) = body else {
            return None;
        };
        Some(SlpError::from_wire(reply.error_code).map(|()| non_empty(reply.service_types)))
    }
}

pub struct FindAttributes {
    pub url: String,
    pub scopes: String,
    pub tags: String,
}

impl Discovery for FindAttributes {
    type Item = String;

    fn request(&self, previous_responders: &str) -> Body {
        Body::AttributeRequest(AttributeRequest {
            previous_responders: previous_responders.into(),
            url: self.url.clone(),
            scopes: self.scopes.clone(),
            tags: self.tags.clone(),
            spi: String::default(),
        })
    }

    fn reply(body: Body) -> Option<Result<Vec<String>, SlpError>> {
        let Body::AttributeReply(reply) = body else {
            return None;
        };
        Some(SlpError::from_wire(reply.error_code).map(|()| non_empty(reply.attributes)))
    }
}

fn non_empty(list: String) -> Vec<String> {
    if list.is_empty() {
        Vec::default()
    } else {
        vec![list]
    }
}

enum Convergence {
    Stopped,
    Exhausted,
}

pub struct DiscoveryEngine<D> {
    session: Session,
    discovery: D,
    target: Target,
    policy: RetryPolicy,
    state: State,
    deadline: Instant,
    responders: Vec<IpAddr>,
    fingerprints: HashSet<[u8; 32]>,
}

impl<D: Discovery> DiscoveryEngine<D> {
    /// Builds the request and sends it once.
    pub async fn start(
        session: Session,
        discovery: D,
        target: Target,
        policy: RetryPolicy,
    ) -> Result<Self, SlpError> {
        let mut engine = Self {
            session,
            discovery,
            target,
            policy,
            state: State::Building,
            deadline: Instant::now(),
            responders: Vec::default(),
            fingerprints: HashSet::default(),
        };
        let packet = engine.build()?;

        engine.transition(State::Sending);
        let transport = match engine.session.lock_transport().await {
            Ok(transport) => transport,
            Err(e) => {
                engine.transition(State::Cancelled);
                return Err(e);
            }
        };
        if let Err(e) = transport.send(engine.target, packet).await {
            engine.transition(State::Failed);
            return Err(network_error(e));
        }
        engine.deadline = Instant::now() + engine.policy.total;
        engine.transition(State::AwaitingResponses);
        Ok(engine)
    }

    /// Collects replies until the callback stops, the request times out or
    /// it is cancelled.
    pub async fn run<F>(mut self, mut callback: F)
    where
        F: FnMut(Result<Reply<D::Item>, SlpError>) -> Flow,
    {
        let token = self.session.cancellation.clone();
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            outcome = self.converge(&mut callback) => Some(outcome),
        };
        if token.is_cancelled() {
            self.transition(State::Cancelled);
            return;
        }
        match outcome {
            Some(Ok(Convergence::Stopped)) => self.transition(State::Completed),
            Some(Ok(Convergence::Exhausted)) => {
                callback(Ok(Reply::LastCall));
                self.transition(State::Completed);
            }
            Some(Err(e)) => {
                callback(Err(e));
                self.transition(State::Failed);
            }
            None => self.transition(State::Cancelled),
        }
    }

    async fn converge<F>(&mut self, callback: &mut F) -> Result<Convergence, SlpError>
    where
        F: FnMut(Result<Reply<D::Item>, SlpError>) -> Flow,
    {
        let mut interval = self.policy.initial;
        let mut retransmit = false;
        loop {
            let now = Instant::now();
            if now >= self.deadline {
                return Ok(Convergence::Exhausted);
            }
            let cycle_end = (now + interval).min(self.deadline);

            let transport = self.session.transport.clone().lock_owned().await;
            let packet = if retransmit {
                self.retransmission()
            } else {
                None
            };
            if let Some(packet) = packet {
                transport
                    .send(self.target, packet)
                    .await
                    .map_err(network_error)?;
            }
            while let Some(remaining) = cycle_end
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
            {
                let Some(datagram) = transport.receive(remaining).await.map_err(network_error)?
                else {
                    break;
                };
                if self.accept(datagram, callback) == Flow::Stop {
                    return Ok(Convergence::Stopped);
                }
            }
            drop(transport);

            retransmit = true;
            interval = self.policy.next_interval(interval);
        }
    }

    fn build(&self) -> Result<Arc<[u8]>, SlpError> {
        self.session
            .encode(self.discovery.request(&self.previous_responders()), self.flags())
    }

    /// The request carrying the current previous responders, unless it no
    /// longer fits the MTU.
    fn retransmission(&self) -> Option<Arc<[u8]>> {
        match self.build() {
            Ok(packet) => {
                log::debug!(
                    "Retransmitting XID {} with {} previous responders",
                    self.session.xid,
                    self.responders.len()
                );
                Some(packet)
            }
            Err(_) => {
                log::debug!(
                    "Previous responders of XID {} no longer fit, listening only",
                    self.session.xid
                );
                None
            }
        }
    }

    fn accept<F>(&mut self, datagram: Datagram, callback: &mut F) -> Flow
    where
        F: FnMut(Result<Reply<D::Item>, SlpError>) -> Flow,
    {
        let message = match Message::decode(&datagram.payload) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("Dropping datagram from {}: {}", datagram.source, e);
                return Flow::Continue;
            }
        };
        if message.header.xid != self.session.xid {
            log::debug!(
                "Dropping reply to XID {} from {}",
                message.header.xid,
                datagram.source
            );
            return Flow::Continue;
        }
        let function_id = message.function_id();
        let Some(reply) = D::reply(message.body) else {
            log::debug!(
                "Dropping unexpected {:?} from {}",
                function_id,
                datagram.source
            );
            return Flow::Continue;
        };
        if !self.fingerprints.insert(fingerprint(&datagram)) {
            log::debug!("Dropping duplicate reply from {}", datagram.source);
            return Flow::Continue;
        }
        let responder = datagram.source.ip();
        if !self.responders.contains(&responder) {
            self.responders.push(responder);
        }

        match reply {
            Err(e) => self.deliver(callback, Err(e)),
            Ok(items) => {
                for item in items {
                    if self.deliver(callback, Ok(Reply::Found(item))) == Flow::Stop {
                        return Flow::Stop;
                    }
                }
                Flow::Continue
            }
        }
    }

    fn deliver<F>(&self, callback: &mut F, result: Result<Reply<D::Item>, SlpError>) -> Flow
    where
        F: FnMut(Result<Reply<D::Item>, SlpError>) -> Flow,
    {
        if self.session.cancellation.is_cancelled() {
            return Flow::Stop;
        }
        callback(result)
    }

    fn previous_responders(&self) -> String {
        self.responders
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn flags(&self) -> Flags {
        match self.target {
            Target::Multicast | Target::Broadcast => Flags::REQUEST_MCAST,
            Target::Unicast(_) => Flags::default(),
        }
    }

    fn transition(&mut self, state: State) {
        log::trace!(
            "XID {}: {:?} -> {:?}",
            self.session.xid,
            self.state,
            state
        );
        self.state = state;
    }
}

/// A unicast request answered by a single acknowledgement.
pub struct AcknowledgedEngine {
    session: Session,
    destination: SocketAddr,
    packet: Arc<[u8]>,
    policy: RetryPolicy,
    state: State,
    deadline: Instant,
}

impl AcknowledgedEngine {
    pub async fn start(
        session: Session,
        body: Body,
        fresh: bool,
        destination: SocketAddr,
        policy: RetryPolicy,
    ) -> Result<Self, SlpError> {
        let flags = if fresh {
            Flags::FRESH
        } else {
            Flags::default()
        };
        let packet = session.encode(body, flags)?;
        let mut engine = Self {
            session,
            destination,
            packet,
            policy,
            state: State::Building,
            deadline: Instant::now(),
        };

        engine.transition(State::Sending);
        let transport = match engine.session.lock_transport().await {
            Ok(transport) => transport,
            Err(e) => {
                engine.transition(State::Cancelled);
                return Err(e);
            }
        };
        if let Err(e) = transport
            .send(Target::Unicast(destination), engine.packet.clone())
            .await
        {
            engine.transition(State::Failed);
            return Err(network_error(e));
        }
        engine.deadline = Instant::now() + engine.policy.total;
        engine.transition(State::AwaitingResponses);
        Ok(engine)
    }

    /// Delivers the acknowledgement, a failure, or nothing when cancelled.
    pub async fn run<F>(mut self, callback: F)
    where
        F: FnOnce(Result<(), SlpError>),
    {
        let token = self.session.cancellation.clone();
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            outcome = self.acknowledgement() => Some(outcome),
        };
        let Some(outcome) = outcome.filter(|_| !token.is_cancelled()) else {
            self.transition(State::Cancelled);
            return;
        };
        self.transition(if outcome.is_ok() {
            State::Completed
        } else {
            State::Failed
        });
        callback(outcome);
    }

    async fn acknowledgement(&mut self) -> Result<(), SlpError> {
        let mut interval = self.policy.initial;
        let mut retransmit = false;
        loop {
            let now = Instant::now();
            if now >= self.deadline {
                log::debug!(
                    "No acknowledgement of XID {} from {}",
                    self.session.xid,
                    self.destination
                );
                return Err(SlpError::NetworkTimedOut);
            }
            let cycle_end = (now + interval).min(self.deadline);

            let transport = self.session.transport.clone().lock_owned().await;
            if retransmit {
                log::debug!(
                    "Retransmitting XID {} to {}",
                    self.session.xid,
                    self.destination
                );
                transport
                    .send(Target::Unicast(self.destination), self.packet.clone())
                    .await
                    .map_err(network_error)?;
            }
            while let Some(remaining) = cycle_end
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
            {
                let Some(datagram) = transport.receive(remaining).await.map_err(network_error)?
                else {
                    break;
                };
                if datagram.source.ip() != self.destination.ip() {
                    log::debug!("Dropping datagram from stranger {}", datagram.source);
                    continue;
                }
                let message = Message::decode(&datagram.payload)?;
                if message.header.xid != self.session.xid {
                    log::debug!(
                        "Dropping reply to XID {} from {}",
                        message.header.xid,
                        datagram.source
                    );
                    continue;
                }
                return match message.body {
                    Body::ServiceAcknowledge(ack) => SlpError::from_wire(ack.error_code),
                    other => {
                        log::debug!(
                            "Expected an acknowledgement, got {:?}",
                            other.function_id()
                        );
                        Err(SlpError::ParseError)
                    }
                };
            }
            drop(transport);

            retransmit = true;
            interval = self.policy.next_interval(interval);
        }
    }

    fn transition(&mut self, state: State) {
        log::trace!(
            "XID {}: {:?} -> {:?}",
            self.session.xid,
            self.state,
            state
        );
        self.state = state;
    }
}

fn fingerprint(datagram: &Datagram) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(datagram.source.to_string().as_bytes());
    hasher.update(&datagram.payload);
    hasher.finalize().into()
}
