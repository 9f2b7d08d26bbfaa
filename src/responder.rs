//! C6: the query responder pipeline (§4.6), plus the public [`Responder`]
//! API that wires C4's per-service tasks, C5's registry, and the wire
//! codec together into the thing an embedder actually holds.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::config::ResponderOptions;
use crate::error::{Error, Result};
use crate::message::{Header, Message, PacketType, Question, RData, RecordType, ResourceRecord, CLASS_IN};
use crate::record::{build_record_set, RateLimiter, RecordFingerprint};
use crate::registry::RegistryHandle;
use crate::service::Service;
use crate::state_machine::{self, Control, Outcome, ProbeBus, ProbeEvent, ServiceTaskHandle};
use crate::transport::udp::UdpTransport;
use crate::transport::{InterfaceResolver, StaticInterfaceResolver, Transport};

/// §4.6's enumeration meta-query name (RFC 6763 §9).
pub const SERVICES_ENUM_NAME: &str = "_services._dns-sd._udp.local";

/// Builds a [`Responder`], letting tests substitute a [`Transport`] and
/// [`InterfaceResolver`] in place of the real UDP socket / interface table.
pub struct ResponderBuilder {
    options: ResponderOptions,
    transport: Option<Arc<dyn Transport>>,
    interfaces: Option<Arc<dyn InterfaceResolver>>,
}

impl ResponderBuilder {
    pub fn new() -> ResponderBuilder {
        ResponderBuilder {
            options: ResponderOptions::default(),
            transport: None,
            interfaces: None,
        }
    }

    pub fn with_options(mut self, options: ResponderOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_interfaces(mut self, interfaces: Arc<dyn InterfaceResolver>) -> Self {
        self.interfaces = Some(interfaces);
        self
    }

    pub fn build(self) -> Result<Responder> {
        let transport: Arc<dyn Transport> = match self.transport {
            Some(t) => t,
            None => Arc::new(UdpTransport::bind(self.options.bind_addr)?),
        };
        let interfaces: Arc<dyn InterfaceResolver> = self
            .interfaces
            .unwrap_or_else(|| Arc::new(StaticInterfaceResolver::new()));

        Ok(Responder::new(self.options, transport, interfaces))
    }
}

impl Default for ResponderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The running responder: owns the registry actor and the receive loop,
/// and is the handle an embedder calls `register`/`unregister`/`close` on.
pub struct Responder {
    options: ResponderOptions,
    transport: Arc<dyn Transport>,
    interfaces: Arc<dyn InterfaceResolver>,
    registry: RegistryHandle,
    probe_bus: Arc<ProbeBus>,
    rate_limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
    /// The registry actor and receive-loop tasks, aborted on `close()`.
    background_tasks: StdMutex<Vec<JoinHandle<()>>>,
    /// Per-service state-machine tasks. Joined (not aborted) on `close()`
    /// so each one finishes sending its Goodbye before the process
    /// considers shutdown complete.
    service_tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Responder {
    fn new(
        options: ResponderOptions,
        transport: Arc<dyn Transport>,
        interfaces: Arc<dyn InterfaceResolver>,
    ) -> Responder {
        let (registry, registry_rx) = RegistryHandle::new();
        let cancel = CancellationToken::new();
        let probe_bus = Arc::new(ProbeBus::new());
        let rate_limiter = Arc::new(RateLimiter::new());

        let registry_task = tokio::spawn(crate::registry::manager(registry_rx));

        let responder = Responder {
            options,
            transport,
            interfaces,
            registry,
            probe_bus,
            rate_limiter,
            cancel,
            background_tasks: StdMutex::new(vec![registry_task]),
            service_tasks: StdMutex::new(Vec::new()),
        };

        let receive_task = tokio::spawn(receive_loop(
            responder.transport.clone(),
            responder.interfaces.clone(),
            responder.registry.clone(),
            responder.probe_bus.clone(),
            responder.rate_limiter.clone(),
            responder.cancel.clone(),
            responder.options.ttl_a,
            responder.options.ttl_service,
        ));
        responder.background_tasks.lock().unwrap().push(receive_task);

        responder
    }

    /// Builds a `Responder` bound to the default UDP transport.
    pub fn builder() -> ResponderBuilder {
        ResponderBuilder::new()
    }

    /// Registers `service`, driving it through Probing and Announcing
    /// (§4.4) and blocking until it's Established. The returned [`Service`]
    /// may have a renamed `instance_name` if a conflict forced a rename.
    #[instrument(skip(self, service), fields(full_name = %service.full_name()))]
    pub async fn register(&self, service: Service) -> Result<Service> {
        let interface_ipv4 = self
            .interfaces
            .first_non_loopback()
            .unwrap_or(Ipv4Addr::UNSPECIFIED);

        let (control_tx, control_rx) = mpsc::channel(4);
        let (established_tx, established_rx) = oneshot::channel();
        // deliberately independent of `self.cancel` (which only gates the
        // receive loop): `close()` must be able to ask every service task
        // to send Goodbye over `control` before anything is canceled.
        let cancel = CancellationToken::new();

        let task = tokio::spawn(state_machine::run(
            service,
            interface_ipv4,
            self.transport.clone(),
            self.probe_bus.clone(),
            cancel.clone(),
            established_tx,
            control_rx,
            self.options.state_machine_config(),
        ));
        self.service_tasks.lock().unwrap().push(task);

        let handle = ServiceTaskHandle {
            control: control_tx,
            cancel,
        };

        match established_rx.await.map_err(|_| Error::Closed)? {
            Outcome::Established { service } => {
                if let Err(e) = self.registry.insert(service.full_name(), service.clone(), handle.clone()).await {
                    handle.cancel.cancel();
                    return Err(e);
                }
                debug!(full_name = %service.full_name(), "registered");
                Ok(service)
            }
            Outcome::ConflictExhausted { base_name, attempts } => {
                Err(Error::ConflictExhausted { base_name, attempts })
            }
            Outcome::Canceled => Err(Error::Canceled),
        }
    }

    /// Sends Goodbye for `full_name` and removes it from the registry
    /// (§4.4 Goodbye).
    pub async fn unregister(&self, full_name: &str) -> Result<()> {
        let entry = self.registry.remove(full_name.to_string()).await?;
        let _ = entry.handle.control.send(Control::Goodbye(entry.service)).await;
        Ok(())
    }

    /// Updates a registered service's TXT record without re-probing (§4.4
    /// "TXT-only churn"). The new TXT record is picked up the next time
    /// this service's records are served or a Goodbye is sent.
    pub async fn update_service(&self, full_name: &str, txt: Vec<(String, String)>) -> Result<Service> {
        self.registry.update_txt(full_name.to_string(), txt).await
    }

    pub async fn services(&self) -> Vec<String> {
        self.registry.list().await
    }

    pub async fn service_types(&self) -> Vec<String> {
        self.registry.list_service_types().await
    }

    /// Sends Goodbye for every registered service, then closes the
    /// transport. Idempotent only in the sense that a second call finds
    /// nothing left to say goodbye to.
    pub async fn close(&self) {
        let entries = self.registry.shutdown().await;
        for entry in &entries {
            let _ = entry
                .handle
                .control
                .send(Control::Goodbye(entry.service.clone()))
                .await;
        }

        let service_tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.service_tasks.lock().unwrap());
        for task in service_tasks {
            let _ = task.await;
        }

        self.cancel.cancel();
        let _ = self.transport.close().await;

        let background_tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.background_tasks.lock().unwrap());
        for task in background_tasks {
            task.abort();
        }
    }
}

/// The C6 receive loop: parses every inbound packet, routes responses to
/// the probe bus, and answers queries against the registry.
async fn receive_loop(
    transport: Arc<dyn Transport>,
    interfaces: Arc<dyn InterfaceResolver>,
    registry: RegistryHandle,
    probe_bus: Arc<ProbeBus>,
    rate_limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
    ttl_a: Option<u32>,
    ttl_service: Option<u32>,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = transport.recv() => received,
        };

        let (packet, src, if_index) = match received {
            Ok(r) => r,
            Err(_) => return,
        };

        let message = match Message::parse(&packet) {
            Ok(m) => m,
            Err(e) => {
                trace!(%e, "dropping unparsable packet");
                continue;
            }
        };

        match message.header.qr {
            PacketType::Answer => {
                route_response(&message, &probe_bus);
            }
            PacketType::Query => {
                route_probe_collisions(&message, &probe_bus);
                handle_query(
                    &message,
                    src,
                    if_index,
                    &transport,
                    &interfaces,
                    &registry,
                    &rate_limiter,
                    ttl_a,
                    ttl_service,
                )
                .await;
            }
        }
    }
}

/// Every answer/additional record in a response is fanned out as a
/// [`ProbeEvent::Answer`] — each probing task decides for itself whether
/// the record conflicts with its own proposed authority (§4.4).
fn route_response(message: &Message, probe_bus: &ProbeBus) {
    for record in message.answers.iter().chain(message.additionals.iter()) {
        probe_bus.publish(ProbeEvent::Answer {
            record: record.clone(),
        });
    }
}

/// A query carrying an authority section alongside an `ANY` question for
/// `fullName` is another host's probe for the same name (§8.2).
fn route_probe_collisions(message: &Message, probe_bus: &ProbeBus) {
    if message.authorities.is_empty() {
        return;
    }
    for question in &message.questions {
        if question.qtype == RecordType::Any {
            probe_bus.publish(ProbeEvent::SimultaneousProbe {
                full_name: question.qname.clone(),
                their_authority: message.authorities.clone(),
            });
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_query(
    message: &Message,
    src: SocketAddr,
    if_index: u32,
    transport: &Arc<dyn Transport>,
    interfaces: &Arc<dyn InterfaceResolver>,
    registry: &RegistryHandle,
    rate_limiter: &Arc<RateLimiter>,
    ttl_a: Option<u32>,
    ttl_service: Option<u32>,
) {
    let snapshot = registry.snapshot().await;
    let interface_ip = if if_index == 0 {
        interfaces.first_non_loopback()
    } else {
        interfaces.resolve(if_index)
    };

    // §4.6 step 4: an unknown interface, or one with no IPv4 at all, must
    // never leak another interface's address — the whole response is
    // skipped rather than falling back to a placeholder.
    let Some(interface_ip) = interface_ip else {
        debug!(if_index, "no IPv4 for this interface, dropping response");
        return;
    };
    let interface_ip = Some(interface_ip);

    let mut answers: Vec<ResourceRecord> = Vec::new();
    let mut additionals: Vec<ResourceRecord> = Vec::new();
    let mut unicast = false;

    for question in &message.questions {
        if question.qu {
            unicast = true;
        }

        if question.qname.eq_ignore_ascii_case(SERVICES_ENUM_NAME) && question.qtype == RecordType::Ptr {
            let mut types: Vec<String> = snapshot
                .iter()
                .map(|s| s.service_type.clone())
                .collect::<std::collections::HashSet<_>>()
                .into_iter()
                .collect();
            types.sort();
            for service_type in types {
                answers.push(ResourceRecord {
                    name: SERVICES_ENUM_NAME.to_string(),
                    rtype: RecordType::Ptr,
                    class: CLASS_IN,
                    cache_flush: false,
                    ttl: ttl_service.unwrap_or(crate::record::TTL_SRV),
                    rdata: RData::Ptr(service_type),
                });
            }
            continue;
        }

        for service in &snapshot {
            let full_name = service.full_name();
            let records = build_record_set(service, interface_ip, ttl_a, ttl_service);

            match question.qtype {
                RecordType::Ptr if question.qname.eq_ignore_ascii_case(&service.service_type) => {
                    push_by_type(&records, RecordType::Ptr, &mut answers);
                    push_by_type(&records, RecordType::Srv, &mut additionals);
                    push_by_type(&records, RecordType::Txt, &mut additionals);
                    push_by_type(&records, RecordType::A, &mut additionals);
                }
                RecordType::Srv if question.qname.eq_ignore_ascii_case(&full_name) => {
                    push_by_type(&records, RecordType::Srv, &mut answers);
                    push_by_type(&records, RecordType::Txt, &mut additionals);
                    push_by_type(&records, RecordType::A, &mut additionals);
                }
                RecordType::Txt if question.qname.eq_ignore_ascii_case(&full_name) => {
                    push_by_type(&records, RecordType::Txt, &mut answers);
                }
                RecordType::Any if question.qname.eq_ignore_ascii_case(&full_name) => {
                    push_by_type(&records, RecordType::Srv, &mut answers);
                    push_by_type(&records, RecordType::Txt, &mut answers);
                    push_by_type(&records, RecordType::A, &mut additionals);
                }
                RecordType::A if question.qname.eq_ignore_ascii_case(&service.hostname) => {
                    push_by_type(&records, RecordType::A, &mut answers);
                }
                _ => {}
            }
        }
    }

    if answers.is_empty() {
        return;
    }

    // known-answer suppression (§7.1): drop any candidate the querier
    // already holds with at least half its TTL remaining.
    answers.retain(|rr| !is_known(rr, &message.answers));
    additionals.retain(|rr| !is_known(rr, &message.answers));
    dedup(&mut answers);
    dedup(&mut additionals);

    if answers.is_empty() {
        return;
    }

    let dest = if unicast { Some(src) } else { None };

    if dest.is_none() {
        let now = Instant::now();
        let permitted = answers
            .iter()
            .chain(additionals.iter())
            .all(|rr| rate_limiter.can_multicast(&RecordFingerprint::of(rr), if_index, now));
        if !permitted {
            trace!("dropping response: a record is within its rate-limit window");
            return;
        }
        for rr in answers.iter().chain(additionals.iter()) {
            rate_limiter.record_multicast(RecordFingerprint::of(rr), if_index, now);
        }
    }

    let response = Message {
        header: Header::response(),
        questions: vec![],
        answers,
        authorities: vec![],
        additionals,
    };

    match response.serialize() {
        Ok(bytes) => {
            if let Err(e) = transport.send(&bytes, dest).await {
                warn!(%e, "failed to send response");
            }
        }
        Err(e) => warn!(%e, "failed to serialize response"),
    }
}

fn push_by_type(records: &[ResourceRecord], rtype: RecordType, out: &mut Vec<ResourceRecord>) {
    if let Some(rr) = records.iter().find(|rr| rr.rtype == rtype) {
        out.push(rr.clone());
    }
}

/// §7.1: a candidate is suppressed if the querier's known-answer list
/// already carries the same `(name, type, class, rdata)` with TTL at
/// least half the candidate's.
fn is_known(candidate: &ResourceRecord, known: &[ResourceRecord]) -> bool {
    known.iter().any(|ka| {
        ka.name.eq_ignore_ascii_case(&candidate.name)
            && ka.rtype == candidate.rtype
            && ka.rdata == candidate.rdata
            && u64::from(ka.ttl) * 2 >= u64::from(candidate.ttl)
    })
}

/// Keyed on the full record fingerprint, not just `(name, rtype)` — two
/// instances of the same service type produce distinct PTR rdata and must
/// both survive (§4.6 step 3).
fn dedup(records: &mut Vec<ResourceRecord>) {
    let mut seen: HashSet<RecordFingerprint> = HashSet::new();
    records.retain(|rr| seen.insert(RecordFingerprint::of(rr)));
}
