//! C4: the per-service lifecycle state machine (§3.5, §4.4). One task per
//! registered service, driving Probing → Announcing → Established →
//! Goodbye, with conflict detection and rename during Probing.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::message::{Header, Message, Question, RecordType, ResourceRecord};
use crate::record::{build_record_set, goodbye_record_set, RecordFingerprint};
use crate::service::Service;
use crate::transport::Transport;

const PROBE_COUNT: u32 = 3;
const PROBE_INTERVAL: Duration = Duration::from_millis(250);
const PROBE_JITTER_MAX: Duration = Duration::from_millis(250);
const ANNOUNCE_COUNT: u32 = 2;
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);

/// Knobs that vary per [`crate::config::ResponderOptions`] or per test.
#[derive(Debug, Clone)]
pub struct StateMachineConfig {
    pub max_rename_attempts: u8,
    pub ttl_a: Option<u32>,
    pub ttl_service: Option<u32>,
    /// When true, skip the 0–250 ms jitter before the first probe (§9
    /// "Random probe delay" — fixed at zero for deterministic tests).
    pub deterministic_jitter: bool,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        StateMachineConfig {
            max_rename_attempts: 10,
            ttl_a: None,
            ttl_service: None,
            deterministic_jitter: false,
        }
    }
}

/// Broadcast events seen on the wire that are relevant to a probing
/// service. Published by the C6 receive loop, subscribed to by every
/// in-progress [`run`] invocation, and filtered by `full_name`.
#[derive(Debug, Clone)]
pub enum ProbeEvent {
    /// A record from a response (`QR=1`) seen on the wire. The prober
    /// decides for itself whether `record` conflicts with its own proposed
    /// authority — C6 has no visibility into what a still-probing service
    /// intends to claim, so the comparison can't happen at publish time.
    Answer { record: ResourceRecord },
    /// A simultaneous probe (`QR=0`, authority section populated) for
    /// `full_name` from another host.
    SimultaneousProbe {
        full_name: String,
        their_authority: Vec<ResourceRecord>,
    },
}

/// Fans probe-relevant events out to every probing service's task. A
/// broadcast channel, the same pattern as the shutdown fan-out in
/// [`crate::responder`].
pub struct ProbeBus {
    tx: broadcast::Sender<ProbeEvent>,
}

impl ProbeBus {
    pub fn new() -> ProbeBus {
        let (tx, _) = broadcast::channel(256);
        ProbeBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProbeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ProbeEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for ProbeBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A message sent to a running (Established) service task telling it to
/// wind down.
pub enum Control {
    /// Send Goodbye using `service`'s current (possibly TXT-updated)
    /// record set, then exit.
    Goodbye(Service),
    /// Exit immediately without sending Goodbye (§4.4 Cancellation).
    Cancel,
}

/// The result of running a service through its full lifecycle, reported
/// back as soon as it's known (not necessarily when the task exits — an
/// `Established` outcome is reported while the task keeps running to
/// await Goodbye).
#[derive(Debug, Clone)]
pub enum Outcome {
    Established { service: Service },
    ConflictExhausted { base_name: String, attempts: u8 },
    Canceled,
}

/// Handle to a running per-service task; held by the registry.
#[derive(Clone)]
pub struct ServiceTaskHandle {
    pub control: mpsc::Sender<Control>,
    pub cancel: CancellationToken,
}

/// Runs one service through Probing, Announcing, and Established, sending
/// `established_tx` as soon as it reaches Established (or fails). The task
/// continues running afterwards, waiting on `control` for a Goodbye or
/// Cancel instruction.
#[instrument(skip(transport, probe_bus, cancel, established_tx, control), fields(full_name = %service.full_name()))]
pub async fn run(
    mut service: Service,
    interface_ipv4: std::net::Ipv4Addr,
    transport: Arc<dyn Transport>,
    probe_bus: Arc<ProbeBus>,
    cancel: CancellationToken,
    established_tx: oneshot::Sender<Outcome>,
    mut control: mpsc::Receiver<Control>,
    config: StateMachineConfig,
) {
    let mut established_tx = Some(established_tx);
    let mut attempt: u8 = 0;

    loop {
        match probe(&service, interface_ipv4, &probe_bus, &transport, &cancel, &config).await {
            ProbeOutcome::Established => break,
            ProbeOutcome::Canceled => {
                if let Some(tx) = established_tx.take() {
                    let _ = tx.send(Outcome::Canceled);
                }
                return;
            }
            ProbeOutcome::Conflict => {
                attempt += 1;
                if attempt > config.max_rename_attempts {
                    if let Some(tx) = established_tx.take() {
                        let _ = tx.send(Outcome::ConflictExhausted {
                            base_name: service.instance_name.clone(),
                            attempts: config.max_rename_attempts,
                        });
                    }
                    return;
                }
                warn!(attempt, "name conflict during probing, renaming");
                // attempt counts conflicts from 1; the rename sequence itself
                // starts at "-2" (§3.1/§4.4: X -> X-2 -> X-3 ...).
                service = service.renamed(attempt + 1);
            }
        }
    }

    if announce(&service, interface_ipv4, &transport, &cancel, &config)
        .await
        .is_err()
    {
        if let Some(tx) = established_tx.take() {
            let _ = tx.send(Outcome::Canceled);
        }
        return;
    }

    debug!("service established");
    if let Some(tx) = established_tx.take() {
        let _ = tx.send(Outcome::Established {
            service: service.clone(),
        });
    }

    tokio::select! {
        _ = cancel.cancelled() => {}
        msg = control.recv() => {
            match msg {
                Some(Control::Goodbye(latest)) => {
                    send_goodbye(&latest, interface_ipv4, &transport, &config).await;
                }
                Some(Control::Cancel) | None => {}
            }
        }
    }
}

enum ProbeOutcome {
    Established,
    Conflict,
    Canceled,
}

async fn probe(
    service: &Service,
    interface_ipv4: std::net::Ipv4Addr,
    probe_bus: &ProbeBus,
    transport: &Arc<dyn Transport>,
    cancel: &CancellationToken,
    config: &StateMachineConfig,
) -> ProbeOutcome {
    let full_name = service.full_name();
    let mut events = probe_bus.subscribe();
    let our_authority =
        build_record_set(service, Some(interface_ipv4), config.ttl_a, config.ttl_service);

    let jitter = if config.deterministic_jitter {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::rng().random_range(0..=PROBE_JITTER_MAX.as_millis() as u64))
    };

    tokio::select! {
        _ = cancel.cancelled() => return ProbeOutcome::Canceled,
        _ = sleep(jitter) => {}
    }

    for i in 0..PROBE_COUNT {
        if send_probe(&full_name, &our_authority, transport).await.is_err() {
            warn!("failed to send probe query");
        }
        debug!(probe = i + 1, "probe sent");

        let deadline = sleep(PROBE_INTERVAL);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return ProbeOutcome::Canceled,
                _ = &mut deadline => break,
                event = events.recv() => {
                    match event {
                        Ok(ProbeEvent::Answer { record }) if record.name == full_name => {
                            let ours = our_authority
                                .iter()
                                .find(|rr| rr.name == record.name && rr.rtype == record.rtype);
                            if ours.is_some_and(|ours| ours.rdata != record.rdata) {
                                return ProbeOutcome::Conflict;
                            }
                        }
                        Ok(ProbeEvent::SimultaneousProbe { full_name: n, their_authority }) if n == full_name => {
                            if tiebreak(&our_authority, &their_authority) != std::cmp::Ordering::Greater {
                                return ProbeOutcome::Conflict;
                            }
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return ProbeOutcome::Canceled,
                    }
                }
            }
        }
    }

    ProbeOutcome::Established
}

async fn announce(
    service: &Service,
    interface_ipv4: std::net::Ipv4Addr,
    transport: &Arc<dyn Transport>,
    cancel: &CancellationToken,
    config: &StateMachineConfig,
) -> Result<(), ()> {
    let records = build_record_set(service, Some(interface_ipv4), config.ttl_a, config.ttl_service);
    for i in 0..ANNOUNCE_COUNT {
        if send_response(&records, transport).await.is_err() {
            warn!("failed to send announcement");
        }
        debug!(announcement = i + 1, "announcement sent");
        if i + 1 < ANNOUNCE_COUNT {
            tokio::select! {
                _ = cancel.cancelled() => return Err(()),
                _ = sleep(ANNOUNCE_INTERVAL) => {}
            }
        }
    }
    Ok(())
}

async fn send_goodbye(
    service: &Service,
    interface_ipv4: std::net::Ipv4Addr,
    transport: &Arc<dyn Transport>,
    config: &StateMachineConfig,
) {
    let records = build_record_set(service, Some(interface_ipv4), config.ttl_a, config.ttl_service);
    let goodbye = goodbye_record_set(&records);
    if send_response(&goodbye, transport).await.is_err() {
        warn!("failed to send goodbye");
    }
}

async fn send_probe(
    full_name: &str,
    authority: &[ResourceRecord],
    transport: &Arc<dyn Transport>,
) -> Result<(), ()> {
    let message = Message {
        header: Header::default(),
        questions: vec![Question {
            qname: full_name.to_string(),
            qtype: RecordType::Any,
            qu: false,
        }],
        answers: vec![],
        authorities: authority.to_vec(),
        additionals: vec![],
    };
    let bytes = message.serialize().map_err(|_| ())?;
    transport.send(&bytes, None).await.map_err(|_| ())
}

async fn send_response(records: &[ResourceRecord], transport: &Arc<dyn Transport>) -> Result<(), ()> {
    let message = Message {
        header: Header::response(),
        questions: vec![],
        answers: records.to_vec(),
        authorities: vec![],
        additionals: vec![],
    };
    let bytes = message.serialize().map_err(|_| ())?;
    transport.send(&bytes, None).await.map_err(|_| ())
}

/// §8.2 simultaneous-probe tiebreak: canonical-sort both authority sets
/// and compare lexicographically. `Ordering::Greater` means *we* win;
/// anything else (including `Equal`) is a conflict for us, per the Open
/// Question resolution in SPEC_FULL.md §9.
pub fn tiebreak(ours: &[ResourceRecord], theirs: &[ResourceRecord]) -> std::cmp::Ordering {
    let mut ours: Vec<Vec<u8>> = ours
        .iter()
        .map(|rr| RecordFingerprint::of(rr).into_bytes())
        .collect();
    ours.sort();
    let mut theirs: Vec<Vec<u8>> = theirs
        .iter()
        .map(|rr| RecordFingerprint::of(rr).into_bytes())
        .collect();
    theirs.sort();
    ours.cmp(&theirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use std::net::Ipv4Addr;
    use std::time::Duration as StdDuration;

    fn sample_service() -> Service {
        Service::new(
            "MyPrinter",
            "_http._tcp.local",
            Some("dev.local".into()),
            8080,
            vec![],
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn probes_three_times_then_announces_twice() {
        let service = sample_service();
        let mock = Arc::new(MockTransport::new());
        let transport: Arc<dyn Transport> = mock.clone();
        let probe_bus = Arc::new(ProbeBus::new());
        let cancel = CancellationToken::new();
        let (established_tx, established_rx) = oneshot::channel();
        let (_control_tx, control_rx) = mpsc::channel(1);

        let config = StateMachineConfig {
            deterministic_jitter: true,
            ..StateMachineConfig::default()
        };

        let handle = tokio::spawn(run(
            service.clone(),
            Ipv4Addr::new(10, 0, 0, 5),
            transport.clone(),
            probe_bus,
            cancel.clone(),
            established_tx,
            control_rx,
            config,
        ));

        tokio::time::advance(StdDuration::from_millis(250)).await;
        tokio::time::advance(StdDuration::from_millis(250)).await;
        tokio::time::advance(StdDuration::from_millis(250)).await;
        tokio::time::advance(StdDuration::from_secs(1)).await;

        let outcome = established_rx.await.unwrap();
        assert!(matches!(outcome, Outcome::Established { .. }));

        cancel.cancel();
        let _ = handle.await;

        let sent = mock.sent_packets();
        // 3 probes + 2 announcements.
        assert_eq!(sent.len(), 5);
    }

    #[test]
    fn tiebreak_is_antisymmetric_unless_equal() {
        let a = sample_service();
        let b = a.renamed(2);
        let set_a = build_record_set(&a, None, None, None);
        let set_b = build_record_set(&b, None, None, None);
        let ab = tiebreak(&set_a, &set_b);
        let ba = tiebreak(&set_b, &set_a);
        if ab != std::cmp::Ordering::Equal {
            assert_eq!(ab, ba.reverse());
        }
    }

    #[test]
    fn equal_authority_sets_are_not_greater() {
        let svc = sample_service();
        let set = build_record_set(&svc, None, None, None);
        assert_ne!(tiebreak(&set, &set), std::cmp::Ordering::Greater);
    }
}
