//! C3: record-set builder and the per-record/per-interface rate limiter.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::message::{RData, RecordType, ResourceRecord, CLASS_IN};
use crate::service::{encode_txt, Service};

/// Shared default TTL for PTR/SRV/TXT records (§3.2 table).
pub const TTL_SRV: u32 = 120;
pub const TTL_A: u32 = 4500;
pub const TTL_GOODBYE: u32 = 0;

const RATE_LIMIT_NORMAL: Duration = Duration::from_secs(1);
const RATE_LIMIT_PROBE_DEFENSE: Duration = Duration::from_millis(250);

/// Canonical `(name, type, class-no-flush-bit, rdata)` bytes identifying a
/// record for rate-limiting purposes (§3.4). Two records with the same
/// fingerprint are the same record for throttling purposes even if their
/// TTL or cache-flush bit differs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordFingerprint(Vec<u8>);

impl RecordFingerprint {
    pub fn of(rr: &ResourceRecord) -> RecordFingerprint {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(rr.name.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&rr.rtype.code().to_be_bytes());
        bytes.extend_from_slice(&CLASS_IN.to_be_bytes());
        match &rr.rdata {
            RData::A(octets) => bytes.extend_from_slice(octets),
            RData::Ptr(name) => bytes.extend_from_slice(name.as_bytes()),
            RData::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                bytes.extend_from_slice(&priority.to_be_bytes());
                bytes.extend_from_slice(&weight.to_be_bytes());
                bytes.extend_from_slice(&port.to_be_bytes());
                bytes.extend_from_slice(target.as_bytes());
            }
            RData::Txt(txt) => bytes.extend_from_slice(txt),
            RData::Other(raw) => bytes.extend_from_slice(raw),
        }
        RecordFingerprint(bytes)
    }

    /// Exposes the canonical bytes for sorting/comparison (§8.2 tiebreak).
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Builds the canonical four-record set for `(service, interfaceIPv4)`.
/// `ttl_a`/`ttl_service` let the caller's [`crate::config::ResponderOptions`]
/// override the defaults; `None` uses the §3.2 table.
pub fn build_record_set(
    service: &Service,
    interface_ipv4: Option<Ipv4Addr>,
    ttl_a: Option<u32>,
    ttl_service: Option<u32>,
) -> Vec<ResourceRecord> {
    let full_name = service.full_name();
    let ttl_service = ttl_service.unwrap_or(TTL_SRV);
    let ttl_a = ttl_a.unwrap_or(TTL_A);

    let a_octets = match interface_ipv4 {
        Some(addr) if !addr.is_loopback() && !addr.is_unspecified() => addr.octets(),
        _ => Ipv4Addr::UNSPECIFIED.octets(),
    };

    vec![
        ResourceRecord {
            name: service.service_type.clone(),
            rtype: RecordType::Ptr,
            class: CLASS_IN,
            cache_flush: false,
            ttl: ttl_service,
            rdata: RData::Ptr(full_name.clone()),
        },
        ResourceRecord {
            name: full_name.clone(),
            rtype: RecordType::Srv,
            class: CLASS_IN,
            cache_flush: true,
            ttl: ttl_service,
            rdata: RData::Srv {
                priority: 0,
                weight: 0,
                port: service.port,
                target: service.hostname.clone(),
            },
        },
        ResourceRecord {
            name: full_name,
            rtype: RecordType::Txt,
            class: CLASS_IN,
            cache_flush: true,
            ttl: ttl_service,
            rdata: RData::Txt(encode_txt(&service.txt)),
        },
        ResourceRecord {
            name: service.hostname.clone(),
            rtype: RecordType::A,
            class: CLASS_IN,
            cache_flush: true,
            ttl: ttl_a,
            rdata: RData::A(a_octets),
        },
    ]
}

/// Builds the Goodbye variant of a record set: the same records with
/// `ttl=0` (§3.2, §4.4 Goodbye).
pub fn goodbye_record_set(records: &[ResourceRecord]) -> Vec<ResourceRecord> {
    records
        .iter()
        .cloned()
        .map(|mut rr| {
            rr.ttl = TTL_GOODBYE;
            rr
        })
        .collect()
}

/// Entries older than this are long past mattering for either throttle
/// window and are swept opportunistically rather than kept forever (§3.4
/// "entries are created lazily and swept opportunistically").
const SWEEP_RETENTION: Duration = Duration::from_secs(300);
/// Sweep every this-many writes rather than on every one, so the check
/// doesn't cost every hot-path insert.
const SWEEP_EVERY: u32 = 128;

/// Tracks the last multicast time of every `(fingerprint, interface)` pair
/// (§3.4, §6.2). A dedicated, short-held lock — the hot path in C6.
#[derive(Default)]
pub struct RateLimiter {
    last_send: Mutex<HashMap<(RecordFingerprint, u32), Instant>>,
    writes_since_sweep: AtomicU32,
}

impl RateLimiter {
    pub fn new() -> RateLimiter {
        RateLimiter::default()
    }

    pub fn can_multicast(&self, fingerprint: &RecordFingerprint, iface: u32, now: Instant) -> bool {
        self.elapsed_since_last(fingerprint, iface, now)
            .map(|elapsed| elapsed >= RATE_LIMIT_NORMAL)
            .unwrap_or(true)
    }

    pub fn can_multicast_probe_defense(
        &self,
        fingerprint: &RecordFingerprint,
        iface: u32,
        now: Instant,
    ) -> bool {
        self.elapsed_since_last(fingerprint, iface, now)
            .map(|elapsed| elapsed >= RATE_LIMIT_PROBE_DEFENSE)
            .unwrap_or(true)
    }

    pub fn record_multicast(&self, fingerprint: RecordFingerprint, iface: u32, now: Instant) {
        let mut last_send = self.last_send.lock().unwrap();
        last_send.insert((fingerprint, iface), now);
        if self.writes_since_sweep.fetch_add(1, AtomicOrdering::Relaxed) + 1 >= SWEEP_EVERY {
            self.writes_since_sweep.store(0, AtomicOrdering::Relaxed);
            last_send.retain(|_, &mut last| now.saturating_duration_since(last) < SWEEP_RETENTION);
        }
    }

    fn elapsed_since_last(
        &self,
        fingerprint: &RecordFingerprint,
        iface: u32,
        now: Instant,
    ) -> Option<Duration> {
        self.last_send
            .lock()
            .unwrap()
            .get(&(fingerprint.clone(), iface))
            .map(|last| now.saturating_duration_since(*last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_service() -> Service {
        Service::new(
            "MyPrinter",
            "_http._tcp.local",
            Some("dev.local".into()),
            8080,
            vec![("version".into(), "1.0".into())],
        )
        .unwrap()
    }

    #[test]
    fn builds_the_canonical_four_records() {
        let svc = sample_service();
        let records = build_record_set(&svc, Some(Ipv4Addr::new(10, 0, 0, 5)), None, None);
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].rtype, RecordType::Ptr);
        assert_eq!(records[0].cache_flush, false);
        assert_eq!(records[1].rtype, RecordType::Srv);
        assert!(records[1].cache_flush);
        assert_eq!(records[3].rtype, RecordType::A);
        assert_eq!(records[3].rdata, RData::A([10, 0, 0, 5]));
        assert_eq!(records[3].ttl, TTL_A);
    }

    #[test]
    fn missing_interface_ip_substitutes_unspecified() {
        let svc = sample_service();
        let records = build_record_set(&svc, None, None, None);
        assert_eq!(records[3].rdata, RData::A([0, 0, 0, 0]));
    }

    #[test]
    fn goodbye_zeroes_every_ttl() {
        let svc = sample_service();
        let records = build_record_set(&svc, Some(Ipv4Addr::new(10, 0, 0, 5)), None, None);
        let goodbye = goodbye_record_set(&records);
        assert!(goodbye.iter().all(|rr| rr.ttl == 0));
    }

    #[test]
    fn rate_limit_is_per_record_and_per_interface() {
        let limiter = RateLimiter::new();
        let svc = sample_service();
        let records = build_record_set(&svc, Some(Ipv4Addr::new(10, 0, 0, 5)), None, None);
        let fp_ptr = RecordFingerprint::of(&records[0]);
        let fp_a = RecordFingerprint::of(&records[3]);

        let t0 = Instant::now();
        assert!(limiter.can_multicast(&fp_ptr, 2, t0));
        limiter.record_multicast(fp_ptr.clone(), 2, t0);
        assert!(!limiter.can_multicast(&fp_ptr, 2, t0 + Duration::from_millis(500)));
        // a different record on the same interface is unaffected.
        assert!(limiter.can_multicast(&fp_a, 2, t0 + Duration::from_millis(500)));
        // the same record on a different interface is unaffected.
        assert!(limiter.can_multicast(&fp_ptr, 3, t0 + Duration::from_millis(500)));
        assert!(limiter.can_multicast(&fp_ptr, 2, t0 + Duration::from_secs(1)));
    }

    #[test]
    fn probe_defense_window_is_shorter() {
        let limiter = RateLimiter::new();
        let svc = sample_service();
        let records = build_record_set(&svc, Some(Ipv4Addr::new(10, 0, 0, 5)), None, None);
        let fp = RecordFingerprint::of(&records[1]);
        let t0 = Instant::now();
        limiter.record_multicast(fp.clone(), 2, t0);
        assert!(!limiter.can_multicast_probe_defense(&fp, 2, t0 + Duration::from_millis(200)));
        assert!(limiter.can_multicast_probe_defense(&fp, 2, t0 + Duration::from_millis(250)));
    }

    #[test]
    fn stale_entries_are_swept_after_enough_writes() {
        let limiter = RateLimiter::new();
        let svc = sample_service();
        let records = build_record_set(&svc, Some(Ipv4Addr::new(10, 0, 0, 5)), None, None);
        let stale_fp = RecordFingerprint::of(&records[0]);
        let filler_fp = RecordFingerprint::of(&records[1]);

        let t0 = Instant::now();
        limiter.record_multicast(stale_fp.clone(), 2, t0);

        // enough later writes to trip the opportunistic sweep, all long
        // after SWEEP_RETENTION has passed for the first entry.
        let far_future = t0 + SWEEP_RETENTION + Duration::from_secs(1);
        for i in 0..SWEEP_EVERY {
            limiter.record_multicast(filler_fp.clone(), i, far_future);
        }

        // the stale entry is gone, so the record reads as never-sent again.
        assert!(limiter.can_multicast(&stale_fp, 2, far_future));
    }
}
