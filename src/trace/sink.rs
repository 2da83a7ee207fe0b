use crate::trace::phase::{PhaseRecord, TIMESTAMP_FORMAT};
use chrono::{DateTime, Utc};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tracing::Span;

/// Details about the connection a request was handed.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub reused: bool,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub tls_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WroteRequestInfo {
    pub bytes: u64,
}

/// Hooks fired as a request moves through its network phases.
///
/// Each hook receives the instant the phase was observed, so an
/// implementation never has to read the clock itself.
pub trait ClientTrace {
    fn dns_start(&mut self, at: DateTime<Utc>, host: &str);
    fn dns_done(&mut self, at: DateTime<Utc>, addrs: &[IpAddr], error: Option<&io::Error>);
    fn connect_start(&mut self, at: DateTime<Utc>, network: &str, addr: SocketAddr);
    fn connect_done(
        &mut self,
        at: DateTime<Utc>,
        network: &str,
        addr: SocketAddr,
        error: Option<&io::Error>,
    );
    fn got_conn(&mut self, at: DateTime<Utc>, info: &ConnInfo);
    fn wrote_headers(&mut self, at: DateTime<Utc>);
    fn wrote_request(&mut self, at: DateTime<Utc>, info: WroteRequestInfo);
    fn got_first_response_byte(&mut self, at: DateTime<Utc>);
}

/// Records every hook into a [`PhaseRecord`] and logs it.
///
/// A phase keeps the first value it sees; repeats are logged and dropped.
/// The one exception is the dial end: a successful connect replaces the
/// end of an earlier refused attempt.
#[derive(Debug)]
pub struct PhaseTracer {
    record: PhaseRecord,
    span: Span,
    dial_end_failed: bool,
}

impl PhaseTracer {
    pub fn new(span: Span) -> Self {
        Self {
            record: PhaseRecord::new(),
            span,
            dial_end_failed: false,
        }
    }

    pub fn record(&self) -> &PhaseRecord {
        &self.record
    }
}

fn stamp_once(
    slot: &mut Option<DateTime<Utc>>,
    at: DateTime<Utc>,
    phase: &'static str,
    span: &Span,
) -> bool {
    if let Some(previous) = slot {
        warn!(
            parent: span,
            previous = %previous.format(TIMESTAMP_FORMAT),
            ignored = %at.format(TIMESTAMP_FORMAT),
            "duplicate {phase} event"
        );
        return false;
    }
    *slot = Some(at);
    info!(parent: span, time = %at.format(TIMESTAMP_FORMAT), "{phase}");
    true
}

impl ClientTrace for PhaseTracer {
    fn dns_start(&mut self, at: DateTime<Utc>, host: &str) {
        if stamp_once(&mut self.record.dns.start, at, "dns start", &self.span) {
            self.record.dns.host = host.to_string();
        }
    }

    fn dns_done(&mut self, at: DateTime<Utc>, addrs: &[IpAddr], error: Option<&io::Error>) {
        if stamp_once(&mut self.record.dns.end, at, "dns end", &self.span) {
            self.record.dns.address = addrs.to_vec();
            self.record.dns.error = error.map(|e| e.to_string());
            match error {
                Some(e) => warn!(parent: &self.span, host = %self.record.dns.host, "dns error: {e}"),
                None => debug!(parent: &self.span, "resolved {:?}", addrs),
            }
        }
    }

    fn connect_start(&mut self, at: DateTime<Utc>, network: &str, addr: SocketAddr) {
        debug!(parent: &self.span, "dialing {network} {addr}");
        stamp_once(&mut self.record.dial.start, at, "dial start", &self.span);
    }

    fn connect_done(
        &mut self,
        at: DateTime<Utc>,
        network: &str,
        addr: SocketAddr,
        error: Option<&io::Error>,
    ) {
        match error {
            Some(e) => {
                debug!(parent: &self.span, "dial {network} {addr} failed: {e}");
                if stamp_once(&mut self.record.dial.end, at, "dial end", &self.span) {
                    self.dial_end_failed = true;
                }
            }
            None if self.dial_end_failed => {
                self.dial_end_failed = false;
                self.record.dial.end = Some(at);
                info!(parent: &self.span, time = %at.format(TIMESTAMP_FORMAT), "dial end");
            }
            None => {
                stamp_once(&mut self.record.dial.end, at, "dial end", &self.span);
            }
        }
    }

    fn got_conn(&mut self, at: DateTime<Utc>, info: &ConnInfo) {
        debug!(
            parent: &self.span,
            reused = info.reused,
            local_addr = %info.local_addr,
            remote_addr = %info.remote_addr,
            tls = info.tls_version.as_deref().unwrap_or("none"),
            "got connection"
        );
        stamp_once(&mut self.record.connection.time, at, "conn time", &self.span);
    }

    fn wrote_headers(&mut self, at: DateTime<Utc>) {
        stamp_once(
            &mut self.record.wrote_headers.time,
            at,
            "wrote all request headers",
            &self.span,
        );
    }

    fn wrote_request(&mut self, at: DateTime<Utc>, info: WroteRequestInfo) {
        if stamp_once(
            &mut self.record.wrote_request.time,
            at,
            "wrote all request",
            &self.span,
        ) {
            debug!(parent: &self.span, bytes = info.bytes, "request flushed");
        }
    }

    fn got_first_response_byte(&mut self, at: DateTime<Utc>) {
        stamp_once(
            &mut self.record.first_response_byte.time,
            at,
            "first received response byte",
            &self.span,
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    RequestBuilt,
    Tracing,
    Completed,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::RequestBuilt => "request built",
            RunState::Tracing => "tracing",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-run state threaded through request execution.
#[derive(Debug)]
pub struct TraceContext<T = PhaseTracer> {
    pub tracer: T,
    state: RunState,
}

impl<T: ClientTrace> TraceContext<T> {
    pub fn new(tracer: T) -> Self {
        Self {
            tracer,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub(crate) fn transition(&mut self, next: RunState) {
        debug!("trace state: {} -> {}", self.state, next);
        self.state = next;
    }
}

impl TraceContext<PhaseTracer> {
    /// A context whose tracer logs under a `tracing` span for `target`.
    pub fn for_target(target: &str) -> Self {
        Self::new(PhaseTracer::new(info_span!("tracing", target = %target)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn tracer() -> PhaseTracer {
        PhaseTracer::new(Span::none())
    }

    #[test]
    fn test_records_each_phase() {
        let base = Utc::now();
        let tick = |n: i64| base + TimeDelta::milliseconds(n);
        let addr: SocketAddr = "127.0.0.1:443".parse().unwrap();
        let mut t = tracer();

        t.dns_start(tick(0), "example.com");
        t.dns_done(tick(1), &[addr.ip()], None);
        t.connect_start(tick(2), "tcp", addr);
        t.connect_done(tick(3), "tcp", addr, None);
        t.got_conn(
            tick(4),
            &ConnInfo {
                reused: false,
                local_addr: "127.0.0.1:50000".parse().unwrap(),
                remote_addr: addr,
                tls_version: Some("TLSv1_3".to_string()),
            },
        );
        t.wrote_headers(tick(5));
        t.wrote_request(tick(6), WroteRequestInfo { bytes: 64 });
        t.got_first_response_byte(tick(7));

        let record = t.record();
        assert_eq!(record.dns.host, "example.com");
        assert_eq!(record.dns.address, vec![addr.ip()]);
        assert!(record.dns.error.is_none());
        assert_eq!(record.first_response_byte.time, Some(tick(7)));
        let timeline = record.timeline();
        assert_eq!(timeline.len(), 8);
        assert!(timeline.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn test_dns_error_recorded() {
        let mut t = tracer();
        let err = io::Error::new(io::ErrorKind::NotFound, "no such host");
        t.dns_start(Utc::now(), "nonexistent.invalid");
        t.dns_done(Utc::now(), &[], Some(&err));

        let record = t.record();
        assert_eq!(record.dns.error.as_deref(), Some("no such host"));
        assert!(record.dns.address.is_empty());
        assert!(record.dns.end.is_some());
        assert!(record.dial.start.is_none());
    }

    #[test]
    fn test_duplicate_events_keep_first() {
        let first = Utc::now();
        let second = first + TimeDelta::seconds(1);
        let mut t = tracer();

        t.dns_start(first, "a.example");
        t.dns_start(second, "b.example");
        t.wrote_headers(first);
        t.wrote_headers(second);
        t.got_first_response_byte(first);
        t.got_first_response_byte(second);

        let record = t.record();
        assert_eq!(record.dns.start, Some(first));
        assert_eq!(record.dns.host, "a.example");
        assert_eq!(record.wrote_headers.time, Some(first));
        assert_eq!(record.first_response_byte.time, Some(first));
    }

    #[test]
    fn test_failed_dial_still_stamped() {
        let mut t = tracer();
        let addr: SocketAddr = "[::1]:80".parse().unwrap();
        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        t.connect_start(Utc::now(), "tcp", addr);
        t.connect_done(Utc::now(), "tcp", addr, Some(&err));
        assert!(t.record().dial.start.is_some());
        assert!(t.record().dial.end.is_some());
    }

    #[test]
    fn test_successful_dial_replaces_refused_end() {
        let refused: SocketAddr = "[::1]:80".parse().unwrap();
        let accepted: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let base = Utc::now();
        let tick = |n: i64| base + TimeDelta::milliseconds(n);
        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        let mut t = tracer();

        t.connect_start(tick(0), "tcp", refused);
        t.connect_done(tick(1), "tcp", refused, Some(&err));
        t.connect_start(tick(2), "tcp", accepted);
        t.connect_done(tick(3), "tcp", accepted, None);

        let dial = &t.record().dial;
        assert_eq!(dial.start, Some(tick(0)));
        assert_eq!(dial.end, Some(tick(3)));
    }

    #[test]
    fn test_second_successful_dial_is_duplicate() {
        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let first = Utc::now();
        let mut t = tracer();

        t.connect_done(first, "tcp", addr, None);
        t.connect_done(first + TimeDelta::seconds(1), "tcp", addr, None);

        assert_eq!(t.record().dial.end, Some(first));
    }

    #[test]
    fn test_context_starts_idle() {
        let mut ctx = TraceContext::new(tracer());
        assert_eq!(ctx.state(), RunState::Idle);
        ctx.transition(RunState::RequestBuilt);
        assert_eq!(ctx.state(), RunState::RequestBuilt);
        assert_eq!(RunState::Completed.to_string(), "completed");
    }
}
