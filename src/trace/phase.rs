use chrono::{DateTime, Utc};
use serde::ser::Serializer;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Rendering used for every timestamp in the report.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f +0000 UTC";

const REPORT_INDENT: &[u8] = b"    ";

/// Unset timestamps render as an empty string.
fn serialize_stamp<S>(stamp: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match stamp {
        Some(at) => serializer.collect_str(&at.format(TIMESTAMP_FORMAT)),
        None => serializer.serialize_str(""),
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DnsPhase {
    #[serde(serialize_with = "serialize_stamp")]
    pub start: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_stamp")]
    pub end: Option<DateTime<Utc>>,
    pub host: String,
    pub address: Vec<IpAddr>,
    pub error: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DialPhase {
    #[serde(serialize_with = "serialize_stamp")]
    pub start: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_stamp")]
    pub end: Option<DateTime<Utc>>,
}

/// A phase that is marked by a single instant.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PointPhase {
    #[serde(serialize_with = "serialize_stamp")]
    pub time: Option<DateTime<Utc>>,
}

/// Timestamps and metadata for every observed phase of one request.
///
/// Field order is the report's key order.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PhaseRecord {
    pub dns: DnsPhase,
    pub dial: DialPhase,
    pub connection: PointPhase,
    #[serde(rename = "wrote_all_request_header")]
    pub wrote_headers: PointPhase,
    #[serde(rename = "wrote_all_request")]
    pub wrote_request: PointPhase,
    #[serde(rename = "first_received_response_byte")]
    pub first_response_byte: PointPhase,
}

impl PhaseRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes the record as an indented JSON report.
    pub fn to_report(&self) -> Result<String, serde_json::Error> {
        let mut buf = Vec::new();
        let mut ser =
            serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(REPORT_INDENT));
        self.serialize(&mut ser)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Timestamps in canonical phase order, skipping the ones never set.
    pub fn timeline(&self) -> Vec<(&'static str, DateTime<Utc>)> {
        [
            ("dns start", self.dns.start),
            ("dns end", self.dns.end),
            ("dial start", self.dial.start),
            ("dial end", self.dial.end),
            ("connection", self.connection.time),
            ("wrote all request headers", self.wrote_headers.time),
            ("wrote all request", self.wrote_request.time),
            ("first received response byte", self.first_response_byte.time),
        ]
        .into_iter()
        .filter_map(|(label, at)| at.map(|at| (label, at)))
        .collect()
    }

    pub fn breakdown(&self) -> Breakdown {
        let total_start = self.timeline().first().map(|(_, at)| *at);
        Breakdown {
            dns: span(self.dns.start, self.dns.end),
            tcp_connect: span(self.dial.start, self.dial.end),
            connection_setup: span(self.dial.end, self.connection.time),
            request_write: span(self.connection.time, self.wrote_request.time),
            server_wait: span(self.wrote_request.time, self.first_response_byte.time),
            total: span(total_start, self.first_response_byte.time),
        }
    }
}

fn span(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<Duration> {
    (end? - start?).to_std().ok()
}

/// Durations between consecutive phases of a record.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Breakdown {
    pub dns: Option<Duration>,
    pub tcp_connect: Option<Duration>,
    pub connection_setup: Option<Duration>,
    pub request_write: Option<Duration>,
    pub server_wait: Option<Duration>,
    pub total: Option<Duration>,
}

impl fmt::Display for Breakdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\nTime breakdown:")?;
        let rows = [
            ("DNS lookup", self.dns),
            ("TCP connect", self.tcp_connect),
            ("Connection setup", self.connection_setup),
            ("Request write", self.request_write),
            ("Server wait", self.server_wait),
            ("Total time", self.total),
        ];
        for (label, value) in rows {
            match value {
                Some(d) => writeln!(f, "  {:<18}{:>10.3} ms", format!("{label}:"), d.as_secs_f64() * 1000.0)?,
                None => writeln!(f, "  {:<18}       N/A", format!("{label}:"))?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDateTime, TimeZone};
    use serde_json::Value;

    const KEYS: [&str; 6] = [
        "dns",
        "dial",
        "connection",
        "wrote_all_request_header",
        "wrote_all_request",
        "first_received_response_byte",
    ];

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + millis)
            .single()
            .unwrap()
    }

    fn complete_record() -> PhaseRecord {
        let mut record = PhaseRecord::new();
        record.dns.start = Some(at(0));
        record.dns.host = "example.com".to_string();
        record.dns.address = vec!["93.184.216.34".parse().unwrap()];
        record.dns.end = Some(at(12));
        record.dial.start = Some(at(13));
        record.dial.end = Some(at(40));
        record.connection.time = Some(at(95));
        record.wrote_headers.time = Some(at(96));
        record.wrote_request.time = Some(at(97));
        record.first_response_byte.time = Some(at(180));
        record
    }

    #[test]
    fn test_empty_report_has_blank_fields() {
        let report = PhaseRecord::new().to_report().unwrap();
        let value: Value = serde_json::from_str(&report).unwrap();
        assert_eq!(value["dns"]["start"], "");
        assert_eq!(value["dns"]["host"], "");
        assert_eq!(value["dns"]["address"], Value::Array(vec![]));
        assert!(value["dns"]["error"].is_null());
        assert_eq!(value["first_received_response_byte"]["time"], "");
    }

    #[test]
    fn test_report_has_exactly_six_typed_keys() {
        let report = complete_record().to_report().unwrap();
        let value: Value = serde_json::from_str(&report).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 6);
        for key in KEYS {
            assert!(object.contains_key(key), "missing {key}");
        }

        let dns = &value["dns"];
        assert!(dns["start"].is_string());
        assert!(dns["end"].is_string());
        assert_eq!(dns["host"], "example.com");
        assert_eq!(dns["address"][0], "93.184.216.34");
        assert!(dns["error"].is_null());
        assert!(value["dial"]["start"].is_string());
        assert!(value["dial"]["end"].is_string());
        for key in &KEYS[2..] {
            assert!(value[*key]["time"].is_string());
        }
    }

    #[test]
    fn test_report_keeps_declared_order_and_indent() {
        let report = complete_record().to_report().unwrap();
        let positions: Vec<usize> = KEYS
            .iter()
            .map(|key| report.find(&format!("\n    \"{key}\": {{")).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(report.contains("\n        \"start\": \""));
    }

    #[test]
    fn test_timestamp_format_parses_back() {
        let report = complete_record().to_report().unwrap();
        let value: Value = serde_json::from_str(&report).unwrap();
        let raw = value["dial"]["end"].as_str().unwrap();
        assert!(raw.ends_with(" +0000 UTC"));
        let parsed =
            NaiveDateTime::parse_from_str(raw.trim_end_matches(" +0000 UTC"), "%Y-%m-%d %H:%M:%S%.f")
                .unwrap();
        assert_eq!(parsed.and_utc(), at(40));
    }

    #[test]
    fn test_dns_error_serialized() {
        let mut record = PhaseRecord::new();
        record.dns.error = Some("failed to lookup address information".to_string());
        let value: Value = serde_json::from_str(&record.to_report().unwrap()).unwrap();
        assert_eq!(
            value["dns"]["error"],
            "failed to lookup address information"
        );
    }

    #[test]
    fn test_timeline_skips_unset() {
        let mut record = complete_record();
        record.dns = DnsPhase::default();
        let labels: Vec<_> = record.timeline().into_iter().map(|(l, _)| l).collect();
        assert_eq!(labels.first(), Some(&"dial start"));
        assert_eq!(labels.len(), 6);
    }

    #[test]
    fn test_breakdown() {
        let breakdown = complete_record().breakdown();
        assert_eq!(breakdown.dns, Some(Duration::from_millis(12)));
        assert_eq!(breakdown.tcp_connect, Some(Duration::from_millis(27)));
        assert_eq!(breakdown.connection_setup, Some(Duration::from_millis(55)));
        assert_eq!(breakdown.request_write, Some(Duration::from_millis(2)));
        assert_eq!(breakdown.server_wait, Some(Duration::from_millis(83)));
        assert_eq!(breakdown.total, Some(Duration::from_millis(180)));

        let text = breakdown.to_string();
        assert!(text.contains("DNS lookup:"));
        assert!(text.contains("12.000 ms"));
    }

    #[test]
    fn test_breakdown_missing_phases() {
        let mut record = PhaseRecord::new();
        record.dial.start = Some(at(5));
        let breakdown = record.breakdown();
        assert_eq!(breakdown, Breakdown::default());
        assert!(breakdown.to_string().contains("N/A"));
    }
}
