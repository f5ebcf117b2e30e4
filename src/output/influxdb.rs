//! InfluxDB line protocol output formatter.

use crate::location::DeviceLocation;
use crate::output::OutputFormatter;
use crate::sample::SignalSample;
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

/// Field values for InfluxDB line protocol
#[derive(Debug, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::Float(num) => write!(f, "{num}"),
            FieldValue::Integer(num) => write!(f, "{num}i"),
        }
    }
}

/// Data point in InfluxDB line protocol
#[derive(Debug)]
pub struct DataPoint {
    pub measurement: String,
    pub tag_set: BTreeMap<String, String>,
    pub field_set: BTreeMap<String, FieldValue>,
    pub timestamp: Option<SystemTime>,
}

/// Escape tag keys and values for line protocol.
///
/// Line breaks cannot be escaped, so they are written as spaces.
fn escape_tag(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        let c = if matches!(c, '\n' | '\r') { ' ' } else { c };
        if matches!(c, ',' | '=' | ' ' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn fmt_tags(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    for (key, value) in data_point.tag_set.iter() {
        write!(fmt, ",{}={}", escape_tag(key), escape_tag(value))?;
    }
    Ok(())
}

fn fmt_fields(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    for (i, (key, value)) in data_point.field_set.iter().enumerate() {
        if i > 0 {
            write!(fmt, ",")?;
        }
        write!(fmt, "{}={}", key, value)?;
    }
    Ok(())
}

fn fmt_timestamp(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    if let Some(time) = data_point.timestamp {
        let nanos = time
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        write!(fmt, " {}", nanos)?;
    }
    Ok(())
}

impl fmt::Display for DataPoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.measurement)?;
        fmt_tags(self, fmt)?;
        write!(fmt, " ")?;
        fmt_fields(self, fmt)?;
        fmt_timestamp(self, fmt)
    }
}

/// InfluxDB line protocol formatter.
///
/// Produces three measurements under a common prefix:
/// `<prefix>_location`, `<prefix>_peers` (one per snapshot) and
/// `<prefix>_peer` (one per visible peer).
pub struct InfluxDbFormatter {
    prefix: String,
}

impl InfluxDbFormatter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn location_point(&self, location: &DeviceLocation) -> DataPoint {
        let mut field_set = BTreeMap::new();
        field_set.insert("latitude".into(), FieldValue::Float(location.latitude));
        field_set.insert("longitude".into(), FieldValue::Float(location.longitude));
        field_set.insert("accuracy".into(), FieldValue::Float(location.accuracy));

        DataPoint {
            measurement: format!("{}_location", self.prefix),
            tag_set: BTreeMap::new(),
            field_set,
            timestamp: Some(location.timestamp),
        }
    }

    fn summary_point(&self, count: usize, published_at: SystemTime) -> DataPoint {
        let mut field_set = BTreeMap::new();
        field_set.insert("count".into(), FieldValue::Integer(count as i64));

        DataPoint {
            measurement: format!("{}_peers", self.prefix),
            tag_set: BTreeMap::new(),
            field_set,
            timestamp: Some(published_at),
        }
    }

    fn peer_point(&self, sample: &SignalSample) -> DataPoint {
        let mut tag_set = BTreeMap::new();
        tag_set.insert("identity".into(), sample.identity().to_string());
        // an empty tag value is not valid line protocol
        if let Some(name) = sample.display_name.as_ref().filter(|name| !name.is_empty()) {
            tag_set.insert("name".into(), name.clone());
        }

        let mut field_set = BTreeMap::new();
        field_set.insert("rssi".into(), FieldValue::Integer(i64::from(sample.rssi)));
        if let Some(tx_power) = sample.tx_power {
            field_set.insert("tx_power".into(), FieldValue::Integer(i64::from(tx_power)));
        }
        // distance-unknown peers simply have no distance field
        if let Ok(distance) = sample.distance() {
            field_set.insert("distance".into(), FieldValue::Float(distance));
        }

        DataPoint {
            measurement: format!("{}_peer", self.prefix),
            tag_set,
            field_set,
            timestamp: Some(sample.observed_at),
        }
    }
}

impl OutputFormatter for InfluxDbFormatter {
    fn format_location(&self, location: &DeviceLocation) -> String {
        self.location_point(location).to_string()
    }

    fn format_peers(&self, peers: &[SignalSample], published_at: SystemTime) -> Vec<String> {
        std::iter::once(self.summary_point(peers.len(), published_at))
            .chain(peers.iter().map(|p| self.peer_point(p)))
            .map(|point| point.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerIdentity;
    use crate::test_utils::{TEST_MAC, at};
    use std::time::Duration;

    fn formatter() -> InfluxDbFormatter {
        InfluxDbFormatter::new("proximity")
    }

    #[test]
    fn test_field_value_display() {
        assert_eq!(FieldValue::Float(1.5).to_string(), "1.5");
        assert_eq!(FieldValue::Integer(-60).to_string(), "-60i");
    }

    #[test]
    fn test_escape_tag() {
        assert_eq!(escape_tag("Living Room"), "Living\\ Room");
        assert_eq!(escape_tag("a,b=c"), "a\\,b\\=c");
        assert_eq!(escape_tag("plain"), "plain");
        assert_eq!(escape_tag("a\\b"), "a\\\\b");
        assert_eq!(escape_tag("two\r\nlines"), "two\\ \\ lines");
    }

    #[test]
    fn test_name_with_line_break_stays_on_one_line() {
        let sample = SignalSample::new(TEST_MAC, -60, at(1))
            .with_name("Tag\nproximity_location accuracy=0,latitude=0,longitude=0");

        let report = formatter().format_peers(&[sample], at(1)).join("\n");
        assert_eq!(report.lines().count(), 2);
        assert!(report.ends_with(
            ",name=Tag\\ proximity_location\\ accuracy\\=0\\,latitude\\=0\\,longitude\\=0 rssi=-60i 1000000000"
        ));
    }

    #[test]
    fn test_name_with_trailing_backslash_keeps_fields() {
        let sample = SignalSample::new(TEST_MAC, -60, at(1)).with_name("abc\\");
        let lines = formatter().format_peers(&[sample], at(1));
        assert_eq!(
            lines[1],
            "proximity_peer,identity=AA:BB:CC:DD:EE:FF,name=abc\\\\ rssi=-60i 1000000000"
        );
    }

    #[test]
    fn test_empty_name_is_omitted() {
        let sample = SignalSample::new(TEST_MAC, -60, at(1)).with_name("");
        let lines = formatter().format_peers(&[sample], at(1));
        assert_eq!(
            lines[1],
            "proximity_peer,identity=AA:BB:CC:DD:EE:FF rssi=-60i 1000000000"
        );
    }

    #[test]
    fn test_format_location() {
        let location = DeviceLocation::new(60.5, 24.25, 8.0, at(2));
        assert_eq!(
            formatter().format_location(&location),
            "proximity_location accuracy=8,latitude=60.5,longitude=24.25 2000000000"
        );
    }

    #[test]
    fn test_format_peer_with_distance() {
        let sample = SignalSample::new(TEST_MAC, -80, at(1))
            .with_name("Desk Tag")
            .with_tx_power(-59);

        let lines = formatter().format_peers(&[sample], at(3));
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "proximity_peers count=1i 3000000000");
        assert!(lines[1].starts_with(
            "proximity_peer,identity=AA:BB:CC:DD:EE:FF,name=Desk\\ Tag distance=4.04"
        ));
        assert!(lines[1].ends_with(",rssi=-80i,tx_power=-59i 1000000000"));
    }

    #[test]
    fn test_format_peer_without_tx_power_has_no_distance() {
        let sample = SignalSample::new(PeerIdentity::Name("beacon".into()), -70, at(1));
        let lines = formatter().format_peers(&[sample], at(1));
        assert_eq!(
            lines[1],
            "proximity_peer,identity=beacon rssi=-70i 1000000000"
        );
    }

    #[test]
    fn test_empty_snapshot_still_reports() {
        let published = SystemTime::UNIX_EPOCH + Duration::from_millis(5);
        assert_eq!(
            formatter().format_peers(&[], published),
            vec!["proximity_peers count=0i 5000000".to_string()]
        );
    }
}
