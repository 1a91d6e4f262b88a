//! Sensor wire protocol codec.
//!
//! Implements the newline-delimited ASCII protocol spoken by the device:
//! - Inbound: `DATA <temperature> <humidity>` raw readings
//! - Inbound: `STATS <temp_avg> <temp_max> <temp_min> <hum_avg> <hum_max> <hum_min>`
//!   windowed statistics
//! - Outbound: operator commands (START, STOP, MODE1, MODE2, SET_FREQ,
//!   SET_WINDOW), one per line

use chrono::{DateTime, Local};

/// Device-computed summary over its own sampling window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateStats {
    pub temp_avg: f64,
    pub temp_max: f64,
    pub temp_min: f64,
    pub hum_avg: f64,
    pub hum_max: f64,
    pub hum_min: f64,
}

/// Payload of a decoded message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Measurement {
    /// A single instantaneous temperature/humidity pair.
    Raw { temperature: f64, humidity: f64 },

    /// Avg/max/min computed by the device over its sampling window.
    Aggregate(AggregateStats),
}

impl Measurement {
    /// Mode tag persisted with each stored record.
    pub fn mode(&self) -> &'static str {
        match self {
            Measurement::Raw { .. } => "RAW",
            Measurement::Aggregate(_) => "AGGREGATE",
        }
    }
}

/// A decoded reading, stamped with the server's receive time.
///
/// The device is not assumed to have a synchronized clock, so the timestamp
/// is assigned here at decode time rather than taken from the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub timestamp: DateTime<Local>,
    pub measurement: Measurement,
}

/// Protocol decoding errors.
///
/// Every variant is recovered locally: the offending line is logged and
/// dropped, and the connection keeps reading.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// DATA line without exactly two numeric fields.
    MalformedData(String),
    /// STATS line without exactly six numeric fields.
    MalformedStats(String),
    /// Leading token is not a known message type.
    UnknownMessageType(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::MalformedData(line) => write!(f, "Malformed DATA line: {}", line),
            DecodeError::MalformedStats(line) => write!(f, "Malformed STATS line: {}", line),
            DecodeError::UnknownMessageType(tag) => write!(f, "Unknown message type: {}", tag),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode one line received from the device.
///
/// Returns `Ok(None)` for a line that is empty after trimming surrounding
/// whitespace; such lines are skipped without error. The leading token is
/// matched case-sensitively.
pub fn decode(line: &str) -> Result<Option<Reading>, DecodeError> {
    decode_at(line, Local::now())
}

/// Decode with an explicit timestamp, so tests can pin the clock.
pub fn decode_at(line: &str, timestamp: DateTime<Local>) -> Result<Option<Reading>, DecodeError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let parts: Vec<&str> = line.split_whitespace().collect();

    let measurement = match parts[0] {
        "DATA" => parse_data(&parts, line)?,
        "STATS" => parse_stats(&parts, line)?,
        tag => return Err(DecodeError::UnknownMessageType(tag.to_string())),
    };

    Ok(Some(Reading {
        timestamp,
        measurement,
    }))
}

/// Parse a DATA line: exactly two float fields after the tag.
fn parse_data(parts: &[&str], line: &str) -> Result<Measurement, DecodeError> {
    if parts.len() != 3 {
        return Err(DecodeError::MalformedData(line.to_string()));
    }

    let temperature =
        parse_float(parts[1]).ok_or_else(|| DecodeError::MalformedData(line.to_string()))?;
    let humidity =
        parse_float(parts[2]).ok_or_else(|| DecodeError::MalformedData(line.to_string()))?;

    Ok(Measurement::Raw {
        temperature,
        humidity,
    })
}

/// Parse a STATS line: exactly six float fields after the tag, in the order
/// temp_avg, temp_max, temp_min, hum_avg, hum_max, hum_min.
fn parse_stats(parts: &[&str], line: &str) -> Result<Measurement, DecodeError> {
    if parts.len() != 7 {
        return Err(DecodeError::MalformedStats(line.to_string()));
    }

    let mut fields = [0.0f64; 6];
    for (slot, token) in fields.iter_mut().zip(&parts[1..]) {
        *slot = parse_float(token).ok_or_else(|| DecodeError::MalformedStats(line.to_string()))?;
    }

    Ok(Measurement::Aggregate(AggregateStats {
        temp_avg: fields[0],
        temp_max: fields[1],
        temp_min: fields[2],
        hum_avg: fields[3],
        hum_max: fields[4],
        hum_min: fields[5],
    }))
}

fn parse_float(token: &str) -> Option<f64> {
    token.parse().ok()
}

/// Operator commands sent back to the device.
///
/// No acknowledgment is expected; the device interprets the semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Begin sampling and reporting.
    Start,
    /// Halt reporting.
    Stop,
    /// Report raw readings (DATA lines).
    Mode1,
    /// Report windowed statistics (STATS lines).
    Mode2,
    /// Set the sampling period in milliseconds.
    SetFreq(u64),
    /// Set the statistics window in milliseconds.
    SetWindow(u64),
}

impl Command {
    /// Encode as a newline-terminated wire line.
    pub fn to_line(&self) -> String {
        match self {
            Command::Start => encode_line("START", &[]),
            Command::Stop => encode_line("STOP", &[]),
            Command::Mode1 => encode_line("MODE1", &[]),
            Command::Mode2 => encode_line("MODE2", &[]),
            Command::SetFreq(ms) => encode_line("SET_FREQ", &[ms.to_string()]),
            Command::SetWindow(ms) => encode_line("SET_WINDOW", &[ms.to_string()]),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_line().trim_end())
    }
}

/// Join a tag and its arguments with single spaces and terminate with `\n`.
fn encode_line(tag: &str, args: &[String]) -> String {
    let mut line = String::from(tag);
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_now(line: &str) -> Result<Option<Reading>, DecodeError> {
        decode_at(line, Local::now())
    }

    #[test]
    fn test_decode_data() {
        let reading = decode_now("DATA 21.5 60.2").unwrap().unwrap();
        match reading.measurement {
            Measurement::Raw {
                temperature,
                humidity,
            } => {
                assert_eq!(temperature, 21.5);
                assert_eq!(humidity, 60.2);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(reading.measurement.mode(), "RAW");
    }

    #[test]
    fn test_decode_data_wrong_arity() {
        let err = decode_now("DATA 21.5").unwrap_err();
        assert!(matches!(err, DecodeError::MalformedData(_)));

        let err = decode_now("DATA 21.5 60.2 99.9").unwrap_err();
        assert!(matches!(err, DecodeError::MalformedData(_)));
    }

    #[test]
    fn test_decode_data_non_numeric() {
        let err = decode_now("DATA warm humid").unwrap_err();
        assert!(matches!(err, DecodeError::MalformedData(_)));
    }

    #[test]
    fn test_decode_stats() {
        let reading = decode_now("STATS 21.0 23.5 19.2 55.0 60.0 50.0")
            .unwrap()
            .unwrap();
        match reading.measurement {
            Measurement::Aggregate(stats) => {
                assert_eq!(stats.temp_avg, 21.0);
                assert_eq!(stats.temp_max, 23.5);
                assert_eq!(stats.temp_min, 19.2);
                assert_eq!(stats.hum_avg, 55.0);
                assert_eq!(stats.hum_max, 60.0);
                assert_eq!(stats.hum_min, 50.0);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(reading.measurement.mode(), "AGGREGATE");
    }

    #[test]
    fn test_decode_stats_wrong_arity() {
        let err = decode_now("STATS 21.0 23.5 19.2 55.0 60.0").unwrap_err();
        assert!(matches!(err, DecodeError::MalformedStats(_)));

        let err = decode_now("STATS 1 2 3 4 5 6 7").unwrap_err();
        assert!(matches!(err, DecodeError::MalformedStats(_)));
    }

    #[test]
    fn test_decode_stats_non_numeric() {
        let err = decode_now("STATS 21.0 23.5 19.2 55.0 60.0 x").unwrap_err();
        assert!(matches!(err, DecodeError::MalformedStats(_)));
    }

    #[test]
    fn test_decode_unknown_tag() {
        let err = decode_now("FOO bar").unwrap_err();
        assert_eq!(err, DecodeError::UnknownMessageType("FOO".to_string()));
    }

    #[test]
    fn test_tag_is_case_sensitive() {
        let err = decode_now("data 21.5 60.2").unwrap_err();
        assert!(matches!(err, DecodeError::UnknownMessageType(_)));
    }

    #[test]
    fn test_decode_blank_line() {
        assert_eq!(decode_now("").unwrap(), None);
        assert_eq!(decode_now("   \t ").unwrap(), None);
    }

    #[test]
    fn test_decode_trims_surrounding_whitespace() {
        let reading = decode_now("  DATA 1.0 2.0 \r").unwrap().unwrap();
        assert!(matches!(reading.measurement, Measurement::Raw { .. }));
    }

    #[test]
    fn test_decode_stamps_given_time() {
        let stamp = Local::now();
        let reading = decode_at("DATA 1.0 2.0", stamp).unwrap().unwrap();
        assert_eq!(reading.timestamp, stamp);
    }

    #[test]
    fn test_command_encoding() {
        assert_eq!(Command::Start.to_line(), "START\n");
        assert_eq!(Command::Stop.to_line(), "STOP\n");
        assert_eq!(Command::Mode1.to_line(), "MODE1\n");
        assert_eq!(Command::Mode2.to_line(), "MODE2\n");
        assert_eq!(Command::SetFreq(1000).to_line(), "SET_FREQ 1000\n");
        assert_eq!(Command::SetWindow(5000).to_line(), "SET_WINDOW 5000\n");
    }
}
