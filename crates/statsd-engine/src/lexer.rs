// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte-level parser for the statsd wire format.
//!
//! Metrics:
//!
//! ```text
//! <name>:<value>|<type>[|@<sample rate>][|#<tag>,<tag>,...]
//! ```
//!
//! where `<type>` is one of `c` (counter), `g` (gauge), `ms` or `h` (timer)
//! and `s` (set). Events use the extended form:
//!
//! ```text
//! _e{<title length>,<text length>}:<title>|<text>[|d:<epoch>][|h:<host>][|k:<key>][|p:low][|s:<source>][|t:<alert>][|#<tags>]
//! ```
//!
//! The parser scans each line once, left to right, without backtracking.

use crate::errors::ParseError;
use crate::metric::{AlertType, Event, Metric, MetricType, Priority, Tags};
use ustr::Ustr;

const EVENT_PREFIX: &[u8] = b"_e{";

/// Result of parsing one line: exactly one of a metric or an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    Metric(Metric),
    Event(Event),
}

/// Parses one line (without its trailing newline). When `namespace` is set it
/// is prepended to metric names with a `.` separator.
pub fn parse_line(line: &[u8], namespace: Option<&str>) -> Result<Parsed, ParseError> {
    if line.starts_with(EVENT_PREFIX) {
        lex_event(line).map(Parsed::Event)
    } else {
        lex_metric(line, namespace).map(Parsed::Metric)
    }
}

#[derive(Clone, Copy)]
enum State {
    Key,
    Value,
    Type,
    Segment,
}

fn lex_metric(input: &[u8], namespace: Option<&str>) -> Result<Metric, ParseError> {
    let mut name = String::with_capacity(input.len() + namespace.map_or(0, |ns| ns.len() + 1));
    if let Some(ns) = namespace {
        name.push_str(ns);
        name.push('.');
    }
    let name_offset = name.len();

    let mut state = State::Key;
    let mut pos = 0;
    let mut value: &[u8] = &[];
    let mut metric_type = MetricType::Counter;
    let mut sample_rate: Option<f64> = None;
    let mut tags = Tags::new();

    loop {
        match state {
            State::Key => match input.get(pos) {
                None => return Err(ParseError::MissingKeySeparator),
                Some(&b':') => {
                    if name.len() == name_offset {
                        return Err(ParseError::EmptyKey);
                    }
                    pos += 1;
                    state = State::Value;
                }
                Some(&b) => {
                    push_sanitized(&mut name, b);
                    pos += 1;
                }
            },
            State::Value => {
                let start = pos;
                pos = scan_to(input, pos, b'|');
                if pos == input.len() {
                    return Err(ParseError::MissingValueSeparator);
                }
                value = &input[start..pos];
                pos += 1;
                state = State::Type;
            }
            State::Type => {
                let start = pos;
                pos = scan_to(input, pos, b'|');
                metric_type = match &input[start..pos] {
                    b"c" => MetricType::Counter,
                    b"g" => MetricType::Gauge,
                    b"ms" | b"h" => MetricType::Timer,
                    b"s" => MetricType::Set,
                    other => {
                        return Err(ParseError::UnknownType(
                            String::from_utf8_lossy(other).into_owned(),
                        ))
                    }
                };
                state = State::Segment;
            }
            State::Segment => {
                // input[pos] is either the end of the line or a '|'
                if pos >= input.len() {
                    break;
                }
                let start = pos + 1;
                pos = scan_to(input, start, b'|');
                let segment = &input[start..pos];
                match segment.split_first() {
                    Some((&b'@', rate)) => sample_rate = Some(lex_sample_rate(rate)?),
                    Some((&b'#', section)) => tags = lex_tags(section)?,
                    _ => {
                        return Err(ParseError::InvalidSegment(
                            String::from_utf8_lossy(segment).into_owned(),
                        ))
                    }
                }
            }
        }
    }

    let name = Ustr::from(name.as_str());
    let value = std::str::from_utf8(value).map_err(|_| ParseError::InvalidUtf8("value"))?;
    if value.is_empty() {
        return Err(ParseError::InvalidValue(String::new()));
    }

    if metric_type == MetricType::Set {
        return Ok(Metric::new_set(name, value.to_string(), tags));
    }

    let mut parsed: f64 = value
        .parse()
        .map_err(|_| ParseError::InvalidValue(value.to_string()))?;
    if parsed.is_nan() {
        return Err(ParseError::NanValue);
    }
    if let (MetricType::Counter, Some(rate)) = (metric_type, sample_rate) {
        parsed /= rate;
    }
    Ok(Metric::new(name, metric_type, parsed, tags))
}

/// `/` becomes `-`, whitespace becomes `_`, other bytes outside
/// `[A-Za-z0-9._-]` are dropped.
#[inline]
fn push_sanitized(name: &mut String, b: u8) {
    match b {
        b'/' => name.push('-'),
        b if b.is_ascii_whitespace() => name.push('_'),
        b if b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_' => {
            name.push(char::from(b));
        }
        _ => {}
    }
}

/// Index of the next `needle` at or after `from`, or `input.len()`.
#[inline]
fn scan_to(input: &[u8], from: usize, needle: u8) -> usize {
    input[from.min(input.len())..]
        .iter()
        .position(|&b| b == needle)
        .map_or(input.len(), |i| from + i)
}

fn lex_sample_rate(raw: &[u8]) -> Result<f64, ParseError> {
    let invalid = || ParseError::InvalidSampleRate(String::from_utf8_lossy(raw).into_owned());
    let rate: f64 = std::str::from_utf8(raw)
        .map_err(|_| invalid())?
        .parse()
        .map_err(|_| invalid())?;
    if !rate.is_finite() || rate <= 0.0 {
        return Err(invalid());
    }
    Ok(rate)
}

fn lex_tags(section: &[u8]) -> Result<Tags, ParseError> {
    let section = std::str::from_utf8(section).map_err(|_| ParseError::InvalidUtf8("tags"))?;
    Ok(section
        .split(',')
        .filter(|tag| !tag.is_empty())
        .collect())
}

fn lex_event(input: &[u8]) -> Result<Event, ParseError> {
    let mut pos = EVENT_PREFIX.len();
    let title_len = lex_length(input, &mut pos, b',')?;
    let text_len = lex_length(input, &mut pos, b'}')?;

    if input.get(pos) != Some(&b':') {
        return Err(ParseError::MalformedEvent("missing ':' after lengths"));
    }
    pos += 1;

    let remaining = input.len() - pos;
    let needed = title_len
        .checked_add(text_len)
        .and_then(|n| n.checked_add(1))
        .ok_or_else(|| ParseError::InvalidEventLength("length overflow".to_string()))?;
    if needed > remaining {
        return Err(ParseError::InvalidEventLength(format!(
            "title and text need {needed} bytes, {remaining} left"
        )));
    }
    if title_len == 0 {
        return Err(ParseError::MalformedEvent("empty title"));
    }

    let title = std::str::from_utf8(&input[pos..pos + title_len])
        .map_err(|_| ParseError::InvalidUtf8("event title"))?;
    pos += title_len;
    if input[pos] != b'|' {
        return Err(ParseError::MalformedEvent("missing '|' after title"));
    }
    pos += 1;
    let text = std::str::from_utf8(&input[pos..pos + text_len])
        .map_err(|_| ParseError::InvalidUtf8("event text"))?;
    pos += text_len;

    let mut event = Event {
        title: title.to_string(),
        text: text.replace("\\n", "\n"),
        ..Event::default()
    };

    while pos < input.len() {
        if input[pos] != b'|' {
            return Err(ParseError::MalformedEvent("unexpected data after text"));
        }
        let start = pos + 1;
        pos = scan_to(input, start, b'|');
        lex_event_attribute(&input[start..pos], &mut event)?;
    }

    Ok(event)
}

/// Reads ASCII digits up to `terminator`, leaving `pos` just past it.
fn lex_length(input: &[u8], pos: &mut usize, terminator: u8) -> Result<usize, ParseError> {
    let start = *pos;
    let mut length: usize = 0;
    loop {
        match input.get(*pos) {
            None => return Err(ParseError::MalformedEvent("unterminated length field")),
            Some(&b) if b == terminator => break,
            Some(&b) if b.is_ascii_digit() => {
                length = length
                    .checked_mul(10)
                    .and_then(|l| l.checked_add(usize::from(b - b'0')))
                    .ok_or_else(|| ParseError::InvalidEventLength("length overflow".to_string()))?;
                *pos += 1;
            }
            Some(&b) => {
                return Err(ParseError::InvalidEventLength(format!(
                    "unexpected byte {:?} in length",
                    char::from(b)
                )))
            }
        }
    }
    if *pos == start {
        return Err(ParseError::InvalidEventLength("empty length".to_string()));
    }
    *pos += 1;
    Ok(length)
}

fn lex_event_attribute(attribute: &[u8], event: &mut Event) -> Result<(), ParseError> {
    if let Some((&b'#', section)) = attribute.split_first() {
        event.tags = lex_tags(section)?;
        return Ok(());
    }
    if attribute.len() < 2 || attribute[1] != b':' {
        return Err(ParseError::MalformedEventAttribute(
            String::from_utf8_lossy(attribute).into_owned(),
        ));
    }
    let value = std::str::from_utf8(&attribute[2..])
        .map_err(|_| ParseError::InvalidUtf8("event attribute"))?;
    match attribute[0] {
        b'd' => {
            event.date_happened = value
                .parse()
                .map_err(|_| ParseError::InvalidEventDate(value.to_string()))?;
        }
        b'h' => event.hostname = value.to_string(),
        b'k' => event.aggregation_key = value.to_string(),
        b'p' => {
            event.priority = match value {
                "low" => Priority::Low,
                _ => Priority::Normal,
            }
        }
        b's' => event.source_type_name = value.to_string(),
        b't' => {
            event.alert_type = match value {
                "warning" => AlertType::Warning,
                "error" => AlertType::Error,
                "success" => AlertType::Success,
                _ => AlertType::Info,
            }
        }
        other => return Err(ParseError::UnknownEventAttribute(char::from(other))),
    }
    Ok(())
}
