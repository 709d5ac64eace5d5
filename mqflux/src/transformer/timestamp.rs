//! Timestamp-field rules of the JSON transformer.
//!
//! A rule maps a payload field to a time format. The first field that is
//! present and parses replaces the record's `created` value.

use std::collections::BTreeMap;

use chrono::format::{parse, Fixed, Item, Numeric, Pad, Parsed};
use chrono::{DateTime, Datelike, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use mqflux_utils::TimestampNanos;

use super::json::SEP;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Secs,
    Millis,
    Micros,
    Nanos,
}

impl Precision {
    #[inline]
    fn digits(self) -> usize {
        match self {
            Precision::Secs => 9,
            Precision::Millis => 6,
            Precision::Micros => 3,
            Precision::Nanos => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeFormat {
    Unix(Precision),
    Rfc3339,
    /// Reference-time layout, e.g. `Mon Jan _2 15:04:05 2006`
    Layout(String),
}

impl TimeFormat {
    /// Resolves a configured format name, anything unknown is taken as a layout.
    pub fn from_name(name: &str) -> Self {
        let layout = match name.trim().to_ascii_lowercase().as_str() {
            "unix" => return TimeFormat::Unix(Precision::Secs),
            "unix_ms" => return TimeFormat::Unix(Precision::Millis),
            "unix_us" => return TimeFormat::Unix(Precision::Micros),
            "unix_ns" => return TimeFormat::Unix(Precision::Nanos),
            "rfc3339" | "rfc3339nano" => return TimeFormat::Rfc3339,
            "ansic" => "Mon Jan _2 15:04:05 2006",
            "unixdate" => "Mon Jan _2 15:04:05 MST 2006",
            "rubydate" => "Mon Jan 02 15:04:05 -0700 2006",
            "rfc822" => "02 Jan 06 15:04 MST",
            "rfc822z" => "02 Jan 06 15:04 -0700",
            "rfc850" => "Monday, 02-Jan-06 15:04:05 MST",
            "rfc1123" => "Mon, 02 Jan 2006 15:04:05 MST",
            "rfc1123z" => "Mon, 02 Jan 2006 15:04:05 -0700",
            "kitchen" => "3:04PM",
            "stamp" => "Jan _2 15:04:05",
            "stampmilli" => "Jan _2 15:04:05.000",
            "stampmicro" => "Jan _2 15:04:05.000000",
            "stampnano" => "Jan _2 15:04:05.000000000",
            "datetime" => "2006-01-02 15:04:05",
            "dateonly" => "2006-01-02",
            _ => name,
        };
        TimeFormat::Layout(layout.to_owned())
    }

    pub fn parse(&self, value: &Value) -> Option<TimestampNanos> {
        match (self, value) {
            (TimeFormat::Unix(p), Value::Number(n)) => parse_unix(&n.to_string(), *p),
            (TimeFormat::Unix(p), Value::String(s)) => parse_unix(s, *p),
            (TimeFormat::Rfc3339, Value::String(s)) => DateTime::parse_from_rfc3339(s.trim()).ok()?.timestamp_nanos_opt(),
            (TimeFormat::Layout(layout), Value::String(s)) => parse_layout(layout, s),
            _ => None,
        }
    }
}

/// Configured `{field -> format}` rules, tried in field order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "BTreeMap<String, String>")]
pub struct Timestamps {
    fields: BTreeMap<String, TimeFormat>,
}

impl From<BTreeMap<String, String>> for Timestamps {
    fn from(rules: BTreeMap<String, String>) -> Self {
        Self { fields: rules.into_iter().map(|(field, fmt)| (field, TimeFormat::from_name(&fmt))).collect() }
    }
}

impl Timestamps {
    pub fn new<I, K, V>(rules: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        Self { fields: rules.into_iter().map(|(k, v)| (k.into(), TimeFormat::from_name(v.as_ref()))).collect() }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn resolve(&self, obj: &Map<String, Value>) -> Option<TimestampNanos> {
        self.fields.iter().find_map(|(field, fmt)| {
            let v = lookup(obj, field)?;
            let ts = fmt.parse(v);
            if ts.is_none() {
                log::debug!("timestamp field '{}' not parsable as {:?}: {}", field, fmt, v);
            }
            ts
        })
    }
}

/// Finds `field` at the top level, or by walking `/` separated segments.
fn lookup<'a>(obj: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    if let Some(v) = obj.get(field) {
        return Some(v);
    }
    if !field.contains(SEP) {
        return None;
    }
    let mut segs = field.split(SEP);
    let mut cur = obj.get(segs.next()?)?;
    for seg in segs {
        cur = cur.as_object()?.get(seg)?;
    }
    Some(cur)
}

/// Integer and fractional parts are scaled separately so no precision is lost.
fn parse_unix(text: &str, precision: Precision) -> Option<TimestampNanos> {
    let text = text.trim().replace(',', ".");
    if text.contains(['e', 'E']) {
        let f = text.parse::<f64>().ok()?;
        let ns = f * 10f64.powi(precision.digits() as i32);
        return ns.is_finite().then_some(ns as i64);
    }
    let (neg, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(&text)),
    };
    let (int, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if (int.is_empty() && frac.is_empty()) || !int.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }
    let scale = 10i64.pow(precision.digits() as u32);
    let int = if int.is_empty() { 0 } else { int.parse::<i64>().ok()? };
    let mut frac: String = frac.chars().take(precision.digits()).collect();
    while frac.len() < precision.digits() {
        frac.push('0');
    }
    let frac = if frac.is_empty() { 0 } else { frac.parse::<i64>().ok()? };
    let ns = int.checked_mul(scale)?.checked_add(frac)?;
    Some(if neg { -ns } else { ns })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Other,
    Year,
    Month,
    Day,
    Hour,
    Second,
    Offset,
}

const TOKENS: &[(&str, Item<'static>, Part)] = &[
    ("January", Item::Fixed(Fixed::LongMonthName), Part::Month),
    ("Jan", Item::Fixed(Fixed::ShortMonthName), Part::Month),
    ("Monday", Item::Fixed(Fixed::LongWeekdayName), Part::Other),
    ("Mon", Item::Fixed(Fixed::ShortWeekdayName), Part::Other),
    ("MST", Item::Fixed(Fixed::TimezoneName), Part::Other),
    ("2006", Item::Numeric(Numeric::Year, Pad::Zero), Part::Year),
    ("-07:00", Item::Fixed(Fixed::TimezoneOffsetColon), Part::Offset),
    ("-0700", Item::Fixed(Fixed::TimezoneOffset), Part::Offset),
    ("Z07:00", Item::Fixed(Fixed::TimezoneOffsetColonZ), Part::Offset),
    ("Z0700", Item::Fixed(Fixed::TimezoneOffsetZ), Part::Offset),
    ("01", Item::Numeric(Numeric::Month, Pad::Zero), Part::Month),
    ("02", Item::Numeric(Numeric::Day, Pad::Zero), Part::Day),
    ("03", Item::Numeric(Numeric::Hour12, Pad::Zero), Part::Hour),
    ("04", Item::Numeric(Numeric::Minute, Pad::Zero), Part::Other),
    ("05", Item::Numeric(Numeric::Second, Pad::Zero), Part::Second),
    ("06", Item::Numeric(Numeric::YearMod100, Pad::Zero), Part::Year),
    ("15", Item::Numeric(Numeric::Hour, Pad::Zero), Part::Hour),
    ("_2", Item::Numeric(Numeric::Day, Pad::Space), Part::Day),
    ("PM", Item::Fixed(Fixed::UpperAmPm), Part::Other),
    ("pm", Item::Fixed(Fixed::LowerAmPm), Part::Other),
    ("1", Item::Numeric(Numeric::Month, Pad::None), Part::Month),
    ("2", Item::Numeric(Numeric::Day, Pad::None), Part::Day),
    ("3", Item::Numeric(Numeric::Hour12, Pad::None), Part::Hour),
    ("4", Item::Numeric(Numeric::Minute, Pad::None), Part::Other),
    ("5", Item::Numeric(Numeric::Second, Pad::None), Part::Second),
];

struct Compiled<'a> {
    items: Vec<Item<'a>>,
    parts: Vec<Part>,
}

impl Compiled<'_> {
    #[inline]
    fn has(&self, p: Part) -> bool {
        self.parts.contains(&p)
    }
}

fn compile<'a>(layout: &'a str) -> Compiled<'a> {
    let mut items = Vec::new();
    let mut parts = Vec::new();
    let mut lit_start = 0;
    let mut i = 0;
    let flush = |items: &mut Vec<Item<'a>>, from: usize, to: usize| {
        if from < to {
            items.push(Item::Literal(&layout[from..to]));
        }
    };
    while i < layout.len() {
        let rest = &layout[i..];
        if rest.starts_with(' ') {
            flush(&mut items, lit_start, i);
            let n = rest.len() - rest.trim_start_matches(' ').len();
            items.push(Item::Space(" "));
            i += n;
            lit_start = i;
            continue;
        }
        if let (Some(frac), Some(Part::Second)) = (rest.strip_prefix('.'), parts.last()) {
            let tail = frac.trim_start_matches(['0', '9']);
            let n = frac.len() - tail.len();
            if n > 0 && lit_start == i && !tail.starts_with(|c: char| c.is_ascii_digit()) {
                flush(&mut items, lit_start, i);
                items.push(Item::Fixed(Fixed::Nanosecond));
                i += n + 1;
                lit_start = i;
                continue;
            }
        }
        if let Some((tok, item, part)) = TOKENS.iter().find(|(tok, _, _)| rest.starts_with(*tok)) {
            flush(&mut items, lit_start, i);
            items.push(item.clone());
            parts.push(*part);
            i += tok.len();
            lit_start = i;
            continue;
        }
        i += rest.chars().next().map(char::len_utf8).unwrap_or(1);
    }
    flush(&mut items, lit_start, layout.len());
    Compiled { items, parts }
}

/// Missing date parts default to the current year, January and the first
/// day, a missing time of day to midnight. Without an offset the value is UTC.
fn parse_layout(layout: &str, text: &str) -> Option<TimestampNanos> {
    let compiled = compile(layout);
    let mut items = Vec::with_capacity(compiled.items.len() + 8);
    let mut value = String::with_capacity(text.len() + 16);
    if !compiled.has(Part::Year) {
        items.extend([Item::Numeric(Numeric::Year, Pad::Zero), Item::Space(" ")]);
        value.push_str(&format!("{} ", Utc::now().year()));
    }
    if !compiled.has(Part::Month) {
        items.extend([Item::Numeric(Numeric::Month, Pad::Zero), Item::Space(" ")]);
        value.push_str("01 ");
    }
    if !compiled.has(Part::Day) {
        items.extend([Item::Numeric(Numeric::Day, Pad::Zero), Item::Space(" ")]);
        value.push_str("01 ");
    }
    items.extend(compiled.items.iter().cloned());
    value.push_str(text.trim());
    if !compiled.has(Part::Hour) {
        items.extend([
            Item::Space(" "),
            Item::Numeric(Numeric::Hour, Pad::Zero),
            Item::Literal(":"),
            Item::Numeric(Numeric::Minute, Pad::Zero),
        ]);
        value.push_str(" 00:00");
    }

    let mut parsed = Parsed::new();
    parse(&mut parsed, &value, items.iter()).ok()?;
    if compiled.has(Part::Offset) {
        parsed.to_datetime().ok()?.timestamp_nanos_opt()
    } else {
        parsed.to_naive_datetime_with_offset(0).ok()?.and_utc().timestamp_nanos_opt()
    }
}
