//! InfluxDB line protocol.

use std::fmt::Write as _;

use mqflux::writer::{FieldValue, Point};

fn escape(out: &mut String, s: &str, specials: &[char]) {
    for c in s.chars() {
        if specials.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

#[inline]
fn measurement(out: &mut String, s: &str) {
    escape(out, s, &[',', ' ']);
}

///Tag keys, tag values and field keys
#[inline]
fn key(out: &mut String, s: &str) {
    escape(out, s, &[',', '=', ' ']);
}

fn field_value(out: &mut String, v: &FieldValue) {
    match v {
        FieldValue::Float(f) => {
            let _ = write!(out, "{}", f);
        }
        FieldValue::Int(i) => {
            let _ = write!(out, "{}i", i);
        }
        FieldValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        FieldValue::Str(s) => {
            out.push('"');
            escape(out, s, &['"', '\\']);
            out.push('"');
        }
    }
}

/// Appends one line, a point without fields or with a non-finite float yields nothing.
pub fn write_point(out: &mut String, p: &Point) -> bool {
    let fields: Vec<_> = p
        .fields
        .iter()
        .filter(|(_, v)| !matches!(v, FieldValue::Float(f) if !f.is_finite()))
        .collect();
    if fields.is_empty() {
        return false;
    }
    measurement(out, &p.measurement);
    for (k, v) in p.tags.iter().filter(|(_, v)| !v.is_empty()) {
        out.push(',');
        key(out, k);
        out.push('=');
        key(out, v);
    }
    for (i, (k, v)) in fields.into_iter().enumerate() {
        out.push(if i == 0 { ' ' } else { ',' });
        key(out, k);
        out.push('=');
        field_value(out, v);
    }
    let _ = writeln!(out, " {}", p.timestamp);
    true
}

pub fn encode(points: &[Point]) -> String {
    let mut out = String::with_capacity(points.len() * 128);
    for p in points {
        write_point(&mut out, p);
    }
    out
}
