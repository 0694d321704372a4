//! Instance-identifier codec
//!
//! Converts RFC 7951 instance-identifier strings such as
//! `/ietf-interfaces:interfaces/interface[name='eth0']/enabled` into
//! their CBOR form `[sid, key1, key2, ...]` (a bare SID when the path
//! carries no keys) and back. Key values are coerced to the key leaf's
//! type on encode and re-rendered through it on decode.

use ciborium::value::Value as Cbor;

use crate::codec;
use crate::error::{Error, Result};
use crate::schema::{Keyword, NodeId, Schema};

/// One path segment: node name plus `[key='value']` predicates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    pub predicates: Vec<(String, String)>,
}

/// Split an instance-identifier string into segments
///
/// `/` separates segments only outside `[...]`; predicate values may be
/// quoted with either `'` or `"`, or left bare.
pub fn parse(iid: &str) -> Result<Vec<Segment>> {
    if !iid.starts_with('/') {
        return Err(Error::InstanceId(format!(
            "instance-identifier must start with '/': {:?}",
            iid
        )));
    }

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut depth = 0u32;
    for c in iid.chars().skip(1) {
        match c {
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            '/' if depth == 0 => {
                segments.push(parse_segment(&current)?);
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        segments.push(parse_segment(&current)?);
    }
    if segments.is_empty() {
        return Err(Error::InstanceId("empty instance-identifier".into()));
    }
    Ok(segments)
}

fn parse_segment(text: &str) -> Result<Segment> {
    let (name, rest) = match text.find('[') {
        Some(i) => (&text[..i], &text[i..]),
        None => (text, ""),
    };
    if name.is_empty() {
        return Err(Error::InstanceId(format!("empty segment in {:?}", text)));
    }

    let mut predicates = Vec::new();
    let mut rest = rest;
    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err(Error::InstanceId(format!("malformed predicate {:?}", rest)));
        }
        let end = rest
            .find(']')
            .ok_or_else(|| Error::InstanceId(format!("unterminated predicate {:?}", rest)))?;
        let body = &rest[1..end];
        let (key, value) = body
            .split_once('=')
            .ok_or_else(|| Error::InstanceId(format!("predicate without '=': {:?}", body)))?;
        predicates.push((key.trim().to_string(), unquote(value.trim()).to_string()));
        rest = &rest[end + 1..];
    }

    Ok(Segment {
        name: name.to_string(),
        predicates,
    })
}

fn unquote(v: &str) -> &str {
    let bytes = v.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return &v[1..v.len() - 1];
        }
    }
    v
}

/// Encode a string instance-identifier to its CBOR form
///
/// Returns the CBOR item and the terminal schema node so callers can
/// encode an associated value against it.
pub fn encode(schema: &Schema, iid: &str) -> Result<(Cbor, NodeId)> {
    let segments = parse(iid)?;

    let mut cur = Schema::ROOT;
    let mut keys: Vec<Cbor> = Vec::new();
    for segment in &segments {
        cur = schema.data_child_by_arg(cur, &segment.name).ok_or_else(|| {
            Error::InstanceId(format!("unknown node {:?} in {:?}", segment.name, iid))
        })?;

        for (key, value) in &segment.predicates {
            let leaf = schema.data_child_by_arg(cur, key).ok_or_else(|| {
                Error::InstanceId(format!("unknown key leaf {:?} in {:?}", key, iid))
            })?;
            let typ = schema
                .node(leaf)
                .typ
                .as_ref()
                .ok_or_else(|| Error::Schema(format!("key leaf {:?} has no type", key)))?;
            let coerced = coerce_key_value(&typ.name, value);
            keys.push(codec::type_encode(schema, typ, &coerced, false)?);
        }
    }

    let sid = schema
        .node(cur)
        .sid
        .ok_or_else(|| Error::InstanceId(format!("node {:?} has no SID", iid)))?;

    let item = if keys.is_empty() {
        Cbor::Integer(sid.into())
    } else {
        let mut items = vec![Cbor::Integer(sid.into())];
        items.extend(keys);
        Cbor::Array(items)
    };
    Ok((item, cur))
}

/// Key predicate values arrive as strings; map them onto the JSON shape
/// the key leaf's type expects before encoding.
fn coerce_key_value(type_name: &str, value: &str) -> serde_json::Value {
    use serde_json::Value as Json;

    if value == "[null]" {
        return Json::Null;
    }
    match type_name {
        "int8" | "int16" | "int32" | "uint8" | "uint16" | "uint32" => value
            .parse::<i64>()
            .map(Json::from)
            .unwrap_or_else(|_| Json::String(value.to_string())),
        "boolean" => match value {
            "true" => Json::Bool(true),
            "false" => Json::Bool(false),
            _ => Json::String(value.to_string()),
        },
        "empty" => Json::Null,
        _ => Json::String(value.to_string()),
    }
}

/// Decode the CBOR form back into an instance-identifier string
pub fn decode(schema: &Schema, cbor: &Cbor) -> Result<String> {
    decode_with_target(schema, cbor).map(|(iid, _)| iid)
}

/// Decode and also return the terminal schema node, so an associated
/// value can be decoded against it
pub fn decode_with_target(schema: &Schema, cbor: &Cbor) -> Result<(String, NodeId)> {
    let (sid, keys): (i64, &[Cbor]) = match cbor {
        Cbor::Integer(i) => (int_of(i)?, &[]),
        Cbor::Array(items) => {
            let first = items
                .first()
                .ok_or_else(|| Error::InstanceId("empty CBOR array".into()))?;
            match first {
                Cbor::Integer(i) => (int_of(i)?, &items[1..]),
                other => {
                    return Err(Error::InstanceId(format!(
                        "expected SID integer, got {:?}",
                        other
                    )))
                }
            }
        }
        other => {
            return Err(Error::InstanceId(format!(
                "expected SID or [SID, keys...], got {:?}",
                other
            )))
        }
    };

    let (target, path) = schema
        .find_by_sid(sid)
        .ok_or_else(|| Error::InstanceId(format!("unknown SID {}", sid)))?;

    let mut out = String::new();
    let mut key_iter = keys.iter();
    for &node in &path {
        let stm = schema.node(node);
        if matches!(stm.keyword, Keyword::Module | Keyword::Choice | Keyword::Case) {
            continue;
        }
        out.push('/');
        out.push_str(&stm.arg);

        if stm.keyword == Keyword::List {
            for key_name in &stm.keys {
                let key_cbor = match key_iter.next() {
                    Some(k) => k,
                    None => break,
                };
                let rendered = render_key(schema, node, key_name, key_cbor)?;
                out.push_str(&format!("[{}='{}']", key_name, rendered));
            }
        }
    }
    Ok((out, target))
}

fn render_key(schema: &Schema, list: NodeId, key_name: &str, key: &Cbor) -> Result<String> {
    let leaf = schema
        .data_child_by_arg(list, key_name)
        .ok_or_else(|| Error::Schema(format!("missing key leaf {:?}", key_name)))?;
    let typ = schema
        .node(leaf)
        .typ
        .as_ref()
        .ok_or_else(|| Error::Schema(format!("key leaf {:?} has no type", key_name)))?;

    let json = codec::type_decode(schema, typ, key)?;
    Ok(match json {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => "[null]".to_string(),
        other => other.to_string(),
    })
}

fn int_of(i: &ciborium::value::Integer) -> Result<i64> {
    i64::try_from(i128::from(*i)).map_err(|_| Error::InstanceId("SID out of range".into()))
}
