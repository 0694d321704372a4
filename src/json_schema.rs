//! JSON Schema (draft-07) emission
//!
//! Translates the resolved YANG tree into a schema for the
//! human-editable JSON/YAML documents, so editors can validate input
//! before it ever reaches the device. The shape follows the RFC 7951
//! JSON encoding: 64-bit integers and decimal64 as patterned strings,
//! binary as base64, bits as a space-separated name list.

use serde_json::{json, Map, Value as Json};

use crate::codec::ContentFormat;
use crate::schema::{Keyword, NodeId, Schema, TypeSpec};

/// Emit the document schema for the loaded modules
pub fn emit(schema: &Schema, content: ContentFormat) -> Json {
    let mut properties = Map::new();
    for child in schema.data_children(Schema::ROOT) {
        if skip_node(schema, child, content) {
            continue;
        }
        let stm = schema.node(child);
        properties.insert(stm.arg.clone(), node_schema(schema, child, content));
    }

    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "properties": Json::Object(properties),
        "additionalProperties": false,
    })
}

/// Configuration-only transfers leave state nodes out entirely
fn skip_node(schema: &Schema, id: NodeId, content: ContentFormat) -> bool {
    let config_only = matches!(content, ContentFormat::Ipatch | ContentFormat::Put);
    config_only && !schema.node(id).config
}

fn node_schema(schema: &Schema, id: NodeId, content: ContentFormat) -> Json {
    let stm = schema.node(id);
    match stm.keyword {
        Keyword::Container | Keyword::Input | Keyword::Output | Keyword::Notification => {
            object_schema(schema, id, content)
        }
        Keyword::List => list_schema(schema, id, content),
        Keyword::Leaf => stm
            .typ
            .as_ref()
            .map(|t| type_schema(schema, t))
            .unwrap_or_else(|| json!({})),
        Keyword::LeafList => {
            let items = stm
                .typ
                .as_ref()
                .map(|t| type_schema(schema, t))
                .unwrap_or_else(|| json!({}));
            json!({"type": "array", "items": items})
        }
        Keyword::Rpc | Keyword::Action => {
            let mut properties = Map::new();
            for &child in &stm.substms {
                let kw = schema.node(child).keyword;
                if kw == Keyword::Input {
                    properties.insert("input".into(), object_schema(schema, child, content));
                } else if kw == Keyword::Output {
                    properties.insert("output".into(), object_schema(schema, child, content));
                }
            }
            json!({
                "type": "object",
                "properties": Json::Object(properties),
                "minProperties": 1,
                "maxProperties": 1,
            })
        }
        Keyword::Anydata | Keyword::Anyxml => json!({}),
        _ => json!({}),
    }
}

fn object_schema(schema: &Schema, id: NodeId, content: ContentFormat) -> Json {
    let mut properties = Map::new();
    for child in schema.data_children(id) {
        if skip_node(schema, child, content) {
            continue;
        }
        let stm = schema.node(child);
        properties.insert(
            stm.local_name().to_string(),
            node_schema(schema, child, content),
        );
    }
    json!({
        "type": "object",
        "properties": Json::Object(properties),
        "additionalProperties": false,
    })
}

fn list_schema(schema: &Schema, id: NodeId, content: ContentFormat) -> Json {
    let stm = schema.node(id);
    let entry = object_schema(schema, id, content);
    let mut array = json!({"type": "array", "items": entry});
    if stm.config {
        array["uniqueItems"] = Json::Bool(true);
    }

    // FETCH/iPATCH documents may address one entry directly
    if content.accepts_single_list_entry() {
        let entry = object_schema(schema, id, content);
        json!({"oneOf": [array, entry]})
    } else {
        array
    }
}

fn type_schema(schema: &Schema, typ: &TypeSpec) -> Json {
    match typ.name.as_str() {
        "boolean" => json!({"type": "boolean"}),
        "empty" => json!({"type": "null"}),
        "string" => {
            let mut out = json!({"type": "string"});
            if let Some(&(min, max)) = typ.length.first() {
                out["minLength"] = json!(min);
                out["maxLength"] = json!(max);
            }
            if let Some(pattern) = typ.patterns.first() {
                out["pattern"] = json!(format!("^{}$", pattern));
            }
            out
        }
        "int8" | "int16" | "int32" | "uint8" | "uint16" | "uint32" => {
            let (lo, hi) = integer_bounds(&typ.name);
            let (lo, hi) = typ.range.first().copied().unwrap_or((lo, hi));
            json!({"type": "integer", "minimum": lo as i64, "maximum": hi as i64})
        }
        // 64-bit and decimal values travel as strings
        "int64" => json!({"type": "string", "pattern": "^-?[0-9]+$"}),
        "uint64" => json!({"type": "string", "pattern": "^[0-9]+$"}),
        "decimal64" => {
            let digits = typ.fraction_digits.unwrap_or(1);
            json!({
                "type": "string",
                "pattern": format!("^-?[0-9]+(\\.[0-9]{{1,{}}})?$", digits),
            })
        }
        "binary" => {
            let mut out = json!({
                "type": "string",
                "pattern": "^[A-Za-z0-9+/]*={0,2}$",
            });
            if let Some(&(min, max)) = typ.length.first() {
                // base64 expands 3 bytes into 4 characters
                out["minLength"] = json!(min.div_ceil(3) * 4);
                out["maxLength"] = json!(max.div_ceil(3) * 4);
            }
            out
        }
        "enumeration" => {
            let names: Vec<&str> = typ.enums.iter().map(|(n, _)| n.as_str()).collect();
            json!({"type": "string", "enum": names})
        }
        "bits" => {
            let names: Vec<&str> = typ.bits.iter().map(|(n, _)| n.as_str()).collect();
            let alt = names.join("|");
            json!({
                "type": "string",
                "pattern": format!("^({})?(\\s({}))*$", alt, alt),
            })
        }
        "identityref" => {
            let mut names = Vec::new();
            for id in 1..schema.len() {
                let stm = schema.node(id);
                if stm.keyword != Keyword::Identity {
                    continue;
                }
                let derived = typ.identity_bases.is_empty()
                    || typ
                        .identity_bases
                        .iter()
                        .any(|base| schema.identity_derives_from(id, base));
                if derived {
                    names.push(stm.arg.clone());
                    if stm.arg != stm.local_name() {
                        names.push(stm.local_name().to_string());
                    }
                }
            }
            json!({"type": "string", "enum": names})
        }
        "union" => {
            let members: Vec<Json> = typ
                .union
                .iter()
                .map(|m| type_schema(schema, m))
                .collect();
            json!({"oneOf": members})
        }
        "leafref" => typ
            .leafref
            .and_then(|t| schema.node(t).typ.as_ref())
            .map(|t| type_schema(schema, t))
            .unwrap_or_else(|| json!({})),
        "instance-identifier" => json!({"type": "string", "pattern": "^/.+"}),
        _ => json!({}),
    }
}

fn integer_bounds(name: &str) -> (i128, i128) {
    match name {
        "int8" => (i8::MIN as i128, i8::MAX as i128),
        "int16" => (i16::MIN as i128, i16::MAX as i128),
        "int32" => (i32::MIN as i128, i32::MAX as i128),
        "uint8" => (0, u8::MAX as i128),
        "uint16" => (0, u16::MAX as i128),
        _ => (0, u32::MAX as i128),
    }
}
