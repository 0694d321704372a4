//! Schema loading and the on-disk schema cache
//!
//! YANG parsing happens in an external tool that emits a normalized JSON
//! representation of each module. This loader consumes those files plus
//! RFC 9595 `.sid` files, builds the resolved [`Schema`], and caches the
//! result on disk keyed by the input file set and modification times, so
//! repeated invocations skip the resolution work.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::{Keyword, NodeId, Schema, Statement, TypeSpec};

// ----------------------------------------------------------------------
// Normalized module representation
// ----------------------------------------------------------------------

/// Top-level document of a normalized module file
#[derive(Debug, Deserialize)]
struct ModuleFile {
    modules: Vec<RawModule>,
}

#[derive(Debug, Deserialize)]
struct RawModule {
    name: String,
    #[serde(default)]
    statements: Vec<RawStatement>,
}

#[derive(Debug, Deserialize)]
struct RawStatement {
    keyword: String,
    arg: String,
    #[serde(default = "default_true")]
    config: bool,
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    sid: Option<i64>,
    #[serde(default)]
    bases: Vec<String>,
    #[serde(rename = "type", default)]
    typ: Option<RawType>,
    #[serde(default)]
    substms: Vec<RawStatement>,
}

#[derive(Debug, Deserialize)]
struct RawType {
    name: String,
    #[serde(default)]
    range: Vec<(i128, i128)>,
    #[serde(default)]
    length: Vec<(u64, u64)>,
    #[serde(default)]
    patterns: Vec<String>,
    #[serde(default)]
    bits: Vec<(String, u32)>,
    #[serde(default)]
    enums: Vec<(String, i64)>,
    #[serde(default)]
    union: Vec<RawType>,
    #[serde(default)]
    leafref_path: Option<String>,
    #[serde(default)]
    identity_bases: Vec<String>,
    #[serde(default)]
    identity_module: Option<String>,
    #[serde(default)]
    fraction_digits: Option<u8>,
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------
// SID files (RFC 9595)
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SidFile {
    #[serde(default, rename = "items")]
    items: Vec<SidItem>,
}

#[derive(Debug, Deserialize)]
struct SidItem {
    #[serde(default)]
    namespace: String,
    identifier: String,
    sid: i64,
}

// ----------------------------------------------------------------------
// Loader
// ----------------------------------------------------------------------

/// Load a schema from normalized module files and `.sid` files
///
/// # Arguments
/// * `inputs` - Normalized module JSON files plus `.sid` files; `.sid`
///   entries overlay SIDs onto already-loaded nodes
/// * `cache_dir` - Enables the on-disk cache; pass `None` to always
///   resolve from scratch
///
/// # Returns
/// The resolved schema with list keys hoisted and leafrefs resolved
pub fn load_schema(inputs: &[PathBuf], cache_dir: Option<&Path>) -> Result<Schema> {
    let key = cache_key(inputs)?;
    if let Some(dir) = cache_dir {
        if let Some(schema) = cache_lookup(dir, &key) {
            log::debug!("schema cache hit for {} inputs", inputs.len());
            return Ok(schema);
        }
    }

    let mut schema = Schema::new();
    let mut sid_files = Vec::new();
    for path in inputs {
        if path.extension().map_or(false, |e| e == "sid") {
            sid_files.push(path);
            continue;
        }
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Schema(format!("read {}: {}", path.display(), e)))?;
        let file: ModuleFile = serde_json::from_str(&text)
            .map_err(|e| Error::Schema(format!("parse {}: {}", path.display(), e)))?;
        for module in file.modules {
            add_module(&mut schema, &module)?;
        }
    }

    for path in sid_files {
        apply_sid_file(&mut schema, path)?;
    }

    schema.hoist_list_keys();
    schema.resolve_leafrefs();

    if let Some(dir) = cache_dir {
        if let Err(e) = cache_store(dir, &key, &schema) {
            log::warn!("schema cache write failed: {}", e);
        }
    }
    Ok(schema)
}

fn add_module(schema: &mut Schema, module: &RawModule) -> Result<()> {
    let module_id = schema.add_node(
        Schema::ROOT,
        Statement::new(Keyword::Module, &module.name),
    );
    for raw in &module.statements {
        add_statement(schema, module_id, raw, Some(&module.name))?;
    }
    Ok(())
}

fn add_statement(
    schema: &mut Schema,
    parent: NodeId,
    raw: &RawStatement,
    qualify: Option<&str>,
) -> Result<NodeId> {
    let keyword = Keyword::parse(&raw.keyword)?;
    if matches!(keyword, Keyword::Rpc | Keyword::Action)
        && !raw
            .substms
            .iter()
            .any(|s| s.keyword == "input" || s.keyword == "output")
    {
        return Err(Error::Schema(format!(
            "{} {:?} has neither input nor output",
            raw.keyword, raw.arg
        )));
    }

    // top-level names carry their module qualifier in instance data
    let arg = match qualify {
        Some(module) if !raw.arg.contains(':') => format!("{}:{}", module, raw.arg),
        _ => raw.arg.clone(),
    };

    let mut stm = Statement::new(keyword, &arg);
    stm.config = raw.config;
    stm.default = raw.default.clone();
    stm.keys = raw.keys.clone();
    stm.sid = raw.sid;
    stm.bases = raw.bases.clone();

    if let Some(raw_type) = &raw.typ {
        stm.typ = Some(type_spec(raw_type));
    }

    let id = schema.add_node(parent, stm);
    for child in &raw.substms {
        add_statement(schema, id, child, None)?;
    }
    Ok(id)
}

fn type_spec(raw: &RawType) -> TypeSpec {
    TypeSpec {
        name: raw.name.clone(),
        range: raw.range.clone(),
        length: raw.length.clone(),
        patterns: raw.patterns.clone(),
        bits: raw.bits.clone(),
        enums: raw.enums.clone(),
        union: raw.union.iter().map(type_spec).collect(),
        leafref_path: raw.leafref_path.clone(),
        leafref: None,
        identity_bases: raw.identity_bases.clone(),
        identity_module: raw.identity_module.clone(),
        fraction_digits: raw.fraction_digits,
    }
}

/// Attach SIDs from an RFC 9595 `.sid` file to already-loaded nodes
fn apply_sid_file(schema: &mut Schema, path: &Path) -> Result<()> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::SidFile(format!("read {}: {}", path.display(), e)))?;
    let file: SidFile = serde_json::from_str(&text)
        .map_err(|e| Error::SidFile(format!("parse {}: {}", path.display(), e)))?;

    for item in &file.items {
        match item.namespace.as_str() {
            "data" | "" => {
                let segments: Vec<&str> = item
                    .identifier
                    .split('/')
                    .filter(|s| !s.is_empty())
                    .collect();
                match schema.resolve_schema_path(Schema::ROOT, &segments) {
                    Some(node) => schema.node_mut(node).sid = Some(item.sid),
                    None => log::warn!("SID item {:?} matches no node", item.identifier),
                }
            }
            "identity" => match schema.find_identity(&item.identifier) {
                Some(node) => schema.node_mut(node).sid = Some(item.sid),
                None => log::warn!("SID identity {:?} not found", item.identifier),
            },
            other => log::debug!("ignoring SID namespace {:?}", other),
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Cache
// ----------------------------------------------------------------------

/// Input file set plus modification times; any change invalidates
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct CacheKey {
    entries: Vec<(String, u64)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    key: CacheKey,
    schema: Schema,
}

fn cache_key(inputs: &[PathBuf]) -> Result<CacheKey> {
    let mut entries = Vec::with_capacity(inputs.len());
    for path in inputs {
        let meta = fs::metadata(path)
            .map_err(|e| Error::Schema(format!("stat {}: {}", path.display(), e)))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        entries.push((path.display().to_string(), mtime));
    }
    entries.sort();
    Ok(CacheKey { entries })
}

fn cache_path(dir: &Path, key: &CacheKey) -> PathBuf {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    dir.join(format!("schema-{:016x}.json", hasher.finish()))
}

fn cache_lookup(dir: &Path, key: &CacheKey) -> Option<Schema> {
    let path = cache_path(dir, key);
    let text = fs::read_to_string(path).ok()?;
    let entry: CacheEntry = serde_json::from_str(&text).ok()?;
    // hash collisions and stale files both fail the full key comparison
    if &entry.key == key {
        Some(entry.schema)
    } else {
        None
    }
}

fn cache_store(dir: &Path, key: &CacheKey, schema: &Schema) -> Result<()> {
    fs::create_dir_all(dir)?;
    let entry = CacheEntry {
        key: key.clone(),
        schema: schema.clone(),
    };
    let path = cache_path(dir, key);
    fs::write(&path, serde_json::to_vec(&entry)?)?;
    log::debug!("schema cached at {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOARD_MODULE: &str = r#"{
        "modules": [{
            "name": "board",
            "statements": [{
                "keyword": "container",
                "arg": "system",
                "sid": 2000,
                "substms": [
                    {"keyword": "leaf", "arg": "hostname", "sid": 2001,
                     "type": {"name": "string"}},
                    {"keyword": "leaf", "arg": "location",
                     "type": {"name": "string"}}
                ]
            }]
        }]
    }"#;

    const BOARD_SID: &str = r#"{
        "items": [
            {"namespace": "data", "identifier": "/board:system/location", "sid": 2002}
        ]
    }"#;

    fn write_temp(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mup1cc-loader-{}-{}", tag, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_load_module_and_sid_overlay() {
        let dir = temp_dir("overlay");
        let module = write_temp(&dir, "board.json", BOARD_MODULE);
        let sid = write_temp(&dir, "board.sid", BOARD_SID);

        let schema = load_schema(&[module, sid], None).unwrap();
        let node = schema
            .resolve_schema_path(Schema::ROOT, &["board:system", "location"])
            .unwrap();
        assert_eq!(schema.node(node).sid, Some(2002));

        // inline SID survives
        let host = schema
            .resolve_schema_path(Schema::ROOT, &["system", "hostname"])
            .unwrap();
        assert_eq!(schema.node(host).sid, Some(2001));
    }

    #[test]
    fn test_top_level_args_are_qualified() {
        let dir = temp_dir("qualify");
        let module = write_temp(&dir, "board.json", BOARD_MODULE);
        let schema = load_schema(&[module], None).unwrap();
        let system = schema.data_children(Schema::ROOT)[0];
        assert_eq!(schema.node(system).arg, "board:system");
    }

    #[test]
    fn test_rpc_without_input_or_output_is_fatal() {
        let dir = temp_dir("rpc");
        let module = write_temp(
            &dir,
            "bad.json",
            r#"{"modules": [{"name": "bad", "statements": [
                {"keyword": "rpc", "arg": "reboot", "sid": 1}
            ]}]}"#,
        );
        assert!(load_schema(&[module], None).is_err());
    }

    #[test]
    fn test_cache_roundtrip() {
        let dir = temp_dir("cache");
        let module = write_temp(&dir, "board.json", BOARD_MODULE);
        let cache = dir.join("cache");

        let first = load_schema(&[module.clone()], Some(&cache)).unwrap();
        assert!(cache.read_dir().unwrap().count() > 0);

        let second = load_schema(&[module], Some(&cache)).unwrap();
        assert_eq!(first.len(), second.len());
        let node = second
            .resolve_schema_path(Schema::ROOT, &["system", "hostname"])
            .unwrap();
        assert_eq!(second.node(node).sid, Some(2001));
    }
}
