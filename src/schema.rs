//! In-memory YANG schema model
//!
//! The resolved schema is a tree of statements held in a single arena and
//! addressed by integer ids, so leafref targets and parent links never
//! form ownership cycles. YANG parsing happens outside this crate; the
//! loader hands this module a normalized statement tree with SIDs already
//! attached.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Arena index of a statement
pub type NodeId = usize;

/// YANG statement keywords the data plane cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Keyword {
    Module,
    Container,
    List,
    Leaf,
    LeafList,
    Choice,
    Case,
    Rpc,
    Action,
    Input,
    Output,
    Anydata,
    Anyxml,
    Notification,
    Identity,
}

impl Keyword {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "module" => Keyword::Module,
            "container" => Keyword::Container,
            "list" => Keyword::List,
            "leaf" => Keyword::Leaf,
            "leaf-list" => Keyword::LeafList,
            "choice" => Keyword::Choice,
            "case" => Keyword::Case,
            "rpc" => Keyword::Rpc,
            "action" => Keyword::Action,
            "input" => Keyword::Input,
            "output" => Keyword::Output,
            "anydata" => Keyword::Anydata,
            "anyxml" => Keyword::Anyxml,
            "notification" => Keyword::Notification,
            "identity" => Keyword::Identity,
            other => return Err(Error::Schema(format!("unknown keyword {:?}", other))),
        })
    }

    /// Nodes that carry child data nodes keyed by delta SID
    pub fn is_inner(self) -> bool {
        matches!(
            self,
            Keyword::Module
                | Keyword::Container
                | Keyword::Input
                | Keyword::Output
                | Keyword::Notification
        )
    }
}

/// Type information attached to leaf and leaf-list statements
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeSpec {
    /// Builtin type name after typedef resolution
    pub name: String,
    /// Inclusive integer ranges
    pub range: Vec<(i128, i128)>,
    /// Inclusive string/binary length ranges
    pub length: Vec<(u64, u64)>,
    /// Anchored regex patterns
    pub patterns: Vec<String>,
    /// Bit name to position, declaration order
    pub bits: Vec<(String, u32)>,
    /// Enum name to value, declaration order
    pub enums: Vec<(String, i64)>,
    /// Member types of a union, declaration order
    pub union: Vec<TypeSpec>,
    /// Leafref target path as written in the model
    pub leafref_path: Option<String>,
    /// Leafref target after resolution
    pub leafref: Option<NodeId>,
    /// Base identity names an identityref accepts
    pub identity_bases: Vec<String>,
    /// Module owning the identityref's bases
    pub identity_module: Option<String>,
    /// decimal64 fraction digits
    pub fraction_digits: Option<u8>,
}

impl TypeSpec {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn bit_position(&self, name: &str) -> Option<u32> {
        self.bits.iter().find(|(n, _)| n == name).map(|(_, p)| *p)
    }

    pub fn enum_value(&self, name: &str) -> Option<i64> {
        self.enums.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn enum_name(&self, value: i64) -> Option<&str> {
        self.enums
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(n, _)| n.as_str())
    }
}

/// One resolved YANG statement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    pub keyword: Keyword,
    /// Argument; qualified as `module:name` at module top level
    pub arg: String,
    pub config: bool,
    pub default: Option<String>,
    /// Key leaf names for lists, in `key` statement order
    pub keys: Vec<String>,
    pub sid: Option<i64>,
    pub typ: Option<TypeSpec>,
    /// Base identities, for `identity` statements
    pub bases: Vec<String>,
    pub parent: Option<NodeId>,
    pub substms: Vec<NodeId>,
}

impl Statement {
    pub fn new(keyword: Keyword, arg: &str) -> Self {
        Self {
            keyword,
            arg: arg.to_string(),
            config: true,
            default: None,
            keys: Vec::new(),
            sid: None,
            typ: None,
            bases: Vec::new(),
            parent: None,
            substms: Vec::new(),
        }
    }

    pub fn with_sid(mut self, sid: i64) -> Self {
        self.sid = Some(sid);
        self
    }

    pub fn with_type(mut self, typ: TypeSpec) -> Self {
        self.typ = Some(typ);
        self
    }

    pub fn with_keys(mut self, keys: &[&str]) -> Self {
        self.keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_config(mut self, config: bool) -> Self {
        self.config = config;
        self
    }

    pub fn with_bases(mut self, bases: &[&str]) -> Self {
        self.bases = bases.iter().map(|b| b.to_string()).collect();
        self
    }

    /// Argument without any `module:` qualifier
    pub fn local_name(&self) -> &str {
        match self.arg.split_once(':') {
            Some((_, name)) => name,
            None => &self.arg,
        }
    }

    /// Module part of the argument, when qualified
    pub fn module_prefix(&self) -> Option<&str> {
        self.arg.split_once(':').map(|(m, _)| m)
    }
}

/// Resolved schema tree
///
/// A synthetic root holds the loaded modules; it behaves as if its SID
/// were zero, so top-level children encode with their absolute SIDs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    arena: Vec<Statement>,
}

impl Schema {
    pub fn new() -> Self {
        let mut schema = Self { arena: Vec::new() };
        // synthetic root; never matched by argument
        schema.arena.push(Statement::new(Keyword::Module, ""));
        schema
    }

    pub const ROOT: NodeId = 0;

    pub fn node(&self, id: NodeId) -> &Statement {
        &self.arena[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Statement {
        &mut self.arena[id]
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.len() <= 1
    }

    /// Append a statement under `parent`
    pub fn add_node(&mut self, parent: NodeId, mut stm: Statement) -> NodeId {
        let id = self.arena.len();
        stm.parent = Some(parent);
        self.arena.push(stm);
        self.arena[parent].substms.push(id);
        id
    }

    /// Effective SID of a node; the synthetic root counts as zero
    pub fn sid_of(&self, id: NodeId) -> i64 {
        if id == Self::ROOT {
            0
        } else {
            self.node(id).sid.unwrap_or(0)
        }
    }

    /// Child whose argument matches `name`
    ///
    /// A qualified `module:name` child also matches its bare local name,
    /// so paths inside one module can stay unqualified.
    pub fn substm_by_arg(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.node(id)
            .substms
            .iter()
            .copied()
            .find(|&c| {
                let child = self.node(c);
                child.arg == name || child.local_name() == name
            })
    }

    /// Child with the given absolute SID
    pub fn substm_by_sid(&self, id: NodeId, sid: i64) -> Option<NodeId> {
        self.node(id)
            .substms
            .iter()
            .copied()
            .find(|&c| self.node(c).sid == Some(sid))
    }

    /// Walk `segments` starting from `start`
    ///
    /// `..` ascends; under an rpc or action the `input`/`output` segments
    /// select the implicit child of that keyword.
    pub fn resolve_schema_path(&self, start: NodeId, segments: &[&str]) -> Option<NodeId> {
        let mut cur = start;
        for seg in segments {
            if seg.is_empty() {
                continue;
            }
            if *seg == ".." {
                cur = self.node(cur).parent?;
                continue;
            }
            let here = self.node(cur);
            if matches!(here.keyword, Keyword::Rpc | Keyword::Action)
                && (*seg == "input" || *seg == "output")
            {
                let want = if *seg == "input" {
                    Keyword::Input
                } else {
                    Keyword::Output
                };
                cur = here
                    .substms
                    .iter()
                    .copied()
                    .find(|&c| self.node(c).keyword == want)?;
                continue;
            }
            cur = self.data_child_by_arg(cur, seg)?;
        }
        Some(cur)
    }

    /// Depth-first search for a SID anywhere in the tree
    ///
    /// Returns the node and the root-to-node path (root excluded).
    pub fn find_by_sid(&self, sid: i64) -> Option<(NodeId, Vec<NodeId>)> {
        let mut path = Vec::new();
        self.dfs_sid(Self::ROOT, sid, &mut path).map(|id| (id, path))
    }

    fn dfs_sid(&self, cur: NodeId, sid: i64, path: &mut Vec<NodeId>) -> Option<NodeId> {
        for &child in &self.node(cur).substms {
            path.push(child);
            if self.node(child).sid == Some(sid) {
                return Some(child);
            }
            if let Some(found) = self.dfs_sid(child, sid, path) {
                return Some(found);
            }
            path.pop();
        }
        None
    }

    /// Locate an `identity` statement by (optionally qualified) name
    pub fn find_identity(&self, name: &str) -> Option<NodeId> {
        let (module, local) = match name.split_once(':') {
            Some((m, n)) => (Some(m), n),
            None => (None, name),
        };
        self.identities().find(|&id| {
            let stm = self.node(id);
            stm.local_name() == local
                && module.map_or(true, |m| {
                    stm.module_prefix().map_or(true, |prefix| prefix == m)
                })
        })
    }

    /// True when `identity` (or one of its bases, transitively) is named
    /// `base`
    pub fn identity_derives_from(&self, identity: NodeId, base: &str) -> bool {
        let stm = self.node(identity);
        if stm.local_name() == strip_prefix(base) {
            return true;
        }
        stm.bases.iter().any(|b| {
            self.find_identity(b)
                .map_or(false, |parent| self.identity_derives_from(parent, base))
        })
    }

    fn identities(&self) -> impl Iterator<Item = NodeId> + '_ {
        (1..self.arena.len()).filter(|&id| self.node(id).keyword == Keyword::Identity)
    }

    /// Reorder every list's substatements so key leaves come first in
    /// `key` statement order
    pub fn hoist_list_keys(&mut self) {
        for id in 0..self.arena.len() {
            if self.node(id).keyword != Keyword::List || self.node(id).keys.is_empty() {
                continue;
            }
            let keys = self.node(id).keys.clone();
            let substms = self.node(id).substms.clone();
            let mut front: Vec<NodeId> = Vec::with_capacity(keys.len());
            for key in &keys {
                if let Some(&k) = substms
                    .iter()
                    .find(|&&c| self.node(c).local_name() == key.as_str())
                {
                    front.push(k);
                }
            }
            let rest: Vec<NodeId> = substms
                .iter()
                .copied()
                .filter(|c| !front.contains(c))
                .collect();
            front.extend(rest);
            self.node_mut(id).substms = front;
        }
    }

    /// Fill every leafref's target id by resolving its path
    pub fn resolve_leafrefs(&mut self) {
        for id in 0..self.arena.len() {
            let path = match self.node(id).typ.as_ref().and_then(|t| t.leafref_path.clone()) {
                Some(p) => p,
                None => continue,
            };
            // relative paths are evaluated from the leaf itself, so the
            // leading `..` steps to its parent
            let start = if path.starts_with('/') { Self::ROOT } else { id };
            let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
            match self.resolve_schema_path(start, &segments) {
                Some(target) => {
                    if let Some(typ) = self.node_mut(id).typ.as_mut() {
                        typ.leafref = Some(target);
                    }
                }
                None => log::warn!("unresolvable leafref path {:?}", path),
            }
        }
    }

    /// Children as they appear in instance data
    ///
    /// Modules hanging off the synthetic root and choice/case layers do
    /// not occur in instance trees, so lookups descend through them.
    pub fn data_children(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_data_children(id, id == Self::ROOT, &mut out);
        out
    }

    fn collect_data_children(&self, id: NodeId, at_root: bool, out: &mut Vec<NodeId>) {
        for &child in &self.node(id).substms {
            match self.node(child).keyword {
                Keyword::Choice | Keyword::Case => self.collect_data_children(child, false, out),
                Keyword::Module if at_root => self.collect_data_children(child, false, out),
                _ => out.push(child),
            }
        }
    }

    /// Instance-data child by (optionally qualified) name
    pub fn data_child_by_arg(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.data_children(id).into_iter().find(|&c| {
            let child = self.node(c);
            child.arg == name || child.local_name() == name
        })
    }

    /// Instance-data child by absolute SID
    pub fn data_child_by_sid(&self, id: NodeId, sid: i64) -> Option<NodeId> {
        self.data_children(id)
            .into_iter()
            .find(|&c| self.node(c).sid == Some(sid))
    }
}

/// Drop a `module:` qualifier if present
pub fn strip_prefix(name: &str) -> &str {
    match name.split_once(':') {
        Some((_, local)) => local,
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interfaces_schema() -> Schema {
        let mut s = Schema::new();
        let module = s.add_node(
            Schema::ROOT,
            Statement::new(Keyword::Module, "ietf-interfaces"),
        );
        let container = s.add_node(
            module,
            Statement::new(Keyword::Container, "ietf-interfaces:interfaces").with_sid(1500),
        );
        let list = s.add_node(
            container,
            Statement::new(Keyword::List, "interface")
                .with_sid(1505)
                .with_keys(&["name"]),
        );
        s.add_node(
            list,
            Statement::new(Keyword::Leaf, "enabled")
                .with_sid(1510)
                .with_type(TypeSpec::named("boolean")),
        );
        s.add_node(
            list,
            Statement::new(Keyword::Leaf, "name")
                .with_sid(1506)
                .with_type(TypeSpec::named("string")),
        );
        let rpc = s.add_node(
            module,
            Statement::new(Keyword::Rpc, "ietf-interfaces:restart").with_sid(1600),
        );
        let input = s.add_node(rpc, Statement::new(Keyword::Input, "input").with_sid(1601));
        s.add_node(
            input,
            Statement::new(Keyword::Leaf, "delay")
                .with_sid(1602)
                .with_type(TypeSpec::named("uint32")),
        );
        s.hoist_list_keys();
        s
    }

    #[test]
    fn test_resolve_simple_path() {
        let s = interfaces_schema();
        let node = s
            .resolve_schema_path(
                Schema::ROOT,
                &["ietf-interfaces:interfaces", "interface", "enabled"],
            )
            .unwrap();
        assert_eq!(s.node(node).sid, Some(1510));
    }

    #[test]
    fn test_resolve_unqualified_module_name() {
        let s = interfaces_schema();
        assert!(s
            .resolve_schema_path(Schema::ROOT, &["interfaces", "interface"])
            .is_some());
    }

    #[test]
    fn test_resolve_dotdot_ascends() {
        let s = interfaces_schema();
        let leaf = s
            .resolve_schema_path(Schema::ROOT, &["interfaces", "interface", "name"])
            .unwrap();
        let sibling = s.resolve_schema_path(leaf, &["..", "enabled"]).unwrap();
        assert_eq!(s.node(sibling).sid, Some(1510));
    }

    #[test]
    fn test_rpc_input_is_selected_by_segment() {
        let s = interfaces_schema();
        let delay = s
            .resolve_schema_path(Schema::ROOT, &["restart", "input", "delay"])
            .unwrap();
        assert_eq!(s.node(delay).sid, Some(1602));
    }

    #[test]
    fn test_find_by_sid_returns_path() {
        let s = interfaces_schema();
        let (node, path) = s.find_by_sid(1510).unwrap();
        assert_eq!(s.node(node).arg, "enabled");
        let args: Vec<&str> = path.iter().map(|&id| s.node(id).local_name()).collect();
        assert_eq!(
            args,
            vec!["ietf-interfaces", "interfaces", "interface", "enabled"]
        );
    }

    #[test]
    fn test_list_keys_are_hoisted_first() {
        let s = interfaces_schema();
        let list = s
            .resolve_schema_path(Schema::ROOT, &["interfaces", "interface"])
            .unwrap();
        let first = s.node(list).substms[0];
        assert_eq!(s.node(first).arg, "name");
    }

    #[test]
    fn test_substm_by_sid() {
        let s = interfaces_schema();
        let list = s
            .resolve_schema_path(Schema::ROOT, &["interfaces", "interface"])
            .unwrap();
        let enabled = s.substm_by_sid(list, 1510).unwrap();
        assert_eq!(s.node(enabled).arg, "enabled");
        assert!(s.substm_by_sid(list, 9999).is_none());
    }

    #[test]
    fn test_identity_derivation() {
        let mut s = Schema::new();
        let module = s.add_node(Schema::ROOT, Statement::new(Keyword::Module, "iana-if-type"));
        s.add_node(
            module,
            Statement::new(Keyword::Identity, "iana-if-type:interface-type").with_sid(1850),
        );
        let eth = s.add_node(
            module,
            Statement::new(Keyword::Identity, "iana-if-type:ethernetCsmacd")
                .with_sid(1880)
                .with_bases(&["interface-type"]),
        );

        assert_eq!(s.find_identity("iana-if-type:ethernetCsmacd"), Some(eth));
        assert_eq!(s.find_identity("ethernetCsmacd"), Some(eth));
        assert!(s.identity_derives_from(eth, "interface-type"));
        assert!(s.identity_derives_from(eth, "ethernetCsmacd"));
        assert!(!s.identity_derives_from(eth, "tunnel"));
    }

    #[test]
    fn test_leafref_resolution() {
        let mut s = interfaces_schema();
        let list = s
            .resolve_schema_path(Schema::ROOT, &["interfaces", "interface"])
            .unwrap();
        let mut typ = TypeSpec::named("leafref");
        typ.leafref_path = Some("../name".to_string());
        s.add_node(
            list,
            Statement::new(Keyword::Leaf, "alias").with_sid(1520).with_type(typ),
        );
        s.resolve_leafrefs();

        let alias = s.resolve_schema_path(list, &["alias"]).unwrap();
        let target = s.node(alias).typ.as_ref().unwrap().leafref.unwrap();
        assert_eq!(s.node(target).arg, "name");
    }
}
