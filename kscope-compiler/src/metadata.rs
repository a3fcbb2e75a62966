//! Analyzer-populated dictionaries and external resolvers
//!
//! The semantic analyzer runs before code generation and hands over these
//! tables read-mostly: the generator only writes argument offsets into the
//! format tables and interns names into the probe-id registry. Symbol and
//! wildcard resolution stay behind the `ProbeResolver` trait so the
//! generator never touches /proc, kallsyms, or ELF notes itself.

use crate::ast::AttachPoint;
use crate::types::{Field, SizedType, StackType, StructDef};
use std::collections::HashMap;

/// One registered map: the runtime-assigned id (used in async events), the
/// loaded map fd (patched into the program via the pseudo-fd relocation),
/// and the value type.
#[derive(Debug, Clone)]
pub struct MapInfo {
    pub id: u64,
    pub fd: i32,
    pub value_type: SizedType,
}

/// Per-location USDT argument specification.
#[derive(Debug, Clone, PartialEq)]
pub enum UsdtArg {
    Constant(i64),
    Register(String),
    /// Dereference `register + offset` in user memory.
    Memory { register: String, offset: i64 },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UsdtLocation {
    pub args: Vec<UsdtArg>,
}

/// USDT probe metadata: one probe name may be instantiated at several
/// binary locations, each with its own argument encodings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UsdtInfo {
    pub num_locations: usize,
    pub locations: Vec<UsdtLocation>,
}

/// Everything the analyzer resolved ahead of code generation.
#[derive(Debug, Default)]
pub struct TraceMetadata {
    pub enums: HashMap<String, i64>,
    pub structs: HashMap<String, StructDef>,
    pub maps: HashMap<String, MapInfo>,

    /// Per-call-site argument tables for format-string actions. Indexed by
    /// the per-probe call-site id; the generator fills in field offsets as
    /// it lays out each record struct.
    pub printf_args: Vec<(String, Vec<Field>)>,
    pub system_args: Vec<(String, Vec<Field>)>,
    pub cat_args: Vec<(String, Vec<Field>)>,
    /// Types of non-map `print()` call sites, indexed by id.
    pub non_map_print_args: Vec<SizedType>,

    /// Positional parameters (`$1` is `params[0]`).
    pub params: Vec<String>,

    /// Configured string buffer length for `str()` and string literals.
    pub strlen: u64,
    pub join_argnum: u32,
    pub join_argsize: u32,

    /// Process-wide registry backing the `probe` builtin.
    pub probe_ids: Vec<String>,

    pub pid: Option<u32>,
    /// Pid of the child the runtime spawned (`cpid` builtin).
    pub child_pid: Option<u32>,

    /// Internal maps the runtime pre-creates.
    pub elapsed_map: Option<MapInfo>,
    pub join_map: Option<MapInfo>,
    pub perf_event_map: Option<MapInfo>,
    pub stack_maps: HashMap<StackType, MapInfo>,
}

impl TraceMetadata {
    pub fn new() -> Self {
        TraceMetadata {
            strlen: 64,
            join_argnum: 16,
            join_argsize: 1024,
            ..Default::default()
        }
    }

    /// Positional parameter text. Out-of-range parameters read as `"0"`,
    /// or as the empty string when in string position.
    pub fn get_param(&self, n: usize, is_in_str: bool) -> String {
        if n == 0 || n > self.params.len() {
            return if is_in_str { String::new() } else { "0".to_string() };
        }
        self.params[n - 1].clone()
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    /// Intern a resolved probe name, returning its stable id.
    pub fn probe_id(&mut self, probefull: &str) -> u64 {
        match self.probe_ids.iter().position(|p| p == probefull) {
            Some(idx) => idx as u64,
            None => {
                self.probe_ids.push(probefull.to_string());
                (self.probe_ids.len() - 1) as u64
            }
        }
    }
}

/// External resolution the generator depends on but does not implement:
/// symbol lookup, wildcard expansion against the live system, and USDT
/// note parsing.
pub trait ProbeResolver {
    /// Resolve a kernel symbol to its address; unresolved names read as 0.
    fn resolve_kname(&self, name: &str) -> u64;

    /// Resolve a user-space symbol in `target`. Failure is a compile error
    /// at the call site.
    fn resolve_uname(&self, name: &str, target: &str) -> Option<u64>;

    fn resolve_cgroupid(&self, path: &str) -> u64;

    /// Expand a wildcard attach point to its concrete matches. Match
    /// strings carry the same colon-separated shape the provider expects
    /// (`category:func` for tracepoints, `target:ns:func` for USDT).
    fn find_wildcard_matches(&self, ap: &AttachPoint) -> Vec<String>;

    fn find_usdt(&self, pid: Option<u32>, target: &str, ns: &str, func: &str) -> Option<UsdtInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_param_out_of_range() {
        let mut meta = TraceMetadata::new();
        meta.params = vec!["123".to_string()];
        assert_eq!(meta.get_param(1, false), "123");
        assert_eq!(meta.get_param(2, false), "0");
        assert_eq!(meta.get_param(2, true), "");
    }

    #[test]
    fn test_probe_id_interning() {
        let mut meta = TraceMetadata::new();
        assert_eq!(meta.probe_id("kprobe:a"), 0);
        assert_eq!(meta.probe_id("kprobe:b"), 1);
        assert_eq!(meta.probe_id("kprobe:a"), 0);
    }
}
