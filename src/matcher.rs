/// Attributes live processes to a project
///
/// Two independent signals, unioned by PID:
/// 1. a listening socket on one of the project's ports (strongest signal)
/// 2. cwd inside the project directory OR a command line containing one of its patterns.
///    This rule only runs when the project has BOTH a path and at least one pattern.
///
/// Finding nothing is the normal "not running" answer, never an error.
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::MAIN_SEPARATOR;

use crate::project::ProjectDescriptor;
use crate::snapshot::{ProcessRecord, ProcessSnapshot};

/// Which rules confirmed a process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatchReasons {
    pub port: bool,
    pub cwd: bool,
    pub pattern: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedProcess {
    pub record: ProcessRecord,
    pub reasons: MatchReasons,
}

/// Processes attributed to one project for one pass, keyed by PID
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchedProcessSet {
    processes: BTreeMap<u32, MatchedProcess>,
}

impl MatchedProcessSet {
    fn confirm(&mut self, record: &ProcessRecord, mark: impl FnOnce(&mut MatchReasons)) {
        let matched = self.processes.entry(record.pid).or_insert_with(|| MatchedProcess {
            record: record.clone(),
            reasons: MatchReasons::default(),
        });
        mark(&mut matched.reasons);
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.processes.contains_key(&pid)
    }

    pub fn get(&self, pid: u32) -> Option<&MatchedProcess> {
        self.processes.get(&pid)
    }

    pub fn pids(&self) -> impl Iterator<Item = u32> + '_ {
        self.processes.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MatchedProcess> {
        self.processes.values()
    }
}

/// Strip trailing separators so `/app/` and `/app` behave the same
pub fn normalize_path(path: &str) -> &str {
    path.trim_end_matches(MAIN_SEPARATOR)
}

/// Exact subtree containment: `/app` holds `/app` and `/app/x`, not `/app-other`.
/// An empty (or root-only) project path contains nothing.
pub fn cwd_within(cwd: &str, project_path: &str) -> bool {
    let root = normalize_path(project_path);
    if root.is_empty() {
        return false;
    }
    let cwd = normalize_path(cwd);
    cwd == root
        || cwd
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with(MAIN_SEPARATOR))
}

/// Case-insensitive substring match against any pattern; blank patterns never match
pub fn cmdline_matches(cmdline: &str, patterns: &[String]) -> bool {
    let cmdline = cmdline.to_lowercase();
    patterns
        .iter()
        .map(|pattern| pattern.trim())
        .filter(|pattern| !pattern.is_empty())
        .any(|pattern| cmdline.contains(&pattern.to_lowercase()))
}

pub struct ProcessMatcher {
    self_name: String,
}

impl ProcessMatcher {
    /// `self_name` is our own invocation name; command lines containing it are never
    /// claimed by the pattern rule
    pub fn new(self_name: impl Into<String>) -> Self {
        Self {
            self_name: self_name.into(),
        }
    }

    fn is_self(&self, cmdline: &str) -> bool {
        !self.self_name.is_empty() && cmdline.contains(&self.self_name)
    }

    /// Match using the descriptor's configured ports
    pub fn match_processes(&self, descriptor: &ProjectDescriptor, snapshot: &ProcessSnapshot) -> MatchedProcessSet {
        self.match_with_ports(descriptor, &descriptor.configured_ports, snapshot)
    }

    /// Match using an already-resolved port list in place of the configured one
    pub fn match_with_ports(
        &self,
        descriptor: &ProjectDescriptor,
        ports: &[u16],
        snapshot: &ProcessSnapshot,
    ) -> MatchedProcessSet {
        let mut matched = MatchedProcessSet::default();

        if !ports.is_empty() {
            for socket in snapshot.sockets().iter().filter(|s| ports.contains(&s.port)) {
                if let Some(record) = socket.pid.and_then(|pid| snapshot.process(pid)) {
                    matched.confirm(record, |reasons| reasons.port = true);
                }
            }
        }

        if !descriptor.path.is_empty() && !descriptor.process_patterns.is_empty() {
            for record in snapshot.processes() {
                let cmdline = record.cmdline.as_deref().unwrap_or("");
                if self.is_self(cmdline) {
                    continue;
                }
                let by_cwd = record
                    .cwd
                    .as_deref()
                    .is_some_and(|cwd| cwd_within(cwd, &descriptor.path));
                let by_pattern = cmdline_matches(cmdline, &descriptor.process_patterns);
                if by_cwd || by_pattern {
                    matched.confirm(record, |reasons| {
                        reasons.cwd |= by_cwd;
                        reasons.pattern |= by_pattern;
                    });
                }
            }
        }

        matched
    }
}
