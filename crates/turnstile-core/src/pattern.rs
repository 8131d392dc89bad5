//! User override patterns and the compiled-regex cache behind them.
//!
//! A pattern is either a glob (`npm run *`, `?` for one character) matched
//! against the whole command, or a regex written between slashes
//! (`/^make( -j\d+)?$/`, optional trailing `i` for case-insensitive).

use regex::Regex;
use std::collections::{HashMap, VecDeque};
use tracing::warn;

pub const REGEX_CACHE_CAPACITY: usize = 128;
pub const MAX_PATTERN_LEN: usize = 256;

/// Translate a pattern into regex source.
pub fn pattern_source(pattern: &str) -> String {
    let p = pattern.trim();
    if let Some(inner) = p.strip_prefix('/') {
        if let Some(body) = inner.strip_suffix("/i") {
            return format!("(?i){body}");
        }
        if let Some(body) = inner.strip_suffix('/') {
            return body.to_string();
        }
    }
    let mut out = String::with_capacity(p.len() + 8);
    out.push('^');
    for c in p.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

/// Reason a pattern cannot be used, or `None` when it compiles.
pub fn pattern_problem(pattern: &str) -> Option<String> {
    if pattern.trim().is_empty() {
        return Some("empty pattern".to_string());
    }
    if pattern.len() > MAX_PATTERN_LEN {
        return Some(format!("pattern longer than {MAX_PATTERN_LEN} characters"));
    }
    Regex::new(&pattern_source(pattern))
        .err()
        .map(|e| e.to_string())
}

// ---------------------------------------------------------------------------
// RegexCache
// ---------------------------------------------------------------------------

/// Bounded cache of compiled patterns. When full, the pattern compiled
/// earliest is evicted (FIFO, not LRU: hits do not refresh position).
#[derive(Debug)]
pub struct RegexCache {
    capacity: usize,
    entries: HashMap<String, Option<Regex>>,
    order: VecDeque<String>,
}

impl Default for RegexCache {
    fn default() -> Self {
        Self::new(REGEX_CACHE_CAPACITY)
    }
}

impl RegexCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.entries.contains_key(pattern)
    }

    /// Compiled form of `pattern`; `None` for patterns that do not compile
    /// (the failure is cached too, so it is reported once).
    pub fn get(&mut self, pattern: &str) -> Option<Regex> {
        if let Some(hit) = self.entries.get(pattern) {
            return hit.clone();
        }
        let compiled = if pattern.len() > MAX_PATTERN_LEN {
            warn!(len = pattern.len(), "override pattern too long; ignoring");
            None
        } else {
            match Regex::new(&pattern_source(pattern)) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern, error = %e, "invalid override pattern; ignoring");
                    None
                }
            }
        };
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(pattern.to_string());
        self.entries.insert(pattern.to_string(), compiled.clone());
        compiled
    }

    pub fn is_match(&mut self, pattern: &str, command: &str) -> bool {
        self.get(pattern).is_some_and(|re| re.is_match(command))
    }
}
