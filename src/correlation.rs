//! Reply-correlation primitives shared by the channels.
//!
//! Bounded insertion-ordered tables for provider-message-id tracking, and
//! the `[CC-<hex>]` session prefix carried in outbound subjects/bodies.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::LazyLock;

use regex::Regex;

/// Maximum entries a correlation table holds before eviction kicks in.
pub const CORRELATION_TABLE_CAP: usize = 10_000;

static CC_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[CC-([0-9a-fA-F]+)\]\s*").expect("valid regex"));

/// Format the session prefix attached to outbound subjects and bodies.
pub fn session_prefix(session_id: &str) -> String {
    format!("[CC-{session_id}]")
}

/// Extract a `[CC-<hex>]` session id from free text.
///
/// Returns the session id and the text with the prefix (and any trailing
/// whitespace) stripped. `"[CC-abc123]hello"` resolves to `("abc123", "hello")`.
pub fn extract_session_prefix(text: &str) -> Option<(String, String)> {
    let caps = CC_PREFIX_RE.captures(text)?;
    let session_id = caps.get(1)?.as_str().to_string();
    let whole = caps.get(0)?;
    let mut stripped = String::with_capacity(text.len());
    stripped.push_str(&text[..whole.start()]);
    stripped.push_str(&text[whole.end()..]);
    Some((session_id, stripped.trim().to_string()))
}

/// Insertion-ordered map capped at `cap` entries.
///
/// On overflow the oldest half is evicted and the newest half retained, so
/// the table never grows unbounded regardless of correlation success.
#[derive(Debug)]
pub struct BoundedMap<K, V> {
    order: VecDeque<K>,
    entries: HashMap<K, V>,
    cap: usize,
}

impl<K: Eq + Hash + Clone, V> BoundedMap<K, V> {
    pub fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::new(),
            entries: HashMap::new(),
            cap,
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }
        if self.entries.len() > self.cap {
            self.evict_oldest_half();
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest_half(&mut self) {
        let evict = self.cap / 2;
        for _ in 0..evict {
            if let Some(key) = self.order.pop_front() {
                self.entries.remove(&key);
            }
        }
    }
}

/// Insertion-ordered dedup set with the same eviction policy as [`BoundedMap`].
#[derive(Debug)]
pub struct BoundedSet<K> {
    order: VecDeque<K>,
    entries: HashSet<K>,
    cap: usize,
}

impl<K: Eq + Hash + Clone> BoundedSet<K> {
    pub fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::new(),
            entries: HashSet::new(),
            cap,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Record a key. Returns `false` if it was already present.
    pub fn insert(&mut self, key: K) -> bool {
        if !self.entries.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        if self.entries.len() > self.cap {
            let evict = self.cap / 2;
            for _ in 0..evict {
                if let Some(old) = self.order.pop_front() {
                    self.entries.remove(&old);
                }
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
