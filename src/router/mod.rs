// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Trie-based signal router (C3): compiles route specs into a prefix
//! trie, score-ranks matches, and returns ordered targets.
//!
//! Route targets are opaque to the router itself; here they are a tagged
//! enum kept monomorphic on the hot path.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use arc_swap::ArcSwap;
use serde_json::Value;
use thiserror::Error;

use crate::signal::Signal;

/// A dispatch target reached by a matching route.
#[derive(Debug, Clone)]
pub enum Target {
    /// An opaque named target (a subscription id, typically).
    Atom(String),
    /// A module/opts pair, e.g. an adapter call.
    AdapterCall(String, Value),
    /// Several targets expanding in declaration order.
    Multi(Vec<Target>),
}

/// A predicate evaluated against a signal after a trie match succeeds.
pub type MatchFn = Arc<dyn Fn(&Signal) -> bool + Send + Sync>;

/// Errors raised by router operations.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The pattern violated the path grammar.
    #[error("invalid route path `{0}`")]
    InvalidPath(String),
    /// Two routes share identical path and priority with no
    /// `on_conflict: replace` marker.
    #[error("route conflict at path `{path}` priority {priority}")]
    RouteConflict {
        /// The conflicting path.
        path: String,
        /// The shared priority.
        priority: i8,
    },
    /// `route()` was called with an empty signal type.
    #[error("nil signal type")]
    NilType,
    /// `route()` matched no subscriptions.
    #[error("no handlers for signal")]
    NoHandlers,
}

/// What happens when `add` finds an existing route at the same path and
/// priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnConflict {
    /// Reject the add with [`RouterError::RouteConflict`].
    #[default]
    Reject,
    /// Replace the existing route.
    Replace,
}

/// A route registered with the router.
#[derive(Clone)]
pub struct Route {
    /// Dot-separated pattern, e.g. `"order.*"` or `"audit.**"`.
    pub path: String,
    /// What to dispatch to when this route matches.
    pub target: Target,
    /// Tie-break priority, -100..=100, default 0.
    pub priority: i8,
    /// Optional guard evaluated after a structural match.
    pub match_fn: Option<MatchFn>,
    /// What to do if a route already exists at `(path, priority)`.
    pub on_conflict: OnConflict,
    /// Monotonic insertion order, used as the final tie-break.
    seq: u64,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("path", &self.path)
            .field("priority", &self.priority)
            .field("has_match_fn", &self.match_fn.is_some())
            .field("seq", &self.seq)
            .finish()
    }
}

impl Route {
    /// Builds a route with default priority 0, no predicate, reject on
    /// conflict.
    #[must_use]
    pub fn new(path: impl Into<String>, target: Target) -> Self {
        Self {
            path: path.into(),
            target,
            priority: 0,
            match_fn: None,
            on_conflict: OnConflict::Reject,
            seq: 0,
        }
    }

    /// Sets the tie-break priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i8) -> Self {
        self.priority = priority;
        self
    }

    /// Attaches a predicate guard.
    #[must_use]
    pub fn with_match_fn(mut self, f: MatchFn) -> Self {
        self.match_fn = Some(f);
        self
    }

    /// Allows this route to silently replace one already registered at
    /// the same `(path, priority)`.
    #[must_use]
    pub fn replace_on_conflict(mut self) -> Self {
        self.on_conflict = OnConflict::Replace;
        self
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Segment<'a> {
    Literal(&'a str),
    Single,
    Multi,
}

fn parse_pattern(path: &str) -> Result<Vec<Segment<'_>>, RouterError> {
    if path.is_empty() {
        return Err(RouterError::InvalidPath(path.to_string()));
    }
    if path.starts_with('.') || path.ends_with('.') || path.contains("..") {
        return Err(RouterError::InvalidPath(path.to_string()));
    }
    let raw_segments: Vec<&str> = path.split('.').collect();
    let mut segments = Vec::with_capacity(raw_segments.len());
    let mut prev_was_multi = false;
    for seg in raw_segments {
        if seg.is_empty()
            || !seg
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'*' | b'-'))
        {
            return Err(RouterError::InvalidPath(path.to_string()));
        }
        let parsed = if seg == "**" {
            if prev_was_multi {
                return Err(RouterError::InvalidPath(path.to_string()));
            }
            Segment::Multi
        } else if seg == "*" {
            Segment::Single
        } else if seg.contains('*') {
            // a literal segment containing a stray `*` (not a full wildcard
            // token) is not a valid pattern grammar.
            return Err(RouterError::InvalidPath(path.to_string()));
        } else {
            Segment::Literal(seg)
        };
        prev_was_multi = parsed == Segment::Multi;
        segments.push(parsed);
    }
    Ok(segments)
}

/// Checks whether `type_str` matches `pattern`, without building a trie.
/// Constant-memory two-pointer matcher, used where building a full trie
/// would be overkill for a single pattern/type check.
#[must_use]
pub fn matches(type_str: &str, pattern: &str) -> bool {
    let Ok(pat) = parse_pattern(pattern) else {
        return false;
    };
    let tokens: Vec<&str> = type_str.split('.').collect();
    matches_segments(&tokens, &pat)
}

fn matches_segments(tokens: &[&str], pat: &[Segment<'_>]) -> bool {
    match pat.first() {
        None => tokens.is_empty(),
        Some(Segment::Literal(lit)) => {
            !tokens.is_empty() && tokens[0] == *lit && matches_segments(&tokens[1..], &pat[1..])
        }
        Some(Segment::Single) => {
            !tokens.is_empty() && matches_segments(&tokens[1..], &pat[1..])
        }
        Some(Segment::Multi) => {
            for consume in 0..=tokens.len() {
                if matches_segments(&tokens[consume..], &pat[1..]) {
                    return true;
                }
            }
            false
        }
    }
}

#[derive(Default)]
struct Node {
    literal_children: HashMap<String, Box<Node>>,
    single_child: Option<Box<Node>>,
    multi_child: Option<Box<Node>>,
    routes: Vec<Route>,
}

impl Node {
    fn insert(&mut self, pat: &[Segment<'_>], route: Route) -> Result<(), RouterError> {
        match pat.first() {
            None => {
                if let Some(existing) = self
                    .routes
                    .iter()
                    .position(|r| r.priority == route.priority)
                {
                    if route.on_conflict == OnConflict::Replace {
                        self.routes[existing] = route;
                        Ok(())
                    } else {
                        Err(RouterError::RouteConflict {
                            path: route.path.clone(),
                            priority: route.priority,
                        })
                    }
                } else {
                    self.routes.push(route);
                    Ok(())
                }
            }
            Some(Segment::Literal(lit)) => self
                .literal_children
                .entry((*lit).to_string())
                .or_default()
                .insert(&pat[1..], route),
            Some(Segment::Single) => self
                .single_child
                .get_or_insert_with(Box::default)
                .insert(&pat[1..], route),
            Some(Segment::Multi) => self
                .multi_child
                .get_or_insert_with(Box::default)
                .insert(&pat[1..], route),
        }
    }

    fn remove(&mut self, pat: &[Segment<'_>]) -> usize {
        match pat.first() {
            None => {
                let n = self.routes.len();
                self.routes.clear();
                n
            }
            Some(Segment::Literal(lit)) => self
                .literal_children
                .get_mut(*lit)
                .map_or(0, |child| child.remove(&pat[1..])),
            Some(Segment::Single) => self
                .single_child
                .as_mut()
                .map_or(0, |child| child.remove(&pat[1..])),
            Some(Segment::Multi) => self
                .multi_child
                .as_mut()
                .map_or(0, |child| child.remove(&pat[1..])),
        }
    }

    /// Walks the trie against `tokens`, accumulating `(route, score)` for
    /// every terminal reached, where `score` already includes the penalty
    /// for the wildcard edges taken to reach it.
    fn collect<'a>(
        &'a self,
        tokens: &[&str],
        depth: usize,
        total_len: usize,
        penalty_acc: i64,
        out: &mut Vec<(&'a Route, i64)>,
    ) {
        if tokens.is_empty() {
            if !self.routes.is_empty() {
                let base = 2000 * total_len as i64 + 3000 * exact_weight_sum(total_len, depth);
                for route in &self.routes {
                    out.push((route, base - penalty_acc));
                }
            }
        } else {
            if let Some(child) = self.literal_children.get(tokens[0]) {
                child.collect(&tokens[1..], depth + 1, total_len, penalty_acc, out);
            }
            if let Some(child) = &self.single_child {
                let penalty = 1000 - 100 * depth as i64;
                child.collect(&tokens[1..], depth + 1, total_len, penalty_acc + penalty, out);
            }
        }

        // `**` may also consume zero trailing segments, so this child is
        // reachable even once `tokens` has already run out.
        if let Some(child) = &self.multi_child {
            let penalty = 2000 - 200 * depth as i64;
            for consume in 0..=tokens.len() {
                child.collect(
                    &tokens[consume..],
                    depth + 1,
                    total_len,
                    penalty_acc + penalty,
                    out,
                );
            }
        }
    }
}

/// `Σ exact_weight(pos)`: every consumed segment contributes weight 1,
/// with wildcard edges already penalized separately via `penalty_acc`.
fn exact_weight_sum(_total_len: usize, depth: usize) -> i64 {
    depth as i64
}

/// A compiled trie snapshot, cheap to clone (all nodes behind `Arc`-free
/// plain ownership since the whole tree is rebuilt on write).
#[derive(Default)]
struct Trie {
    root: Node,
    next_seq: u64,
}

impl Trie {
    fn add(&mut self, mut route: Route) -> Result<(), RouterError> {
        let pat = parse_pattern(&route.path)?;
        route.seq = self.next_seq;
        self.next_seq += 1;
        self.root.insert(&pat, route)
    }

    fn remove(&mut self, path: &str) -> Result<usize, RouterError> {
        let pat = parse_pattern(path)?;
        Ok(self.root.remove(&pat))
    }

    fn route(&self, signal: &Signal) -> Result<Vec<Target>, RouterError> {
        if signal.signal_type.is_empty() {
            return Err(RouterError::NilType);
        }
        let tokens = signal.type_segments();
        let mut hits = Vec::new();
        self.root.collect(&tokens, 0, tokens.len(), 0, &mut hits);

        let mut scored: Vec<(&Route, i64)> = hits
            .into_iter()
            .filter(|(route, _)| route.match_fn.as_ref().is_none_or(|f| f(signal)))
            .collect();
        if scored.is_empty() {
            return Err(RouterError::NoHandlers);
        }
        scored.sort_by(|(ra, sa), (rb, sb)| {
            sb.cmp(sa)
                .then_with(|| rb.priority.cmp(&ra.priority))
                .then_with(|| ra.seq.cmp(&rb.seq))
        });
        Ok(scored.into_iter().map(|(r, _)| r.target.clone()).collect())
    }
}

/// RCU-style shared router: readers take a lock-free snapshot via
/// `ArcSwap`; writers rebuild and publish a new snapshot.
pub struct SharedRouter {
    snapshot: ArcSwap<Trie>,
    write_lock: Mutex<()>,
}

impl Default for SharedRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::new(Arc::new(Trie::default())),
            write_lock: Mutex::new(()),
        }
    }

    /// Adds routes, rebuilding and publishing a new trie snapshot.
    /// Returns the total route count across the whole trie after the add.
    pub fn add(&self, routes: Vec<Route>) -> Result<usize, RouterError> {
        let _guard = self.write_lock.lock().expect("router write lock poisoned");
        let current = self.snapshot.load();
        let mut next = Trie {
            root: clone_node(&current.root),
            next_seq: current.next_seq,
        };
        for route in routes {
            next.add(route)?;
        }
        let count = count_routes(&next.root);
        self.snapshot.store(Arc::new(next));
        Ok(count)
    }

    /// Removes every route registered at any of `paths`. Returns the
    /// number of routes removed.
    pub fn remove(&self, paths: &[String]) -> Result<usize, RouterError> {
        let _guard = self.write_lock.lock().expect("router write lock poisoned");
        let current = self.snapshot.load();
        let mut next = Trie {
            root: clone_node(&current.root),
            next_seq: current.next_seq,
        };
        let mut removed = 0;
        for path in paths {
            removed += next.remove(path)?;
        }
        self.snapshot.store(Arc::new(next));
        Ok(removed)
    }

    /// Routes `signal` against the current snapshot, returning ordered
    /// targets or a routing error.
    pub fn route(&self, signal: &Signal) -> Result<Vec<Target>, RouterError> {
        self.snapshot.load().route(signal)
    }

    /// Filters `signals` to those whose type matches `pattern`.
    #[must_use]
    pub fn filter<'a>(&self, signals: &'a [Signal], pattern: &str) -> Vec<&'a Signal> {
        signals
            .iter()
            .filter(|s| matches(&s.signal_type, pattern))
            .collect()
    }
}

fn clone_node(node: &Node) -> Node {
    Node {
        literal_children: node
            .literal_children
            .iter()
            .map(|(k, v)| (k.clone(), Box::new(clone_node(v))))
            .collect(),
        single_child: node.single_child.as_ref().map(|c| Box::new(clone_node(c))),
        multi_child: node.multi_child.as_ref().map(|c| Box::new(clone_node(c))),
        routes: node.routes.clone(),
    }
}

fn count_routes(node: &Node) -> usize {
    let mut n = node.routes.len();
    for child in node.literal_children.values() {
        n += count_routes(child);
    }
    if let Some(child) = &node.single_child {
        n += count_routes(child);
    }
    if let Some(child) = &node.multi_child {
        n += count_routes(child);
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sig(t: &str) -> Signal {
        let g = crate::signal::IdGenerator::new();
        crate::signal::Signal::new(&g, t, "test", json!(null)).expect("valid signal")
    }

    #[test]
    fn exact_route_matches_and_misses() {
        let router = SharedRouter::new();
        router
            .add(vec![Route::new("user.created", Target::Atom("T1".into()))])
            .expect("add");

        let targets = router.route(&sig("user.created")).expect("routed");
        assert_eq!(targets.len(), 1);

        let err = router.route(&sig("user.updated")).unwrap_err();
        assert!(matches!(err, RouterError::NoHandlers));
    }

    #[test]
    fn priority_tie_break_orders_specific_route_first() {
        let router = SharedRouter::new();
        router
            .add(vec![
                Route::new("a.b", Target::Atom("T1".into())).with_priority(0),
                Route::new("a.*", Target::Atom("T2".into())).with_priority(10),
            ])
            .expect("add");

        let targets = router.route(&sig("a.b")).expect("routed");
        let names: Vec<String> = targets
            .iter()
            .map(|t| match t {
                Target::Atom(s) => s.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(names, vec!["T1".to_string(), "T2".to_string()]);
    }

    #[test]
    fn multi_segment_wildcard_matches_trailing_depths() {
        let router = SharedRouter::new();
        router
            .add(vec![Route::new("audit.**", Target::Atom("T".into()))])
            .expect("add");

        assert!(router.route(&sig("audit")).is_ok());
        assert!(router.route(&sig("audit.user")).is_ok());
        assert!(router.route(&sig("audit.user.created")).is_ok());
    }

    #[test]
    fn single_wildcard_requires_exactly_one_segment() {
        assert!(matches("a.b", "a.*"));
        assert!(!matches("a", "a.*"));
    }

    #[test]
    fn multi_wildcard_at_end_matches_zero_or_more() {
        assert!(matches("a", "a.**"));
        assert!(matches("a.b", "a.**"));
        assert!(matches("a.b.c", "a.**"));
    }

    #[test]
    fn route_conflict_rejected_without_replace_marker() {
        let router = SharedRouter::new();
        router
            .add(vec![Route::new("x.y", Target::Atom("T1".into()))])
            .expect("add");
        let err = router
            .add(vec![Route::new("x.y", Target::Atom("T2".into()))])
            .unwrap_err();
        assert!(matches!(err, RouterError::RouteConflict { .. }));
    }

    #[test]
    fn route_conflict_allowed_with_replace_marker() {
        let router = SharedRouter::new();
        router
            .add(vec![Route::new("x.y", Target::Atom("T1".into()))])
            .expect("add");
        router
            .add(vec![
                Route::new("x.y", Target::Atom("T2".into())).replace_on_conflict(),
            ])
            .expect("replace should succeed");
        let targets = router.route(&sig("x.y")).expect("routed");
        assert_eq!(targets.len(), 1);
    }

    #[test]
    fn predicate_route_is_filtered_after_structural_match() {
        let router = SharedRouter::new();
        let guard: MatchFn = Arc::new(|s: &Signal| s.source == "trusted");
        router
            .add(vec![
                Route::new("evt.x", Target::Atom("T".into())).with_match_fn(guard),
            ])
            .expect("add");

        let g = crate::signal::IdGenerator::new();
        let trusted = crate::signal::Signal::new(&g, "evt.x", "trusted", json!(null)).unwrap();
        let untrusted = crate::signal::Signal::new(&g, "evt.x", "other", json!(null)).unwrap();

        assert!(router.route(&trusted).is_ok());
        assert!(matches!(
            router.route(&untrusted).unwrap_err(),
            RouterError::NoHandlers
        ));
    }

    #[test]
    fn nil_type_is_a_routing_error() {
        let router = SharedRouter::new();
        let g = crate::signal::IdGenerator::new();
        let mut empty = crate::signal::Signal::new(&g, "a", "s", json!(null)).unwrap();
        empty.signal_type.clear();
        assert!(matches!(
            router.route(&empty).unwrap_err(),
            RouterError::NilType
        ));
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        assert!(parse_pattern("a..b").is_err());
        assert!(parse_pattern(".a").is_err());
        assert!(parse_pattern("a.").is_err());
        assert!(parse_pattern("a.**.**").is_err());
        assert!(parse_pattern("a b").is_err());
    }

    #[test]
    fn remove_drops_routes_at_path() {
        let router = SharedRouter::new();
        router
            .add(vec![Route::new("x.y", Target::Atom("T1".into()))])
            .expect("add");
        let removed = router.remove(&["x.y".to_string()]).expect("remove");
        assert_eq!(removed, 1);
        assert!(matches!(
            router.route(&sig("x.y")).unwrap_err(),
            RouterError::NoHandlers
        ));
    }
}
