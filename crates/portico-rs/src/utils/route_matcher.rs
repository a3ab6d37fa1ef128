//! Two-tier route matching with compiled patterns.
//!
//! Tier 1 dispatches on the request path: an exact-path map for literal
//! patterns, then a segment trie for parameterized patterns, then a
//! longest-first prefix list. Tier 2 evaluates the predicate set (host,
//! headers, query, cookies, body fields) of every candidate sharing the
//! path key, ordered by specificity score with insertion order as the
//! stable tie-break.
//!
//! All patterns and regexes are compiled at construction; matching is
//! deterministic and performs no I/O.

use crate::models::http::GatewayRequest;
use crate::models::route::{Route, ValueMatch};
use crate::utils::path::segments;
use ahash::HashMap as AHashMap;
use ahash::HashMapExt;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouteMatchError {
    #[error("Invalid route pattern: {pattern}")]
    InvalidPattern { pattern: String },
    #[error("Regex compilation failed: {0}")]
    RegexError(String),
}

/// Compiled predicate matcher.
#[derive(Debug, Clone)]
enum CompiledMatch {
    Exact(String),
    Present(bool),
    Pattern(Arc<Regex>),
}

impl CompiledMatch {
    fn compile(matcher: &ValueMatch) -> Result<Self, RouteMatchError> {
        if let Some(value) = &matcher.value {
            return Ok(Self::Exact(value.clone()));
        }
        if let Some(present) = matcher.present {
            return Ok(Self::Present(present));
        }
        if let Some(pattern) = &matcher.pattern {
            let regex =
                Regex::new(pattern).map_err(|e| RouteMatchError::RegexError(e.to_string()))?;
            return Ok(Self::Pattern(Arc::new(regex)));
        }
        Err(RouteMatchError::InvalidPattern {
            pattern: "empty predicate".to_string(),
        })
    }

    /// Evaluates against an optionally-present value.
    fn evaluate(&self, value: Option<&str>) -> bool {
        match self {
            Self::Exact(expected) => value == Some(expected.as_str()),
            Self::Present(true) => value.is_some(),
            Self::Present(false) => value.is_none(),
            Self::Pattern(regex) => value.map(|v| regex.is_match(v)).unwrap_or(false),
        }
    }
}

/// Host predicate: exact name or `*.suffix` wildcard, compared without
/// port, case-insensitively.
#[derive(Debug, Clone)]
enum HostPattern {
    Exact(String),
    Suffix(String),
}

impl HostPattern {
    fn compile(pattern: &str) -> Self {
        let lowered = pattern.to_ascii_lowercase();
        match lowered.strip_prefix("*.") {
            Some(suffix) => Self::Suffix(format!(".{}", suffix)),
            None => Self::Exact(lowered),
        }
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            Self::Exact(expected) => host == expected,
            Self::Suffix(suffix) => host.ends_with(suffix.as_str()) && host.len() > suffix.len(),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledPredicate {
    name: String,
    matcher: CompiledMatch,
}

#[derive(Debug, Clone)]
struct CompiledBodyPredicate {
    /// Dotted JSON path split into segments; numeric segments index arrays.
    path: Vec<String>,
    matcher: CompiledMatch,
}

/// A route with its predicates compiled and its specificity precomputed.
#[derive(Debug)]
pub struct CompiledRoute {
    pub route: Arc<Route>,
    pub specificity: i32,
    pub insertion: usize,
    /// Parameter name per pattern segment; `None` for literal segments.
    param_slots: Vec<Option<String>>,
    hosts: Vec<HostPattern>,
    headers: Vec<CompiledPredicate>,
    query: Vec<CompiledPredicate>,
    cookies: Vec<CompiledPredicate>,
    body: Vec<CompiledBodyPredicate>,
}

impl CompiledRoute {
    fn compile(route: Route, insertion: usize) -> Result<Self, RouteMatchError> {
        let param_slots = segments(&route.path)
            .iter()
            .map(|seg| {
                seg.strip_prefix('{')
                    .and_then(|s| s.strip_suffix('}'))
                    .map(|s| s.to_string())
            })
            .collect();

        let compile_preds = |preds: &[crate::models::route::KeyPredicate],
                             lower_names: bool|
         -> Result<Vec<CompiledPredicate>, RouteMatchError> {
            preds
                .iter()
                .map(|p| {
                    Ok(CompiledPredicate {
                        name: if lower_names {
                            p.name.to_ascii_lowercase()
                        } else {
                            p.name.clone()
                        },
                        matcher: CompiledMatch::compile(&p.matcher)?,
                    })
                })
                .collect()
        };

        let hosts = route.hosts.iter().map(|h| HostPattern::compile(h)).collect();
        let headers = compile_preds(&route.headers, true)?;
        let query = compile_preds(&route.query, false)?;
        let cookies = compile_preds(&route.cookies, false)?;
        let body = route
            .body
            .iter()
            .map(|p| {
                Ok(CompiledBodyPredicate {
                    path: p.path.split('.').map(|s| s.to_string()).collect(),
                    matcher: CompiledMatch::compile(&p.matcher)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            specificity: route.specificity(),
            insertion,
            param_slots,
            hosts,
            headers,
            query,
            cookies,
            body,
            route: Arc::new(route),
        })
    }

    /// Tier-2 predicate evaluation, excluding the method check.
    fn predicates_match(&self, req: &GatewayRequest, max_body: usize) -> bool {
        if !self.hosts.is_empty() {
            let host = req.host_without_port();
            if !self.hosts.iter().any(|h| h.matches(&host)) {
                return false;
            }
        }

        for pred in &self.headers {
            if !pred.matcher.evaluate(req.header(&pred.name)) {
                return false;
            }
        }

        if !self.query.is_empty() {
            let pairs = req.query_pairs();
            for pred in &self.query {
                let value = pairs.iter().find(|(k, _)| *k == pred.name).map(|(_, v)| v.as_str());
                if !pred.matcher.evaluate(value) {
                    return false;
                }
            }
        }

        if !self.cookies.is_empty() {
            let cookies = req.cookies();
            for pred in &self.cookies {
                let value = cookies
                    .iter()
                    .find(|(k, _)| *k == pred.name)
                    .map(|(_, v)| v.as_str());
                if !pred.matcher.evaluate(value) {
                    return false;
                }
            }
        }

        if !self.body.is_empty() {
            // Oversized bodies fail body predicates rather than erroring.
            if req.body.len() > max_body {
                return false;
            }
            let Ok(parsed) = serde_json::from_slice::<serde_json::Value>(&req.body) else {
                return false;
            };
            for pred in &self.body {
                let value = lookup_json_path(&parsed, &pred.path);
                let rendered = value.map(render_json_leaf);
                if !pred.matcher.evaluate(rendered.as_deref()) {
                    return false;
                }
            }
        }

        true
    }

    /// Extracts `{param}` captures by zipping pattern slots with the
    /// request path segments. Caller guarantees equal segment counts.
    fn extract_params(&self, path: &str) -> HashMap<String, String> {
        let mut params = HashMap::new();
        for (slot, segment) in self.param_slots.iter().zip(segments(path)) {
            if let Some(name) = slot {
                params.insert(name.clone(), segment.to_string());
            }
        }
        params
    }
}

/// Walks a dotted path through a JSON document.
fn lookup_json_path<'a>(value: &'a serde_json::Value, path: &[String]) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// String form of a JSON leaf for predicate comparison.
fn render_json_leaf(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Outcome of a match attempt.
#[derive(Debug)]
pub enum MatchOutcome {
    /// Best route plus extracted path parameters.
    Matched {
        route: Arc<CompiledRoute>,
        params: HashMap<String, String>,
    },
    /// A candidate matched on everything except its method set. Surfaced
    /// so the handler can answer 405 instead of 404.
    MethodMismatch,
    NoMatch,
}

/// Trie node for parameterized patterns. Literal edges take priority over
/// the parameter edge during descent.
#[derive(Debug, Default)]
struct TrieNode {
    literal: AHashMap<String, TrieNode>,
    param: Option<Box<TrieNode>>,
    /// Indices into the matcher's route table terminating here.
    terminals: Vec<usize>,
}

impl TrieNode {
    fn insert(&mut self, pattern_segments: &[&str], index: usize) {
        match pattern_segments.split_first() {
            None => self.terminals.push(index),
            Some((head, rest)) => {
                let child = if head.starts_with('{') {
                    self.param.get_or_insert_with(Default::default)
                } else {
                    self.literal.entry(head.to_string()).or_default()
                };
                child.insert(rest, index);
            }
        }
    }

    /// Collects every terminal group reachable for the given path
    /// segments, literal branches first so more-literal patterns come out
    /// ahead of parameterized ones at equal specificity.
    fn collect<'a>(&'a self, path_segments: &[&str], out: &mut Vec<usize>) {
        match path_segments.split_first() {
            None => out.extend(&self.terminals),
            Some((head, rest)) => {
                if let Some(child) = self.literal.get(*head) {
                    child.collect(rest, out);
                }
                if let Some(child) = &self.param {
                    child.collect(rest, out);
                }
            }
        }
    }
}

/// High-performance two-tier route matcher with compiled patterns.
#[derive(Debug)]
pub struct RouteMatcher {
    routes: Vec<Arc<CompiledRoute>>,
    /// Tier 1a: exact literal paths (and prefix bases) to candidate groups.
    exact: AHashMap<String, Vec<usize>>,
    /// Tier 1b: parameterized patterns.
    trie: TrieNode,
    /// Prefix routes, longest base first.
    prefixes: Vec<(String, usize)>,
    /// Body bytes inspected by body predicates.
    max_match_body_size: usize,
}

impl RouteMatcher {
    /// Builds the matcher, compiling every pattern and predicate regex.
    pub fn new(routes: Vec<Route>, max_match_body_size: usize) -> Result<Self, RouteMatchError> {
        let mut compiled = Vec::with_capacity(routes.len());
        let mut exact: AHashMap<String, Vec<usize>> = AHashMap::new();
        let mut trie = TrieNode::default();
        let mut prefixes: Vec<(String, usize)> = Vec::new();

        for (insertion, route) in routes.into_iter().enumerate() {
            let index = compiled.len();
            let is_prefix = route.prefix;
            let path = route.path.clone();
            let parameterized = path.contains('{');
            compiled.push(Arc::new(CompiledRoute::compile(route, insertion)?));

            if is_prefix {
                let base = path.trim_end_matches('/').to_string();
                // The base itself also matches, so register it exactly.
                exact.entry(normalize(&base)).or_default().push(index);
                prefixes.push((normalize(&base), index));
            } else if parameterized {
                trie.insert(&segments(&path), index);
            } else {
                exact.entry(normalize(&path)).or_default().push(index);
            }
        }

        // Longest prefix first; equal lengths keep insertion order.
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.1.cmp(&b.1)));

        Ok(Self {
            routes: compiled,
            exact,
            trie,
            prefixes,
            max_match_body_size,
        })
    }

    /// Finds the best route for a request.
    ///
    /// Deterministic: candidates are ranked by specificity descending with
    /// insertion order as tie-break, and the first whose predicates hold
    /// wins.
    pub fn find_match(&self, req: &GatewayRequest) -> MatchOutcome {
        let path = normalize(&req.path);
        let mut method_mismatch = false;

        // Tier 1a: exact path group.
        if let Some(group) = self.exact.get(&path) {
            match self.evaluate_group(group, req, &mut method_mismatch) {
                Some(outcome) => return outcome,
                None => {}
            }
        }

        // Tier 1b: parameterized patterns.
        let mut candidates = Vec::new();
        self.trie.collect(&segments(&req.path), &mut candidates);
        if !candidates.is_empty() {
            if let Some(outcome) = self.evaluate_group(&candidates, req, &mut method_mismatch) {
                return outcome;
            }
        }

        // Tier 1c: longest-prefix routes.
        for (base, index) in &self.prefixes {
            if path_has_prefix(&path, base) {
                if let Some(outcome) =
                    self.evaluate_group(std::slice::from_ref(index), req, &mut method_mismatch)
                {
                    return outcome;
                }
            }
        }

        if method_mismatch {
            MatchOutcome::MethodMismatch
        } else {
            MatchOutcome::NoMatch
        }
    }

    /// Tier 2: orders a candidate group and returns the first full match.
    fn evaluate_group(
        &self,
        group: &[usize],
        req: &GatewayRequest,
        method_mismatch: &mut bool,
    ) -> Option<MatchOutcome> {
        let mut ordered: Vec<&Arc<CompiledRoute>> =
            group.iter().map(|i| &self.routes[*i]).collect();
        ordered.sort_by(|a, b| {
            b.specificity
                .cmp(&a.specificity)
                .then(a.insertion.cmp(&b.insertion))
        });

        for candidate in ordered {
            if !candidate.predicates_match(req, self.max_match_body_size) {
                continue;
            }
            if !candidate.route.allows_method(req.method.as_str()) {
                *method_mismatch = true;
                continue;
            }
            let params = candidate.extract_params(&req.path);
            return Some(MatchOutcome::Matched {
                route: candidate.clone(),
                params,
            });
        }
        None
    }
}

fn normalize(path: &str) -> String {
    if path.len() > 1 {
        path.trim_end_matches('/').to_string()
    } else {
        path.to_string()
    }
}

fn path_has_prefix(path: &str, base: &str) -> bool {
    path == base || (path.starts_with(base) && path.as_bytes().get(base.len()) == Some(&b'/'))
}
