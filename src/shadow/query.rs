//! jq queries over JSON documents.
//!
//! Queries pick the parts of a response body that are compared, ignored or
//! redacted. The full jq language is available through `jaq`.
//!
//! # Design Decisions
//! - Compiled once at provisioning time, so a bad query fails provisioning
//! - Each query is compiled three ways: as written, wrapped in `del(..)` for
//!   ignore rules, and wrapped in `path(..)` for redaction
//! - Runtime errors are returned per output and never compare equal
//! - Output streams are capped at [`MAX_OUTPUTS`] values

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use jaq_core::load::{Arena, File, Loader};
use jaq_core::{Compiler, Ctx, RcIter};
use jaq_json::Val;
use serde_json::Value;
use thiserror::Error;

/// Most values taken from a single query run.
pub const MAX_OUTPUTS: usize = 10_000;

/// Error produced when a query string fails to compile.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct QueryError {
    /// What went wrong.
    pub message: String,
}

impl QueryError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// One segment of a path from the document root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathSeg {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSeg::Key(k) => write!(f, ".{}", k),
            PathSeg::Index(i) => write!(f, "[{}]", i),
        }
    }
}

/// Result of one query output.
pub type Output = Result<Value, String>;

type Program = Arc<dyn Fn(Val) -> Vec<Output> + Send + Sync>;

/// A compiled jq query.
#[derive(Clone)]
pub struct Query {
    source: String,
    filter: Program,
    delete: Program,
    paths: Program,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Query").field(&self.source).finish()
    }
}

impl Query {
    /// Compile a query string.
    pub fn compile(source: &str) -> Result<Self, QueryError> {
        if source.trim().is_empty() {
            return Err(QueryError::new("empty query"));
        }
        // The newline keeps a trailing `#` comment from swallowing the closing paren.
        Ok(Self {
            source: source.to_string(),
            filter: program(source)?,
            delete: program(&format!("del({source}\n)"))?,
            paths: program(&format!("path({source}\n)"))?,
        })
    }

    /// The query as written in configuration.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Run the query, returning every output in order.
    pub fn run(&self, input: &Value) -> Vec<Output> {
        (self.filter)(Val::from(input.clone()))
    }

    /// Remove everything the query selects. A value the query cannot
    /// address is returned unchanged.
    pub fn delete(&self, input: &Value) -> Value {
        match (self.delete)(Val::from(input.clone())).into_iter().next() {
            Some(Ok(value)) => value,
            _ => input.clone(),
        }
    }

    /// The paths of everything the query selects, in order. Outputs that
    /// are not paths are skipped.
    pub fn paths(&self, input: &Value) -> Vec<Vec<PathSeg>> {
        (self.paths)(Val::from(input.clone()))
            .into_iter()
            .filter_map(Result::ok)
            .filter_map(|path| to_path(&path))
            .collect()
    }
}

impl FromStr for Query {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Query::compile(s)
    }
}

fn program(code: &str) -> Result<Program, QueryError> {
    let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let arena = Arena::default();
    let modules = loader
        .load(&arena, File { code, path: () })
        .map_err(|errs| {
            let reasons: Vec<String> = errs.into_iter().map(|(_, e)| format!("{:?}", e)).collect();
            QueryError::new(format!("invalid query: {}", reasons.join("; ")))
        })?;
    let filter = Compiler::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .compile(modules)
        .map_err(|errs| {
            let names: Vec<String> = errs
                .into_iter()
                .flat_map(|(_, undefined)| undefined)
                .map(|(name, _)| name.to_string())
                .collect();
            QueryError::new(format!("undefined: {}", names.join(", ")))
        })?;

    Ok(Arc::new(move |input: Val| {
        let inputs = RcIter::new(core::iter::empty());
        let outputs: Vec<Output> = filter
            .run((Ctx::new([], &inputs), input))
            .take(MAX_OUTPUTS)
            .map(|out| out.map(to_json).map_err(|e| e.to_string()))
            .collect();
        outputs
    }))
}

fn to_json(val: Val) -> Value {
    let text = val.to_string();
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

fn to_path(value: &Value) -> Option<Vec<PathSeg>> {
    value
        .as_array()?
        .iter()
        .map(|seg| match seg {
            Value::String(key) => Some(PathSeg::Key(key.clone())),
            Value::Number(n) => n.as_u64().map(|i| PathSeg::Index(i as usize)),
            _ => None,
        })
        .collect()
}

/// Replace the value at every existing path with `replacement`.
pub fn mask_paths(value: &mut Value, paths: &[Vec<PathSeg>], replacement: &Value) {
    for path in paths {
        if let Some(slot) = lookup_mut(value, path) {
            *slot = replacement.clone();
        }
    }
}

fn lookup_mut<'a>(value: &'a mut Value, path: &[PathSeg]) -> Option<&'a mut Value> {
    path.iter().try_fold(value, |current, seg| match (current, seg) {
        (Value::Object(map), PathSeg::Key(k)) => map.get_mut(k),
        (Value::Array(items), PathSeg::Index(i)) => items.get_mut(*i),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(q: &str, doc: &Value) -> Vec<Value> {
        Query::compile(q)
            .unwrap()
            .run(doc)
            .into_iter()
            .map(Result::unwrap)
            .collect()
    }

    #[test]
    fn test_identity() {
        let doc = json!({"a": 1});
        assert_eq!(run(".", &doc), vec![doc.clone()]);
    }

    #[test]
    fn test_field_access() {
        let doc = json!({"greeting": "hi", "nested": {"inner": [1, 2]}});
        assert_eq!(run(".greeting", &doc), vec![json!("hi")]);
        assert_eq!(run(".nested.inner", &doc), vec![json!([1, 2])]);
        assert_eq!(run(".[\"greeting\"]", &doc), vec![json!("hi")]);
        assert_eq!(run(".a.b.c", &doc), vec![Value::Null]);
    }

    #[test]
    fn test_wrong_type_is_an_error_output() {
        let q = Query::compile(".a.b").unwrap();
        let out = q.run(&json!({"a": "string"}));
        assert_eq!(out.len(), 1);
        assert!(out[0].is_err());
    }

    #[test]
    fn test_index_and_iterate() {
        let doc = json!({"items": [10, 20, 30]});
        assert_eq!(run(".items[0]", &doc), vec![json!(10)]);
        assert_eq!(run(".items[-1]", &doc), vec![json!(30)]);
        assert_eq!(run(".items[]", &doc), vec![json!(10), json!(20), json!(30)]);
        assert!(run(".missing[]?", &doc).is_empty());
    }

    #[test]
    fn test_builtins_and_pipes() {
        let doc = json!({"items": [{"id": 1, "a": true}, {"id": 2, "a": false}], "ts": 9});
        assert_eq!(run(".items | length", &doc), vec![json!(2)]);
        assert_eq!(run(".items[] | select(.a) | .id", &doc), vec![json!(1)]);
        assert_eq!(run("keys", &doc), vec![json!(["items", "ts"])]);
        assert_eq!(run(".items | map(.id)", &doc), vec![json!([1, 2])]);
        assert_eq!(run("del(.ts) | keys", &doc), vec![json!(["items"])]);
        assert_eq!(run(".ts, .items[0].id", &doc), vec![json!(9), json!(1)]);
    }

    #[test]
    fn test_output_cap() {
        let out = Query::compile("range(100000)").unwrap().run(&Value::Null);
        assert_eq!(out.len(), MAX_OUTPUTS);
    }

    #[test]
    fn test_paths() {
        let doc = json!({"users": [{"id": 1}, {"id": 2}]});
        let q = Query::compile(".users[].id").unwrap();
        assert_eq!(
            q.paths(&doc),
            vec![
                vec![PathSeg::Key("users".into()), PathSeg::Index(0), PathSeg::Key("id".into())],
                vec![PathSeg::Key("users".into()), PathSeg::Index(1), PathSeg::Key("id".into())],
            ]
        );
    }

    #[test]
    fn test_compile_errors() {
        assert!(Query::compile("").is_err());
        assert!(Query::compile("greeting").is_err());
        assert!(Query::compile(".[").is_err());
        assert!(Query::compile(".a |").is_err());
        assert!(Query::compile(".a )").is_err());
    }

    #[test]
    fn test_trailing_comment_still_wraps() {
        let q = Query::compile(".ts # drop the clock").unwrap();
        assert_eq!(q.delete(&json!({"ts": 1, "id": 2})), json!({"id": 2}));
    }

    #[test]
    fn test_delete() {
        let doc = json!({"id": 1, "meta": {"ts": 5, "keep": true}, "list": [1, 2, 3]});
        let q = Query::compile(".meta.ts, .list[0], .list[2], .missing").unwrap();
        assert_eq!(
            q.delete(&doc),
            json!({"id": 1, "meta": {"keep": true}, "list": [2]})
        );
    }

    #[test]
    fn test_delete_unaddressable_is_unchanged() {
        let q = Query::compile(".a.b").unwrap();
        assert_eq!(q.delete(&json!({"a": "x"})), json!({"a": "x"}));
    }

    #[test]
    fn test_mask_paths() {
        let mut doc = json!({"user": {"email": "a@b.c", "name": "x"}});
        let q = Query::compile(".user.email, .user.phone").unwrap();
        let paths = q.paths(&doc);
        mask_paths(&mut doc, &paths, &json!("REDACTED"));
        assert_eq!(doc, json!({"user": {"email": "REDACTED", "name": "x"}}));
    }
}
