//! Declarative call-site caching
//!
//! Three operations wrap an invocation closure with cache semantics, without
//! any runtime proxy machinery:
//!
//! - [`CacheLookup`]: condition -> key -> lookup -> invoke on miss -> unless
//!   -> store.
//! - [`CacheWrite`]: always invoke, then store the result.
//! - [`CacheInvalidate`]: evict a key or the whole namespace, before or after
//!   invocation.
//!
//! Keys, conditions and `unless` guards are expressions in a deliberately
//! small language: identifiers bind to argument names or positions (`p0`,
//! `p1`, ...), `.` navigates properties, `+` concatenates, `'...'` quotes
//! string literals, and `==` / `!=` compare. No side effects are possible.
//! `unless` expressions additionally see the invocation result as `result`.
//!
//! Target-method errors always propagate unchanged. Cache failures during
//! lookup degrade to a miss; cache failures during store are logged and never
//! fail the invocation.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};
use crate::manager::NamespacedCache;
use crate::traits::CacheCodec;
use crate::wrappers::namespace::effective_key;

// ===== Invocation context =====

/// A method invocation the declarative operations are applied to: the method
/// name plus its named arguments as JSON values.
#[derive(Debug, Clone)]
pub struct Invocation {
    method: String,
    args: Vec<(String, Value)>,
}

impl Invocation {
    #[must_use]
    pub fn new(method: &str) -> Self {
        Self {
            method: method.to_string(),
            args: Vec::new(),
        }
    }

    /// Append a named argument. Positional bindings `p0`, `p1`, ... resolve
    /// by insertion order.
    #[must_use]
    pub fn arg(mut self, name: &str, value: Value) -> Self {
        self.args.push((name.to_string(), value));
        self
    }

    fn resolve(&self, ident: &str) -> Option<Value> {
        if ident == "method" {
            return Some(Value::String(self.method.clone()));
        }
        if let Some(position) = ident
            .strip_prefix('p')
            .and_then(|digits| digits.parse::<usize>().ok())
        {
            if let Some((_, value)) = self.args.get(position) {
                return Some(value.clone());
            }
        }
        self.args
            .iter()
            .find(|(name, _)| name == ident)
            .map(|(_, value)| value.clone())
    }
}

// ===== Expression language =====

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(String),
    Dot,
    Plus,
    Eq,
    Ne,
}

fn tokenize(input: &str) -> CacheResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Eq);
                } else {
                    return Err(CacheError::configuration(
                        "cache expression: expected '==' but found a single '='",
                    ));
                }
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Ne);
                } else {
                    return Err(CacheError::configuration(
                        "cache expression: expected '!=' but found a bare '!'",
                    ));
                }
            }
            '\'' => {
                chars.next();
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => literal.push(c),
                        None => {
                            return Err(CacheError::configuration(
                                "cache expression: unterminated string literal",
                            ))
                        }
                    }
                }
                tokens.push(Token::Literal(literal));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(CacheError::configuration(format!(
                    "cache expression: unexpected character '{other}'"
                )))
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(String),
    /// Root identifier followed by property segments.
    Path(Vec<String>),
    Concat(Vec<Expr>),
    Compare {
        left: Box<Expr>,
        right: Box<Expr>,
        negated: bool,
    },
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn parse_expression(&mut self) -> CacheResult<Expr> {
        let left = self.parse_concat()?;
        match self.peek() {
            Some(Token::Eq) => {
                self.next();
                let right = self.parse_concat()?;
                Ok(Expr::Compare {
                    left: Box::new(left),
                    right: Box::new(right),
                    negated: false,
                })
            }
            Some(Token::Ne) => {
                self.next();
                let right = self.parse_concat()?;
                Ok(Expr::Compare {
                    left: Box::new(left),
                    right: Box::new(right),
                    negated: true,
                })
            }
            _ => Ok(left),
        }
    }

    fn parse_concat(&mut self) -> CacheResult<Expr> {
        let mut parts = vec![self.parse_primary()?];
        while matches!(self.peek(), Some(Token::Plus)) {
            self.next();
            parts.push(self.parse_primary()?);
        }
        if parts.len() == 1 {
            Ok(parts.remove(0))
        } else {
            Ok(Expr::Concat(parts))
        }
    }

    fn parse_primary(&mut self) -> CacheResult<Expr> {
        match self.next() {
            Some(Token::Literal(literal)) => Ok(Expr::Literal(literal)),
            Some(Token::Ident(root)) => {
                let mut path = vec![root];
                while matches!(self.peek(), Some(Token::Dot)) {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(segment)) => path.push(segment),
                        _ => {
                            return Err(CacheError::configuration(
                                "cache expression: expected identifier after '.'",
                            ))
                        }
                    }
                }
                Ok(Expr::Path(path))
            }
            other => Err(CacheError::configuration(format!(
                "cache expression: unexpected token {other:?}"
            ))),
        }
    }
}

/// A parsed expression, validated at construction time.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    expr: Expr,
}

impl Expression {
    /// Parse an expression. Errors name the offending construct.
    pub fn parse(source: &str) -> CacheResult<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            position: 0,
        };
        let expr = parser.parse_expression()?;
        if parser.position != parser.tokens.len() {
            return Err(CacheError::configuration(format!(
                "cache expression '{source}': trailing tokens"
            )));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    fn eval(&self, invocation: &Invocation, result: Option<&Value>) -> CacheResult<Value> {
        Self::eval_expr(&self.expr, invocation, result)
    }

    fn eval_expr(
        expr: &Expr,
        invocation: &Invocation,
        result: Option<&Value>,
    ) -> CacheResult<Value> {
        match expr {
            Expr::Literal(literal) => Ok(Value::String(literal.clone())),
            Expr::Path(path) => {
                let mut segments = path.iter();
                let root = segments.next().ok_or_else(|| {
                    CacheError::configuration("cache expression: empty path")
                })?;
                let mut current = if root == "result" {
                    result.cloned().unwrap_or(Value::Null)
                } else {
                    invocation.resolve(root).ok_or_else(|| {
                        CacheError::configuration(format!(
                            "cache expression: unknown identifier '{root}'"
                        ))
                    })?
                };
                for segment in segments {
                    current = match &current {
                        Value::Object(map) => map.get(segment).cloned().unwrap_or(Value::Null),
                        Value::Array(items) => segment
                            .parse::<usize>()
                            .ok()
                            .and_then(|index| items.get(index).cloned())
                            .unwrap_or(Value::Null),
                        _ => Value::Null,
                    };
                }
                Ok(current)
            }
            Expr::Concat(parts) => {
                let mut out = String::new();
                for part in parts {
                    out.push_str(&stringify(&Self::eval_expr(part, invocation, result)?));
                }
                Ok(Value::String(out))
            }
            Expr::Compare {
                left,
                right,
                negated,
            } => {
                let left = Self::eval_expr(left, invocation, result)?;
                let right = Self::eval_expr(right, invocation, result)?;
                let equal = stringify(&left) == stringify(&right);
                Ok(Value::Bool(equal != *negated))
            }
        }
    }

    /// Evaluate to a key string.
    fn eval_key(&self, invocation: &Invocation) -> CacheResult<String> {
        Ok(stringify(&self.eval(invocation, None)?))
    }

    /// Evaluate to a boolean (missing / null / false / empty are false).
    fn eval_bool(
        &self,
        invocation: &Invocation,
        result: Option<&Value>,
    ) -> CacheResult<bool> {
        Ok(truthy(&self.eval(invocation, result)?))
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

// ===== Declarative operations =====

/// Cache-aside read around a method: on hit the method is never invoked.
pub struct CacheLookup {
    key: Expression,
    condition: Option<Expression>,
    unless: Option<Expression>,
    ttl: Option<Duration>,
    stampede_protection: bool,
}

impl CacheLookup {
    pub fn new(key_expression: &str) -> CacheResult<Self> {
        Ok(Self {
            key: Expression::parse(key_expression)?,
            condition: None,
            unless: None,
            ttl: None,
            stampede_protection: false,
        })
    }

    /// Skip caching entirely when this evaluates to false.
    pub fn condition(mut self, expression: &str) -> CacheResult<Self> {
        self.condition = Some(Expression::parse(expression)?);
        Ok(self)
    }

    /// Veto storing the result when this evaluates to true. Sees `result`.
    pub fn unless(mut self, expression: &str) -> CacheResult<Self> {
        self.unless = Some(Expression::parse(expression)?);
        Ok(self)
    }

    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Serialize concurrent cold-key invocations through the namespace's
    /// stampede lock.
    #[must_use]
    pub fn with_stampede_protection(mut self, enabled: bool) -> Self {
        self.stampede_protection = enabled;
        self
    }

    pub async fn execute<C, F, Fut>(
        &self,
        cache: &NamespacedCache<C>,
        invocation: &Invocation,
        invoke: F,
    ) -> CacheResult<Value>
    where
        C: CacheCodec,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = CacheResult<Value>> + Send,
    {
        if let Some(condition) = &self.condition {
            if !condition.eval_bool(invocation, None)? {
                return invoke().await;
            }
        }
        let key = self.key.eval_key(invocation)?;

        match cache.get::<Value>(&key).await {
            Ok(Some(cached)) => return Ok(cached),
            Ok(None) => {}
            Err(err) => {
                // Lookup failures degrade to a miss.
                debug!(key = %key, error = %err, "cache lookup failed; treating as miss");
            }
        }

        if self.stampede_protection {
            // An open circuit short-circuits before any lock is acquired.
            if matches!(
                cache.circuit_state(),
                Some(crate::wrappers::BreakerState::Open)
            ) {
                return invoke().await;
            }
            if let Some(protection) = cache.stampede_protection() {
                let effective = effective_key(cache.name(), &key);
                if let Some(guard) = protection.acquire(&effective).await? {
                    // Double-check before invoking under the lock.
                    if let Ok(Some(cached)) = cache.get::<Value>(&key).await {
                        guard.release().await;
                        return Ok(cached);
                    }
                    let result = invoke().await;
                    let outcome = match result {
                        Ok(value) => {
                            self.store(cache, invocation, &key, &value).await;
                            Ok(value)
                        }
                        Err(err) => Err(err),
                    };
                    guard.release().await;
                    return outcome;
                }
                // Lock wait exhausted: invoke without caching.
                return invoke().await;
            }
        }

        let value = invoke().await?;
        self.store(cache, invocation, &key, &value).await;
        Ok(value)
    }

    async fn store<C: CacheCodec>(
        &self,
        cache: &NamespacedCache<C>,
        invocation: &Invocation,
        key: &str,
        value: &Value,
    ) {
        if let Some(unless) = &self.unless {
            match unless.eval_bool(invocation, Some(value)) {
                Ok(true) => return,
                Ok(false) => {}
                Err(err) => {
                    warn!(key = %key, error = %err, "unless expression failed; not caching");
                    return;
                }
            }
        }
        let stored = match self.ttl {
            Some(ttl) => cache.put_with_ttl(key, value, ttl).await,
            None => cache.put(key, value).await,
        };
        if let Err(err) = stored {
            // Cache failures during write never fail the invocation.
            warn!(key = %key, error = %err, "failed to store invocation result");
        }
    }
}

/// Write-through around a method: the method always runs, its result is
/// cached afterwards.
pub struct CacheWrite {
    key: Expression,
    condition: Option<Expression>,
    unless: Option<Expression>,
    ttl: Option<Duration>,
}

impl CacheWrite {
    pub fn new(key_expression: &str) -> CacheResult<Self> {
        Ok(Self {
            key: Expression::parse(key_expression)?,
            condition: None,
            unless: None,
            ttl: None,
        })
    }

    pub fn condition(mut self, expression: &str) -> CacheResult<Self> {
        self.condition = Some(Expression::parse(expression)?);
        Ok(self)
    }

    pub fn unless(mut self, expression: &str) -> CacheResult<Self> {
        self.unless = Some(Expression::parse(expression)?);
        Ok(self)
    }

    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub async fn execute<C, F, Fut>(
        &self,
        cache: &NamespacedCache<C>,
        invocation: &Invocation,
        invoke: F,
    ) -> CacheResult<Value>
    where
        C: CacheCodec,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = CacheResult<Value>> + Send,
    {
        let value = invoke().await?;

        if let Some(condition) = &self.condition {
            if !condition.eval_bool(invocation, Some(&value))? {
                return Ok(value);
            }
        }
        if let Some(unless) = &self.unless {
            if unless.eval_bool(invocation, Some(&value))? {
                return Ok(value);
            }
        }

        let key = self.key.eval_key(invocation)?;
        let stored = match self.ttl {
            Some(ttl) => cache.put_with_ttl(&key, &value, ttl).await,
            None => cache.put(&key, &value).await,
        };
        if let Err(err) = stored {
            warn!(key = %key, error = %err, "failed to store invocation result");
        }
        Ok(value)
    }
}

/// Eviction around a method: a single key or the whole namespace, before or
/// after the invocation.
pub struct CacheInvalidate {
    key: Option<Expression>,
    all_entries: bool,
    before_invocation: bool,
    condition: Option<Expression>,
}

impl CacheInvalidate {
    /// Evict the key the expression evaluates to.
    pub fn key(key_expression: &str) -> CacheResult<Self> {
        Ok(Self {
            key: Some(Expression::parse(key_expression)?),
            all_entries: false,
            before_invocation: false,
            condition: None,
        })
    }

    /// Evict every entry in the namespace.
    #[must_use]
    pub fn all_entries() -> Self {
        Self {
            key: None,
            all_entries: true,
            before_invocation: false,
            condition: None,
        }
    }

    /// Evict before the method runs, guaranteeing eviction even when the
    /// method fails.
    #[must_use]
    pub fn before_invocation(mut self, enabled: bool) -> Self {
        self.before_invocation = enabled;
        self
    }

    pub fn condition(mut self, expression: &str) -> CacheResult<Self> {
        self.condition = Some(Expression::parse(expression)?);
        Ok(self)
    }

    pub async fn execute<C, F, Fut>(
        &self,
        cache: &NamespacedCache<C>,
        invocation: &Invocation,
        invoke: F,
    ) -> CacheResult<Value>
    where
        C: CacheCodec,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = CacheResult<Value>> + Send,
    {
        if let Some(condition) = &self.condition {
            if !condition.eval_bool(invocation, None)? {
                return invoke().await;
            }
        }

        if self.before_invocation {
            self.evict(cache, invocation).await;
            return invoke().await;
        }

        let value = invoke().await?;
        self.evict(cache, invocation).await;
        Ok(value)
    }

    async fn evict<C: CacheCodec>(&self, cache: &NamespacedCache<C>, invocation: &Invocation) {
        let result = if self.all_entries {
            cache.clear().await
        } else if let Some(key) = &self.key {
            match key.eval_key(invocation) {
                Ok(key) => cache.remove(&key).await,
                Err(err) => {
                    warn!(error = %err, "invalidation key expression failed");
                    return;
                }
            }
        } else {
            Ok(())
        };
        if let Err(err) = result {
            warn!(error = %err, "cache invalidation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::manager::CacheManager;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn invocation() -> Invocation {
        Invocation::new("find_user")
            .arg("id", json!(42))
            .arg("user", json!({"name": "ada", "active": true, "email": ""}))
    }

    #[test]
    fn key_expressions_evaluate() {
        let inv = invocation();
        let cases = [
            ("id", "42"),
            ("'user:' + id", "user:42"),
            ("user.name", "ada"),
            ("method + ':' + p0", "find_user:42"),
            ("'u:' + user.name + ':' + id", "u:ada:42"),
        ];
        for (source, expected) in cases {
            let expr = Expression::parse(source).unwrap();
            assert_eq!(expr.eval_key(&inv).unwrap(), expected, "{source}");
        }
    }

    #[test]
    fn missing_property_evaluates_to_null() {
        let inv = invocation();
        let expr = Expression::parse("user.missing").unwrap();
        assert_eq!(expr.eval_key(&inv).unwrap(), "null");
        assert!(!expr.eval_bool(&inv, None).unwrap());
    }

    #[test]
    fn unknown_identifier_is_an_error() {
        let inv = invocation();
        let expr = Expression::parse("nope").unwrap();
        assert!(matches!(
            expr.eval_key(&inv).unwrap_err(),
            CacheError::Configuration { .. }
        ));
    }

    #[test]
    fn comparisons_and_truthiness() {
        let inv = invocation();
        let truthy_cases = ["user.active", "user.name == 'ada'", "user.name != 'bob'"];
        for source in truthy_cases {
            let expr = Expression::parse(source).unwrap();
            assert!(expr.eval_bool(&inv, None).unwrap(), "{source}");
        }
        let falsy_cases = ["user.email", "user.name == 'bob'"];
        for source in falsy_cases {
            let expr = Expression::parse(source).unwrap();
            assert!(!expr.eval_bool(&inv, None).unwrap(), "{source}");
        }
    }

    #[test]
    fn unless_sees_the_result_binding() {
        let inv = invocation();
        let expr = Expression::parse("result.total == '0'").unwrap();
        assert!(expr.eval_bool(&inv, Some(&json!({"total": 0}))).unwrap());
        assert!(!expr.eval_bool(&inv, Some(&json!({"total": 3}))).unwrap());
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for source in ["'unterminated", "a b", "a +", "a = b", "!b", "a.", "?"] {
            assert!(Expression::parse(source).is_err(), "{source}");
        }
    }

    async fn local_manager() -> CacheManager {
        CacheManager::new(CacheConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn lookup_skips_the_method_on_hit() {
        let manager = local_manager().await;
        let cache = manager.get_cache("users").unwrap();
        let lookup = CacheLookup::new("'user:' + id").unwrap();
        let inv = Invocation::new("find_user").arg("id", json!(1));
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let value = lookup
                .execute(&cache, &inv, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"name": "ada"}))
                })
                .await
                .unwrap();
            assert_eq!(value, json!({"name": "ada"}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lookup_condition_false_bypasses_the_cache() {
        let manager = local_manager().await;
        let cache = manager.get_cache("users").unwrap();
        let lookup = CacheLookup::new("'user:' + id")
            .unwrap()
            .condition("cacheable")
            .unwrap();
        let inv = Invocation::new("find_user")
            .arg("id", json!(2))
            .arg("cacheable", json!(false));
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            lookup
                .execute(&cache, &inv, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("fresh"))
                })
                .await
                .unwrap();
        }
        // Pass-through both times: nothing was cached.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lookup_unless_vetoes_storing() {
        let manager = local_manager().await;
        let cache = manager.get_cache("users").unwrap();
        let lookup = CacheLookup::new("'user:' + id")
            .unwrap()
            .unless("result.empty")
            .unwrap();
        let inv = Invocation::new("find_user").arg("id", json!(3));
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            lookup
                .execute(&cache, &inv, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"empty": true}))
                })
                .await
                .unwrap();
        }
        // The unless guard kept the result out of the cache.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lookup_caches_null_results_by_default() {
        let manager = local_manager().await;
        let cache = manager.get_cache("users").unwrap();
        let lookup = CacheLookup::new("'user:' + id").unwrap();
        let inv = Invocation::new("find_user").arg("id", json!(4));
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let value = lookup
                .execute(&cache, &inv, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                })
                .await
                .unwrap();
            assert_eq!(value, Value::Null);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn method_errors_propagate_unchanged() {
        let manager = local_manager().await;
        let cache = manager.get_cache("users").unwrap();
        let lookup = CacheLookup::new("'user:' + id").unwrap();
        let inv = Invocation::new("find_user").arg("id", json!(5));

        let err = lookup
            .execute(&cache, &inv, || async {
                Err(CacheError::Backend {
                    operation: "db",
                    key: "user:5".to_string(),
                    message: "database down".to_string(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Backend { .. }));
        // The failure was not cached.
        assert_eq!(cache.get::<Value>("user:5").await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_always_invokes_and_refreshes() {
        let manager = local_manager().await;
        let cache = manager.get_cache("users").unwrap();
        let write = CacheWrite::new("'user:' + id").unwrap();
        let inv = Invocation::new("update_user").arg("id", json!(6));
        let calls = Arc::new(AtomicU32::new(0));

        for generation in 0..2 {
            let calls = Arc::clone(&calls);
            write
                .execute(&cache, &inv, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"generation": generation}))
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let cached = cache.get::<Value>("user:6").await.unwrap();
        assert_eq!(cached, Some(json!({"generation": 1})));
    }

    #[tokio::test]
    async fn invalidate_after_invocation_requires_success() {
        let manager = local_manager().await;
        let cache = manager.get_cache("users").unwrap();
        cache.put("user:7", &json!({"name": "ada"})).await.unwrap();

        let invalidate = CacheInvalidate::key("'user:' + id").unwrap();
        let inv = Invocation::new("delete_user").arg("id", json!(7));

        // A failing method leaves the entry alone (after-invocation mode).
        let _ = invalidate
            .execute(&cache, &inv, || async {
                Err(CacheError::Backend {
                    operation: "db",
                    key: String::new(),
                    message: "down".to_string(),
                })
            })
            .await;
        assert!(cache.get::<Value>("user:7").await.unwrap().is_some());

        invalidate
            .execute(&cache, &inv, || async { Ok(json!(null)) })
            .await
            .unwrap();
        assert_eq!(cache.get::<Value>("user:7").await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalidate_before_invocation_survives_method_failure() {
        let manager = local_manager().await;
        let cache = manager.get_cache("users").unwrap();
        cache.put("user:8", &json!({"name": "ada"})).await.unwrap();

        let invalidate = CacheInvalidate::key("'user:' + id")
            .unwrap()
            .before_invocation(true);
        let inv = Invocation::new("delete_user").arg("id", json!(8));

        let _ = invalidate
            .execute(&cache, &inv, || async {
                Err(CacheError::Backend {
                    operation: "db",
                    key: String::new(),
                    message: "down".to_string(),
                })
            })
            .await;
        // Evicted even though the method failed.
        assert_eq!(cache.get::<Value>("user:8").await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalidate_all_entries_clears_the_namespace() {
        let manager = local_manager().await;
        let cache = manager.get_cache("users").unwrap();
        cache.put("a", &json!(1)).await.unwrap();
        cache.put("b", &json!(2)).await.unwrap();

        let invalidate = CacheInvalidate::all_entries();
        let inv = Invocation::new("reload");
        invalidate
            .execute(&cache, &inv, || async { Ok(json!(null)) })
            .await
            .unwrap();

        assert_eq!(cache.get::<Value>("a").await.unwrap(), None);
        assert_eq!(cache.get::<Value>("b").await.unwrap(), None);
    }
}
