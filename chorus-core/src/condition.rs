use crate::blob::BlobStore;
use crate::types::BlobRef;
use anyhow::Result;
use evalexpr::{
    build_operator_tree, ContextWithMutableFunctions, ContextWithMutableVariables,
    DefaultNumericTypes, EvalexprError, Function, HashMapContext, Node, Value as ExprValue,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

type ExprNode = Node<DefaultNumericTypes>;
type ExprCtx = HashMapContext<DefaultNumericTypes>;

// ─── Condition sum ────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "sum_gt")]
    SumGt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompositeOp {
    And,
    Or,
    Not,
}

/// A typed condition evaluated against `(current_output, run_context)`.
///
/// Expression is the primary kind; the rest are secondary variants the
/// compiler accepts wherever a condition is allowed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Boolean evalexpr over `output.*` and `ctx.<node>.*` identifiers.
    Expression { expr: String },
    /// Structural match against a stored JSON schema; `invert` supports
    /// "loop while not valid".
    Schema {
        schema_ref: BlobRef,
        #[serde(default)]
        invert: bool,
    },
    /// Extract from the current output by path, compare to a literal.
    Path {
        path: String,
        op: CompareOp,
        value: Value,
    },
    /// Compare a path rooted at the current output with a path rooted at
    /// another node's recorded output.
    CrossNode {
        left_path: String,
        node_id: String,
        right_path: String,
        op: CompareOp,
    },
    Composite {
        op: CompositeOp,
        conditions: Vec<Condition>,
    },
    /// Registered host callback, wall-clock bounded, no I/O.
    Sandbox { name: String },
}

// ─── Errors ───────────────────────────────────────────────────

/// Evaluator failures. The Coordinator treats any of these as
/// condition-false and takes the fallback path.
#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("expression compile failed: {0}")]
    Compile(String),
    #[error("expression evaluation failed: {0}")]
    Eval(String),
    #[error("schema {schema_ref} could not be loaded: {detail}")]
    SchemaLoad { schema_ref: String, detail: String },
    #[error("path query failed: {0}")]
    Path(String),
    #[error("no sandbox evaluator registered under '{0}'")]
    SandboxMissing(String),
    #[error("sandbox evaluator '{0}' exceeded its wall-clock budget")]
    SandboxTimeout(String),
}

// ─── Sandbox seam ─────────────────────────────────────────────

/// Opaque user-supplied evaluator. Implementations receive plain values and
/// have no I/O handles; CPU and memory confinement are the registrar's
/// contract, the evaluator enforces the wall-clock budget.
pub trait SandboxEval: Send + Sync {
    fn evaluate(&self, output: &Value, ctx: &Value) -> std::result::Result<bool, String>;
}

// ─── Evaluator ────────────────────────────────────────────────

const DEFAULT_SANDBOX_BUDGET: Duration = Duration::from_millis(250);

/// Caching condition evaluator. One instance per Coordinator.
///
/// Compiled expressions are cached by textual form; the lock permits
/// concurrent lookup, and an uncached compilation blocks only itself plus
/// the brief insert.
pub struct Evaluator {
    exprs: RwLock<HashMap<String, Arc<ExprNode>>>,
    schemas: RwLock<HashMap<BlobRef, Arc<jsonschema::Validator>>>,
    sandboxes: RwLock<HashMap<String, Arc<dyn SandboxEval>>>,
    sandbox_budget: Duration,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator {
    pub fn new() -> Self {
        Self {
            exprs: RwLock::new(HashMap::new()),
            schemas: RwLock::new(HashMap::new()),
            sandboxes: RwLock::new(HashMap::new()),
            sandbox_budget: DEFAULT_SANDBOX_BUDGET,
        }
    }

    pub fn with_sandbox_budget(mut self, budget: Duration) -> Self {
        self.sandbox_budget = budget;
        self
    }

    pub fn register_sandbox(&self, name: &str, eval: Arc<dyn SandboxEval>) {
        self.sandboxes
            .write()
            .expect("sandbox registry poisoned")
            .insert(name.to_string(), eval);
    }

    /// Evaluate `condition` against the current output and the run context
    /// (`ctx` is a map node_id -> {"output": ..., "metadata": ...}).
    ///
    /// Schema refs not yet cached are fetched from the blob store up front
    /// so the evaluation itself stays synchronous.
    pub async fn eval(
        &self,
        condition: &Condition,
        output: &Value,
        ctx: &Value,
        blob: &dyn BlobStore,
    ) -> std::result::Result<bool, ConditionError> {
        self.prime_schemas(condition, blob).await?;
        self.eval_sync(condition, output, ctx)
    }

    /// Fetch and compile any schema this condition tree references.
    async fn prime_schemas(
        &self,
        condition: &Condition,
        blob: &dyn BlobStore,
    ) -> std::result::Result<(), ConditionError> {
        let mut refs = Vec::new();
        collect_schema_refs(condition, &mut refs);
        for schema_ref in refs {
            if self
                .schemas
                .read()
                .expect("schema cache poisoned")
                .contains_key(&schema_ref)
            {
                continue;
            }
            let bytes =
                blob.get(&schema_ref)
                    .await
                    .map_err(|e| ConditionError::SchemaLoad {
                        schema_ref: schema_ref.clone(),
                        detail: e.to_string(),
                    })?;
            let schema: Value =
                serde_json::from_slice(&bytes).map_err(|e| ConditionError::SchemaLoad {
                    schema_ref: schema_ref.clone(),
                    detail: e.to_string(),
                })?;
            let validator =
                jsonschema::validator_for(&schema).map_err(|e| ConditionError::SchemaLoad {
                    schema_ref: schema_ref.clone(),
                    detail: e.to_string(),
                })?;
            self.schemas
                .write()
                .expect("schema cache poisoned")
                .insert(schema_ref, Arc::new(validator));
        }
        Ok(())
    }

    fn eval_sync(
        &self,
        condition: &Condition,
        output: &Value,
        ctx: &Value,
    ) -> std::result::Result<bool, ConditionError> {
        match condition {
            Condition::Expression { expr } => self.eval_expression(expr, output, ctx),
            Condition::Schema { schema_ref, invert } => {
                let validator = self
                    .schemas
                    .read()
                    .expect("schema cache poisoned")
                    .get(schema_ref)
                    .cloned()
                    .ok_or_else(|| ConditionError::SchemaLoad {
                        schema_ref: schema_ref.clone(),
                        detail: "not primed".to_string(),
                    })?;
                let valid = validator.is_valid(output);
                Ok(valid != *invert)
            }
            Condition::Path { path, op, value } => {
                let selected = select_path(output, path)?;
                Ok(compare(*op, &selected, value))
            }
            Condition::CrossNode {
                left_path,
                node_id,
                right_path,
                op,
            } => {
                let left = select_path(output, left_path)?;
                let node_output = ctx
                    .get(node_id)
                    .and_then(|entry| entry.get("output"))
                    .cloned()
                    .unwrap_or(Value::Null);
                let right = select_path(&node_output, right_path)?;
                Ok(compare(*op, &left, &right))
            }
            Condition::Composite { op, conditions } => match op {
                CompositeOp::And => {
                    for c in conditions {
                        if !self.eval_sync(c, output, ctx)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                CompositeOp::Or => {
                    for c in conditions {
                        if self.eval_sync(c, output, ctx)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                CompositeOp::Not => {
                    let inner = conditions
                        .first()
                        .ok_or_else(|| ConditionError::Eval("empty NOT composite".into()))?;
                    Ok(!self.eval_sync(inner, output, ctx)?)
                }
            },
            Condition::Sandbox { name } => self.eval_sandbox(name, output, ctx),
        }
    }

    fn eval_expression(
        &self,
        expr: &str,
        output: &Value,
        ctx: &Value,
    ) -> std::result::Result<bool, ConditionError> {
        let node = {
            let cache = self.exprs.read().expect("expression cache poisoned");
            cache.get(expr).cloned()
        };
        let node = match node {
            Some(n) => n,
            None => {
                let compiled = Arc::new(
                    build_operator_tree(expr)
                        .map_err(|e| ConditionError::Compile(e.to_string()))?,
                );
                self.exprs
                    .write()
                    .expect("expression cache poisoned")
                    .insert(expr.to_string(), compiled.clone());
                compiled
            }
        };

        let eval_ctx = build_expr_context(output, ctx)
            .map_err(|e| ConditionError::Eval(e.to_string()))?;
        node.eval_boolean_with_context(&eval_ctx)
            .map_err(|e| ConditionError::Eval(e.to_string()))
    }

    fn eval_sandbox(
        &self,
        name: &str,
        output: &Value,
        ctx: &Value,
    ) -> std::result::Result<bool, ConditionError> {
        let eval = self
            .sandboxes
            .read()
            .expect("sandbox registry poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| ConditionError::SandboxMissing(name.to_string()))?;

        let (tx, rx) = std::sync::mpsc::channel();
        let output = output.clone();
        let ctx = ctx.clone();
        std::thread::spawn(move || {
            let _ = tx.send(eval.evaluate(&output, &ctx));
        });
        match rx.recv_timeout(self.sandbox_budget) {
            Ok(Ok(verdict)) => Ok(verdict),
            Ok(Err(detail)) => Err(ConditionError::Eval(detail)),
            Err(_) => Err(ConditionError::SandboxTimeout(name.to_string())),
        }
    }
}

fn collect_schema_refs(condition: &Condition, out: &mut Vec<BlobRef>) {
    match condition {
        Condition::Schema { schema_ref, .. } => out.push(schema_ref.clone()),
        Condition::Composite { conditions, .. } => {
            for c in conditions {
                collect_schema_refs(c, out);
            }
        }
        _ => {}
    }
}

// ─── Expression context construction ──────────────────────────

/// Flatten the output and context into dotted evalexpr identifiers:
/// `output.score`, `ctx.fetch.output.status`, `ctx.fetch.metadata.attempt`.
fn build_expr_context(output: &Value, ctx: &Value) -> Result<ExprCtx, EvalexprError> {
    let mut eval_ctx = ExprCtx::new();
    let mut defined: HashSet<String> = HashSet::new();

    flatten_into(&mut eval_ctx, &mut defined, "output", output)?;
    if let Value::Object(entries) = ctx {
        for (node_id, entry) in entries {
            flatten_into(&mut eval_ctx, &mut defined, &format!("ctx.{node_id}"), entry)?;
        }
    }

    register_helpers(&mut eval_ctx, defined)?;
    Ok(eval_ctx)
}

fn flatten_into(
    eval_ctx: &mut ExprCtx,
    defined: &mut HashSet<String>,
    prefix: &str,
    value: &Value,
) -> Result<(), EvalexprError> {
    match value {
        Value::Object(map) => {
            for (key, v) in map {
                flatten_into(eval_ctx, defined, &format!("{prefix}.{key}"), v)?;
            }
        }
        other => {
            if let Some(converted) = to_expr_value(other) {
                eval_ctx.set_value(prefix.to_string(), converted)?;
                defined.insert(prefix.to_string());
            }
        }
    }
    Ok(())
}

fn to_expr_value(value: &Value) -> Option<ExprValue<DefaultNumericTypes>> {
    match value {
        Value::Null => Some(ExprValue::Empty),
        Value::Bool(b) => Some(ExprValue::Boolean(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(ExprValue::Int(i))
            } else {
                n.as_f64().map(ExprValue::Float)
            }
        }
        Value::String(s) => Some(ExprValue::String(s.clone())),
        Value::Array(items) => {
            let tuple: Vec<_> = items.iter().filter_map(to_expr_value).collect();
            Some(ExprValue::Tuple(tuple))
        }
        // Nested objects are flattened by the caller, never stored whole.
        Value::Object(_) => None,
    }
}

fn register_helpers(
    eval_ctx: &mut ExprCtx,
    defined: HashSet<String>,
) -> Result<(), EvalexprError> {
    eval_ctx.set_function(
        "contains".to_string(),
        Function::new(|arg| {
            let (hay, needle) = pair(arg)?;
            match (&hay, &needle) {
                (ExprValue::String(h), ExprValue::String(n)) => {
                    Ok(ExprValue::Boolean(h.contains(n.as_str())))
                }
                (ExprValue::Tuple(items), n) => Ok(ExprValue::Boolean(items.contains(n))),
                _ => Err(EvalexprError::CustomMessage(
                    "contains expects (string, string) or (list, value)".into(),
                )),
            }
        }),
    )?;
    eval_ctx.set_function(
        "starts_with".to_string(),
        Function::new(|arg| {
            let (hay, needle) = pair(arg)?;
            match (&hay, &needle) {
                (ExprValue::String(h), ExprValue::String(n)) => {
                    Ok(ExprValue::Boolean(h.starts_with(n.as_str())))
                }
                _ => Err(EvalexprError::CustomMessage(
                    "starts_with expects (string, string)".into(),
                )),
            }
        }),
    )?;
    eval_ctx.set_function(
        "ends_with".to_string(),
        Function::new(|arg| {
            let (hay, needle) = pair(arg)?;
            match (&hay, &needle) {
                (ExprValue::String(h), ExprValue::String(n)) => {
                    Ok(ExprValue::Boolean(h.ends_with(n.as_str())))
                }
                _ => Err(EvalexprError::CustomMessage(
                    "ends_with expects (string, string)".into(),
                )),
            }
        }),
    )?;
    eval_ctx.set_function(
        "in".to_string(),
        Function::new(|arg| {
            let (needle, list) = pair(arg)?;
            match &list {
                ExprValue::Tuple(items) => Ok(ExprValue::Boolean(items.contains(&needle))),
                _ => Err(EvalexprError::CustomMessage(
                    "in expects (value, list)".into(),
                )),
            }
        }),
    )?;
    eval_ctx.set_function(
        "all".to_string(),
        Function::new(|arg| match arg {
            ExprValue::Tuple(items) => Ok(ExprValue::Boolean(
                items.iter().all(|v| v == &ExprValue::Boolean(true)),
            )),
            _ => Err(EvalexprError::CustomMessage("all expects a list".into())),
        }),
    )?;
    eval_ctx.set_function(
        "exists".to_string(),
        Function::new(move |arg| match arg {
            ExprValue::String(name) => Ok(ExprValue::Boolean(defined.contains(name.as_str()))),
            _ => Err(EvalexprError::CustomMessage(
                "exists expects a variable name string".into(),
            )),
        }),
    )?;
    Ok(())
}

fn pair(
    arg: &ExprValue<DefaultNumericTypes>,
) -> Result<(ExprValue<DefaultNumericTypes>, ExprValue<DefaultNumericTypes>), EvalexprError> {
    match arg {
        ExprValue::Tuple(items) if items.len() == 2 => {
            Ok((items[0].clone(), items[1].clone()))
        }
        _ => Err(EvalexprError::CustomMessage(
            "expected exactly two arguments".into(),
        )),
    }
}

// ─── Path selection + comparison ──────────────────────────────

/// Select a single value by dot/bracket path (`a.b[0]`). Empty path yields
/// the value itself; multiple matches yield the first.
fn select_path(value: &Value, path: &str) -> std::result::Result<Value, ConditionError> {
    if path.is_empty() {
        return Ok(value.clone());
    }
    let jsonpath = if path.starts_with('$') {
        path.to_string()
    } else {
        format!("$.{path}")
    };
    let matches = jsonpath_lib::select(value, &jsonpath)
        .map_err(|e| ConditionError::Path(e.to_string()))?;
    Ok(matches.first().map(|v| (*v).clone()).unwrap_or(Value::Null))
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> bool {
    match op {
        CompareOp::Eq => json_eq(left, right),
        CompareOp::Ne => !json_eq(left, right),
        CompareOp::Lt => num_cmp(left, right).is_some_and(|o| o == std::cmp::Ordering::Less),
        CompareOp::Gt => num_cmp(left, right).is_some_and(|o| o == std::cmp::Ordering::Greater),
        CompareOp::Le => num_cmp(left, right).is_some_and(|o| o != std::cmp::Ordering::Greater),
        CompareOp::Ge => num_cmp(left, right).is_some_and(|o| o != std::cmp::Ordering::Less),
        CompareOp::In => match right {
            Value::Array(items) => items.iter().any(|v| json_eq(left, v)),
            Value::String(s) => left.as_str().map(|l| s.contains(l)).unwrap_or(false),
            _ => false,
        },
        CompareOp::SumGt => {
            let sum = match left {
                Value::Array(items) => items.iter().filter_map(Value::as_f64).sum::<f64>(),
                other => other.as_f64().unwrap_or(0.0),
            };
            right.as_f64().map(|r| sum > r).unwrap_or(false)
        }
    }
}

fn json_eq(left: &Value, right: &Value) -> bool {
    if let Some(ord) = num_cmp(left, right) {
        return ord == std::cmp::Ordering::Equal;
    }
    left == right
}

fn num_cmp(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    let (l, r) = (left.as_f64()?, right.as_f64()?);
    l.partial_cmp(&r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlobStore;
    use serde_json::json;

    fn ctx_with(node_id: &str, output: Value) -> Value {
        json!({ node_id: { "output": output, "metadata": {} } })
    }

    async fn eval(cond: &Condition, output: &Value, ctx: &Value) -> bool {
        let blob = MemoryBlobStore::new();
        Evaluator::new()
            .eval(cond, output, ctx, &blob)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn expression_over_output_and_ctx() {
        let cond = Condition::Expression {
            expr: "output.score >= 80 && ctx.fetch.output.status == 200".into(),
        };
        let output = json!({"score": 95});
        let ctx = ctx_with("fetch", json!({"status": 200}));
        assert!(eval(&cond, &output, &ctx).await);

        let low = json!({"score": 42});
        assert!(!eval(&cond, &low, &ctx).await);
    }

    #[tokio::test]
    async fn expression_string_helpers() {
        let cond = Condition::Expression {
            expr: r#"contains(output.name, "resh") && starts_with(output.name, "thr")"#.into(),
        };
        let output = json!({"name": "threshold"});
        assert!(eval(&cond, &output, &json!({})).await);
    }

    #[tokio::test]
    async fn expression_list_membership() {
        let cond = Condition::Expression {
            expr: r#"in(output.label, output.allowed)"#.into(),
        };
        let output = json!({"label": "b", "allowed": ["a", "b", "c"]});
        assert!(eval(&cond, &output, &json!({})).await);
    }

    #[tokio::test]
    async fn compile_errors_surface_as_condition_errors() {
        let cond = Condition::Expression {
            expr: "output.score >=".into(),
        };
        let blob = MemoryBlobStore::new();
        let err = Evaluator::new()
            .eval(&cond, &json!({}), &json!({}), &blob)
            .await
            .unwrap_err();
        assert!(matches!(err, ConditionError::Compile(_)));
    }

    #[tokio::test]
    async fn expression_cache_reuses_compiled_tree() {
        let evaluator = Evaluator::new();
        let blob = MemoryBlobStore::new();
        let cond = Condition::Expression {
            expr: "output.n > 1".into(),
        };
        for n in 0..4 {
            let _ = evaluator
                .eval(&cond, &json!({ "n": n }), &json!({}), &blob)
                .await
                .unwrap();
        }
        assert_eq!(evaluator.exprs.read().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn path_condition_with_brackets() {
        let cond = Condition::Path {
            path: "items[0].price".into(),
            op: CompareOp::Gt,
            value: json!(10),
        };
        let output = json!({"items": [{"price": 12}, {"price": 3}]});
        assert!(eval(&cond, &output, &json!({})).await);
    }

    #[tokio::test]
    async fn path_sum_gt() {
        let cond = Condition::Path {
            path: "scores".into(),
            op: CompareOp::SumGt,
            value: json!(10),
        };
        assert!(eval(&cond, &json!({"scores": [4, 4, 4]}), &json!({})).await);
        assert!(!eval(&cond, &json!({"scores": [1, 2]}), &json!({})).await);
    }

    #[tokio::test]
    async fn cross_node_comparison() {
        let cond = Condition::CrossNode {
            left_path: "total".into(),
            node_id: "baseline".into(),
            right_path: "total".into(),
            op: CompareOp::Gt,
        };
        let output = json!({"total": 120});
        let ctx = ctx_with("baseline", json!({"total": 100}));
        assert!(eval(&cond, &output, &ctx).await);
    }

    #[tokio::test]
    async fn composite_and_or_not() {
        let gt = Condition::Path {
            path: "n".into(),
            op: CompareOp::Gt,
            value: json!(5),
        };
        let lt = Condition::Path {
            path: "n".into(),
            op: CompareOp::Lt,
            value: json!(10),
        };
        let between = Condition::Composite {
            op: CompositeOp::And,
            conditions: vec![gt.clone(), lt],
        };
        assert!(eval(&between, &json!({"n": 7}), &json!({})).await);
        assert!(!eval(&between, &json!({"n": 12}), &json!({})).await);

        let not = Condition::Composite {
            op: CompositeOp::Not,
            conditions: vec![gt],
        };
        assert!(eval(&not, &json!({"n": 3}), &json!({})).await);
    }

    #[tokio::test]
    async fn schema_condition_with_invert() {
        let blob = MemoryBlobStore::new();
        let schema = json!({
            "type": "object",
            "required": ["status"],
            "properties": { "status": { "type": "integer" } }
        });
        let schema_ref = crate::blob::put_json(&blob, &schema).await.unwrap();

        let evaluator = Evaluator::new();
        let valid_output = json!({"status": 200});
        let invalid_output = json!({"other": true});

        let cond = Condition::Schema {
            schema_ref: schema_ref.clone(),
            invert: false,
        };
        assert!(evaluator
            .eval(&cond, &valid_output, &json!({}), &blob)
            .await
            .unwrap());
        assert!(!evaluator
            .eval(&cond, &invalid_output, &json!({}), &blob)
            .await
            .unwrap());

        // Loop-while-not-valid.
        let inverted = Condition::Schema {
            schema_ref,
            invert: true,
        };
        assert!(evaluator
            .eval(&inverted, &invalid_output, &json!({}), &blob)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn sandbox_verdict_and_timeout() {
        struct Spin;
        impl SandboxEval for Spin {
            fn evaluate(&self, _: &Value, _: &Value) -> std::result::Result<bool, String> {
                std::thread::sleep(Duration::from_secs(5));
                Ok(true)
            }
        }
        struct Yes;
        impl SandboxEval for Yes {
            fn evaluate(&self, output: &Value, _: &Value) -> std::result::Result<bool, String> {
                Ok(output.get("ok").and_then(Value::as_bool).unwrap_or(false))
            }
        }

        let blob = MemoryBlobStore::new();
        let evaluator = Evaluator::new().with_sandbox_budget(Duration::from_millis(50));
        evaluator.register_sandbox("spin", Arc::new(Spin));
        evaluator.register_sandbox("yes", Arc::new(Yes));

        let ok = evaluator
            .eval(
                &Condition::Sandbox { name: "yes".into() },
                &json!({"ok": true}),
                &json!({}),
                &blob,
            )
            .await
            .unwrap();
        assert!(ok);

        let err = evaluator
            .eval(
                &Condition::Sandbox {
                    name: "spin".into(),
                },
                &json!({}),
                &json!({}),
                &blob,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConditionError::SandboxTimeout(_)));

        let missing = evaluator
            .eval(
                &Condition::Sandbox {
                    name: "ghost".into(),
                },
                &json!({}),
                &json!({}),
                &blob,
            )
            .await
            .unwrap_err();
        assert!(matches!(missing, ConditionError::SandboxMissing(_)));
    }
}
