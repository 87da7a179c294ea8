use ocean_mapping::{ExprError, Expression, ExpressionCompiler, JqCompiler, JqExpression};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn eval(source: &str, input: Value) -> Value {
    JqExpression::compile(source).unwrap().evaluate(&input).unwrap()
}

fn eval_all(source: &str, input: Value) -> Vec<Value> {
    JqExpression::compile(source)
        .unwrap()
        .evaluate_all(&input)
        .unwrap()
}

fn eval_err(source: &str, input: Value) -> ExprError {
    JqExpression::compile(source)
        .unwrap()
        .evaluate(&input)
        .unwrap_err()
}

// ── Paths ─────────────────────────────────────────────────────────

#[test]
fn identity_and_fields() {
    let input = json!({"a": {"b": 1}, "x-y": 2});
    assert_eq!(eval(".", input.clone()), input);
    assert_eq!(eval(".a.b", input.clone()), json!(1));
    assert_eq!(eval(r#"."x-y""#, input.clone()), json!(2));
    assert_eq!(eval(r#".["x-y"]"#, input.clone()), json!(2));
    assert_eq!(eval(".missing.deeper", input), json!(null));
}

#[test]
fn array_indexing() {
    let input = json!({"tags": ["a", "b", "c"]});
    assert_eq!(eval(".tags[0]", input.clone()), json!("a"));
    assert_eq!(eval(".tags[-1]", input.clone()), json!("c"));
    assert_eq!(eval(".tags[10]", input.clone()), json!(null));
    assert_eq!(eval(".tags | first", input.clone()), json!("a"));
    assert_eq!(eval(".tags | last", input), json!("c"));
}

#[test]
fn indexing_wrong_type_errors_unless_optional() {
    assert!(matches!(eval_err(".a.b", json!({"a": 5})), ExprError::Raised(_)));
    assert_eq!(eval(".a.b?", json!({"a": 5})), json!(null));
}

#[test]
fn iteration_yields_every_element() {
    assert_eq!(
        eval_all(".items[].id", json!({"items": [{"id": 1}, {"id": 2}]})),
        vec![json!(1), json!(2)]
    );
    // evaluate() keeps the first value only
    assert_eq!(eval(".items[].id", json!({"items": [{"id": 1}, {"id": 2}]})), json!(1));
    assert_eq!(eval(".items[]", json!({"items": []})), json!(null));
}

// ── Operators ─────────────────────────────────────────────────────

#[test]
fn alternative_operator() {
    assert_eq!(eval(r#".name // "unknown""#, json!({})), json!("unknown"));
    assert_eq!(eval(r#".name // "unknown""#, json!({"name": false})), json!("unknown"));
    assert_eq!(eval(r#".name // "unknown""#, json!({"name": "svc"})), json!("svc"));
    // an optional left side that errors falls through to the right
    assert_eq!(eval("(.a.b)? // 3", json!({"a": 1})), json!(3));
    assert!(matches!(eval_err(".a.b // 3", json!({"a": 1})), ExprError::Raised(_)));
}

#[test]
fn comparisons_and_logic() {
    let input = json!({"state": "open", "priority": 2});
    assert_eq!(eval(r#".state == "open""#, input.clone()), json!(true));
    assert_eq!(eval(".priority > 1 and .priority <= 2", input.clone()), json!(true));
    assert_eq!(eval(r#".state != "open" or .priority < 1"#, input.clone()), json!(false));
    assert_eq!(eval(".missing | not", input), json!(true));
    assert_eq!(eval("1 == 1.0", json!(null)), json!(true));
    assert_eq!(eval("null < false", json!(null)), json!(true));
    assert_eq!(eval(r#"[1] > "z""#, json!(null)), json!(true));
}

#[test]
fn arithmetic() {
    assert_eq!(eval(".a + .b", json!({"a": 1, "b": 2})), json!(3));
    assert_eq!(eval(".a * 2 - 1", json!({"a": 1.5})), json!(2.0));
    assert_eq!(eval("7 % 3", json!(null)), json!(1));
    assert_eq!(eval("10 / 4", json!(null)), json!(2.5));
    assert_eq!(eval("-.a", json!({"a": 3})), json!(-3));
    assert_eq!(eval(r#""a" + "b""#, json!(null)), json!("ab"));
    assert_eq!(eval("[1,2] + [3]", json!(null)), json!([1, 2, 3]));
    assert_eq!(eval("[1,2,3] - [2]", json!(null)), json!([1, 3]));
    assert_eq!(eval("null + 1", json!(null)), json!(1));
    assert_eq!(eval(r#""a,b" / ",""#, json!(null)), json!(["a", "b"]));
    assert_eq!(
        eval("{a: {b: 1}} * {a: {c: 2}}", json!(null)),
        json!({"a": {"b": 1, "c": 2}})
    );
}

#[test]
fn arithmetic_type_errors() {
    assert!(matches!(eval_err(r#"1 + "a""#, json!(null)), ExprError::Raised(_)));
    assert!(matches!(eval_err(r#"{} - 1"#, json!(null)), ExprError::Raised(_)));
    // a non-finite result has no JSON form
    assert_eq!(eval("1 / 0", json!(null)), json!(null));
}

#[test]
fn integer_overflow_is_an_error_not_a_crash() {
    let min = json!({"n": i64::MIN});
    assert!(matches!(eval_err(".n % -1", min.clone()), ExprError::Aborted(_)));
    // the expression stays usable afterwards
    assert_eq!(eval(".n % 2", min), json!(0));
}

// ── Constructors ──────────────────────────────────────────────────

#[test]
fn object_and_array_construction() {
    let input = json!({"name": "api", "owner": {"team": "core"}});
    assert_eq!(
        eval("{name, team: .owner.team, tags: [.name, \"x\"]}", input),
        json!({"name": "api", "team": "core", "tags": ["api", "x"]})
    );
    assert_eq!(eval("[]", json!(null)), json!([]));
    assert_eq!(eval(r#"{("k" + "1"): 1}"#, json!(null)), json!({"k1": 1}));
}

#[test]
fn string_interpolation() {
    assert_eq!(
        eval(r#""\(.org)/\(.repo | ascii_downcase)""#, json!({"org": "acme", "repo": "API"})),
        json!("acme/api")
    );
    assert_eq!(eval(r#""n=\(.n)""#, json!({"n": 3})), json!("n=3"));
}

#[test]
fn conditionals() {
    let expr = r#"if .p == 1 then "high" elif .p == 2 then "medium" else "low" end"#;
    assert_eq!(eval(expr, json!({"p": 1})), json!("high"));
    assert_eq!(eval(expr, json!({"p": 2})), json!("medium"));
    assert_eq!(eval(expr, json!({"p": 9})), json!("low"));
    // no else branch passes the input through
    assert_eq!(eval("if .a then 1 end", json!({"a": false})), json!({"a": false}));
}

// ── Builtins ──────────────────────────────────────────────────────

#[test]
fn collection_builtins() {
    let input = json!({"labels": [{"name": "bug"}, {"name": "p1"}], "meta": {"b": 1, "a": 2}});
    assert_eq!(eval(".labels | map(.name)", input.clone()), json!(["bug", "p1"]));
    assert_eq!(eval(".labels | length", input.clone()), json!(2));
    assert_eq!(eval(".meta | keys", input.clone()), json!(["a", "b"]));
    assert_eq!(eval(r#".meta | has("a")"#, input.clone()), json!(true));
    assert_eq!(
        eval(r#".labels | map(select(.name | startswith("p"))) | length"#, input.clone()),
        json!(1)
    );
    assert_eq!(eval(".meta | to_entries | map(.value) | add", input.clone()), json!(3));
    assert_eq!(eval("[3, 1, 2, 1] | unique", json!(null)), json!([1, 2, 3]));
    assert_eq!(eval("[3, 1, 2] | sort | reverse", json!(null)), json!([3, 2, 1]));
    assert_eq!(eval("[{a: 2}, {a: 1}] | sort_by(.a) | first.a", json!(null)), json!(1));
    assert_eq!(eval("[1, 5, 3] | max", json!(null)), json!(5));
    assert_eq!(eval("[] | min", json!(null)), json!(null));
    assert_eq!(
        eval("{a: 1, b: 2} | with_entries(select(.value > 1))", json!(null)),
        json!({"b": 2})
    );
}

#[test]
fn string_builtins() {
    assert_eq!(eval(r#""A-b" | ascii_downcase"#, json!(null)), json!("a-b"));
    assert_eq!(eval(r#""a b" | ascii_upcase"#, json!(null)), json!("A B"));
    assert_eq!(eval(r#""a,b" | split(",")"#, json!(null)), json!(["a", "b"]));
    assert_eq!(eval(r#"["a", "b", "c"] | join("-")"#, json!(null)), json!("a-b-c"));
    assert_eq!(eval(r#""refs/heads/main" | ltrimstr("refs/heads/")"#, json!(null)), json!("main"));
    assert_eq!(eval(r#""file.yaml" | rtrimstr(".yaml")"#, json!(null)), json!("file"));
    assert_eq!(eval(r#""foobar" | contains("oba")"#, json!(null)), json!(true));
    assert_eq!(eval(r#""PROJ-12" | test("^[A-Z]+-\\d+$")"#, json!(null)), json!(true));
    assert_eq!(eval(r#""abc" | endswith("bc")"#, json!(null)), json!(true));
}

#[test]
fn conversion_builtins() {
    assert_eq!(eval(".n | tostring", json!({"n": 42})), json!("42"));
    assert_eq!(eval(r#""3.5" | tonumber"#, json!(null)), json!(3.5));
    assert_eq!(eval(".a | type", json!({"a": [1]})), json!("array"));
    assert_eq!(eval("{a: 1} | tojson", json!(null)), json!(r#"{"a":1}"#));
    assert_eq!(eval(r#""[1,2]" | fromjson"#, json!(null)), json!([1, 2]));
    assert_eq!(eval("3.7 | floor", json!(null)), json!(3));
}

#[test]
fn date_builtins() {
    assert_eq!(eval("0 | todate", json!(null)), json!("1970-01-01T00:00:00Z"));
    assert_eq!(
        eval(r#""2024-01-02T03:04:05Z" | fromdate"#, json!(null)),
        json!(1_704_164_645)
    );
    assert_eq!(
        eval(r#""2024-01-02T03:04:05+01:00" | fromdate"#, json!(null)),
        json!(1_704_161_045)
    );
    assert!(matches!(eval_err(r#""yesterday" | fromdate"#, json!(null)), ExprError::Raised(_)));
}

#[test]
fn empty_and_error() {
    assert_eq!(eval_all("empty", json!(1)), Vec::<Value>::new());
    assert_eq!(eval("empty", json!(1)), json!(null));
    assert_eq!(
        eval_err(r#"error("boom")"#, json!(null)),
        ExprError::Raised("boom".to_string())
    );
}

// ── Compilation ───────────────────────────────────────────────────

#[test]
fn compile_errors() {
    assert!(matches!(JqExpression::compile(".a |"), Err(ExprError::Parse { .. })));
    assert!(matches!(JqExpression::compile("{a: }"), Err(ExprError::Parse { .. })));
    assert_eq!(
        JqExpression::compile("nosuchfn(.a)").unwrap_err(),
        ExprError::UnknownFunction { name: "nosuchfn".to_string(), arity: 1 }
    );
    assert!(matches!(
        JqExpression::compile(".a + $nope"),
        Err(ExprError::Undefined { kind: "variable", .. })
    ));
    assert!(matches!(
        JqExpression::compile(r#""unterminated"#),
        Err(ExprError::Parse { .. })
    ));
}

#[test]
fn invalid_regex_is_reported() {
    assert!(matches!(eval_err(r#""a" | test("(")"#, json!(null)), ExprError::Raised(_)));
}

#[test]
fn compiler_trait_object() {
    let expr = JqCompiler.compile(".id").unwrap();
    assert_eq!(expr.source(), ".id");
    assert_eq!(expr.evaluate(&json!({"id": 7})).unwrap(), json!(7));
}

#[test]
fn evaluation_is_pure() {
    let expr = JqExpression::compile(r#"{id: .id, name: (.name // "n/a")}"#).unwrap();
    let input = json!({"id": 1});
    assert_eq!(expr.evaluate(&input).unwrap(), expr.evaluate(&input).unwrap());
    assert_eq!(input, json!({"id": 1}));
}

#[test]
fn clock_and_environment_are_unavailable() {
    assert!(JqExpression::compile("now").is_ok());
    assert!(matches!(eval_err("now", json!(null)), ExprError::Raised(_)));
    assert!(matches!(eval_err("env", json!(null)), ExprError::Raised(_)));
    assert!(matches!(eval_err("halt", json!(null)), ExprError::Raised(_)));
}

#[test]
fn parse_errors_point_into_the_source() {
    match JqExpression::compile(".a | | .b") {
        Err(ExprError::Parse { position, .. }) => assert!(position <= ".a | | .b".len()),
        other => panic!("expected a parse error, got {other:?}"),
    }
}
