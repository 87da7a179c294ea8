//! The mapping expression language: JQ, evaluated by the `jaq` engine.
//!
//! Expressions are compiled once when a mapping document is loaded and
//! evaluated once per raw object. Evaluation is pure: the clock, the
//! environment and process control builtins are replaced by filters that
//! raise an error.
//!
//! The mapper only depends on the [`Expression`] trait, so a different
//! engine can be injected through [`ExpressionCompiler`].

use jaq_core::box_iter::box_once;
use jaq_core::compile::{Lut, Undefined};
use jaq_core::load::{self, Arena, File, Loader};
use jaq_core::{Compiler, Ctx, Cv, Exn, Native, RcIter, ValXs};
use jaq_json::Val;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExprError {
    #[error("parse error at offset {position}: {message}")]
    Parse { message: String, position: usize },

    #[error("unknown function {name}/{arity}")]
    UnknownFunction { name: String, arity: usize },

    #[error("undefined {kind} {name}")]
    Undefined { kind: &'static str, name: String },

    /// A runtime error: a type mismatch, a bad regex, or `error(...)`.
    #[error("{0}")]
    Raised(String),

    /// The engine panicked, e.g. on integer overflow.
    #[error("evaluation aborted: {0}")]
    Aborted(String),
}

/// A compiled, side-effect-free expression.
pub trait Expression: Send + Sync + fmt::Debug {
    /// Evaluates against `input`. When the expression yields several values
    /// the first one is returned; when it yields none, `null`.
    fn evaluate(&self, input: &Value) -> Result<Value, ExprError>;

    /// The source text the expression was compiled from.
    fn source(&self) -> &str;
}

/// Compiles expression source text. The mapper is generic over this so tests
/// and embedders can swap the engine.
pub trait ExpressionCompiler: Send + Sync {
    fn compile(&self, source: &str) -> Result<Arc<dyn Expression>, ExprError>;
}

/// The default JQ compiler.
#[derive(Debug, Clone, Copy, Default)]
pub struct JqCompiler;

impl ExpressionCompiler for JqCompiler {
    fn compile(&self, source: &str) -> Result<Arc<dyn Expression>, ExprError> {
        Ok(Arc::new(JqExpression::compile(source)?))
    }
}

/// Builtins that would read the clock, the environment, or end the process.
const IMPURE: [&str; 4] = ["env", "now", "halt", "halt_error"];

fn unavailable<'a>(_: &'a Lut<Native<Val>>, _: Cv<'a, Val>) -> ValXs<'a, Val> {
    box_once(Err(Exn::from(jaq_core::Error::str(
        "builtin is not available in mapping expressions",
    ))))
}

fn natives() -> impl Iterator<Item = jaq_std::Filter<Native<Val>>> {
    jaq_std::funs()
        .chain(jaq_json::funs())
        .map(|(name, args, native)| {
            if IMPURE.contains(&name) {
                (name, args, Native::new(unavailable))
            } else {
                (name, args, native)
            }
        })
}

pub struct JqExpression {
    source: String,
    filter: jaq_core::Filter<Native<Val>>,
}

impl JqExpression {
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        let arena = Arena::default();
        let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
        let program = File {
            code: source,
            path: (),
        };
        let modules = loader
            .load(&arena, program)
            .map_err(|errs| load_error(source, errs))?;
        let filter = Compiler::default()
            .with_funs(natives())
            .compile(modules)
            .map_err(compile_error)?;
        Ok(Self {
            source: source.to_string(),
            filter,
        })
    }

    /// All values the expression produces, in order.
    pub fn evaluate_all(&self, input: &Value) -> Result<Vec<Value>, ExprError> {
        let run = || {
            let inputs = RcIter::new(core::iter::empty::<Result<Val, String>>());
            let outputs: Result<Vec<Value>, ExprError> = self
                .filter
                .run((Ctx::new([], &inputs), Val::from(input.clone())))
                .map(|out| {
                    out.map(Value::from)
                        .map_err(|e| ExprError::Raised(message(e.into_val())))
                })
                .collect();
            outputs
        };
        panic::catch_unwind(AssertUnwindSafe(run))
            .unwrap_or_else(|payload| Err(ExprError::Aborted(panic_message(payload.as_ref()))))
    }
}

impl fmt::Debug for JqExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("JqExpression").field(&self.source).finish()
    }
}

impl Expression for JqExpression {
    fn evaluate(&self, input: &Value) -> Result<Value, ExprError> {
        Ok(self
            .evaluate_all(input)?
            .into_iter()
            .next()
            .unwrap_or(Value::Null))
    }

    fn source(&self) -> &str {
        &self.source
    }
}

/// JQ truthiness: only `false` and `null` are falsy.
#[must_use]
pub fn is_truthy(v: &Value) -> bool {
    !matches!(v, Value::Null | Value::Bool(false))
}

/// Byte offset of `part` inside `whole`, clamped to the end of `whole`.
fn position(whole: &str, part: &str) -> usize {
    (part.as_ptr() as usize)
        .checked_sub(whole.as_ptr() as usize)
        .filter(|offset| *offset <= whole.len())
        .unwrap_or(whole.len())
}

fn load_error(source: &str, errs: load::Errors<&str, ()>) -> ExprError {
    let first = errs.into_iter().find_map(|(_file, err)| match err {
        load::Error::Io(errs) => errs
            .into_iter()
            .next()
            .map(|(path, msg)| ExprError::Parse {
                message: msg,
                position: position(source, path),
            }),
        load::Error::Lex(errs) => errs.into_iter().next().map(|(expect, at)| ExprError::Parse {
            message: format!("expected {}", expect.as_str()),
            position: position(source, at),
        }),
        load::Error::Parse(errs) => errs.into_iter().next().map(|(expect, at)| ExprError::Parse {
            message: format!("expected {}", expect.as_str()),
            position: position(source, at),
        }),
    });
    first.unwrap_or_else(|| ExprError::Parse {
        message: "invalid expression".to_string(),
        position: 0,
    })
}

fn compile_error(errs: Vec<(File<&str, ()>, Vec<(&str, Undefined)>)>) -> ExprError {
    let first = errs
        .into_iter()
        .flat_map(|(_file, errs)| errs)
        .next()
        .map(|(name, undefined)| match undefined {
            Undefined::Filter(arity) => ExprError::UnknownFunction {
                name: name.to_string(),
                arity,
            },
            other => ExprError::Undefined {
                kind: other.as_str(),
                name: name.to_string(),
            },
        });
    first.unwrap_or_else(|| ExprError::Parse {
        message: "invalid expression".to_string(),
        position: 0,
    })
}

fn message(v: Val) -> String {
    match v {
        Val::Str(s) => s.to_string(),
        other => other.to_string(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "engine panic".to_string())
}
