//! Evaluation of the page's embedded state expression without running any
//! real JavaScript.
//!
//! Only the data-literal subset a hydration payload is written in is accepted:
//! object/array/string/number/boolean/null literals, `undefined`, `void`, the
//! unary `!`/`-`/`+` operators, member access, parameter and `var` bindings,
//! member assignments, and immediately-invoked `function` expressions. Anything
//! else (calls of non-literal functions, `new`, operators, templates, regexes)
//! is rejected, so there is nothing for hostile input to execute.
//!
//! Placeholder globals (`window`, `document`, ...) are inert empty objects
//! supplied through [`Placeholders`]; nothing from the host process is visible.

mod eval;
mod lexer;

pub use eval::truthy;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::DEFAULT_SANDBOX_TIMEOUT_MS;
use crate::extract::{EmbeddedExpression, STATE_GLOBAL, STATE_PROPERTY};

pub const MAX_DEPTH: usize = 256;

#[derive(Debug, Error, PartialEq)]
pub enum SandboxError {
    #[error("syntax error at byte {pos}: {msg}")]
    Syntax { pos: usize, msg: String },

    #[error("unsupported construct: {0}")]
    Unsupported(String),

    #[error("unknown identifier `{0}`")]
    UnknownIdentifier(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("nesting deeper than {} levels", MAX_DEPTH)]
    TooDeep,

    #[error("evaluation exceeded {0:?}")]
    Timeout(Duration),

    #[error("expression produced no result")]
    NoResult,
}

impl SandboxError {
    pub(crate) fn syntax(pos: usize, msg: impl Into<String>) -> Self {
        SandboxError::Syntax {
            pos,
            msg: msg.into(),
        }
    }
}

/// Wall-clock deadline shared by lexing, parsing and evaluation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Budget {
    deadline: Instant,
    limit: Duration,
}

impl Budget {
    pub(crate) fn new(limit: Duration) -> Self {
        Self {
            deadline: Instant::now() + limit,
            limit,
        }
    }

    pub(crate) fn check_deadline(&self) -> Result<(), SandboxError> {
        if Instant::now() >= self.deadline {
            Err(SandboxError::Timeout(self.limit))
        } else {
            Ok(())
        }
    }

    pub(crate) fn check_depth(&self, depth: usize) -> Result<(), SandboxError> {
        if depth > MAX_DEPTH {
            Err(SandboxError::TooDeep)
        } else {
            Ok(())
        }
    }
}

/// Names bound to inert empty objects in the global scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholders {
    names: Vec<String>,
}

impl Default for Placeholders {
    fn default() -> Self {
        Self::new(["window", "document", "navigator", "location"])
    }
}

impl Placeholders {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    fn scope(&self) -> BTreeMap<String, Value> {
        self.names()
            .map(|n| (n.to_string(), Value::Object(Map::new())))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    timeout: Duration,
    placeholders: Placeholders,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_SANDBOX_TIMEOUT_MS))
    }
}

impl Sandbox {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            placeholders: Placeholders::default(),
        }
    }

    pub fn with_placeholders(mut self, placeholders: Placeholders) -> Self {
        self.placeholders = placeholders;
        self
    }

    /// Runs `window.__NUXT__ = <expr>;` and returns what ended up on `window.__NUXT__`.
    pub fn evaluate(&self, expr: &EmbeddedExpression<'_>) -> Result<Value, SandboxError> {
        self.evaluate_assignment(&expr.assignment(), STATE_GLOBAL, STATE_PROPERTY)
    }

    /// Executes `program` and reads `global.property` back out of the
    /// placeholder scope. `null`/`undefined` count as no result.
    pub fn evaluate_assignment(
        &self,
        program: &str,
        global: &str,
        property: &str,
    ) -> Result<Value, SandboxError> {
        let budget = Budget::new(self.timeout);
        let tokens = lexer::tokenize(program, &budget)?;
        let statements = eval::Parser::new(&tokens, budget).parse_program()?;

        let mut interp = eval::Interpreter::new(self.placeholders.scope(), budget);
        interp.run_program(&statements)?;

        let result = interp
            .global(global)
            .and_then(|g| g.get(property))
            .cloned()
            .unwrap_or(Value::Null);
        if result.is_null() {
            return Err(SandboxError::NoResult);
        }
        tracing::debug!(global, property, "Sandbox evaluation produced a value");
        Ok(result)
    }
}
