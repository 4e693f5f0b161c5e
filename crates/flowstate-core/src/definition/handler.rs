// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State handlers and their typed variable bindings.
//!
//! Every non-final state is registered with a handler and an ordered list of
//! [`StateVariable`] descriptors. Before the handler runs, the declared
//! variables are decoded into [`StateArgs`]; afterwards the writable ones are
//! encoded back into the instance's variables.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::codec::{VariableCodec, VariableKind};
use crate::error::{CoreError, Result};
use crate::execution::StateExecution;
use crate::model::{NextAction, StateVariables};

/// Business logic of one workflow state.
#[async_trait]
pub trait StateHandler: Send + Sync {
    /// Run the state. An error fails the attempt and triggers retry handling.
    async fn execute(
        &self,
        execution: &mut StateExecution,
        args: &mut StateArgs,
    ) -> anyhow::Result<NextAction>;
}

/// Adapter turning a synchronous closure into a [`StateHandler`].
pub struct FnHandler<F>(F);

/// Wrap a closure as a state handler.
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&mut StateExecution, &mut StateArgs) -> anyhow::Result<NextAction> + Send + Sync,
{
    FnHandler(f)
}

#[async_trait]
impl<F> StateHandler for FnHandler<F>
where
    F: Fn(&mut StateExecution, &mut StateArgs) -> anyhow::Result<NextAction> + Send + Sync,
{
    async fn execute(
        &self,
        execution: &mut StateExecution,
        args: &mut StateArgs,
    ) -> anyhow::Result<NextAction> {
        (self.0)(execution, args)
    }
}

/// Declaration of a variable a handler receives as an argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateVariable {
    pub name: String,
    pub kind: VariableKind,
    /// Value used, and stored, when the variable does not exist yet.
    pub default: Option<String>,
    /// Read-only variables are never written back.
    pub read_only: bool,
    /// Optional variables are passed as `Null` when missing.
    pub optional: bool,
}

impl StateVariable {
    pub fn new(name: impl Into<String>, kind: VariableKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            read_only: false,
            optional: false,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, VariableKind::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, VariableKind::Integer)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, VariableKind::Boolean)
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, VariableKind::Json)
    }

    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Decoded handler arguments, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateArgs {
    values: Vec<(String, Value)>,
}

impl StateArgs {
    /// Value of the named argument; `Null` when the variable is absent.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Argument by declaration index.
    pub fn at(&self, index: usize) -> Option<&Value> {
        self.values.get(index).map(|(_, v)| v)
    }

    /// Replace the value of a declared argument. Returns false if undeclared.
    pub fn set(&mut self, name: &str, value: Value) -> bool {
        match self.values.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A registered handler with its variable declarations.
#[derive(Clone)]
pub struct StateMethod {
    handler: Arc<dyn StateHandler>,
    variables: Vec<StateVariable>,
}

impl std::fmt::Debug for StateMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMethod")
            .field("handler", &"...")
            .field("variables", &self.variables)
            .finish()
    }
}

impl StateMethod {
    pub(crate) fn new(handler: Arc<dyn StateHandler>, variables: Vec<StateVariable>) -> Self {
        Self { handler, variables }
    }

    pub fn handler(&self) -> &Arc<dyn StateHandler> {
        &self.handler
    }

    pub fn variables(&self) -> &[StateVariable] {
        &self.variables
    }

    /// Decode the declared variables from `variables`.
    ///
    /// Missing variables with a default are instantiated with it, missing
    /// optional variables are passed as `Null`. Any other missing variable
    /// fails the binding.
    pub fn bind_arguments(
        &self,
        variables: &StateVariables,
        codec: &dyn VariableCodec,
    ) -> Result<StateArgs> {
        let mut values = Vec::with_capacity(self.variables.len());
        for declared in &self.variables {
            let raw = variables
                .get(&declared.name)
                .map(String::as_str)
                .or(declared.default.as_deref());
            let value = match raw {
                Some(raw) => codec.decode(declared.kind, &declared.name, raw)?,
                None if declared.optional => Value::Null,
                None => {
                    return Err(CoreError::VariableCodec {
                        name: declared.name.clone(),
                        reason: "required variable is missing".to_string(),
                    });
                }
            };
            values.push((declared.name.clone(), value));
        }
        Ok(StateArgs { values })
    }

    /// Encode writable, non-null arguments back into `variables`.
    pub fn write_back(
        &self,
        args: &StateArgs,
        variables: &mut StateVariables,
        codec: &dyn VariableCodec,
    ) -> Result<()> {
        for (declared, (_, value)) in self.variables.iter().zip(&args.values) {
            if declared.read_only || value.is_null() {
                continue;
            }
            let encoded = codec.encode(&declared.name, value)?;
            variables.insert(declared.name.clone(), encoded);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonVariableCodec;
    use serde_json::json;

    fn method(variables: Vec<StateVariable>) -> StateMethod {
        let handler = handler_fn(|_, _| anyhow::bail!("not called"));
        StateMethod::new(Arc::new(handler), variables)
    }

    #[test]
    fn test_bind_uses_defaults_and_nulls() {
        let method = method(vec![
            StateVariable::integer("amount"),
            StateVariable::integer("attempts").default_value("0"),
            StateVariable::string("note").optional(),
        ]);
        let mut variables = StateVariables::new();
        variables.insert("amount".into(), "12".into());

        let args = method.bind_arguments(&variables, &JsonVariableCodec).unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args.get("amount"), Some(&json!(12)));
        assert_eq!(args.at(1), Some(&json!(0)));
        assert_eq!(args.get("note"), Some(&Value::Null));
    }

    #[test]
    fn test_bind_fails_on_missing_required_variable() {
        let method = method(vec![StateVariable::integer("amount")]);
        let err = method
            .bind_arguments(&StateVariables::new(), &JsonVariableCodec)
            .unwrap_err();
        assert!(err.to_string().contains("required variable is missing"));
    }

    #[test]
    fn test_bind_fails_on_undecodable_value() {
        let method = method(vec![StateVariable::integer("amount")]);
        let mut variables = StateVariables::new();
        variables.insert("amount".into(), "many".into());
        assert!(method.bind_arguments(&variables, &JsonVariableCodec).is_err());
    }

    #[test]
    fn test_write_back_skips_read_only_and_null() {
        let method = method(vec![
            StateVariable::integer("attempts").default_value("0"),
            StateVariable::string("customer").read_only(),
            StateVariable::string("note").optional(),
        ]);
        let mut variables = StateVariables::new();
        variables.insert("customer".into(), "acme".into());

        let mut args = method.bind_arguments(&variables, &JsonVariableCodec).unwrap();
        assert!(args.set("attempts", json!(3)));
        assert!(args.set("customer", json!("other")));
        assert!(!args.set("undeclared", json!(1)));

        method
            .write_back(&args, &mut variables, &JsonVariableCodec)
            .unwrap();
        assert_eq!(variables.get("attempts").map(String::as_str), Some("3"));
        assert_eq!(variables.get("customer").map(String::as_str), Some("acme"));
        assert!(!variables.contains_key("note"));
    }
}
