//! CMP provider contracts.
//!
//! Providers are injected values, never looked up from a global namespace.
//! Both deliver their answer through a [`ConsentCallback`], either from
//! inside the call or later from another task.

use std::sync::Arc;

use serde_json::Value;

use crate::errors::ProviderError;

/// Receives a raw CMP payload
pub type ConsentCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// In-page CMP with the `(command, parameter, callback)` calling convention.
pub trait InPageCmp: Send + Sync {
    fn call(
        &self,
        command: &str,
        parameter: Option<&Value>,
        callback: ConsentCallback,
    ) -> Result<(), ProviderError>;
}

/// Operator-registered CMP taking only a callback.
pub trait CustomCmp: Send + Sync {
    fn call(&self, callback: ConsentCallback) -> Result<(), ProviderError>;
}

impl<F> InPageCmp for F
where
    F: Fn(&str, Option<&Value>, ConsentCallback) -> Result<(), ProviderError> + Send + Sync,
{
    fn call(
        &self,
        command: &str,
        parameter: Option<&Value>,
        callback: ConsentCallback,
    ) -> Result<(), ProviderError> {
        self(command, parameter, callback)
    }
}

impl<F> CustomCmp for F
where
    F: Fn(ConsentCallback) -> Result<(), ProviderError> + Send + Sync,
{
    fn call(&self, callback: ConsentCallback) -> Result<(), ProviderError> {
        self(callback)
    }
}
