//! Device/app context stamped onto every queued event.
//!
//! Platform probes (location, bluetooth, ad identifier, notification
//! authorization, ...) live outside this crate. Each one is a
//! [`ContextProvider`] that enriches a [`Context`]; the queue folds every
//! registered provider in registration order when an event is enqueued.

use serde::{Deserialize, Serialize};

use crate::attributes::{AttributeValue, Attributes};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(Attributes);

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.0.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn attributes(&self) -> &Attributes {
        &self.0
    }
}

/// Enriches a context snapshot with one slice of device state.
pub trait ContextProvider: Send + Sync {
    fn capture_context(&self, context: Context) -> Context;
}

impl<F> ContextProvider for F
where
    F: Fn(Context) -> Context + Send + Sync,
{
    fn capture_context(&self, context: Context) -> Context {
        self(context)
    }
}

/// Run every provider over an empty context, in order.
pub fn capture(providers: &[std::sync::Arc<dyn ContextProvider>]) -> Context {
    providers
        .iter()
        .fold(Context::new(), |ctx, provider| provider.capture_context(ctx))
}
