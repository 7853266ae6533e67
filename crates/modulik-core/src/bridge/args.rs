//! Call arguments that may carry callbacks.
//!
//! Callbacks are found one level deep: a top-level argument, an element of an
//! array argument, or a field of an object argument. On the wire each one is
//! replaced by a token string holding its [`CallbackId`].

use serde_json::{Map, Value};

use crate::callbacks::Callback;

use super::protocol::CallbackId;

/// Prefix of the token standing in for a callback on the wire.
pub const CALLBACK_TOKEN_PREFIX: &str = "modulik-callback-id:";

/// One call argument.
///
/// `C` is the callback representation: a host [`Callback`] when calling into
/// a worker, a remote stand-in inside the worker.
#[derive(Debug, Clone)]
pub enum Arg<C = Callback> {
    /// Plain data.
    Value(Value),
    /// A top-level callback.
    Callback(C),
    /// An array with at least one callback element.
    Array(Vec<ArgItem<C>>),
    /// An object with at least one callback field.
    Object(Vec<(String, ArgItem<C>)>),
}

/// An element of an [`Arg::Array`] or a field of an [`Arg::Object`].
#[derive(Debug, Clone)]
pub enum ArgItem<C = Callback> {
    Value(Value),
    Callback(C),
}

impl<C> Arg<C> {
    /// The plain value, if this argument carries no callback.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Arg::Value(value) => Some(value),
            _ => None,
        }
    }

    /// The callback, if this argument is one.
    pub fn as_callback(&self) -> Option<&C> {
        match self {
            Arg::Callback(callback) => Some(callback),
            _ => None,
        }
    }

    /// Callbacks carried by this argument, in order.
    pub fn callbacks(&self) -> Vec<&C> {
        match self {
            Arg::Value(_) => Vec::new(),
            Arg::Callback(callback) => vec![callback],
            Arg::Array(items) => items.iter().filter_map(ArgItem::as_callback).collect(),
            Arg::Object(fields) => fields
                .iter()
                .filter_map(|(_, item)| item.as_callback())
                .collect(),
        }
    }
}

impl<C> ArgItem<C> {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            ArgItem::Value(value) => Some(value),
            ArgItem::Callback(_) => None,
        }
    }

    pub fn as_callback(&self) -> Option<&C> {
        match self {
            ArgItem::Callback(callback) => Some(callback),
            ArgItem::Value(_) => None,
        }
    }
}

impl<C> From<Value> for Arg<C> {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl<C> From<Value> for ArgItem<C> {
    fn from(value: Value) -> Self {
        ArgItem::Value(value)
    }
}

/// Wire token for a callback id.
pub fn callback_token(id: CallbackId) -> String {
    format!("{CALLBACK_TOKEN_PREFIX}{id}")
}

/// Extract the callback id from a wire token.
pub fn parse_callback_token(value: &Value) -> Option<CallbackId> {
    value
        .as_str()?
        .strip_prefix(CALLBACK_TOKEN_PREFIX)
        .and_then(CallbackId::parse)
}

/// Replace callbacks by tokens, registering each one through `register`.
pub(crate) fn marshal<C>(args: Vec<Arg<C>>, mut register: impl FnMut(C) -> CallbackId) -> Vec<Value> {
    let mut item = |item: ArgItem<C>| match item {
        ArgItem::Value(value) => value,
        ArgItem::Callback(callback) => Value::String(callback_token(register(callback))),
    };

    args.into_iter()
        .map(|arg| match arg {
            Arg::Value(value) => value,
            Arg::Callback(callback) => item(ArgItem::Callback(callback)),
            Arg::Array(items) => Value::Array(items.into_iter().map(&mut item).collect()),
            Arg::Object(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|(key, value)| (key, item(value)))
                    .collect::<Map<_, _>>(),
            ),
        })
        .collect()
}

/// Resolve tokens into callbacks through `resolve`.
pub(crate) fn unmarshal<C>(values: Vec<Value>, mut resolve: impl FnMut(CallbackId) -> C) -> Vec<Arg<C>> {
    let mut item = |value: Value| match parse_callback_token(&value) {
        Some(id) => ArgItem::Callback(resolve(id)),
        None => ArgItem::Value(value),
    };

    values
        .into_iter()
        .map(|value| match value {
            Value::String(_) if parse_callback_token(&value).is_some() => match item(value) {
                ArgItem::Callback(callback) => Arg::Callback(callback),
                ArgItem::Value(value) => Arg::Value(value),
            },
            Value::Array(items) if items.iter().any(|v| parse_callback_token(v).is_some()) => {
                Arg::Array(items.into_iter().map(&mut item).collect())
            }
            Value::Object(fields) if fields.values().any(|v| parse_callback_token(v).is_some()) => {
                Arg::Object(
                    fields
                        .into_iter()
                        .map(|(key, value)| (key, item(value)))
                        .collect(),
                )
            }
            value => Arg::Value(value),
        })
        .collect()
}
