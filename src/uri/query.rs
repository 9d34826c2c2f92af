//! Declarative mapping from query-string keys to typed option fields.
//!
//! A [`QueryDescriptor`] names a source key and knows how to parse and
//! store its value on an options struct; [`apply_descriptors`] runs a set
//! of them over a parsed query map, touching only the fields whose source
//! keys are present.

use std::collections::HashMap;

use crate::error::Result;
use crate::utility::{parse_boolean, parse_integer, to_camel_case};

/// A query value: a single string, or the ordered sequence produced by a
/// repeated key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    Scalar(String),
    Sequence(Vec<String>),
}

impl QueryValue {
    /// Collapses to one string: a sequence yields its last element.
    pub fn as_scalar(&self) -> &str {
        match self {
            QueryValue::Scalar(value) => value,
            QueryValue::Sequence(values) => values.last().map(String::as_str).unwrap_or(""),
        }
    }

    /// Widens to a sequence: a scalar yields a one-element view.
    pub fn as_array(&self) -> Vec<&str> {
        match self {
            QueryValue::Scalar(value) => vec![value.as_str()],
            QueryValue::Sequence(values) => values.iter().map(String::as_str).collect(),
        }
    }

    pub(crate) fn push(&mut self, value: String) {
        match self {
            QueryValue::Scalar(first) => {
                *self = QueryValue::Sequence(vec![std::mem::take(first), value]);
            }
            QueryValue::Sequence(values) => values.push(value),
        }
    }
}

type Apply<T> = Box<dyn Fn(&mut T, &QueryValue) -> Result<()> + Send + Sync>;

/// Maps one query key onto one typed field of `T`.
pub struct QueryDescriptor<T> {
    source: String,
    apply: Apply<T>,
}

impl<T> QueryDescriptor<T> {
    /// Descriptor with a custom parser/setter.
    pub fn new<F>(source: &str, apply: F) -> Self
    where
        F: Fn(&mut T, &QueryValue) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            source: source.to_owned(),
            apply: Box::new(apply),
        }
    }

    /// Descriptor storing the raw scalar value.
    pub fn string<F>(source: &str, set: F) -> Self
    where
        F: Fn(&mut T, String) + Send + Sync + 'static,
    {
        Self::new(source, move |target, value| {
            set(target, value.as_scalar().to_owned());
            Ok(())
        })
    }

    /// Descriptor parsing the scalar value with [`parse_integer`].
    pub fn integer<F>(source: &str, set: F) -> Self
    where
        F: Fn(&mut T, i64) + Send + Sync + 'static,
    {
        Self::new(source, move |target, value| {
            set(target, parse_integer(value.as_scalar())?);
            Ok(())
        })
    }

    /// Descriptor parsing the scalar value with [`parse_boolean`].
    pub fn boolean<F>(source: &str, set: F) -> Self
    where
        F: Fn(&mut T, bool) + Send + Sync + 'static,
    {
        Self::new(source, move |target, value| {
            set(target, parse_boolean(value.as_scalar())?);
            Ok(())
        })
    }
}

/// Runs `descriptors` over `queries`, merging parsed values into `target`.
/// Absent source keys leave their fields untouched; a value its parser
/// rejects fails the whole application.
pub fn apply_descriptors<T>(
    target: &mut T,
    queries: &HashMap<String, QueryValue>,
    descriptors: &[QueryDescriptor<T>],
) -> Result<()> {
    for descriptor in descriptors {
        if let Some(value) = queries.get(&to_camel_case(&descriptor.source)) {
            (descriptor.apply)(target, value)?;
        }
    }
    Ok(())
}
