//! Turns source records into operations, or rejects them before any remote
//! call is made. Rejections become `Skipped` results, never failures.

use serde_json::Value;
use thiserror::Error;

use crate::contract::{Operation, OperationKey};
use crate::source::{Record, SourceRecord};

pub const DEFAULT_KEY_FIELD: &str = "id";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing key field `{0}`")]
    MissingKey(String),
    #[error("key field `{field}` must be a non-empty string or an integer, got {found}")]
    InvalidKey { field: String, found: String },
    #[error("missing required field `{0}`")]
    MissingField(String),
    #[error("ordering field `{0}` must be an integer")]
    InvalidOrderHint(String),
}

/// A record that did not become an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub offset: u64,
    pub record: Record,
    pub error: ValidationError,
}

#[derive(Debug, Clone)]
pub struct Validator {
    key_field: String,
    order_field: Option<String>,
    required: Vec<String>,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_FIELD)
    }
}

impl Validator {
    pub fn new(key_field: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
            order_field: None,
            required: Vec::new(),
        }
    }

    pub fn with_order_field(mut self, field: Option<String>) -> Self {
        self.order_field = field;
        self
    }

    pub fn with_required<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    pub fn validate(&self, record: SourceRecord) -> Result<Operation, Rejected> {
        let SourceRecord { offset, fields } = record;
        match self.check(&fields) {
            Ok((key, order_hint)) => Ok(Operation {
                key,
                payload: Value::Object(fields),
                order_hint,
                offset,
            }),
            Err(error) => Err(Rejected {
                offset,
                record: fields,
                error,
            }),
        }
    }

    fn check(&self, fields: &Record) -> Result<(OperationKey, Option<i64>), ValidationError> {
        let raw_key = fields
            .get(&self.key_field)
            .filter(|v| !v.is_null())
            .ok_or_else(|| ValidationError::MissingKey(self.key_field.clone()))?;
        let key = OperationKey::from_value(raw_key).ok_or_else(|| ValidationError::InvalidKey {
            field: self.key_field.clone(),
            found: raw_key.to_string(),
        })?;

        if let Some(missing) = self
            .required
            .iter()
            .find(|f| fields.get(f.as_str()).map_or(true, Value::is_null))
        {
            return Err(ValidationError::MissingField(missing.clone()));
        }

        let order_hint = match &self.order_field {
            None => None,
            Some(field) => match fields.get(field) {
                None | Some(Value::Null) => None,
                Some(v) => Some(
                    v.as_i64()
                        .ok_or_else(|| ValidationError::InvalidOrderHint(field.clone()))?,
                ),
            },
        };

        Ok((key, order_hint))
    }
}
