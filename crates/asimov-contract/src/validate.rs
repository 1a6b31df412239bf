//! Wire-level message validation.
//!
//! One compiled JSON schema per message variant; the top-level validator
//! dispatches on the `type` tag. Every inbound payload passes through here
//! before it is deserialized and dispatched.

use crate::error::{ProtocolError, SchemaViolation};
use jsonschema::Validator;
use serde_json::{json, Value};
use std::collections::HashMap;

fn input_entry_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "inputType": { "type": "string" },
            "value": {}
        },
        "required": ["inputType", "value"]
    })
}

fn return_item_schema() -> Value {
    json!({
        "type": "object",
        "oneOf": [
            {
                "properties": {
                    "type": { "const": "output" },
                    "outputType": { "type": "string" },
                    "data": {},
                    "summary": { "type": "string" }
                },
                "required": ["type", "outputType", "data"]
            },
            {
                "properties": {
                    "type": { "const": "error" },
                    "errorName": { "type": "string" },
                    "description": { "type": "string" },
                    "data": {}
                },
                "required": ["type", "errorName", "description"]
            }
        ]
    })
}

fn variant_schemas() -> Vec<(&'static str, Value)> {
    vec![
        (
            "invoke",
            json!({
                "type": "object",
                "properties": {
                    "type": { "const": "invoke" },
                    "configProfiles": { "type": "object" },
                    "inputs": { "type": "array", "items": input_entry_schema() },
                    "userConfirmation": {
                        "type": "object",
                        "properties": { "confirmedBy": { "type": "string" } },
                        "required": ["confirmedBy"]
                    }
                },
                "required": ["type"]
            }),
        ),
        (
            "requestInput",
            json!({
                "type": "object",
                "properties": {
                    "type": { "const": "requestInput" },
                    "inputs": {
                        "type": "object",
                        "additionalProperties": {
                            "type": "object",
                            "properties": {
                                "description": { "type": "string" },
                                "schema": {},
                                "required": { "type": "boolean" },
                                "minCount": { "type": "integer", "minimum": 0 }
                            },
                            "required": ["description"]
                        }
                    }
                },
                "required": ["type", "inputs"]
            }),
        ),
        (
            "provideInput",
            json!({
                "type": "object",
                "properties": {
                    "type": { "const": "provideInput" },
                    "inputs": { "type": "array", "items": input_entry_schema() },
                    "seq": { "type": "integer", "minimum": 0 }
                },
                "required": ["type", "inputs"]
            }),
        ),
        (
            "return",
            json!({
                "type": "object",
                "properties": {
                    "type": { "const": "return" },
                    "items": { "type": "array", "items": return_item_schema() },
                    "close": { "type": "boolean" },
                    "seq": { "type": "integer", "minimum": 0 }
                },
                "required": ["type", "items", "close"]
            }),
        ),
        (
            "cancel",
            json!({
                "type": "object",
                "properties": { "type": { "const": "cancel" } },
                "required": ["type"]
            }),
        ),
        (
            "requestUserConfirmation",
            json!({
                "type": "object",
                "properties": {
                    "type": { "const": "requestUserConfirmation" },
                    "reqId": { "type": "string" },
                    "reason": { "type": "string" }
                },
                "required": ["type", "reqId"]
            }),
        ),
        (
            "provideUserConfirmation",
            json!({
                "type": "object",
                "properties": {
                    "type": { "const": "provideUserConfirmation" },
                    "reqId": { "type": "string" },
                    "confirmedBy": { "type": "string" }
                },
                "required": ["type", "reqId", "confirmedBy"]
            }),
        ),
        (
            "requestPayment",
            json!({
                "type": "object",
                "properties": {
                    "type": { "const": "requestPayment" },
                    "reqId": { "type": "string" },
                    "acceptedPaymentSchemas": {
                        "type": "array",
                        "items": { "type": "string" }
                    },
                    "amount": { "type": "integer", "minimum": 0 },
                    "currency": { "type": "string" },
                    "description": { "type": "string" }
                },
                "required": ["type", "reqId", "acceptedPaymentSchemas", "amount", "currency", "description"]
            }),
        ),
        (
            "authorizePayment",
            json!({
                "type": "object",
                "properties": {
                    "type": { "const": "authorizePayment" },
                    "reqId": { "type": "string" },
                    "paymentId": { "type": "string" },
                    "paymentSchema": { "type": "string" },
                    "amount": { "type": "integer", "minimum": 0 },
                    "currency": { "type": "string" },
                    "token": { "type": "string" },
                    "paymentData": {}
                },
                "required": ["type", "reqId", "paymentId", "paymentSchema", "amount", "currency", "token"]
            }),
        ),
        (
            "rejectPayment",
            json!({
                "type": "object",
                "properties": {
                    "type": { "const": "rejectPayment" },
                    "reqId": { "type": "string" },
                    "reason": { "type": "string" }
                },
                "required": ["type", "reqId"]
            }),
        ),
    ]
}

/// Collect all violations of `value` against a compiled validator.
pub(crate) fn collect_violations(validator: &Validator, value: &Value) -> Vec<SchemaViolation> {
    validator
        .iter_errors(value)
        .map(|e| SchemaViolation {
            path: e.instance_path.to_string(),
            message: e.to_string(),
        })
        .collect()
}

/// Compile an arbitrary schema, mapping failures into the protocol error
/// space.
pub(crate) fn compile_schema(schema: &Value) -> Result<Validator, String> {
    Validator::new(schema).map_err(|e| e.to_string())
}

/// Compiled union validator over the whole message taxonomy.
pub struct MessageValidator {
    variants: HashMap<&'static str, Validator>,
}

impl MessageValidator {
    /// Compile every variant schema.
    pub fn new() -> Result<Self, ProtocolError> {
        let mut variants = HashMap::new();
        for (tag, schema) in variant_schemas() {
            let validator = compile_schema(&schema)
                .map_err(|e| ProtocolError::Serialization(format!("schema for {tag}: {e}")))?;
            variants.insert(tag, validator);
        }
        Ok(Self { variants })
    }

    /// Validate an inbound wire payload against its variant schema.
    ///
    /// Unknown or missing `type` tags fail with `InvalidMessage`
    /// ("Invalid message type"); shape violations fail with the structured
    /// violations as `child_errors`.
    pub fn validate(&self, payload: &Value) -> Result<(), ProtocolError> {
        let tag = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::invalid_message("Invalid message type"))?;
        let validator = self
            .variants
            .get(tag)
            .ok_or_else(|| ProtocolError::invalid_message("Invalid message type"))?;
        let child_errors = collect_violations(validator, payload);
        if child_errors.is_empty() {
            return Ok(());
        }
        Err(ProtocolError::InvalidMessage {
            message: format!("Message failed schema validation: {tag}"),
            child_errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{InputEntry, Message};

    fn validator() -> MessageValidator {
        MessageValidator::new().unwrap()
    }

    #[test]
    fn every_variant_passes_its_own_schema() {
        let samples = vec![
            Message::Invoke {
                config_profiles: Default::default(),
                inputs: vec![InputEntry::new("name", serde_json::json!("John"))],
                user_confirmation: None,
            },
            Message::ProvideInput {
                inputs: vec![],
                seq: Some(3),
            },
            Message::Cancel,
            Message::ProvideUserConfirmation {
                req_id: "r1".into(),
                confirmed_by: "me".into(),
            },
            Message::RejectPayment {
                req_id: "r2".into(),
                reason: None,
            },
        ];
        let v = validator();
        for msg in samples {
            let payload = serde_json::to_value(&msg).unwrap();
            v.validate(&payload).unwrap();
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = validator()
            .validate(&serde_json::json!({"type": "teleport"}))
            .unwrap_err();
        match err {
            ProtocolError::InvalidMessage { message, .. } => {
                assert_eq!(message, "Invalid message type");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_tag_is_rejected() {
        let err = validator()
            .validate(&serde_json::json!({"inputs": []}))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage { .. }));
    }

    #[test]
    fn shape_violations_carry_child_errors() {
        let payload = serde_json::json!({
            "type": "provideInput",
            "inputs": [{"value": 1}]
        });
        let err = validator().validate(&payload).unwrap_err();
        assert!(!err.child_errors().is_empty());
    }
}
