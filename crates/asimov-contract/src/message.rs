//! Wire message taxonomy.
//!
//! Messages travel as internally-tagged JSON objects (`type` tag, camelCase
//! fields). The enum is the dispatch authority; the schemas in
//! [`crate::validate`] are the wire-level authority.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// A single provided input: the declared type name plus its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputEntry {
    pub input_type: String,
    pub value: Value,
}

impl InputEntry {
    pub fn new(input_type: impl Into<String>, value: Value) -> Self {
        Self {
            input_type: input_type.into(),
            value,
        }
    }
}

/// Descriptor sent with `RequestInput`, demanding inputs of one type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDemand {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_count: Option<u32>,
}

/// User confirmation attached to an `Invoke`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfirmation {
    pub confirmed_by: String,
}

/// One entry of a `Return` batch: a produced output or a command error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReturnItem {
    #[serde(rename_all = "camelCase")]
    Output {
        output_type: String,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error_name: String,
        description: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

/// Payment authorization record handed to the command handler after a
/// successful `AuthorizePayment` reply.
///
/// `max_amount` is derived from the requested amount, not the authorize
/// message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAuthorization {
    pub payment_id: String,
    pub payment_schema: String,
    pub max_amount: u64,
    pub currency: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_data: Option<Value>,
}

/// The ASIMOV message taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    /// agent → service: start a command invocation.
    #[serde(rename_all = "camelCase")]
    Invoke {
        #[serde(default)]
        config_profiles: HashMap<String, Value>,
        #[serde(default)]
        inputs: Vec<InputEntry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_confirmation: Option<UserConfirmation>,
    },

    /// service → agent: demand additional inputs.
    #[serde(rename_all = "camelCase")]
    RequestInput { inputs: BTreeMap<String, InputDemand> },

    /// agent → service: supply inputs.
    #[serde(rename_all = "camelCase")]
    ProvideInput {
        inputs: Vec<InputEntry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },

    /// service → agent: deliver a batch of outputs and/or errors.
    ///
    /// `close = true` terminates the invocation; it is always the last
    /// outbound message of a context.
    #[serde(rename_all = "camelCase")]
    Return {
        items: Vec<ReturnItem>,
        close: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },

    /// agent → service: abort the invocation.
    Cancel,

    /// service → agent: ask the user to confirm an action.
    #[serde(rename_all = "camelCase")]
    RequestUserConfirmation {
        req_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// agent → service: reply to a confirmation request.
    #[serde(rename_all = "camelCase")]
    ProvideUserConfirmation { req_id: String, confirmed_by: String },

    /// service → agent: ask for payment authorization.
    #[serde(rename_all = "camelCase")]
    RequestPayment {
        req_id: String,
        accepted_payment_schemas: Vec<String>,
        amount: u64,
        currency: String,
        description: String,
    },

    /// agent → service: authorize a requested payment.
    #[serde(rename_all = "camelCase")]
    AuthorizePayment {
        req_id: String,
        payment_id: String,
        payment_schema: String,
        amount: u64,
        currency: String,
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payment_data: Option<Value>,
    },

    /// agent → service: decline a requested payment.
    #[serde(rename_all = "camelCase")]
    RejectPayment {
        req_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Message {
    /// The wire tag of this variant.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Invoke { .. } => "invoke",
            Message::RequestInput { .. } => "requestInput",
            Message::ProvideInput { .. } => "provideInput",
            Message::Return { .. } => "return",
            Message::Cancel => "cancel",
            Message::RequestUserConfirmation { .. } => "requestUserConfirmation",
            Message::ProvideUserConfirmation { .. } => "provideUserConfirmation",
            Message::RequestPayment { .. } => "requestPayment",
            Message::AuthorizePayment { .. } => "authorizePayment",
            Message::RejectPayment { .. } => "rejectPayment",
        }
    }

    /// Whether this is a `Return` with `close = true`.
    pub fn is_closing_return(&self) -> bool {
        matches!(self, Message::Return { close: true, .. })
    }
}
