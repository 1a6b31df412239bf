//! Service manifest document types.
//!
//! The manifest is assembled by the service at request time and served from
//! `GET {baseUrl}/manifest.json`. The invoke path consumes
//! `required_config_profiles` and `requires_user_confirmation` from the
//! per-command descriptors.

use crate::command::{IoTypeDescriptor, ProfileScope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Manifest entry describing one config profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigProfileDescriptor {
    pub name: String,
    pub scope: ProfileScope,
    pub setup_uri: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

/// Manifest entry describing one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDescriptor {
    pub command_name: String,
    pub description: BTreeMap<String, String>,
    pub required_config_profiles: Vec<String>,
    pub requires_user_confirmation: bool,
    pub input_types: BTreeMap<String, IoTypeDescriptor>,
    pub output_types: BTreeMap<String, IoTypeDescriptor>,
    pub endpoint_uri: String,
}

/// The static service advertisement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceManifest {
    pub name: String,
    pub version: String,
    pub description: BTreeMap<String, String>,
    pub config_profiles: Vec<ConfigProfileDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms_url: Option<String>,
    pub accepted_payment_schemas: Vec<String>,
    pub commands: Vec<CommandDescriptor>,
}
