//! Channel addressing: the pair of half-channels an invocation flows
//! through, plus protocol version and header names.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Version ranges accepted by the service endpoint.
pub const SUPPORTED_VERSIONS: &[&str] = &["1.x"];

pub const HEADER_PROTOCOL_VERSION: &str = "x-asmv-protocol-version";
pub const HEADER_CLIENT_CHANNEL_ID: &str = "x-asmv-client-channel-id";
pub const HEADER_CLIENT_CHANNEL_URL: &str = "x-asmv-client-channel-url";
pub const HEADER_CLIENT_CHANNEL_TOKEN: &str = "x-asmv-client-channel-token";
pub const HEADER_SERVICE_CHANNEL_ID: &str = "x-asmv-service-channel-id";
pub const HEADER_SERVICE_CHANNEL_URL: &str = "x-asmv-service-channel-url";
pub const HEADER_SERVICE_CHANNEL_TOKEN: &str = "x-asmv-service-channel-token";

/// Check a peer-announced protocol version against [`SUPPORTED_VERSIONS`].
///
/// Accepts any `1.x` version string.
pub fn is_supported_version(version: &str) -> bool {
    version
        .split('.')
        .next()
        .is_some_and(|major| major == "1")
}

/// Generate an opaque channel ID.
pub fn generate_channel_id() -> String {
    Uuid::now_v7().simple().to_string()
}

/// Generate an opaque correlation ID for an upcall request.
pub fn generate_req_id() -> String {
    Uuid::now_v7().simple().to_string()
}

/// Generate a random bearer token for one half-channel.
pub fn generate_channel_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// The ordered pair of half-channels carrying one invocation.
///
/// Each half is addressed by `(url, id, token)`; the token is the bearer
/// secret the peer must present when posting to that half's URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub protocol_version: String,
    pub command_name: String,
    pub client_channel_id: String,
    pub client_channel_url: String,
    pub client_channel_token: String,
    pub service_channel_id: String,
    pub service_channel_url: String,
    pub service_channel_token: String,
}
