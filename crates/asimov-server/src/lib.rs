//! Service-side ASIMOV HTTP binding: the service definition registry and
//! the axum router exposing manifest, invoke, and channel endpoints.

pub mod definition;
pub mod http;
pub mod sender;

pub use definition::{
    CommandRegistration, ServiceDefinition, ServiceDefinitionBuilder, ServiceDefinitionError,
};
pub use http::{router, AppState};
pub use sender::ClientChannelSender;
