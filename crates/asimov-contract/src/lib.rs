//! Shared ASIMOV protocol contracts: wire messages, command definitions,
//! channels, error taxonomy, and the persisted-context store interface.

pub mod channel;
pub mod command;
pub mod error;
pub mod manifest;
pub mod message;
pub mod storage;
pub mod transport;
pub mod validate;

pub use channel::{
    generate_channel_id, generate_channel_token, generate_req_id, is_supported_version, Channel,
    HEADER_CLIENT_CHANNEL_ID, HEADER_CLIENT_CHANNEL_TOKEN, HEADER_CLIENT_CHANNEL_URL,
    HEADER_PROTOCOL_VERSION, HEADER_SERVICE_CHANNEL_ID, HEADER_SERVICE_CHANNEL_TOKEN,
    HEADER_SERVICE_CHANNEL_URL, PROTOCOL_VERSION, SUPPORTED_VERSIONS,
};
pub use command::{
    CommandDefinition, CommandDefinitionError, ConfigProfileDefinition, IoTypeDefinition,
    IoTypeDescriptor, ProfileScope,
};
pub use error::{
    HttpErrorBody, NestedError, ProtocolError, SchemaViolation, TransportError, WireErrorName,
};
pub use manifest::{CommandDescriptor, ConfigProfileDescriptor, ServiceManifest};
pub use message::{
    InputDemand, InputEntry, Message, PaymentAuthorization, ReturnItem, UserConfirmation,
};
pub use storage::{
    ContextStatus, ContextStore, ContextStoreError, SerializedContext, StoredContext,
};
pub use transport::MessageSender;
pub use validate::MessageValidator;
