//! Agent-side ASIMOV client: drives invocations against a remote service,
//! reads streamed returns, and answers mid-execution upcalls.

pub mod context;
pub mod endpoint;
pub mod host;
pub mod http;

pub use context::{ClientContext, ClientStatus, RetryOptions};
pub use endpoint::{InvokeRequest, ServiceEndpoint};
pub use host::AgentChannelHost;
pub use http::HttpMessageSender;
