//! Service-side ASIMOV runtime: the async queue primitive, the
//! per-invocation service context, the execution runner, and the live
//! context registry.

pub mod context;
pub mod manager;
pub mod observer;
pub mod queue;
pub mod runner;

pub use context::{PaymentRequest, ServiceContext, ServiceContextOptions};
pub use manager::ContextManager;
pub use observer::{ContextObserver, NoopObserver, NoopServiceObserver, ServiceObserver};
pub use queue::{AsyncQueue, Wait};
pub use runner::{CommandHandler, ExecutionRunner, HandlerError};
