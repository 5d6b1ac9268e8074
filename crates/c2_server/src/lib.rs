pub mod codec;
pub mod grpc;
pub mod http;
pub mod identity;
pub mod metrics;
pub mod registry;
pub mod shell;
pub mod sweeper;
