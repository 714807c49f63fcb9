pub mod ack;
pub mod app_context;
pub mod batch;
pub mod channel;
pub mod config;
pub mod kafka;
pub mod message;
pub mod metrics_consts;
pub mod retry;
pub mod server;
pub mod sink;
pub mod sinks;
pub mod subscription;
pub mod test_utils;
pub mod user;
pub mod validator;
pub mod worker;
