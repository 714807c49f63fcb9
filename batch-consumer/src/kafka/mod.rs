pub mod config;
pub mod publisher;
pub mod receiver;

pub use publisher::{KafkaContext, KafkaPublisher};
pub use receiver::KafkaReceiver;
