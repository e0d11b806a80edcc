pub mod batch;
pub mod cache;
pub mod hydrator;
pub mod quota;
pub mod session;
pub mod stream;
pub mod subscriptions;
pub mod transport;
pub mod types;
pub mod visibility;
