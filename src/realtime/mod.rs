pub mod consumer;
pub mod registry;
pub mod router;
