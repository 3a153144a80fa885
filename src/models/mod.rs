pub mod booking;
pub mod event;
pub mod location;
