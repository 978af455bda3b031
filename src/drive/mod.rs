pub mod command;
pub mod mapper;
pub mod throttle;
