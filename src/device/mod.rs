pub mod ble;
pub mod constants;
pub mod controller;
pub mod machine;
pub mod transport;
pub mod types;
