use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;
use futures::channel::mpsc::SendError;

use crate::device::types::DeviceId;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file (is another controller running?): {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("Device {0} is not known to the adapter")]
    UnknownDevice(DeviceId),

    #[error("A required bluetooth service is not available")]
    MissingService,

    #[error("A required bluetooth characteristic is not available")]
    MissingCharacteristic,

    #[error("Failed to queue message: {source}")]
    SendError { #[from] source: SendError },
}

/// Failures surfaced to observers. The controller keeps only the latest one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("Bluetooth is not available: {0}")]
    TransportUnavailable(String),

    #[error("Failed to connect to device {device}: {reason}")]
    Connect { device: DeviceId, reason: String },

    #[error("Device {device} is not compatible: {reason}")]
    Discovery { device: DeviceId, reason: String },

    #[error("Scanning failed: {0}")]
    Scan(String),

    #[error("Failed to write to device: {0}")]
    Write(String),

    #[error("Auxiliary value must be -1, 0 or 1 (got {0})")]
    InvalidAux(i8),

    #[error("Can not {operation} while {state}")]
    InvalidState { operation: &'static str, state: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("Unknown command \"{0}\" (try \"help\")")]
    UnknownCommand(String),

    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("Invalid value for {name}: \"{value}\"")]
    InvalidArgument { name: &'static str, value: String },

    #[error("No discovered device with index {0}")]
    NoSuchDevice(usize),
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start controller (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start controller (device): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Failed to read console input: {source}")]
    IOError { #[from] source: io::Error },
}
