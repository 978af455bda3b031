use std::fmt::Write as _;
use std::str::{FromStr, SplitWhitespace};

use crate::device::types::{ControlCommand, DeviceEvent, DeviceId, Snapshot};
use crate::error::ConsoleError;

pub const HELP: &str = "\
Commands:
  scan                 scan for peripherals (clears the device list)
  stop-scan            stop scanning
  connect <id|index>   connect to a device by id or by its index in `devices`
  disconnect           stop the motors and disconnect
  move <x> <y>         drive with a joystick vector, each axis in [-1, 1]
  send <left> <right>  drive with raw motor speeds
  aux <-1|0|1>         send an auxiliary step down / neutral / step up
  stop                 stop the motors
  text <payload>       send a raw text payload
  speed <n>            set the max speed [10, 1000]
  devices              list discovered devices
  status               show the connection status
  dismiss              clear the last error
  help                 show this help
  quit                 disconnect and exit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Control(ControlCommand),
    /// Connect to the n-th entry of the discovered device list.
    ConnectIndex(usize),
    Devices,
    Status,
    Help,
    Quit,
}

fn argument<T: FromStr>(args: &mut SplitWhitespace, name: &'static str) -> Result<T, ConsoleError> {
    let value = args.next().ok_or(ConsoleError::MissingArgument(name))?;
    value.parse::<T>().map_err(|_| ConsoleError::InvalidArgument { name, value: value.to_string() })
}

/// Parse one line of operator input. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>, ConsoleError> {
    let line = line.trim();
    let mut args = line.split_whitespace();
    let Some(keyword) = args.next() else {
        return Ok(None);
    };

    let command = match keyword.to_ascii_lowercase().as_str() {
        "scan" => ConsoleCommand::Control(ControlCommand::StartScan),
        "stop-scan" => ConsoleCommand::Control(ControlCommand::StopScan),
        "connect" => {
            let target: String = argument(&mut args, "device")?;
            match target.parse::<usize>() {
                Ok(index) => ConsoleCommand::ConnectIndex(index),
                Err(_) => ConsoleCommand::Control(ControlCommand::Connect(DeviceId::new(target))),
            }
        },
        "disconnect" => ConsoleCommand::Control(ControlCommand::Disconnect),
        "move" => {
            let x = argument(&mut args, "x")?;
            let y = argument(&mut args, "y")?;
            ConsoleCommand::Control(ControlCommand::Drive { x, y })
        },
        "send" => {
            let left = argument(&mut args, "left")?;
            let right = argument(&mut args, "right")?;
            ConsoleCommand::Control(ControlCommand::Send { left, right })
        },
        "aux" => ConsoleCommand::Control(ControlCommand::Aux(argument(&mut args, "aux")?)),
        "stop" => ConsoleCommand::Control(ControlCommand::Stop),
        "text" => {
            // keep the payload as typed, inner whitespace included
            let payload = line[keyword.len()..].trim_start();
            if payload.is_empty() {
                return Err(ConsoleError::MissingArgument("payload"));
            }
            ConsoleCommand::Control(ControlCommand::SendText(payload.to_string()))
        },
        "speed" => ConsoleCommand::Control(ControlCommand::SetMaxSpeed(argument(&mut args, "speed")?)),
        "devices" => ConsoleCommand::Devices,
        "status" => ConsoleCommand::Status,
        "dismiss" => ConsoleCommand::Control(ControlCommand::DismissError),
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        _ => return Err(ConsoleError::UnknownCommand(keyword.to_string())),
    };

    Ok(Some(command))
}

pub fn render_devices(snapshot: &Snapshot) -> String {
    if snapshot.devices.is_empty() {
        return "No devices discovered".to_string();
    }

    let mut out = String::new();
    for (index, device) in snapshot.devices.iter().enumerate() {
        let _ = writeln!(out, "[{}] {}", index, device);
    }
    out.trim_end().to_string()
}

pub fn render_status(snapshot: &Snapshot) -> String {
    let mut out = format!("State: {}\nMax speed: {}", snapshot.state, snapshot.max_speed);
    if let Some(sent) = &snapshot.last_sent {
        let _ = write!(out, "\nLast sent: {}", sent.trim_end());
    }
    if !snapshot.transport_available {
        out.push_str("\nBluetooth is not available");
    }
    if let Some(error) = &snapshot.last_error {
        let _ = write!(out, "\nError: {}", error);
    }
    out
}

/// Line to print for an event, if it is worth interrupting the operator for.
pub fn render_event(event: &DeviceEvent) -> Option<String> {
    match event {
        DeviceEvent::StateChange(state) => Some(format!("* {}", state)),
        DeviceEvent::DevicesChanged(devices) => devices.last().map(|device| {
            format!("+ [{}] {}", devices.len() - 1, device)
        }),
        DeviceEvent::CommandSent(_) => None,
        DeviceEvent::Error(error) => Some(format!("! {}", error)),
    }
}
