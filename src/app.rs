use futures::channel::mpsc::{channel, Receiver};
use futures::StreamExt;
use log::{info, warn};
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cli::{Args, Command};
use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::console::{parse_line, render_devices, render_event, render_status, ConsoleCommand, HELP};
use crate::device::ble::BtleTransport;
use crate::device::controller::{spawn_controller, ControllerHandle};
use crate::device::machine::{ConnectionMachine, MachineSettings};
use crate::device::transport::TransportEvent;
use crate::device::types::{ConnectionState, ControlCommand, DeviceEvent, DeviceId};
use crate::drive::mapper::MaxSpeed;
use crate::error::{AppRunError, ConfigError, ConsoleError, ControlError};

/**
 * Events buffered for the console. Further events are dropped until it catches up.
 */
const EVENT_QUEUE_SIZE: usize = 256;

struct Session {
    controller: ControllerHandle,
    cancel: CancellationToken,
    controller_task: JoinHandle<()>,
    link_worker: JoinHandle<()>,
}

impl Session {
    async fn start(config: &Config) -> (Session, Receiver<DeviceEvent>) {
        let cancel = CancellationToken::new();
        let (transport_sender, transport_receiver) = channel::<TransportEvent>(EVENT_QUEUE_SIZE);
        let (transport, link_worker) = BtleTransport::new(transport_sender, cancel.child_token()).await;

        let machine = ConnectionMachine::new(transport, MachineSettings::from(config));
        let (event_sender, event_receiver) = channel::<DeviceEvent>(EVENT_QUEUE_SIZE);
        let (controller, controller_task) = spawn_controller(
            machine,
            transport_receiver,
            vec![event_sender],
            cancel.clone(),
        );

        let session = Session { controller, cancel, controller_task, link_worker };
        (session, event_receiver)
    }

    /// Stop the motors, disconnect and wait until the radio had a chance to do so.
    async fn close(self) {
        info!("Closing session");
        self.cancel.cancel();
        drop(self.controller);

        if let Err(err) = self.controller_task.await {
            warn!("Failed to join controller task: {:?}", err);
        }
        if let Err(err) = self.link_worker.await {
            warn!("Failed to join link worker: {:?}", err);
        }
    }
}

fn submit(controller: &mut ControllerHandle, command: ControlCommand) {
    if let Err(err) = controller.submit(command) {
        warn!("Command dropped: {}", err);
    }
}

async fn print_events(mut events: Receiver<DeviceEvent>) {
    while let Some(event) = events.next().await {
        if let Some(line) = render_event(&event) {
            println!("{}", line);
        }
    }
}

async fn run_scan(config: Config) -> Result<(), AppRunError> {
    let (session, mut events) = Session::start(&config).await;
    let mut controller = session.controller.clone();
    controller.start_scan()?;

    let mut scanning = false;
    while let Some(event) = events.next().await {
        match &event {
            DeviceEvent::StateChange(ConnectionState::Scanning) => scanning = true,
            DeviceEvent::StateChange(ConnectionState::Idle) if scanning => break,
            DeviceEvent::Error(err) => {
                println!("! {}", err);
                if matches!(err, ControlError::TransportUnavailable(_)) {
                    break;
                }
            },
            _ => {
                if let Some(line) = render_event(&event) {
                    println!("{}", line);
                }
            },
        }
    }

    println!("{}", render_devices(&controller.snapshot()));

    let drain = spawn(print_events(events));
    drop(controller);
    session.close().await;
    let _ = drain.await;
    Ok(())
}

async fn run_drive(config: Config, device: Option<String>) -> Result<(), AppRunError> {
    let (session, events) = Session::start(&config).await;
    let printer = spawn(print_events(events));
    let mut controller = session.controller.clone();

    match device {
        Some(id) => controller.connect(DeviceId::new(id))?,
        None => controller.start_scan()?,
    }
    println!("Type \"help\" for a list of commands");

    let mut lines = BufReader::new(stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                println!("! {}", err);
                continue;
            },
        };

        match command {
            ConsoleCommand::Quit => break,
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Devices => println!("{}", render_devices(&controller.snapshot())),
            ConsoleCommand::Status => println!("{}", render_status(&controller.snapshot())),
            ConsoleCommand::ConnectIndex(index) => match controller.snapshot().devices.get(index) {
                Some(device) => submit(&mut controller, ControlCommand::Connect(device.id.clone())),
                None => println!("! {}", ConsoleError::NoSuchDevice(index)),
            },
            ConsoleCommand::Control(command) => submit(&mut controller, command),
        }
    }

    drop(controller);
    session.close().await;
    let _ = printer.await;
    Ok(())
}

async fn run_config(config_io: &ConfigIO, reset: bool) -> Result<(), AppRunError> {
    if reset {
        config_io.save(&Config::default()).await?;
    }

    let config = config_io.read().await?;
    println!("{}", config_io.path().to_string_lossy());
    println!("{}", serde_json::to_string_pretty(&config).map_err(ConfigError::from)?);
    Ok(())
}

pub async fn run(args: Args) -> Result<(), AppRunError> {
    let command = args.command.unwrap_or_default();
    let config_io = ConfigIO::open(args.config.as_deref())?;

    if let Command::Config { reset: false } = command {
        return run_config(&config_io, false).await;
    }

    // one controller per config file, so two processes never drive the same robot
    let mut config_locker = config_io.locker()?;
    let _lock_guard = config_locker.lock()?;

    match command {
        Command::Config { reset } => run_config(&config_io, reset).await,
        Command::Scan { seconds } => {
            let mut config = config_io.read().await?;
            if let Some(seconds) = seconds {
                config.scan_timeout_ms = seconds.saturating_mul(1000);
            }
            config.normalize();
            run_scan(config).await
        },
        Command::Drive { device, max_speed } => {
            let mut config = config_io.read().await?;
            if let Some(max_speed) = max_speed {
                config.max_speed = MaxSpeed::new(max_speed);
            }
            run_drive(config, device).await
        },
    }
}
