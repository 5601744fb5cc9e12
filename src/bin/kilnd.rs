use clap::{App, Arg};
use kiln_controller::bus::EventBus;
use kiln_controller::collaborators::{
    self, AmbientSensor, Caution, EstopMonitor, Heartbeat, SimulatedKiln, TemperatureProbe,
    ThermocoupleSampler,
};
use kiln_controller::config::KilnConfig;
use kiln_controller::controller::{ControlSettings, Controller, Message, SystemClock};
use kiln_controller::profile::ProfileStore;
use kiln_controller::error::ProtocolError;
use kiln_controller::protocol::{
    read_bounded_line, CommandDispatcher, CommandResponse, ProtocolHandler, MAX_COMMAND_SIZE,
};
use kiln_controller::state::SnapshotStore;
use std::path::Path;
use std::str::FromStr;
use std::sync::{mpsc, Arc};
use std::thread;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn, Level};

const DEFAULT_CONFIG: &str = "kiln.json";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("kilnd")
        .version("0.1.0")
        .about("🔥 Kiln controller daemon")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Configuration file")
                .takes_value(true)
                .default_value(DEFAULT_CONFIG),
        )
        .arg(
            Arg::with_name("simulate")
                .long("simulate")
                .help("Drive a simulated kiln instead of hardware"),
        )
        .arg(
            Arg::with_name("listen")
                .short("l")
                .long("listen")
                .value_name("ADDR")
                .help("Control port address, overrides the configuration")
                .takes_value(true),
        )
        .get_matches();

    let config_path = matches.value_of("config").unwrap_or(DEFAULT_CONFIG);
    let mut config = KilnConfig::load(Path::new(config_path))?;
    if matches.is_present("simulate") {
        config.general.simulate = true;
    }
    if let Some(listen) = matches.value_of("listen") {
        config.general.listen = listen.to_string();
    }

    let level = Level::from_str(&config.general.log_level).unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    println!("🔥 Kiln Controller");
    println!("==================");

    let bus = EventBus::new();
    let (tx, rx) = mpsc::channel::<Message>();
    let _forwarding = bus.forward_to(tx.clone());

    let probes = attach_hardware(&config, &bus)?;

    collaborators::spawn(ThermocoupleSampler::new(
        &config.sensors,
        config.general.unit,
        config.safety.error_limit_percent,
        bus.clone(),
        probes,
    ))?;
    collaborators::spawn(EstopMonitor::new(&config.estop, bus.clone(), None))?;
    collaborators::spawn(Heartbeat::new(&config.indicators, bus.clone(), None))?;
    collaborators::spawn(Caution::new(&config.indicators, bus.clone(), None))?;
    if !config.ambient.probes.is_empty() {
        warn!("ambient probes configured but no one-wire driver attached");
    }
    collaborators::spawn(AmbientSensor::new(&config.ambient, bus.clone(), Vec::new()))?;

    let snapshots = SnapshotStore::new(&config.general.restart.state_file, config.restart_window());
    info!("looking for restart info at {}", snapshots.path().display());
    let mut controller = Controller::new(
        ControlSettings::from(&config),
        bus.clone(),
        snapshots,
        rx,
        SystemClock,
    );
    let status = controller.status_board();
    thread::Builder::new()
        .name("controller".to_string())
        .spawn(move || controller.run())?;

    let store = ProfileStore::new(&config.general.profiles_dir, config.general.unit);
    let dispatcher = Arc::new(CommandDispatcher::new(store, tx, status));

    let listener = TcpListener::bind(&config.general.listen).await?;
    info!("🌐 control port listening on {}", config.general.listen);

    tokio::select! {
        result = serve(listener, dispatcher) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    bus.set_heat(false);
    println!("🧯 Kiln controller stopped");
    Ok(())
}

/// Register the heater and return the thermocouple probes.
fn attach_hardware(
    config: &KilnConfig,
    bus: &EventBus,
) -> Result<Vec<Box<dyn TemperatureProbe>>, Box<dyn std::error::Error>> {
    if !config.general.simulate {
        return Err("no hardware drivers are built in, run with --simulate".into());
    }
    warn!("this is a simulation");
    let kiln = Arc::new(SimulatedKiln::new(config.simulation.clone()));
    let _heater = bus.subscribe_actuator(kiln.clone());
    Ok(config
        .sensors
        .thermocouples
        .iter()
        .map(|tc| Box::new(kiln.probe(&tc.name)) as Box<dyn TemperatureProbe>)
        .collect())
}

async fn serve(
    listener: TcpListener,
    dispatcher: Arc<CommandDispatcher>,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("🔗 client connected: {}", addr);
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, dispatcher).await {
                        warn!("client {} error: {}", addr, e);
                    }
                    info!("🔌 client {} disconnected", addr);
                });
            }
            Err(e) => error!("failed to accept connection: {}", e),
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    dispatcher: Arc<CommandDispatcher>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let protocol = ProtocolHandler::new();

    let mut line = String::new();
    loop {
        match read_bounded_line(&mut reader, &mut line, MAX_COMMAND_SIZE).await {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(ProtocolError::MessageTooLarge) => {
                warn!("command over {} bytes, closing connection", MAX_COMMAND_SIZE);
                let response = CommandResponse::invalid(0, ProtocolError::MessageTooLarge.to_string());
                let json = protocol.serialize_response(&response)?;
                writer.write_all(json.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match protocol.parse_command(trimmed) {
            Ok(command) => {
                info!("📨 received command: {:?}", command.command_type);
                let dispatcher = Arc::clone(&dispatcher);
                tokio::task::spawn_blocking(move || dispatcher.dispatch(command)).await?
            }
            Err(e) => {
                error!("failed to parse command: {}", e);
                CommandResponse::invalid(0, format!("invalid command: {e}"))
            }
        };

        let json = protocol.serialize_response(&response)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
}
