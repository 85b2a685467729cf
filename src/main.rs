mod console;

use std::io::{self, BufRead};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, PoisonError};
use std::thread;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pressure_ctl::alarm::{DEFAULT_ALARM_DELAY_SECONDS, DEFAULT_ALARM_TOLERANCE_BAR, SafetyAlarmConfig};
use pressure_ctl::channel::{ParameterChannel, find_responsive_port};
use pressure_ctl::clock::{Clock, StopSignal, SystemClock};
use pressure_ctl::constants::{DEFAULT_BAUD, DEFAULT_NODE};
use pressure_ctl::controller::{FlowController, SharedController};
use pressure_ctl::data::ControllerEvent;
use pressure_ctl::interface::InterfaceMode;
use pressure_ctl::poller::{PollingLoop, spawn_poller};
use pressure_ctl::purge::PurgePlan;
use pressure_ctl::settings::{
    ControlSettings, DEFAULT_IO_TIMEOUT, DEFAULT_MAX_SET_PRESSURE, TransportConfig,
};

use console::{ConsoleState, HELP, OperatorCommand, parse_command};

const CONSOLE_TICK: Duration = Duration::from_millis(100);

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Propar pressure controller console")]
struct Args {
    /// Serial port path (e.g. /dev/ttyUSB0); probed when omitted
    #[arg(short, long)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Propar node address
    #[arg(short, long)]
    node: Option<u8>,

    /// Poll interval in milliseconds
    #[arg(short = 'i', long, default_value_t = 200)]
    poll_interval: u64,

    /// Device interface
    #[arg(short = 'I', long, value_enum, default_value_t = InterfaceMode::Propar)]
    interface: InterfaceMode,

    /// Highest setpoint accepted from the console, in bar (capped at capacity)
    #[arg(short = 'm', long, default_value_t = DEFAULT_MAX_SET_PRESSURE)]
    max_set_pressure: f64,

    /// Safety alarm trip distance above setpoint, in bar
    #[arg(long, default_value_t = DEFAULT_ALARM_TOLERANCE_BAR)]
    alarm_tolerance: f64,

    /// Seconds the deviation must persist before the alarm trips
    #[arg(long, default_value_t = DEFAULT_ALARM_DELAY_SECONDS)]
    alarm_delay: u32,

    /// Leave the safety alarm disabled
    #[arg(long, default_value_t = false)]
    no_alarm: bool,

    /// Purge timeout in seconds
    #[arg(long, default_value_t = 7.0)]
    purge_timeout: f64,
}

#[derive(Debug, Clone)]
struct RuntimeArgs {
    transport: TransportConfig,
    settings: ControlSettings,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let mut runtime = resolve_runtime_args(&args)?;
    if runtime.transport.interface.needs_port() && runtime.transport.port.is_none() {
        runtime.transport.port = Some(probe_ports(&runtime.transport)?);
    }

    let channel =
        ParameterChannel::open(&runtime.transport).wrap_err("open instrument channel")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (event_tx, event_rx) = mpsc::channel();

    let mut controller = FlowController::new(
        channel.clone(),
        Arc::clone(&clock),
        event_tx.clone(),
        &runtime.settings,
    );
    let identity = controller
        .read_device_identity()
        .wrap_err("read device identity")?;
    match controller.read_user_tag() {
        Ok(tag) if !tag.is_empty() => info!(tag = %tag, "user tag"),
        Ok(_) => {}
        Err(err) => warn!(error = %err, "user tag unavailable"),
    }
    controller
        .configure_safety_alarm(runtime.settings.alarm)
        .wrap_err("configure safety alarm")?;
    println!(
        "connected: capacity {} {}",
        identity.capacity, identity.unit
    );
    let controller = controller.into_shared();

    let stop = Arc::new(StopSignal::new());
    let poller = PollingLoop::new(
        channel.clone(),
        Arc::clone(&controller),
        clock,
        event_tx,
        runtime.settings.poll_interval,
    );
    let poller_handle = spawn_poller(poller, Arc::clone(&stop));
    let lines = spawn_line_reader();

    let result = run_console(&controller, &runtime.settings, &lines, &event_rx);

    stop.raise();
    poller_handle.join().ok();
    channel.close().wrap_err("close instrument channel")?;

    result
}

fn resolve_runtime_args(args: &Args) -> eyre::Result<RuntimeArgs> {
    let interface = {
        #[cfg(debug_assertions)]
        {
            resolve_interface_mode(args)
        }
        #[cfg(not(debug_assertions))]
        {
            resolve_interface_mode(args)?
        }
    };
    let baud = args.baud.unwrap_or(DEFAULT_BAUD);
    let node = args.node.unwrap_or(DEFAULT_NODE);
    let port = if interface.needs_port() {
        args.port.clone()
    } else {
        None
    };

    if args.poll_interval == 0 {
        return Err(eyre::eyre!("poll interval must be at least 1 ms"));
    }
    if !args.purge_timeout.is_finite() || args.purge_timeout <= 0.0 {
        return Err(eyre::eyre!("purge timeout must be a positive number of seconds"));
    }
    if !args.alarm_tolerance.is_finite() || args.alarm_tolerance < 0.0 {
        return Err(eyre::eyre!("alarm tolerance must be a non-negative pressure"));
    }
    if !args.max_set_pressure.is_finite() || args.max_set_pressure <= 0.0 {
        return Err(eyre::eyre!("max set pressure must be positive"));
    }

    Ok(RuntimeArgs {
        transport: TransportConfig {
            port,
            baud,
            node,
            interface,
            io_timeout: DEFAULT_IO_TIMEOUT,
        },
        settings: ControlSettings {
            max_set_pressure: Some(args.max_set_pressure),
            alarm: SafetyAlarmConfig {
                enabled: !args.no_alarm,
                tolerance_bar: args.alarm_tolerance,
                delay_seconds: args.alarm_delay,
            },
            poll_interval: Duration::from_millis(args.poll_interval),
            purge_timeout: Duration::from_secs_f64(args.purge_timeout),
        },
    })
}

#[cfg(debug_assertions)]
fn resolve_interface_mode(args: &Args) -> InterfaceMode {
    args.interface
}

#[cfg(not(debug_assertions))]
fn resolve_interface_mode(args: &Args) -> eyre::Result<InterfaceMode> {
    if args.interface == InterfaceMode::Simulation {
        return Err(eyre::eyre!(
            "simulation interface is only available in debug builds"
        ));
    }
    Ok(args.interface)
}

fn probe_ports(template: &TransportConfig) -> eyre::Result<String> {
    let candidates: Vec<String> = serialport::available_ports()
        .wrap_err("list serial ports")?
        .into_iter()
        .map(|info| info.port_name)
        .collect();
    if candidates.is_empty() {
        return Err(eyre::eyre!("no serial ports found; pass --port"));
    }

    let (port, serial) = find_responsive_port(&candidates, None, |port| {
        ParameterChannel::open(&TransportConfig {
            port: Some(port.to_string()),
            ..template.clone()
        })
    })
    .ok_or_else(|| eyre::eyre!("no instrument answered on {}", candidates.join(", ")))?;
    info!(port = %port, %serial, "using instrument");
    Ok(port)
}

fn spawn_line_reader() -> Receiver<String> {
    let (line_tx, line_rx) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });
    line_rx
}

fn run_console(
    controller: &SharedController,
    settings: &ControlSettings,
    lines: &Receiver<String>,
    events: &Receiver<ControllerEvent>,
) -> eyre::Result<()> {
    let mut state = ConsoleState::new();
    println!("{HELP}");

    loop {
        for event in events.try_iter() {
            if let Some(notice) = state.apply(event) {
                println!("{notice}");
            }
        }

        match lines.recv_timeout(CONSOLE_TICK) {
            Ok(line) => match parse_command(&line) {
                Ok(Some(OperatorCommand::Quit)) => return Ok(()),
                Ok(Some(command)) => {
                    if let Err(err) = execute(controller, settings, &state, command) {
                        println!("command failed: {err:#}");
                    }
                }
                Ok(None) => {}
                Err(err) => println!("{err}"),
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                info!("console input closed");
                return Ok(());
            }
        }
    }
}

fn execute(
    controller: &SharedController,
    settings: &ControlSettings,
    state: &ConsoleState,
    command: OperatorCommand,
) -> eyre::Result<()> {
    let mut controller = controller.lock().unwrap_or_else(PoisonError::into_inner);
    match command {
        OperatorCommand::Setpoint(bar) => {
            check_limit(&controller, bar)?;
            controller.set_setpoint(bar)?;
            println!("setpoint {bar} bar");
        }
        OperatorCommand::Pid => {
            controller.set_pid_mode()?;
            println!("valve in PID mode");
        }
        OperatorCommand::Close => {
            controller.close_valve()?;
            println!("valve closed");
        }
        OperatorCommand::Purge {
            target_bar,
            tolerance_bar,
        } => {
            check_limit(&controller, target_bar)?;
            let mut plan = PurgePlan::new(target_bar, settings.purge_timeout);
            if let Some(tolerance_bar) = tolerance_bar {
                plan = plan.with_tolerance(tolerance_bar);
            }
            controller.start_purge(plan)?;
            println!(
                "purging to {target_bar} bar (±{} bar, {:.1} s timeout)",
                plan.tolerance_bar,
                plan.timeout.as_secs_f64()
            );
        }
        OperatorCommand::Rearm => {
            controller.begin_rearm_cooldown()?;
            println!("alarm disarmed until pressure settles");
        }
        OperatorCommand::Status => println!("{}", describe(&controller, state)),
        OperatorCommand::Quit => {}
    }
    Ok(())
}

fn check_limit(controller: &FlowController, bar: f64) -> eyre::Result<()> {
    let max = controller.effective_max_pressure()?;
    if bar > max {
        return Err(eyre::eyre!("{bar} bar exceeds the {max} bar limit"));
    }
    Ok(())
}

fn describe(controller: &FlowController, state: &ConsoleState) -> String {
    let pressure = state
        .pressure_bar()
        .map_or_else(|| "--".to_string(), |bar| format!("{bar:.3} bar"));
    let trend = state
        .pressure_trend()
        .map_or_else(String::new, |delta| format!(" ({delta:+.3})"));
    let valve = state
        .valve_percent
        .map_or_else(|| "--".to_string(), |percent| format!("{percent:.1} %"));
    let setpoint = controller
        .last_setpoint_bar()
        .map_or_else(|| "--".to_string(), |bar| format!("{bar} bar"));
    let alarm = match (controller.alarm_config(), controller.cooldown()) {
        (_, Some(_)) => "cooling down",
        (Some(config), None) if config.enabled => "armed",
        _ => "off",
    };
    let purge = if controller.purge_session().is_some() {
        ", purging"
    } else {
        ""
    };
    format!(
        "{} | pressure {pressure}{trend} | setpoint {setpoint} | valve {valve} {:?} | alarm {alarm} | status {:?}{purge}",
        if state.connected { "online" } else { "offline" },
        controller.valve_mode(),
        state.severity,
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;

    use super::{Args, InterfaceMode, resolve_runtime_args};

    #[test]
    fn propar_defaults_are_applied() {
        let args = Args::try_parse_from(["bin", "--port", "/dev/ttyUSB0"])
            .expect("args should parse");
        let runtime = resolve_runtime_args(&args).expect("runtime should resolve");
        assert_eq!(runtime.transport.interface, InterfaceMode::Propar);
        assert_eq!(runtime.transport.baud, 38_400);
        assert_eq!(runtime.transport.node, 0x80);
        assert_eq!(runtime.settings.poll_interval, Duration::from_millis(200));
        assert_eq!(runtime.settings.purge_timeout, Duration::from_secs(7));
        assert_eq!(runtime.settings.max_set_pressure, Some(100.0));
        assert!(runtime.settings.alarm.enabled);
    }

    #[test]
    fn missing_port_is_left_for_the_probe() {
        let args = Args::try_parse_from(["bin"]).expect("args should parse");
        let runtime = resolve_runtime_args(&args).expect("runtime should resolve");
        assert!(runtime.transport.port.is_none());
    }

    #[cfg(debug_assertions)]
    #[test]
    fn simulation_interface_ignores_port() {
        let args = Args::try_parse_from(["bin", "--interface", "simulation", "--port", "COM3"])
            .expect("args should parse");
        let runtime = resolve_runtime_args(&args).expect("runtime should resolve");
        assert_eq!(runtime.transport.interface, InterfaceMode::Simulation);
        assert!(runtime.transport.port.is_none());
    }

    #[test]
    fn explicit_link_settings_override_defaults() {
        let args = Args::try_parse_from([
            "bin",
            "--port",
            "/dev/ttyUSB0",
            "--baud",
            "19200",
            "--node",
            "3",
        ])
        .expect("args should parse");
        let runtime = resolve_runtime_args(&args).expect("runtime should resolve");
        assert_eq!(runtime.transport.baud, 19_200);
        assert_eq!(runtime.transport.node, 3);
    }

    #[test]
    fn alarm_and_purge_options_reach_settings() {
        let args = Args::try_parse_from([
            "bin",
            "--alarm-tolerance",
            "0.5",
            "--alarm-delay",
            "4",
            "--no-alarm",
            "--purge-timeout",
            "12.5",
            "-m",
            "6",
        ])
        .expect("args should parse");
        let runtime = resolve_runtime_args(&args).expect("runtime should resolve");
        assert!(!runtime.settings.alarm.enabled);
        assert_eq!(runtime.settings.alarm.tolerance_bar, 0.5);
        assert_eq!(runtime.settings.alarm.delay_seconds, 4);
        assert_eq!(runtime.settings.purge_timeout, Duration::from_millis(12_500));
        assert_eq!(runtime.settings.max_set_pressure, Some(6.0));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        for flags in [
            ["--poll-interval", "0"],
            ["--purge-timeout", "0"],
            ["--alarm-tolerance", "NaN"],
        ] {
            let args = Args::try_parse_from(["bin", flags[0], flags[1]]).expect("args should parse");
            assert!(resolve_runtime_args(&args).is_err(), "{flags:?} should be rejected");
        }
    }
}
