use std::cmp::max;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use luxio_control_lib::control_interface::ControlInterface;
use luxio_control_lib::device::events::{DeviceEvent, EventTopic};
use luxio_control_lib::led::{LedType, PresetColor, PresetGradient, Rgbw};
use luxio_control_lib::{
    ClientConfig, Device, DeviceDescriptor, DeviceSnapshot, DiscoveryOptions, LuxioContext, PushMode,
    StrategyKind, TransportKind,
};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    handle_cli(cli).await
}

/// This struct defines the command line interface of the application
#[derive(Parser)]
#[clap(
    name = "luxio_control",
    about = "Discovers and controls Luxio LED lights",
    version = "0.1.0"
)]
pub struct Cli {
    /// YAML file with client settings, durations in milliseconds
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// How state updates are received after connecting
    #[clap(long, value_enum, global = true)]
    pub push_mode: Option<PushMode>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// Supported output formats.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    /// Plain text format.
    Plaintext,
    /// JSON format.
    Json,
    /// YAML format.
    Yaml,
}

/// Subcommands available for the CLI
#[derive(Subcommand)]
pub enum Commands {
    /// Subcommand for operations that require device communication
    #[clap(name = "device-call")]
    DeviceCall {
        /// Address of the Luxio, `host` or `host:port`
        #[clap(long, required_unless_present = "demo", conflicts_with = "demo")]
        address: Option<String>,

        /// Talk to the built-in demo device instead of real hardware
        #[clap(long)]
        demo: bool,

        /// Output format (plaintext, json, yaml)
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Plaintext)]
        output: OutputFormat,

        #[clap(subcommand)]
        action: DeviceAction,
    },
    /// Searches the local network for Luxio devices
    #[clap(name = "discover")]
    Discover {
        /// Output format (plaintext, json, yaml)
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Plaintext)]
        output: OutputFormat,

        /// Search timeout in milliseconds, `discovery_timeout` from the config when omitted
        #[clap(short = 't', long = "timeout")]
        timeout: Option<u64>,

        /// Strategies to use, multicast and access-point when omitted
        #[clap(long = "strategy", value_enum)]
        strategies: Vec<StrategyKind>,
    },
}

/// Actions available under the `device-call` subcommand
#[derive(Subcommand)]
pub enum DeviceAction {
    /// Prints the full device state.
    #[clap(name = "state")]
    State,
    /// Prints every state change until interrupted.
    #[clap(name = "watch")]
    Watch {
        /// Stop after this many milliseconds
        #[clap(long, value_parser = parse_duration)]
        duration: Option<Duration>,
    },
    /// Turns the strip on.
    #[clap(name = "set-on")]
    SetOn,
    /// Turns the strip off.
    #[clap(name = "set-off")]
    SetOff,
    /// Sets the brightness (0-255).
    #[clap(name = "set-brightness")]
    SetBrightness { brightness: u8 },
    /// Shows a solid color, given by name, as `#rrggbb` or as `hsv:h,s,v`.
    #[clap(name = "set-color")]
    SetColor {
        #[clap(value_parser = parse_color)]
        color: Rgbw,
    },
    /// Shows a gradient from a preset or a list of colors.
    #[clap(name = "set-gradient")]
    SetGradient {
        /// Named gradient
        #[clap(long, value_enum, conflicts_with = "colors")]
        preset: Option<PresetGradient>,

        /// Color stops by name, as `#rrggbb` or as `hsv:h,s,v`
        #[clap(value_parser = parse_color)]
        colors: Vec<Rgbw>,
    },
    /// Renames the device.
    #[clap(name = "set-name")]
    SetName { name: String },
    /// Sets the number of pixels on the strip.
    #[clap(name = "set-count")]
    SetCount { count: u16 },
    /// Sets the LED chip type.
    #[clap(name = "set-type")]
    SetType {
        #[clap(value_enum)]
        led_type: LedType,
    },
    /// Restarts the device.
    #[clap(name = "restart")]
    Restart,
    /// Erases all settings, including Wi-Fi credentials.
    #[clap(name = "factory-reset")]
    FactoryReset,
    /// Lists the Wi-Fi networks the device can see.
    #[clap(name = "scan-networks")]
    ScanNetworks {
        /// Time to give the scan before reading results, in milliseconds
        #[clap(long, value_parser = parse_duration, default_value = "5000")]
        wait: Duration,
    },
    /// Joins the device to a Wi-Fi network.
    #[clap(name = "connect-wifi")]
    ConnectWifi {
        ssid: String,

        /// Network password, empty for open networks
        #[clap(long, default_value = "")]
        pass: String,
    },
}

fn parse_duration(s: &str) -> Result<Duration, &'static str> {
    let millis = s
        .parse::<u64>()
        .map_err(|_| "could not parse duration in milliseconds")?;
    Ok(Duration::from_millis(millis))
}

fn parse_color(s: &str) -> Result<Rgbw, String> {
    if let Ok(preset) = <PresetColor as ValueEnum>::from_str(s, true) {
        return Ok(preset.into());
    }
    s.parse::<Rgbw>().map_err(|e| e.to_string())
}

fn load_config(path: Option<&Path>, push_mode: Option<PushMode>) -> Result<ClientConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("could not read {}", path.display()))?;
            serde_yaml::from_str::<ClientConfig>(&text).with_context(|| format!("invalid config in {}", path.display()))?
        }
        None => ClientConfig::default(),
    };
    if let Some(push_mode) = push_mode {
        config.push_mode = push_mode;
    }
    // The CLI connects explicitly to the one device it talks to.
    config.auto_connect = false;
    Ok(config)
}

fn print_output<T: Serialize>(output: OutputFormat, value: &T, plaintext: impl FnOnce(&T)) -> Result<()> {
    match output {
        OutputFormat::Plaintext => plaintext(value),
        OutputFormat::Json => println!("{}", serde_json::to_string(value)?),
        OutputFormat::Yaml => println!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

async fn handle_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref(), cli.push_mode)?;

    match cli.command {
        Commands::Discover {
            output,
            timeout,
            strategies,
        } => {
            let timeout = timeout
                .map(Duration::from_millis)
                .unwrap_or(config.discovery_timeout);
            let context = LuxioContext::new(config);
            let mut options = DiscoveryOptions {
                timeout: Some(timeout),
                ..DiscoveryOptions::default()
            };
            if !strategies.is_empty() {
                options.strategies = strategies;
            }

            let scan = context.start_discovery(options);
            tokio::time::sleep(timeout).await;
            drop(scan);

            let devices: Vec<DeviceDescriptor> = context.devices().iter().map(|d| d.descriptor()).collect();
            print_output(output, &devices, |devices| pretty_print_devices(devices))?;
        }
        Commands::DeviceCall {
            address,
            demo,
            output,
            action,
        } => {
            let context = LuxioContext::new(config);
            let device = match (address, demo) {
                (_, true) => context.discovery().enable_demo(),
                (Some(address), false) => lookup(&context, &address).await?,
                (None, false) => return Err(anyhow!("Either --address or --demo is required")),
            };
            device
                .connect()
                .await
                .with_context(|| format!("could not connect to {}", device.address()))?;

            let result = run_action(&device, action, output).await;
            context.shutdown();
            result?;
        }
    }

    Ok(())
}

/// Reads the identity of the device at `address` and registers it.
async fn lookup(context: &LuxioContext, address: &str) -> Result<Arc<Device>> {
    let iface = ControlInterface::new(address, context.config().request_timeout);
    let (system, state) = tokio::try_join!(iface.fetch_system_config(), iface.fetch_system_state())
        .with_context(|| format!("no Luxio answering at {}", address))?;

    let transport = if address == context.config().access_point_address {
        TransportKind::AccessPoint
    } else {
        TransportKind::Multicast
    };
    let id = if system.id.is_empty() {
        address.to_string()
    } else {
        system.id
    };
    let descriptor = DeviceDescriptor {
        id,
        name: system.name,
        address: address.to_string(),
        firmware_version: state.version,
        transport,
    };
    Ok(context.registry().upsert(descriptor).device().clone())
}

async fn run_action(device: &Device, action: DeviceAction, output: OutputFormat) -> Result<()> {
    let commands = device.commands();
    match action {
        DeviceAction::State => {
            print_output(output, &device.snapshot(), |snapshot| {
                pretty_print_snapshot(device, snapshot)
            })?;
        }
        DeviceAction::Watch { duration } => {
            watch(device, output, duration).await?;
        }
        DeviceAction::SetOn => {
            commands.set_on(true).await?;
            println!("{} turned on", device.name());
        }
        DeviceAction::SetOff => {
            commands.set_on(false).await?;
            println!("{} turned off", device.name());
        }
        DeviceAction::SetBrightness { brightness } => {
            commands.set_brightness(brightness).await?;
            println!("Brightness set to {}", brightness);
        }
        DeviceAction::SetColor { color } => {
            commands.set_color(color).await?;
            println!("Displayed color: {}", color);
        }
        DeviceAction::SetGradient { preset, colors } => {
            let colors = match preset {
                Some(preset) => preset.colors(),
                None if !colors.is_empty() => colors,
                None => return Err(anyhow!("At least one color or a preset must be specified")),
            };
            commands.set_gradient(colors.clone()).await?;
            let stops: Vec<String> = colors.iter().map(Rgbw::to_string).collect();
            println!("Displayed gradient: {}", stops.join(" -> "));
        }
        DeviceAction::SetName { name } => {
            commands.set_name(&name).await?;
            println!("Device renamed to {}", name);
        }
        DeviceAction::SetCount { count } => {
            commands.set_count(count).await?;
            println!("Pixel count set to {}", count);
        }
        DeviceAction::SetType { led_type } => {
            commands.set_type(led_type).await?;
            println!("LED type set to {}", led_type);
        }
        DeviceAction::Restart => {
            commands.restart().await?;
            println!("{} is restarting", device.name());
        }
        DeviceAction::FactoryReset => {
            commands.factory_reset().await?;
            println!("{} has been reset to factory settings", device.name());
        }
        DeviceAction::ScanNetworks { wait } => {
            let networks = commands.find_networks(wait).await?;
            print_output(output, &networks, |networks| {
                for network in networks {
                    let lock = if network.encrypted { "locked" } else { "open" };
                    println!("{:>5} dBm  {:<6}  {}", network.rssi, lock, network.ssid);
                }
            })?;
        }
        DeviceAction::ConnectWifi { ssid, pass } => {
            commands.connect_wifi(&ssid, &pass).await?;
            println!("{} is joining {}", device.name(), ssid);
        }
    }
    Ok(())
}

async fn watch(device: &Device, output: OutputFormat, duration: Option<Duration>) -> Result<()> {
    let listeners: Vec<_> = EventTopic::ALL
        .iter()
        .map(|topic| {
            device.add_event_listener(*topic, move |event| {
                print_event(output, event)?;
                Ok(())
            })
        })
        .collect();

    println!("Watching {} ({}), press Ctrl-C to stop", device.name(), device.address());
    match duration {
        Some(duration) => {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                signal = tokio::signal::ctrl_c() => signal?,
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    for id in listeners {
        device.remove_event_listener(id);
    }
    Ok(())
}

fn print_event(output: OutputFormat, event: &DeviceEvent) -> Result<()> {
    match output {
        OutputFormat::Plaintext => match event {
            DeviceEvent::LedState(state) => {
                let stops: Vec<String> = state.colors.iter().map(Rgbw::to_string).collect();
                println!(
                    "led.state      on={} brightness={} colors={}",
                    state.on,
                    state.brightness,
                    stops.join(",")
                );
            }
            DeviceEvent::LedConfig(config) => println!(
                "led.config     type={} count={} pin={}",
                config.led_type, config.pixel_count, config.pin
            ),
            DeviceEvent::SystemConfig(config) => println!("system.config  name={}", config.name),
            DeviceEvent::WifiState(state) => println!(
                "wifi.state     ssid={} ip={}",
                state.ssid.as_deref().unwrap_or("-"),
                state.ip.as_deref().unwrap_or("-")
            ),
        },
        OutputFormat::Json => println!("{}", serde_json::to_string(event)?),
        OutputFormat::Yaml => println!("{}", serde_yaml::to_string(event)?),
    }
    Ok(())
}

fn pretty_print_devices(devices: &[DeviceDescriptor]) {
    let max_address_width = devices.iter().map(|d| d.address.len()).max().unwrap_or(0);
    let max_id_width = devices.iter().map(|d| d.id.len()).max().unwrap_or(0);
    let max_name_width = devices.iter().map(|d| max(d.name.len(), 20)).max().unwrap_or(0);

    println!(
        "{:<address_width$} {:<id_width$} {:<name_width$} {:<10} {}",
        "Address",
        "Device ID",
        "Name",
        "Firmware",
        "Found via",
        address_width = max(max_address_width, 7) + 2,
        id_width = max(max_id_width, 9) + 2,
        name_width = max_name_width + 2,
    );
    for device in devices {
        println!(
            "{:<address_width$} {:<id_width$} {:<name_width$} {:<10} {}",
            device.address,
            device.id,
            device.name,
            device.firmware_version,
            device.transport,
            address_width = max(max_address_width, 7) + 2,
            id_width = max(max_id_width, 9) + 2,
            name_width = max_name_width + 2,
        );
    }
    if devices.is_empty() {
        println!("No devices found.");
    }
}

fn pretty_print_snapshot(device: &Device, snapshot: &DeviceSnapshot) {
    let stops: Vec<String> = snapshot.led_state.colors.iter().map(Rgbw::to_string).collect();
    println!("Name:        {}", snapshot.system_config.name);
    println!("ID:          {}", device.id());
    println!("Address:     {}", device.address());
    println!("Firmware:    {}", snapshot.system_state.version);
    println!("Connection:  {}", device.connection_state());
    println!("Power:       {}", if snapshot.led_state.on { "on" } else { "off" });
    println!("Brightness:  {}", snapshot.led_state.brightness);
    println!("Colors:      {}", stops.join(" -> "));
    println!(
        "Strip:       {} x {} on pin {}",
        snapshot.led_config.pixel_count, snapshot.led_config.led_type, snapshot.led_config.pin
    );
    println!(
        "Wi-Fi:       {} ({})",
        snapshot.wifi_state.ssid.as_deref().unwrap_or("not connected"),
        snapshot.wifi_state.ip.as_deref().unwrap_or("no address")
    );
    if device.is_access_point() {
        println!("This device is in setup mode, join it to a network with connect-wifi.");
    }
}
