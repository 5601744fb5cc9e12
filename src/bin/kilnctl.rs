use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use kiln_controller::profile::ProfileRecord;
use kiln_controller::protocol::{Command, CommandResponse, CommandType, ProtocolHandler, ResponseStatus};
use kiln_controller::state::OvenStatus;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8081";
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("kilnctl")
        .version("0.1.0")
        .about("🔥 Kiln controller command line")
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("Controller host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Controller port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .subcommand(SubCommand::with_name("status").about("📊 Show the oven status"))
        .subcommand(
            SubCommand::with_name("run")
                .about("▶️  Start a firing")
                .arg(
                    Arg::with_name("profile")
                        .help("Profile name")
                        .required(true),
                )
                .arg(
                    Arg::with_name("start-at")
                        .long("start-at")
                        .value_name("MINUTES")
                        .help("Start this many minutes into the schedule")
                        .takes_value(true)
                        .validator(|v| match v.parse::<f64>() {
                            Ok(m) if m.is_finite() && m >= 0.0 => Ok(()),
                            _ => Err("start-at must be a non-negative number".into()),
                        }),
                ),
        )
        .subcommand(SubCommand::with_name("pause").about("⏸️  Pause the running firing"))
        .subcommand(SubCommand::with_name("resume").about("⏯️  Resume a paused firing"))
        .subcommand(SubCommand::with_name("stop").about("⏹️  Abort the firing"))
        .subcommand(
            SubCommand::with_name("profiles")
                .about("📚 Profile management")
                .subcommand(SubCommand::with_name("list").about("List stored profiles"))
                .subcommand(
                    SubCommand::with_name("save")
                        .about("Store a profile from a JSON file")
                        .arg(Arg::with_name("file").help("Profile JSON file").required(true))
                        .arg(
                            Arg::with_name("force")
                                .long("force")
                                .help("Replace an existing profile"),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("delete")
                        .about("Delete a stored profile")
                        .arg(Arg::with_name("name").help("Profile name").required(true)),
                ),
        )
        .subcommand(
            SubCommand::with_name("watch")
                .about("👀 Follow the oven status")
                .arg(
                    Arg::with_name("interval")
                        .short("i")
                        .long("interval")
                        .value_name("SECONDS")
                        .help("Refresh interval")
                        .takes_value(true)
                        .default_value("2")
                        .validator(|v| refresh_interval(&v).map(|_| ())),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let format = matches.value_of("format").unwrap_or("table");
    let mut client = Client::new(host, port);

    match matches.subcommand() {
        ("status", _) => {
            let response = client.send(CommandType::Status).await?;
            print_status(&response, format);
        }
        ("run", Some(sub)) => handle_run(&mut client, sub, format).await?,
        ("pause", _) => {
            let response = client.send(CommandType::Pause).await?;
            print_result("pause", &response, format);
        }
        ("resume", _) => {
            let response = client.send(CommandType::Resume).await?;
            print_result("resume", &response, format);
        }
        ("stop", _) => {
            let response = client.send(CommandType::Stop).await?;
            print_result("stop", &response, format);
        }
        ("profiles", Some(sub)) => handle_profiles(&mut client, sub, format).await?,
        ("watch", Some(sub)) => handle_watch(&mut client, sub, format).await?,
        _ => {
            println!("{}", "🔥 Kiln controller".bright_yellow().bold());
            println!();
            println!("  {}            show the oven status", "kilnctl status".bright_cyan());
            println!("  {}  start a firing", "kilnctl run <profile>".bright_cyan());
            println!("  {}     list stored profiles", "kilnctl profiles list".bright_cyan());
            println!();
            println!("Use {} for all commands", "kilnctl --help".bright_cyan());
        }
    }

    Ok(())
}

struct Client {
    addr: String,
    protocol: ProtocolHandler,
}

impl Client {
    fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            protocol: ProtocolHandler::new(),
        }
    }

    async fn send(&mut self, command_type: CommandType) -> Result<CommandResponse, Box<dyn std::error::Error>> {
        let command = Command {
            id: self.protocol.next_command_id(),
            command_type,
        };
        let json = self.protocol.serialize_command(&command)?;

        let stream = match TcpStream::connect(&self.addr).await {
            Ok(stream) => stream,
            Err(e) => {
                eprintln!("{} Failed to connect to kilnd at {}", "❌".red(), self.addr.bright_white());
                if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    eprintln!("{} Is the daemon running? Start it with:", "💡".yellow());
                    eprintln!("   {}", "kilnd --config kiln.json".bright_cyan());
                }
                return Err(e.into());
            }
        };

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        tokio::time::timeout(RESPONSE_TIMEOUT, async {
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            reader.read_line(&mut line).await
        })
        .await
        .map_err(|_| "timed out waiting for kilnd")??;

        Ok(self.protocol.parse_response(line.trim())?)
    }
}

async fn handle_run(
    client: &mut Client,
    matches: &ArgMatches<'_>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let profile = matches.value_of("profile").unwrap_or_default().to_string();
    let start_at_minutes = match matches.value_of("start-at") {
        Some(v) => v.parse()?,
        None => 0.0,
    };
    let response = client
        .send(CommandType::Run {
            profile,
            start_at_minutes,
        })
        .await?;
    print_result("run", &response, format);
    Ok(())
}

async fn handle_profiles(
    client: &mut Client,
    matches: &ArgMatches<'_>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    match matches.subcommand() {
        ("save", Some(sub)) => {
            let path = sub.value_of("file").unwrap_or_default();
            let profile: ProfileRecord = serde_json::from_str(&std::fs::read_to_string(path)?)?;
            let response = client
                .send(CommandType::SaveProfile {
                    profile,
                    force: sub.is_present("force"),
                })
                .await?;
            print_result("save", &response, format);
        }
        ("delete", Some(sub)) => {
            let name = sub.value_of("name").unwrap_or_default().to_string();
            let response = client.send(CommandType::DeleteProfile { name }).await?;
            print_result("delete", &response, format);
        }
        _ => {
            let response = client.send(CommandType::ListProfiles).await?;
            print_profiles(&response, format);
        }
    }
    Ok(())
}

/// Parse a `--interval` value, never faster than twice a second.
fn refresh_interval(value: &str) -> Result<Duration, String> {
    let seconds: f64 = value
        .parse()
        .map_err(|_| format!("{value} is not a number of seconds"))?;
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(format!("interval must be a positive number of seconds, got {value}"));
    }
    Duration::try_from_secs_f64(seconds.max(0.5)).map_err(|e| format!("interval {value}: {e}"))
}

async fn handle_watch(
    client: &mut Client,
    matches: &ArgMatches<'_>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let period = refresh_interval(matches.value_of("interval").unwrap_or("2"))?;
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let response = client.send(CommandType::Status).await?;
                if format == "table" {
                    print!("\x1B[2J\x1B[H");
                }
                print_status(&response, format);
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn print_json(response: &CommandResponse) {
    match serde_json::to_string_pretty(response) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("{} {}", "❌".red(), e),
    }
}

fn print_result(action: &str, response: &CommandResponse, format: &str) {
    if format == "json" {
        print_json(response);
        return;
    }
    let message = response.message.as_deref().unwrap_or("");
    match response.status {
        ResponseStatus::Success => println!("{} {}", "✅".green(), message.bright_green()),
        ResponseStatus::InvalidCommand => {
            println!("{} {} rejected: {}", "❌".red(), action.bright_white(), message.bright_red());
        }
        ResponseStatus::Error => {
            println!("{} {} failed: {}", "⚠️".yellow(), action.bright_white(), message.bright_red());
        }
    }
}

fn print_status(response: &CommandResponse, format: &str) {
    if format == "json" {
        print_json(response);
        return;
    }
    let Some(oven) = &response.oven else {
        print_result("status", response, format);
        return;
    };
    print_oven(oven);
}

fn colored_state(oven: &OvenStatus) -> ColoredString {
    let state = oven.state.to_string();
    match oven.state {
        kiln_controller::Lifecycle::Running => state.bright_green().bold(),
        kiln_controller::Lifecycle::Paused => state.bright_yellow().bold(),
        kiln_controller::Lifecycle::Idle => state.bright_white(),
    }
}

fn print_oven(oven: &OvenStatus) {
    println!("{}", "🔥 Oven Status".bright_blue().bold());
    println!("{}", "═".repeat(40).bright_blue());
    println!("  State:       {}", colored_state(oven));
    println!("  Profile:     {}", oven.profile.as_deref().unwrap_or("-").bright_cyan());
    println!(
        "  Temperature: {} (target {})",
        format!("{:.0}", oven.temperature).bright_white(),
        format!("{:.0}", oven.target).bright_cyan()
    );
    println!("  Heat rate:   {:.1}/h", oven.heat_rate);
    println!(
        "  Runtime:     {} / {}",
        format_seconds(oven.runtime),
        format_seconds(oven.totaltime)
    );
    println!("  Heat:        {:.0}%", oven.heat * 100.0);
    if oven.catching_up {
        println!(
            "  Catch-up:    {} (shifted {})",
            "waiting for kiln".bright_yellow(),
            format_seconds(oven.catchup_shift)
        );
    }
    println!("  Cost:        {}{:.2}", oven.currency, oven.cost);

    if oven.thermocouples.len() > 1 {
        println!();
        println!("{}", "🌡️  Thermocouples".bright_blue().bold());
        for (name, reading) in &oven.thermocouples {
            println!("  {:12} {:8.1}  {:+.1}/h", name, reading.temperature, reading.heat_rate);
        }
    }

    if !oven.ext.is_empty() {
        println!();
        println!("{}", "📈 Metrics".bright_blue().bold());
        for (key, value) in &oven.ext {
            println!("  {key:24} {value}");
        }
    }

    if let Some(failure) = &oven.failure {
        println!();
        println!("{} {}", "🚨".red(), failure.reason.bright_red().bold());
    }
}

fn print_profiles(response: &CommandResponse, format: &str) {
    if format == "json" {
        print_json(response);
        return;
    }
    let Some(profiles) = &response.profiles else {
        print_result("list", response, format);
        return;
    };
    println!("{}", "📚 Profiles".bright_blue().bold());
    println!("{}", "═".repeat(40).bright_blue());
    if profiles.is_empty() {
        println!("  {}", "no profiles stored".dimmed());
    }
    for profile in profiles {
        let duration = profile.data.last().map_or(0.0, |s| s.time);
        let peak = profile.data.iter().map(|s| s.temperature).fold(0.0_f64, f64::max);
        println!(
            "  {:20} {:>8}  peak {:.0}{}",
            profile.name.bright_cyan(),
            format_seconds(duration),
            peak,
            profile.temp_units.symbol()
        );
    }
}

fn format_seconds(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}
