use clap::{Arg, ArgMatches, Command};
use log::{error, info};

use crate::config::Config;
use crate::modbus::client::ModbusTcpClient;
use crate::output::{
    ConsoleFormatter, ConsoleSink, CsvFormatter, EventFormatter, EventSink, FileSink,
    JsonFormatter,
};
use crate::services::poll_service::Poller;
use crate::services::tcp_server::ModbusTcpServer;
use crate::services::telemetry::TelemetryFeeder;

pub fn build_cli() -> Command {
    Command::new("modbus_tcp_engine")
        .version(crate::VERSION)
        .about("Modbus TCP register server, client and poller")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to a TOML configuration file")
                .global(true),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("Host to bind or connect to")
                .global(true),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("TCP port")
                .global(true),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("MS")
                .help("Request timeout in milliseconds")
                .global(true),
        )
        .arg(
            Arg::new("interval")
                .long("interval")
                .value_name("MS")
                .help("Poll interval in milliseconds")
                .global(true),
        )
        .arg(
            Arg::new("unit")
                .long("unit")
                .value_name("ID")
                .help("Modbus unit id")
                .global(true),
        )
        .subcommand(Command::new("server").about("Run the Modbus TCP server"))
        .subcommand(
            Command::new("poll")
                .about("Poll a register range periodically")
                .arg(
                    Arg::new("start")
                        .long("start")
                        .value_name("ADDR")
                        .help("First register address"),
                )
                .arg(
                    Arg::new("count")
                        .long("count")
                        .value_name("N")
                        .help("Number of registers"),
                )
                .arg(
                    Arg::new("format")
                        .long("format")
                        .value_name("FMT")
                        .help("Output format: console, json or csv"),
                )
                .arg(
                    Arg::new("output-file")
                        .long("output-file")
                        .value_name("FILE")
                        .help("Append events to a file"),
                ),
        )
        .subcommand(
            Command::new("read")
                .about("Read holding registers once")
                .arg(Arg::new("start").required(true).help("First register address"))
                .arg(Arg::new("count").required(true).help("Number of registers")),
        )
        .subcommand(
            Command::new("write")
                .about("Write one or more holding registers")
                .arg(Arg::new("start").required(true).help("First register address"))
                .arg(
                    Arg::new("values")
                        .required(true)
                        .num_args(1..)
                        .help("Register values"),
                ),
        )
        .subcommand(
            Command::new("config-init")
                .about("Write a default configuration file")
                .arg(Arg::new("path").default_value("config.toml").help("Destination path")),
        )
}

pub async fn handle_subcommands(
    matches: &ArgMatches,
    config: &Config,
) -> Result<bool, Box<dyn std::error::Error>> {
    if matches.subcommand_matches("server").is_some() {
        run_server(config).await?;
        return Ok(true);
    }

    if let Some(matches) = matches.subcommand_matches("poll") {
        run_poll(matches, config).await?;
        return Ok(true);
    }

    if let Some(matches) = matches.subcommand_matches("read") {
        let start: u16 = matches.get_one::<String>("start").unwrap().parse()?;
        let count: u16 = matches.get_one::<String>("count").unwrap().parse()?;

        let mut client = connect_client(config).await?;
        let values = client.read_holding_registers(start, count).await?;

        println!("📊 {} registers from {}:", values.len(), start);
        for (i, value) in values.iter().enumerate() {
            println!("  {:>5} = {} (0x{:04X})", start + i as u16, value, value);
        }

        client.close().await;
        return Ok(true);
    }

    if let Some(matches) = matches.subcommand_matches("write") {
        let start: u16 = matches.get_one::<String>("start").unwrap().parse()?;
        let values: Vec<u16> = matches
            .get_many::<String>("values")
            .unwrap()
            .map(|v| v.parse::<u16>())
            .collect::<Result<_, _>>()?;

        let mut client = connect_client(config).await?;
        if values.len() == 1 {
            client.write_single_register(start, values[0]).await?;
        } else {
            client.write_multiple_registers(start, &values).await?;
        }
        println!("✅ Wrote {} register(s) starting at {}", values.len(), start);

        client.close().await;
        return Ok(true);
    }

    if let Some(matches) = matches.subcommand_matches("config-init") {
        let path = matches.get_one::<String>("path").unwrap();
        Config::default().save_to_file(path)?;
        println!("✅ Default configuration written to {}", path);
        return Ok(true);
    }

    Ok(false)
}

/// Run the server with its telemetry feeder until Ctrl+C.
pub async fn run_server(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = ModbusTcpServer::new(&config.server);
    let addr = server.start().await?;

    let feeder = if config.telemetry.enabled {
        Some(TelemetryFeeder::start(server.bank(), &config.telemetry))
    } else {
        None
    };

    info!("🛑 Server ready on {}, press Ctrl+C to stop", addr);
    tokio::signal::ctrl_c().await?;
    println!();

    if let Some(feeder) = feeder {
        feeder.stop();
    }
    server.stop().await?;
    Ok(())
}

async fn run_poll(matches: &ArgMatches, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut poller_settings = config.poller.clone();
    if let Some(start) = matches.get_one::<String>("start") {
        poller_settings.start_address = start.parse()?;
    }
    if let Some(count) = matches.get_one::<String>("count") {
        poller_settings.count = count.parse()?;
    }

    let format = matches
        .get_one::<String>("format")
        .unwrap_or(&config.output.format);
    let formatter = formatter_for(format);

    let mut sinks: Vec<Box<dyn EventSink>> = vec![Box::new(ConsoleSink)];
    if let Some(path) = matches
        .get_one::<String>("output-file")
        .cloned()
        .or_else(|| config.output.file_path.clone())
    {
        info!("📝 Appending events to {}", path);
        sinks.push(Box::new(FileSink::new(path, config.output.append)));
    }

    let client = connect_client(config).await?;
    let (poller, mut events) = Poller::start(client, &poller_settings);

    let header = formatter.format_header();
    if !header.is_empty() {
        for sink in &sinks {
            sink.send(header.trim_end()).await?;
        }
    }

    info!("🛑 Press Ctrl+C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                let text = formatter.format_event(&event);
                for sink in &sinks {
                    if let Err(e) = sink.send(text.trim_end()).await {
                        error!(
                            "❌ Failed to send via {} to {}: {}",
                            sink.sink_type(),
                            sink.destination(),
                            e
                        );
                    }
                }
            }
        }
    }

    poller.stop().await;
    Ok(())
}

async fn connect_client(config: &Config) -> Result<ModbusTcpClient, Box<dyn std::error::Error>> {
    let client = ModbusTcpClient::connect(
        &config.client.host,
        config.client.port,
        config.client.timeout_ms,
    )
    .await?
    .with_unit_id(config.client.unit_id);
    Ok(client)
}

fn formatter_for(format: &str) -> Box<dyn EventFormatter> {
    match format {
        "json" => {
            info!("🎨 Using JSON formatter");
            Box::new(JsonFormatter)
        }
        "csv" => {
            info!("🎨 Using CSV formatter");
            Box::new(CsvFormatter)
        }
        _ => Box::new(ConsoleFormatter),
    }
}
