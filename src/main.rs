use std::{path::Path, time::Duration};

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use serial_monitor::{
    cli::{self, Commands},
    config::Config,
    events::LifecycleEvent,
    logging,
    mock::MockTransport,
    serial::serial_port::NativeTransport,
    server,
    session::SessionHandle,
    transport::{ConnectionConfig, Transport},
    validation::{RuleSet, UserDefine},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, info_span, Instrument, Level};

/// A mock device which says something every second while connected.
fn demo_transport() -> MockTransport {
    let mock = MockTransport::new();
    let device = mock.add_device("/dev/ttyMOCK0", "Demo device");

    tokio::spawn(
        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            let mut count = 0;
            loop {
                interval.tick().await;
                if device.emit_line(&format!("tick {count}")) {
                    count += 1;
                }
            }
        }
        .instrument(info_span!("demo device")),
    );

    mock
}

fn transport(use_mock: bool, config: &Config) -> Box<dyn Transport> {
    if use_mock {
        info!("Using the mock transport");
        Box::new(demo_transport())
    } else {
        Box::new(NativeTransport::new().set_flow_control(config.flow_control))
    }
}

fn read_options(path: &Path) -> Result<Vec<UserDefine>> {
    let contents = std::fs::read_to_string(path)?;

    let options = if path.extension().map_or(false, |ext| ext == "json") {
        serde_json::from_str(&contents)?
    } else {
        ron::from_str(&contents)?
    };

    Ok(options)
}

async fn list(session: SessionHandle) -> Result<()> {
    let devices = session.list_devices().await?;

    if devices.is_empty() {
        println!("No devices found");
    }
    for device in devices {
        println!("{device}");
    }

    Ok(())
}

async fn monitor(session: SessionHandle, connection: ConnectionConfig) -> Result<()> {
    let mut logs = session.subscribe_logs();
    let mut events = session.subscribe_events();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    session.connect(connection).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C, disconnecting");
                break;
            }
            Some(line) = logs.recv() => println!("{}", line.as_str()),
            Some(event) = events.recv() => {
                eprintln!("{event}");
                if event.inner == LifecycleEvent::Disconnected {
                    return Ok(());
                }
            }
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) => session.write(format!("{line}\n").into_bytes()).await?,
                None => {
                    debug!("stdin closed");
                    stdin_open = false;
                }
            },
        }
    }

    session.disconnect().await?;

    Ok(())
}

fn validate(options_path: &Path, rules: RuleSet) -> Result<()> {
    let options = read_options(options_path)?;
    let failures = rules.validate(&options);

    if failures.is_empty() {
        println!("{} option(s), all good", options.len());
        return Ok(());
    }

    for failure in &failures {
        println!("{failure}");
    }

    Err(eyre!("{} problem(s) found", failures.len()))
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    let command = match cli.command {
        Commands::Examples(example) => {
            println!("{}", cli::example(example)?);
            return Ok(());
        }
        command => command,
    };

    let config = if let Some(config_path) = &cli.config {
        Config::new_from_path(config_path)?
    } else {
        Config::default()
    };

    logging::init(
        cli.log_level,
        config.log_dir.clone().map(|dir| (Level::DEBUG, dir)),
    )
    .await;
    debug!(?cli.config, "Configuration loaded");

    match command {
        Commands::List => {
            let session = SessionHandle::new(transport(cli.mock, &config), &config)?;
            list(session).await
        }
        Commands::Monitor { port, baud } => {
            let session = SessionHandle::new(transport(cli.mock, &config), &config)?;
            let baud = baud.unwrap_or(config.default_baud_rate);
            monitor(session, ConnectionConfig::new(&port, baud)).await
        }
        Commands::Validate { options, rules } => {
            let rules = match rules {
                Some(path) => {
                    let rules = RuleSet::new_from_path(path)?;
                    rules.check()?;
                    rules
                }
                None => config.rule_set()?,
            };
            validate(&options, rules)
        }
        Commands::Serve { port } => {
            let mut config = config;
            if let Some(port) = port {
                config.server_port = port;
            }
            let transport = transport(cli.mock, &config);

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C, quitting");
                    Ok(())
                }
                result = server::run_on_port(config, transport) => {
                    error!(?result, "Server returned");
                    result?;
                    Err(eyre!("Server stopped unexpectedly"))
                }
            }
        }
        Commands::Examples(_) => Ok(()),
    }
}
