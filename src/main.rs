use std::path::{Path, PathBuf};
use std::process::exit;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use solenoid_link::{export_csv, logging, Controller, ExportOutcome, LinkConfig, StreamEvent};

#[derive(Parser, Debug)]
#[command(name = "solenoid-link", about = "Talk to the PWM solenoid controller over serial")]
struct Args {
    /// Serial port (overrides the config file)
    #[arg(short, long, global = true)]
    port: Option<String>,
    /// TOML config file
    #[arg(short, long, global = true, default_value = "solenoid.toml")]
    config: PathBuf,
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the board answers
    Ping,
    /// Print the board configuration
    Status,
    /// Set duty in percent of full power
    Duty {
        percent: f64,
        /// Use the fast duty command
        #[arg(long, conflicts_with = "ack")]
        fast: bool,
        /// Wait for the board to acknowledge
        #[arg(long)]
        ack: bool,
    },
    /// Stop the PWM output
    StopPwm,
    /// Stream telemetry to a binary log
    Stream {
        #[arg(short, long, default_value_t = 5)]
        seconds: u64,
    },
    /// Convert a binary stream log to CSV
    Export { bin: PathBuf, csv: PathBuf },
    /// List serial ports
    Ports,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    match &args.log_level {
        Some(level) => logging::init_logging_with_level(level),
        None => logging::init_logging(),
    }

    match args.command {
        Command::Export { ref bin, ref csv } => return export(bin, csv),
        Command::Ports => return ports(),
        _ => {}
    }

    let mut config = LinkConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(port) = &args.port {
        config.serial.port = port.clone();
    }
    if config.serial.port.is_empty() {
        bail!("no serial port given; pass --port or set serial.port in the config");
    }

    let mut ctrl = Controller::open(&config)
        .with_context(|| format!("connecting on {}", config.serial.port))?;

    match args.command {
        Command::Ping => {
            ctrl.ping()?;
            println!("PING acknowledged");
        }
        Command::Status => {
            let status = ctrl.get_status()?;
            println!("firmware            {}", status.firmware_version());
            println!("pwm output pin      {}", status.pwm_output_pin);
            println!("pwm sensing pin     {}", status.pwm_sensing_pin);
            println!("current sensing pin {}", status.current_sensing_pin);
            println!("pwm frequency       {} Hz", status.pwm_frequency);
            println!("pwm adc rate        {} Hz", status.pwm_adc_rate);
            println!("current adc rate    {} Hz", status.current_adc_rate);
            println!("pwm adc resolution  {} bits", status.pwm_adc_resolution);
            println!("current adc res.    {} bits", status.current_adc_resolution);
            println!("pwm depth           {} bits (max duty {})", status.pwm_depth, status.max_duty());
        }
        Command::Duty { percent, fast, ack } => {
            let raw = ctrl.duty_scale().to_raw(percent);
            if fast {
                ctrl.send_duty_fast(percent)?;
            } else if ack {
                ctrl.send_duty_ack(percent)?;
            } else {
                ctrl.send_duty(percent)?;
            }
            println!("duty {percent}% (raw {raw})");
        }
        Command::StopPwm => {
            ctrl.stop_pwm()?;
            println!("PWM stopped");
        }
        Command::Stream { seconds } => stream(&mut ctrl, Duration::from_secs(seconds))?,
        Command::Export { .. } | Command::Ports => {}
    }

    ctrl.close();
    Ok(())
}

fn stream(ctrl: &mut Controller, length: Duration) -> Result<()> {
    // Refreshes the cached ADC rate used for the log header.
    ctrl.get_status()?;
    let buffer = ctrl.start_streaming()?;
    let deadline = Instant::now() + length;

    while Instant::now() < deadline {
        thread::sleep(Duration::from_millis(500));
        if let Some(session) = ctrl.session() {
            for event in session.events().try_iter() {
                let StreamEvent::TimeSync { kind, micros, host_time } = event;
                println!("[{host_time:8.3}s] time sync type={kind} board={micros}us");
            }
            let stats = session.stats();
            println!(
                "[{:8.3}s] {} samples buffered, {} packets, {} CRC errors",
                session.elapsed().as_secs_f64(),
                buffer.len(),
                stats.data_packets,
                stats.crc_errors
            );
            if !session.is_running() {
                eprintln!("stream reader stopped early");
                break;
            }
        }
    }

    if let Some(summary) = ctrl.stop_streaming()? {
        println!(
            "wrote {} records to {}",
            summary.log.records,
            summary.log.path.display()
        );
    }
    Ok(())
}

fn export(bin: &Path, csv: &Path) -> Result<()> {
    match export_csv(bin, csv).with_context(|| format!("exporting {}", bin.display()))? {
        ExportOutcome::EmptySession => println!("{} holds no samples, nothing exported", bin.display()),
        ExportOutcome::Exported {
            rows,
            skipped,
            trailing_bytes,
        } => {
            println!("exported {rows} rows to {}", csv.display());
            if skipped > 0 || trailing_bytes > 0 {
                println!("skipped {skipped} corrupt records, dropped {trailing_bytes} trailing bytes");
            }
        }
    }
    Ok(())
}

fn ports() -> Result<()> {
    let ports = serialport::available_ports().context("listing serial ports")?;
    if ports.is_empty() {
        println!("no serial ports found");
    }
    for port in ports {
        println!("{}", port.port_name);
    }
    Ok(())
}
