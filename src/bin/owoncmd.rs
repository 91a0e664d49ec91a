#![deny(clippy::unwrap_used)]

use clap::{arg, command, value_parser};
use futures::StreamExt;
use owonctl::proto::codec::FrameCodec;
use owonctl::proto::conv::pretty_ts;
use owonctl::proto::{self, Result};
use owonctl::Reading;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::exit;
use tokio_util::codec::FramedRead;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cmd = command!() // requires `cargo` feature
        .arg(arg!(
            -d --debug ... "Turn debugging information on"
        ))
        .subcommand(
            clap::Command::new("decode")
                .about("Decode measurement frames given as hex")
                .arg(
                    arg!(<frame> ... "Frame, e.g. 230000000a00 or 23:00:00:00:0a:00")
                        .value_parser(parse_frame),
                ),
        )
        .subcommand(
            clap::Command::new("replay")
                .about("Decode a capture of back to back frames")
                .arg(arg!(<file> "Capture file").value_parser(value_parser!(PathBuf))),
        );

    #[cfg(feature = "ble")]
    let cmd = cmd
        .subcommand(clap::Command::new("scan").about("List multimeters in range"))
        .subcommand(
            clap::Command::new("mea")
                .about("Get current measurement")
                .arg(arg!(
                    --"watch" "Print measurements until the meter disconnects"
                )),
        );

    let matches = cmd.subcommand_required(true).get_matches();

    init_logging(matches.get_count("debug"));

    if let Err(e) = handle_args(&matches).await {
        match e {
            proto::ProtoError::Io(err) => {
                if err.kind() == ErrorKind::NotFound {
                    eprintln!("File not found: {}", err);
                } else {
                    eprintln!("I/O Error: {}", err);
                }
            }
            proto::ProtoError::Decode(err) => {
                eprintln!("Invalid frame: {}", err);
            }
            proto::ProtoError::Transport(err) => {
                eprintln!("Bluetooth unavailable: {}", err);
            }
            #[cfg(feature = "ble")]
            proto::ProtoError::Ble(err) => {
                eprintln!("Bluetooth error: {}", err);
            }
            proto::ProtoError::Abort => {
                eprintln!("Lost connection to multimeter, aborting!");
            }
        }
        exit(-1);
    }
}

/// `RUST_LOG` takes precedence over the `-d` count.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("owonctl={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_frame(s: &str) -> std::result::Result<Vec<u8>, String> {
    let digits: Vec<u8> = s
        .bytes()
        .filter(|b| !matches!(b, b':' | b'-' | b' '))
        .collect();
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in {}", s));
    }
    digits
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).map_err(|e| e.to_string())?;
            u8::from_str_radix(pair, 16).map_err(|_| format!("invalid hex byte: {}", pair))
        })
        .collect()
}

fn print_reading(c: usize, reading: &Reading) {
    println!(
        "#{:0>4} {:>15} {:>20}",
        c,
        reading.to_string(),
        pretty_ts(&reading.ts())
    );
    if !reading.options().is_empty() {
        println!("      [{}]", reading.options());
    }
}

async fn handle_args(matches: &clap::ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("decode", args)) => {
            let now = chrono::Utc::now();
            for (c, frame) in args
                .get_many::<Vec<u8>>("frame")
                .into_iter()
                .flatten()
                .enumerate()
            {
                let reading = proto::decode(frame, now)?;
                print_reading(c + 1, &reading);
            }
        }
        Some(("replay", args)) => {
            if let Some(path) = args.get_one::<PathBuf>("file") {
                let file = tokio::fs::File::open(path).await?;
                let mut frames = FramedRead::new(file, FrameCodec);
                let mut c = 0;
                while let Some(frame) = frames.next().await {
                    c += 1;
                    match frame? {
                        Ok(reading) => print_reading(c, &reading),
                        Err(err) => eprintln!("#{:0>4} skipped: {}", c, err),
                    }
                }
                eprintln!("{} frames", c);
            }
        }
        #[cfg(feature = "ble")]
        Some(("scan", _args)) => ble::scan().await?,
        #[cfg(feature = "ble")]
        Some(("mea", args)) => {
            let watch = args.get_flag("watch");
            ble::mea(watch).await?;
        }
        _ => {}
    }
    Ok(())
}

#[cfg(feature = "ble")]
mod ble {
    use owonctl::ble::BtleTransport;
    use owonctl::proto::{ProtoError, Result};
    use owonctl::{Config, Monitor, MonitorHandle};
    use tokio::sync::broadcast::error::RecvError;

    use super::print_reading;

    async fn start() -> Result<MonitorHandle> {
        let (transport, events) = BtleTransport::first_adapter().await?;
        let monitor = Monitor::new(transport, Config::default()).spawn(events);
        monitor.set_scanning(true)?;
        eprintln!("Scanning, press Ctrl-C to stop\n");
        Ok(monitor)
    }

    pub async fn scan() -> Result<()> {
        let monitor = start().await?;
        let mut devices = monitor.subscribe();
        loop {
            tokio::select! {
                device = devices.recv() => match device {
                    Ok(device) => println!("{} {}", device.id(), device.peripheral()),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        monitor.shutdown().await
    }

    pub async fn mea(watch: bool) -> Result<()> {
        let monitor = start().await?;
        let device = tokio::select! {
            device = monitor.next_device() => device,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(device) = device else {
            return monitor.shutdown().await;
        };
        eprintln!("Connected to: {}\n", device.peripheral());

        let mut c = 1;
        let mut result = Ok(());
        loop {
            let reading = tokio::select! {
                reading = device.next_reading() => reading,
                _ = tokio::signal::ctrl_c() => break,
            };
            match reading {
                Some(reading) => print_reading(c, &reading),
                None => {
                    result = Err(ProtoError::Abort);
                    break;
                }
            }
            if !watch {
                break;
            }
            c += 1;
        }
        monitor.shutdown().await?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::parse_frame;

    #[test]
    fn frame_notation() {
        let expected = vec![0x23, 0x00, 0x00, 0x00, 0x0a, 0x00];
        assert_eq!(parse_frame("230000000a00"), Ok(expected.clone()));
        assert_eq!(parse_frame("23:00:00:00:0A:00"), Ok(expected));
        assert!(parse_frame("230").is_err());
        assert!(parse_frame("zz").is_err());
    }
}
