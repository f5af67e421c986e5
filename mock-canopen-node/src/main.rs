//! # Mock CANopen Node
//!
//! ## Usage
//!
//! ```bash
//! # Start the mock node on vcan0 with node ID 4
//! cargo run -p mock-canopen-node -- --interface vcan0 --node-id 4
//!
//! # Extra objects from a TOML file, small blocks, already Operational
//! cargo run -p mock-canopen-node -- --objects objects.toml --block-size 8 --operational
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use canopen_client::transport::SocketCanBus;
use canopen_client::{CanBus, NodeId};
use mock_canopen_node::{MockNode, NmtState, ObjectDictionary, SdoServer};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info, trace, warn};
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct Args {
    interface: String,
    node_id: u8,
    objects: Option<PathBuf>,
    block_size: u8,
    tpdo_interval: Duration,
    operational: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            interface: "vcan0".to_string(),
            node_id: 4,
            objects: None,
            block_size: 127,
            tpdo_interval: Duration::from_millis(100),
            operational: false,
        }
    }
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, String> {
        let mut parsed = Self::default();

        while let Some(arg) = args.next() {
            if arg == "--operational" {
                parsed.operational = true;
                continue;
            }

            let value = args.next().ok_or_else(|| format!("{} needs a value", arg))?;
            let invalid = |_| format!("invalid value for {}: {}", arg, value);
            match arg.as_str() {
                "--interface" => parsed.interface = value.clone(),
                "--node-id" => parsed.node_id = value.parse().map_err(invalid)?,
                "--objects" => parsed.objects = Some(PathBuf::from(&value)),
                "--block-size" => parsed.block_size = value.parse().map_err(invalid)?,
                "--tpdo-interval-ms" => {
                    parsed.tpdo_interval = Duration::from_millis(value.parse().map_err(invalid)?)
                }
                _ => return Err(format!("unknown argument: {}", arg)),
            }
        }
        Ok(parsed)
    }
}

fn main() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            error!("{}", e);
            eprintln!(
                "usage: mock-node [--interface vcan0] [--node-id 4] [--objects FILE] \
                 [--block-size 127] [--tpdo-interval-ms 100] [--operational]"
            );
            std::process::exit(2);
        }
    };
    let node_id = NodeId::clamped(args.node_id);

    info!("Mock CANopen Node starting on {} as node {}", args.interface, node_id);

    let bus = match SocketCanBus::open(&args.interface) {
        Ok(bus) => bus,
        Err(e) => {
            error!("Failed to open CAN socket {}: {}", args.interface, e);
            eprintln!("\nTroubleshooting:");
            eprintln!("  1. Create virtual CAN interface:");
            eprintln!("     sudo modprobe vcan");
            eprintln!("     sudo ip link add dev vcan0 type vcan");
            eprintln!("     sudo ip link set up vcan0");
            eprintln!("  2. Check interface exists: ip link show");
            std::process::exit(1);
        }
    };

    let mut object_dict = ObjectDictionary::new();
    object_dict.add_test_objects_for_node(node_id.get());
    if let Some(path) = &args.objects {
        match object_dict.load_toml(path) {
            Ok(count) => info!("Loaded {} object(s) from {:?}", count, path),
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        }
    }

    info!("Object dictionary loaded with {} objects", object_dict.len());
    for line in object_dict.summary() {
        info!("  {}", line);
    }

    let server = SdoServer::new(node_id, object_dict).with_block_size(args.block_size);
    let mut node = MockNode::new(server);
    if args.operational {
        node.set_state(NmtState::Operational);
    }

    if let Err(e) = bus.write_frame(&node.boot_up_frame()) {
        warn!("Failed to send boot-up message: {}", e);
    }

    info!(
        "Waiting for SDO requests on COB-ID 0x{:03X}, TPDO1 on 0x{:03X} every {:?} while Operational",
        node_id.sdo_request_id(),
        0x180 + u16::from(node_id.get()),
        args.tpdo_interval
    );

    let mut last_tpdo_time = Instant::now();

    loop {
        if let Err(e) = node.poll(&bus) {
            warn!("CAN error: {}", e);
        }

        if last_tpdo_time.elapsed() >= args.tpdo_interval {
            if let Some(frame) = node.next_tpdo() {
                match bus.write_frame(&frame) {
                    Ok(()) => {
                        let values = node.tpdo_values();
                        trace!(
                            "TPDO1: Temp={:.2}°C, Press={}hPa, Status={}",
                            f32::from(values.temperature) / 100.0,
                            values.pressure,
                            values.status
                        );
                    }
                    Err(e) => warn!("Failed to send TPDO: {}", e),
                }
            }
            last_tpdo_time = Instant::now();
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, String> {
        Args::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_flags_in_any_order() {
        let args = parse(&["--node-id", "9", "--operational", "--interface", "can1", "--tpdo-interval-ms", "250"]).unwrap();
        assert_eq!(args.node_id, 9);
        assert_eq!(args.interface, "can1");
        assert!(args.operational);
        assert_eq!(args.tpdo_interval, Duration::from_millis(250));
        assert_eq!(args.block_size, 127);
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse(&["--node-id"]).is_err());
        assert!(parse(&["--node-id", "x"]).is_err());
        assert!(parse(&["--speed", "1"]).is_err());
    }
}
