//! Demo host for a BLE voice remote.
//!
//! Scans for HID peripherals (or takes a MAC address as the first
//! argument), connects, and streams: key reports, config updates and
//! decoded-audio statistics go to stdout. Ctrl-C exits.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use btleplug::api::Manager as _;
use btleplug::platform::Manager;

use rcu_link::btle::{self, BtleEngine, EngineCommand};
use rcu_link::config::AUDIO_MODE_AUTOMATIC;
use rcu_link::{DeviceAddress, Event, LinkOptions};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no Bluetooth adapter found"))?;

    let BtleEngine { commands, events } = btle::start(adapter, LinkOptions::default()).await?;

    let target: DeviceAddress = match std::env::args().nth(1) {
        Some(address) => address.parse()?,
        None => {
            println!("Scanning for remotes (8 s)...");
            commands.send(EngineCommand::StartScan)?;
            let deadline = Instant::now() + Duration::from_secs(8);
            let mut best: Option<(DeviceAddress, i16, Option<String>)> = None;
            while Instant::now() < deadline {
                let Ok(event) = events.recv_timeout(Duration::from_millis(250)) else {
                    continue;
                };
                if let Event::ScanResult {
                    address,
                    rssi,
                    name,
                } = event
                {
                    println!(
                        "  {address} ({rssi} dBm) {}",
                        name.as_deref().unwrap_or("")
                    );
                    if best.as_ref().map_or(true, |(_, seen, _)| rssi > *seen) {
                        best = Some((address, rssi, name));
                    }
                }
            }
            commands.send(EngineCommand::StopScan)?;
            let (address, _, name) = best.ok_or_else(|| anyhow!("no remotes found"))?;
            println!("Using {address} {}", name.as_deref().unwrap_or(""));
            address
        }
    };

    commands.send(EngineCommand::Connect(target))?;

    let stream_commands = commands.clone();
    std::thread::spawn(move || {
        let mut total_samples: u64 = 0;
        for event in events {
            match event {
                Event::Connected(address) => println!("Connected to {address}"),
                Event::Disconnected(address) => println!("Disconnected from {address}"),
                Event::DeviceReady(address) => {
                    println!("{address} ready, enabling voice stream");
                    let _ = stream_commands.send(EngineCommand::SetStreaming {
                        enable: true,
                        mode: AUDIO_MODE_AUTOMATIC,
                    });
                }
                Event::KeyReport(report) => println!("Key report: {report:02x?}"),
                Event::ConfigUpdate {
                    mtu,
                    packet_size,
                    connection_interval,
                    slave_latency,
                    supervision_timeout,
                } => println!(
                    "Config: mtu={mtu} packet={packet_size} interval={connection_interval} \
                     latency={slave_latency} timeout={supervision_timeout}"
                ),
                Event::BitrateSample(bits_per_second) => {
                    println!("Bitrate: {bits_per_second:.0} bit/s");
                }
                Event::DecodedAudio(pcm) => {
                    let before = total_samples;
                    total_samples += pcm.len() as u64;
                    // One line per second of decoded audio.
                    if before / 16000 != total_samples / 16000 {
                        println!("Decoded {total_samples} samples");
                    }
                }
                _ => {}
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    println!("Closing");
    commands.send(EngineCommand::Close)?;
    Ok(())
}
