//! # rcu-link
//!
//! Link engine for a BLE voice remote (RCU): connects to the
//! peripheral's attribute server, drives the serialized
//! discovery/initialization state machine, demultiplexes the in-band
//! control protocol out of the audio notification stream, and decodes
//! IMA ADPCM voice into 16-bit PCM.
//!
//! The engine is transport-agnostic: implement [`Transport`] and
//! [`Timers`] for your BLE stack (a `btleplug` binding ships behind the
//! `btleplug` feature), feed [`TransportEvent`]s in from one owner
//! context, and consume the [`Event`] stream:
//!
//! ```no_run
//! # fn demo<H: rcu_link::LinkHost>(host: H) -> Result<(), rcu_link::Error> {
//! use rcu_link::{LinkOptions, RemoteLinkEngine};
//!
//! let (mut engine, events) = RemoteLinkEngine::new(host, LinkOptions::default())?;
//! engine.connect("80:EA:CA:00:12:34".parse()?);
//! // ... feed transport events, drain `events` ...
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod link;
pub mod transport;

#[cfg(feature = "btleplug")]
pub mod btle;

pub use config::LinkOptions;
pub use engine::{Event, RemoteLinkEngine};
pub use error::Error;
pub use link::{LinkState, LinkStateMachine, ReportClass};
pub use transport::{
    BondState, CharHandle, CharacteristicInfo, DescHandle, DescriptorInfo, DeviceAddress,
    GattStatus, LinkHost, ServiceInfo, TimerKind, Timers, Transport, TransportEvent,
};
