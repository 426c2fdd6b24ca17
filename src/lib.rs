//! Talk to PLCs using the Beckhoff ADS protocol.
//!
//! # Introduction
//!
//! ADS is the native protocol of programmable logic controllers (PLCs)
//! running the TwinCAT automation system by
//! [Beckhoff GmbH](https://www.beckhoff.com/).  This crate implements the
//! client side of ADS over AMS/TCP: reading and writing variables by
//! symbolic name, with cached symbol metadata and live handles, and
//! server-pushed device notifications dispatched to callbacks.
//!
//! A single receive pump thread per connection demultiplexes responses by
//! invoke-id, so any number of threads can issue requests over one shared
//! [`Client`].
//!
//! # Example
//!
//! ```rust,ignore
//! // Open the connection to a PLC and bind a session to its runtime.
//! let timeouts = twincat::Timeouts::new(std::time::Duration::from_secs(1));
//! let client = twincat::Client::connect("myplc:48898", timeouts, twincat::Source::Auto)?;
//! let session = client.new_session(twincat::AmsAddr::new("5.39.61.10.1.1".parse()?, 851));
//!
//! // Read a variable by name; handle and metadata are cached transparently.
//! let ctx = twincat::Context::default();
//! let (bytes, info) = session.read(&ctx, "MAIN.counter")?;
//! println!("{} = {}", info.name, twincat::value::decode(&info.data_type, &bytes)?);
//! ```

#![deny(missing_docs)]

pub mod client;
pub mod errors;
pub mod frame;
pub mod index;
pub mod netid;
pub mod notif;
pub mod session;
pub mod symbol;
pub mod value;
#[cfg(test)]
mod test;

pub use client::{AdsState, Canceller, Client, Context, DeviceInfo, Source, Timeouts};
pub use errors::{Error, Result};
pub use netid::{AmsAddr, AmsNetId, AmsPort};
pub use notif::NotificationManager;
pub use session::Session;
pub use symbol::{StructField, SymbolInfo};

/// The default TCP port of an AMS router.
pub const ADS_PORT: u16 = 0xBF02;
