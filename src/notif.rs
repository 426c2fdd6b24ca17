//! Device notifications: wire decoding, subscriptions, and dispatch.
//!
//! A subscription asks the PLC to push value changes for one symbol.  The
//! [`NotificationManager`] keeps the map from server-assigned notification
//! handles to user callbacks and installs the dispatch hook on the
//! client's receive pump.
//!
//! Callbacks run on the pump thread.  They must not perform blocking
//! operations on the same client, or the pump deadlocks against itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::client::Context;
use crate::errors::{Error, Result};
use crate::frame::{read_u32, read_u64, take, Request, Response};
use crate::session::Session;
use crate::symbol::SymbolInfo;

/// A server-assigned handle identifying one notification subscription.
pub type Handle = u32;

/// Seconds between the FILETIME epoch (1601-01-01) and the Unix epoch.
const FILETIME_UNIX_DIFF_SECS: u64 = 11_644_473_600;

/// Convert a Windows FILETIME (100 ns ticks since 1601-01-01 UTC) into
/// wall-clock time.  Timestamps before 1970 are clamped to the Unix epoch.
pub fn filetime_to_system_time(filetime: u64) -> SystemTime {
    let secs = filetime / 10_000_000;
    let nanos = (filetime % 10_000_000) * 100;
    match secs.checked_sub(FILETIME_UNIX_DIFF_SECS) {
        Some(secs) => UNIX_EPOCH + Duration::new(secs, nanos as u32),
        None => UNIX_EPOCH,
    }
}

/// When the server transmits notification samples.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransmissionMode {
    /// Once per server cycle.
    ServerCycle = 3,
    /// Immediately when the value changes.
    ServerOnChange = 4,
    /// On a fixed cycle, regardless of changes.
    Cyclic = 10,
}

/// A decoded device-notification frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Timestamped sample groups, in wire order.
    pub stamps: Vec<Stamp>,
}

/// A group of samples sharing one timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    /// Windows FILETIME of sample generation.
    pub timestamp: u64,
    /// The samples of this stamp, in wire order.
    pub samples: Vec<SampleData>,
}

/// The payload of one sample inside a stamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleData {
    /// Notification handle the sample belongs to.
    pub handle: Handle,
    /// Sample bytes.
    pub data: Vec<u8>,
}

/// One sample paired with the timestamp of its enclosing stamp, as yielded
/// by [`Notification::samples`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sample<'a> {
    /// Notification handle the sample belongs to.
    pub handle: Handle,
    /// Windows FILETIME of the enclosing stamp.
    pub timestamp: u64,
    /// Sample bytes.
    pub data: &'a [u8],
}

impl Notification {
    /// Decode a notification body (the bytes after the frame header).
    ///
    /// The body is a stream header (`length`, `stampCount`), then per
    /// stamp a FILETIME and `sampleCount`, then per sample a handle, a
    /// size, and that many data bytes.  Truncation is a decode error; the
    /// receive pump treats it as skippable, unlike for responses.
    pub fn decode(body: &[u8]) -> Result<Self> {
        const CTX: &str = "decoding notification";
        let mut r = body;
        let _stream_length = read_u32(&mut r, CTX)?;
        let stamp_count = read_u32(&mut r, CTX)?;

        let mut stamps = Vec::new();
        for _ in 0..stamp_count {
            let timestamp = read_u64(&mut r, CTX)?;
            let sample_count = read_u32(&mut r, CTX)?;
            let mut samples = Vec::new();
            for _ in 0..sample_count {
                let handle = read_u32(&mut r, CTX)?;
                let size = read_u32(&mut r, CTX)?;
                let data = take(&mut r, size as usize, CTX)?;
                samples.push(SampleData { handle, data });
            }
            stamps.push(Stamp { timestamp, samples });
        }
        Ok(Self { stamps })
    }

    /// Iterate over all samples across all stamps, in dispatch order.
    pub fn samples(&self) -> impl Iterator<Item = Sample<'_>> {
        self.stamps.iter().flat_map(|stamp| {
            stamp.samples.iter().map(move |sample| Sample {
                handle: sample.handle,
                timestamp: stamp.timestamp,
                data: &sample.data,
            })
        })
    }
}

/// A sample delivered to a subscription callback.
#[derive(Clone, Debug)]
pub struct NotificationSample {
    /// The subscription's notification handle.
    pub handle: Handle,
    /// Wall-clock time the sample was generated.
    pub timestamp: SystemTime,
    /// Raw sample bytes; decode with [`crate::value::decode`] and the
    /// subscribed symbol's data type.
    pub data: Vec<u8>,
}

/// Callback invoked for each sample of a subscription.
pub type NotificationCallback = Box<dyn Fn(NotificationSample) + Send + Sync>;

struct Subscription {
    symbol: SymbolInfo,
    callback: NotificationCallback,
}

type SubscriptionMap = Arc<RwLock<HashMap<Handle, Subscription>>>;

/// Manages device-notification subscriptions for one session.
///
/// [`start`](Self::start) must be called before samples are delivered;
/// subscriptions made earlier are simply quiet until then.
pub struct NotificationManager<'s> {
    session: &'s Session<'s>,
    subscriptions: SubscriptionMap,
    running: Mutex<bool>,
}

impl<'s> NotificationManager<'s> {
    pub(crate) fn new(session: &'s Session<'s>) -> Self {
        Self {
            session,
            subscriptions: SubscriptionMap::default(),
            running: Mutex::new(false),
        }
    }

    /// Install the dispatch handler on the client.  Idempotent.
    pub fn start(&self) {
        let mut running = self.running.lock().expect("run flag poisoned");
        if *running {
            return;
        }
        *running = true;

        let subscriptions = self.subscriptions.clone();
        self.session.client().set_notification_handler(Some(Arc::new(move |notif: &Notification| {
            let subscriptions = subscriptions.read().expect("subscription map poisoned");
            for sample in notif.samples() {
                let Some(subscription) = subscriptions.get(&sample.handle) else { continue };
                (subscription.callback)(NotificationSample {
                    handle: sample.handle,
                    timestamp: filetime_to_system_time(sample.timestamp),
                    data: sample.data.to_vec(),
                });
            }
        })));
    }

    /// Remove the dispatch handler.  Idempotent; subscriptions stay
    /// registered on the server.
    pub fn stop(&self) {
        let mut running = self.running.lock().expect("run flag poisoned");
        if !*running {
            return;
        }
        *running = false;
        self.session.client().set_notification_handler(None);
    }

    /// Subscribe to value changes of `name`, invoking `callback` for
    /// every sample the server pushes.  Returns the server-assigned
    /// notification handle.
    ///
    /// The subscription addresses the symbol by its index group and
    /// offset; a symbol handle is acquired as well so the variable stays
    /// pinned for the session's lifetime.
    pub fn subscribe(
        &self, ctx: &Context, name: &str, cycle_time: Duration, callback: NotificationCallback,
    ) -> Result<Handle> {
        let mut symbol = self.session.get_symbol(ctx, name)?;
        symbol.handle = self.session.ensure_handle(ctx, name)?;

        let ticks = u32::try_from(cycle_time.as_nanos() / 100)?;
        let request = Request::AddNotification {
            index_group: symbol.index_group,
            index_offset: symbol.index_offset,
            length: symbol.size,
            trans_mode: TransmissionMode::ServerOnChange as u32,
            max_delay: ticks,
            cycle_time: ticks,
        };
        let handle = match self.session.client().request(ctx, self.session.target(), request)? {
            Response::AddNotification { handle, .. } => handle,
            _ => return Err(Error::Reply("add notification", "unexpected response packet", 0)),
        };

        // Register the callback before returning, so a notification frame
        // racing the response cannot fall into the gap.
        self.subscriptions
            .write()
            .expect("subscription map poisoned")
            .insert(handle, Subscription { symbol, callback });
        Ok(handle)
    }

    /// Metadata of the symbol behind a subscription, including its data
    /// type for decoding sample bytes.
    pub fn subscribed_symbol(&self, handle: Handle) -> Option<SymbolInfo> {
        self.subscriptions
            .read()
            .expect("subscription map poisoned")
            .get(&handle)
            .map(|s| s.symbol.clone())
    }

    /// Cancel the subscription behind `handle`.
    pub fn unsubscribe(&self, ctx: &Context, handle: Handle) -> Result<()> {
        let removed =
            self.subscriptions.write().expect("subscription map poisoned").remove(&handle);
        if removed.is_none() {
            return Err(Error::Reply("delete notification", "unknown notification handle", handle));
        }
        match self.session.client().request(ctx, self.session.target(),
                                            Request::DeleteNotification { handle })? {
            Response::DeleteNotification { .. } => Ok(()),
            _ => Err(Error::Reply("delete notification", "unexpected response packet", 0)),
        }
    }

    /// Cancel every subscription.  All deletes are attempted; the last
    /// error is returned.
    pub fn unsubscribe_all(&self, ctx: &Context) -> Result<()> {
        let handles: Vec<Handle> = self
            .subscriptions
            .read()
            .expect("subscription map poisoned")
            .keys()
            .copied()
            .collect();
        let mut last_err = None;
        for handle in handles {
            if let Err(e) = self.unsubscribe(ctx, handle) {
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().expect("subscription map poisoned").len()
    }
}

impl Drop for NotificationManager<'_> {
    fn drop(&mut self) {
        self.stop();
    }
}
