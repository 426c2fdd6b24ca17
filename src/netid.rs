//! AMS addressing: NetIDs and NetID/port pairs.

use std::fmt::{self, Display};
use std::io::{Read, Write};
use std::str::FromStr;

use itertools::Itertools;
use zerocopy::{FromBytes, Immutable, IntoBytes, Unaligned};

/// A six-octet AMS NetID, conventionally written like `5.39.61.10.1.1`.
///
/// A NetID often starts with the four octets of the device's IP address,
/// but there is no requirement for that and nothing should rely on it.
/// Together with an [`AmsPort`] it identifies one endpoint of an ADS
/// system.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Debug,
         FromBytes, IntoBytes, Immutable, Unaligned)]
#[repr(C)]
pub struct AmsNetId(pub [u8; 6]);

/// An AMS port, identifying a device behind an AMS router.
///
/// Unrelated to the TCP port of the underlying connection.
pub type AmsPort = u16;

impl AmsNetId {
    /// Create a NetID from six octets.
    pub const fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        Self([a, b, c, d, e, f])
    }

    /// Return the "local NetID", `127.0.0.1.1.1`.
    pub const fn local() -> Self {
        Self::new(127, 0, 0, 1, 1, 1)
    }

    /// Create a NetID from a slice, which must have length 6.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        Some(Self(slice.try_into().ok()?))
    }
}

impl From<[u8; 6]> for AmsNetId {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl FromStr for AmsNetId {
    type Err = &'static str;

    /// Parse a NetID from a string (`a.b.c.d.e.f`).
    ///
    /// Octets missing at the end are substituted by 1.
    fn from_str(s: &str) -> Result<Self, &'static str> {
        let parts = s
            .split('.')
            .map(|octet| octet.parse())
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|_| "invalid NetID string")?;
        if parts.len() > 6 {
            return Err("invalid NetID string");
        }
        let mut octets = [1; 6];
        octets[..parts.len()].copy_from_slice(&parts);
        Ok(Self(octets))
    }
}

impl Display for AmsNetId {
    /// Format a NetID in the usual dotted form.  Width and precision
    /// flags are honored.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.pad(&self.0.iter().format(".").to_string())
    }
}

/// Combination of an AMS NetID and a port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct AmsAddr {
    netid: AmsNetId,
    port: AmsPort,
}

impl AmsAddr {
    /// Create a new address from NetID and port.
    pub const fn new(netid: AmsNetId, port: AmsPort) -> Self {
        Self { netid, port }
    }

    /// Return the NetID of this address.
    pub const fn netid(&self) -> AmsNetId {
        self.netid
    }

    /// Return the port of this address.
    pub const fn port(&self) -> AmsPort {
        self.port
    }

    /// Write the address to a stream in wire format (6 NetID octets, then
    /// the port little-endian).
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        let mut raw = [0; 8];
        raw[..6].copy_from_slice(&self.netid.0);
        raw[6..].copy_from_slice(&self.port.to_le_bytes());
        w.write_all(&raw)
    }

    /// Read an address in wire format from a stream.
    pub fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self> {
        let mut netid = AmsNetId::default();
        r.read_exact(&mut netid.0)?;
        let mut port = [0; 2];
        r.read_exact(&mut port)?;
        Ok(Self { netid, port: u16::from_le_bytes(port) })
    }
}

impl From<(AmsNetId, u16)> for AmsAddr {
    fn from((netid, port): (AmsNetId, u16)) -> Self {
        Self { netid, port }
    }
}

impl FromStr for AmsAddr {
    type Err = &'static str;

    /// Parse an AMS address from a string (`netid:port`).
    fn from_str(s: &str) -> Result<AmsAddr, &'static str> {
        let (netid, port) = s.split_once(':').ok_or("invalid AMS addr string")?;
        Ok(Self {
            netid: netid.parse()?,
            port: port.parse().map_err(|_| "invalid port number")?,
        })
    }
}

impl Display for AmsAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.netid, self.port)
    }
}
