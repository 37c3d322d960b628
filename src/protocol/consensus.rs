//! Tor consensus data model
//!
//! The relay set and bandwidth weights that relay selection runs over.
//! Parsing the consensus document itself happens elsewhere; this module
//! only holds the result, and can load a snapshot of it from JSON.

use crate::error::{Result, TorError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::net::{IpAddr, Ipv4Addr};

/// Parsed consensus snapshot
///
/// Read-only once built. Callers own its lifecycle and pass it explicitly
/// to whatever needs it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Consensus {
    /// All relays in the consensus
    pub relays: Vec<RouterStatus>,

    /// Role-pair bandwidth weights
    #[serde(default)]
    pub weights: BandwidthWeights,
}

impl Consensus {
    pub fn new(relays: Vec<RouterStatus>, weights: BandwidthWeights) -> Self {
        Self { relays, weights }
    }

    /// Load a snapshot from JSON
    ///
    /// Relays that arrive without an IP level get one computed from their
    /// address.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut consensus: Consensus =
            serde_json::from_str(json).map_err(|e| TorError::Parse(e.to_string()))?;
        for relay in &mut consensus.relays {
            if relay.ip_level == 0 {
                relay.ip_level = ip_level(IpAddr::V4(relay.address), 0);
            }
        }
        Ok(consensus)
    }

    /// Get running relays
    pub fn running_relays(&self) -> impl Iterator<Item = &RouterStatus> {
        self.relays.iter().filter(|r| r.flags.running)
    }
}

/// One relay's entry in the consensus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterStatus {
    /// Relay nickname
    pub nickname: String,

    /// SHA-1 digest of the identity key
    #[serde(with = "hex_digest")]
    pub identity: [u8; 20],

    /// IPv4 address
    pub address: Ipv4Addr,

    /// OR (Onion Router) port
    pub or_port: u16,

    /// Directory port (0 if none)
    #[serde(default)]
    pub dir_port: u16,

    /// Measured bandwidth, in consensus units
    pub bandwidth: u32,

    /// Relay flags
    #[serde(default)]
    pub flags: RouterFlags,

    /// Exit ports allowed by the policy summary
    #[serde(default)]
    pub ports: PortSet,

    /// Network-proximity bucket, see [`ip_level`]
    #[serde(default)]
    pub ip_level: u32,
}

impl RouterStatus {
    /// Create an entry with no flags, no exit ports, and a computed IP level
    pub fn new(nickname: &str, identity: [u8; 20], address: Ipv4Addr, or_port: u16) -> Self {
        Self {
            nickname: nickname.to_string(),
            identity,
            address,
            or_port,
            dir_port: 0,
            bandwidth: 0,
            flags: RouterFlags::default(),
            ports: PortSet::none(),
            ip_level: ip_level(IpAddr::V4(address), 0),
        }
    }

    /// Hex fingerprint of the identity digest
    pub fn fingerprint(&self) -> String {
        hex::encode_upper(self.identity)
    }
}

impl std::fmt::Display for RouterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ${} {}:{}",
            self.nickname,
            self.fingerprint(),
            self.address,
            self.or_port
        )
    }
}

mod hex_digest {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &[u8; 20], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode_upper(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 20], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s).map_err(D::Error::custom)?;
        <[u8; 20]>::try_from(bytes.as_slice())
            .map_err(|_| D::Error::custom("identity digest must be 20 bytes"))
    }
}

/// Relay flags from consensus
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterFlags {
    pub authority: bool,
    pub bad_exit: bool,
    pub exit: bool,
    pub fast: bool,
    pub guard: bool,
    pub hs_dir: bool,
    pub middle_only: bool,
    pub no_ed_consensus: bool,
    pub stable: bool,
    pub stale_desc: bool,
    pub running: bool,
    pub valid: bool,
    pub v2_dir: bool,
    pub sybil: bool,
}

impl RouterFlags {
    /// Parse flags from an "s" line's words
    pub fn from_words(flags: &str) -> Self {
        let mut f = RouterFlags::default();

        for flag in flags.split_whitespace() {
            match flag {
                "Authority" => f.authority = true,
                "BadExit" => f.bad_exit = true,
                "Exit" => f.exit = true,
                "Fast" => f.fast = true,
                "Guard" => f.guard = true,
                "HSDir" => f.hs_dir = true,
                "MiddleOnly" => f.middle_only = true,
                "NoEdConsensus" => f.no_ed_consensus = true,
                "Stable" => f.stable = true,
                "StaleDesc" => f.stale_desc = true,
                "Running" => f.running = true,
                "Valid" => f.valid = true,
                "V2Dir" => f.v2_dir = true,
                "Sybil" => f.sybil = true,
                _ => {} // Ignore unknown flags
            }
        }

        f
    }
}

const PORT_BYTES: usize = 65536 / 8;

/// Bitmap of allowed exit ports, one bit per port
#[derive(Clone, PartialEq, Eq)]
pub struct PortSet {
    bits: Box<[u8; PORT_BYTES]>,
}

impl PortSet {
    /// No port allowed
    pub fn none() -> Self {
        Self {
            bits: Box::new([0u8; PORT_BYTES]),
        }
    }

    /// Every port allowed
    pub fn all() -> Self {
        Self {
            bits: Box::new([0xFFu8; PORT_BYTES]),
        }
    }

    /// Allow or forbid `port`
    pub fn set(&mut self, port: u16, allowed: bool) {
        let (byte, bit) = (port as usize / 8, port % 8);
        if allowed {
            self.bits[byte] |= 1 << bit;
        } else {
            self.bits[byte] &= !(1 << bit);
        }
    }

    /// Whether `port` is allowed
    pub fn is_allowed(&self, port: u16) -> bool {
        self.bits[port as usize / 8] & (1 << (port % 8)) != 0
    }

    /// Build from a policy summary like `accept 80,443` or `reject 1-1024`
    pub fn from_policy(policy: &str) -> Result<Self> {
        let (verb, list) = policy
            .trim()
            .split_once(' ')
            .ok_or_else(|| TorError::Parse(format!("bad port policy {:?}", policy)))?;

        let (mut set, allow) = match verb {
            "accept" => (Self::none(), true),
            "reject" => (Self::all(), false),
            _ => {
                return Err(TorError::Parse(format!(
                    "bad port policy verb {:?}",
                    verb
                )))
            }
        };

        for item in list.trim().split(',') {
            let (lo, hi) = match item.split_once('-') {
                Some((lo, hi)) => (parse_port(lo)?, parse_port(hi)?),
                None => {
                    let p = parse_port(item)?;
                    (p, p)
                }
            };
            if lo > hi {
                return Err(TorError::Parse(format!("bad port range {:?}", item)));
            }
            for port in lo..=hi {
                set.set(port, allow);
            }
        }

        Ok(set)
    }

    /// Render as an `accept` policy summary
    pub fn to_policy(&self) -> String {
        let mut ranges = Vec::new();
        let mut start: Option<u16> = None;
        for port in 0..=u16::MAX {
            match (self.is_allowed(port), start) {
                (true, None) => start = Some(port),
                (false, Some(s)) => {
                    ranges.push((s, port - 1));
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            ranges.push((s, u16::MAX));
        }

        if ranges.is_empty() {
            return "reject 0-65535".to_string();
        }

        let list: Vec<String> = ranges
            .iter()
            .map(|(lo, hi)| {
                if lo == hi {
                    lo.to_string()
                } else {
                    format!("{}-{}", lo, hi)
                }
            })
            .collect();
        format!("accept {}", list.join(","))
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.trim()
        .parse()
        .map_err(|_| TorError::Parse(format!("bad port {:?}", s)))
}

impl Default for PortSet {
    fn default() -> Self {
        Self::none()
    }
}

impl std::fmt::Debug for PortSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PortSet({})", self.to_policy())
    }
}

impl Serialize for PortSet {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_policy())
    }
}

impl<'de> Deserialize<'de> for PortSet {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        PortSet::from_policy(&s).map_err(serde::de::Error::custom)
    }
}

const LEVEL_ASN: u32 = 1;
const LEVEL_P24: u32 = 2;
const LEVEL_IPV6: u32 = 4;

/// Network-proximity bucket used to keep circuit hops apart
///
/// The top four bits say what kind of bucket it is: an autonomous system
/// number, an IPv4 /24, or the first 32 bits of an IPv6 address.
pub fn ip_level(addr: IpAddr, asn: u32) -> u32 {
    match addr {
        IpAddr::V4(v4) => {
            if asn != 0 {
                return (LEVEL_ASN << 28) | (asn & 0x0FFF_FFFF);
            }
            let o = v4.octets();
            let p24 = (o[0] as u32) << 16 | (o[1] as u32) << 8 | o[2] as u32;
            (LEVEL_P24 << 28) | p24
        }
        IpAddr::V6(v6) => {
            let o = v6.octets();
            (LEVEL_IPV6 << 28) | u32::from_be_bytes([o[0], o[1], o[2], o[3]])
        }
    }
}

/// Scale of the bandwidth-weight coefficients
pub const WEIGHT_SCALE: u32 = 10000;

/// Bandwidth-weight coefficients from the consensus footer
///
/// The first letter is the position (g = guard, m = middle, e = exit,
/// b = begin-dir, d = directory), the second the relay's flags
/// (g = Guard, e = Exit, d = both, m = neither, b = begin-dir).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct BandwidthWeights {
    pub wbd: u32,
    pub wbe: u32,
    pub wbg: u32,
    pub wbm: u32,
    pub wdb: u32,
    pub web: u32,
    pub wed: u32,
    pub wee: u32,
    pub weg: u32,
    pub wem: u32,
    pub wgb: u32,
    pub wgd: u32,
    pub wgg: u32,
    pub wgm: u32,
    pub wmb: u32,
    pub wmd: u32,
    pub wme: u32,
    pub wmg: u32,
    pub wmm: u32,
}

impl Default for BandwidthWeights {
    fn default() -> Self {
        Self {
            wbd: WEIGHT_SCALE,
            wbe: WEIGHT_SCALE,
            wbg: WEIGHT_SCALE,
            wbm: WEIGHT_SCALE,
            wdb: WEIGHT_SCALE,
            web: WEIGHT_SCALE,
            wed: WEIGHT_SCALE,
            wee: WEIGHT_SCALE,
            weg: WEIGHT_SCALE,
            wem: WEIGHT_SCALE,
            wgb: WEIGHT_SCALE,
            wgd: WEIGHT_SCALE,
            wgg: WEIGHT_SCALE,
            wgm: WEIGHT_SCALE,
            wmb: WEIGHT_SCALE,
            wmd: WEIGHT_SCALE,
            wme: WEIGHT_SCALE,
            wmg: WEIGHT_SCALE,
            wmm: WEIGHT_SCALE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_from_words() {
        let f = RouterFlags::from_words("Exit Fast Guard Running Stable Valid Bogus");
        assert!(f.exit && f.fast && f.guard && f.running && f.stable && f.valid);
        assert!(!f.bad_exit && !f.authority && !f.middle_only);
    }

    #[test]
    fn test_port_policy_accept() {
        let ports = PortSet::from_policy("accept 80,443,6660-6669").unwrap();
        assert!(ports.is_allowed(80));
        assert!(ports.is_allowed(6665));
        assert!(!ports.is_allowed(22));
        assert!(!ports.is_allowed(6670));
        assert_eq!(ports.to_policy(), "accept 80,443,6660-6669");
    }

    #[test]
    fn test_port_policy_reject() {
        let ports = PortSet::from_policy("reject 25,119,135-139").unwrap();
        assert!(!ports.is_allowed(25));
        assert!(!ports.is_allowed(137));
        assert!(ports.is_allowed(443));
        assert!(ports.is_allowed(65535));

        let nothing = PortSet::from_policy("reject 1-65535").unwrap();
        assert!(!nothing.is_allowed(80));
    }

    #[test]
    fn test_port_policy_round_trip() {
        let empty = PortSet::none();
        assert_eq!(empty.to_policy(), "reject 0-65535");
        let back = PortSet::from_policy(&empty.to_policy()).unwrap();
        assert!(!back.is_allowed(0));
        assert_eq!(back, empty);

        assert_eq!(PortSet::all().to_policy(), "accept 0-65535");
        assert_eq!(PortSet::from_policy("accept 0-65535").unwrap(), PortSet::all());

        // Port 0 on its own, and a range that runs to the top
        let mut mixed = PortSet::from_policy("accept 0,22,1024-65535").unwrap();
        mixed.set(22, false);
        assert_eq!(mixed.to_policy(), "accept 0,1024-65535");
        assert_eq!(PortSet::from_policy(&mixed.to_policy()).unwrap(), mixed);

        let json = serde_json::to_string(&empty).unwrap();
        assert_eq!(serde_json::from_str::<PortSet>(&json).unwrap(), empty);
    }

    #[test]
    fn test_port_policy_errors() {
        assert!(PortSet::from_policy("accept").is_err());
        assert!(PortSet::from_policy("allow 80").is_err());
        assert!(PortSet::from_policy("accept 80,http").is_err());
        assert!(PortSet::from_policy("accept 90-80").is_err());
        assert!(PortSet::from_policy("accept 70000").is_err());
    }

    #[test]
    fn test_set_port() {
        let mut ports = PortSet::none();
        ports.set(9001, true);
        assert!(ports.is_allowed(9001));
        ports.set(9001, false);
        assert!(!ports.is_allowed(9001));
        assert!(PortSet::all().is_allowed(0));
    }

    #[test]
    fn test_ip_level() {
        let a = ip_level("192.0.2.10".parse().unwrap(), 0);
        let b = ip_level("192.0.2.200".parse().unwrap(), 0);
        let c = ip_level("192.0.3.10".parse().unwrap(), 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, 0x2000_0000 | 0xC0_00_02);

        assert_eq!(ip_level("192.0.2.10".parse().unwrap(), 64500), 0x1000_0000 | 64500);
        assert_eq!(
            ip_level("2001:db8::1".parse().unwrap(), 0),
            0x4000_0000 | 0x2001_0db8
        );
    }

    #[test]
    fn test_consensus_from_json() {
        let json = r#"{
            "relays": [{
                "nickname": "moria",
                "identity": "9695DFC35FFEB861329B9F1AB04C46397020CE31",
                "address": "128.31.0.34",
                "or_port": 9101,
                "bandwidth": 120,
                "flags": {"guard": true, "running": true},
                "ports": "accept 80,443"
            }],
            "weights": {"Wgg": 5000, "Wee": 9000}
        }"#;

        let consensus = Consensus::from_json(json).unwrap();
        let relay = &consensus.relays[0];
        assert_eq!(relay.fingerprint(), "9695DFC35FFEB861329B9F1AB04C46397020CE31");
        assert!(relay.flags.guard && !relay.flags.exit);
        assert!(relay.ports.is_allowed(443));
        assert_eq!(relay.ip_level, ip_level("128.31.0.34".parse().unwrap(), 0));
        assert_eq!(consensus.weights.wgg, 5000);
        assert_eq!(consensus.weights.wee, 9000);
        assert_eq!(consensus.weights.wmm, WEIGHT_SCALE);
        assert_eq!(consensus.running_relays().count(), 1);
    }

    #[test]
    fn test_bad_identity() {
        let json = r#"{"relays": [{"nickname": "x", "identity": "abcd",
            "address": "10.0.0.1", "or_port": 1, "bandwidth": 1}]}"#;
        assert!(Consensus::from_json(json).is_err());
    }
}
