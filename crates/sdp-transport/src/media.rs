//! Media identifiers, capability masks and hardware addresses.
//!
//! Every physical transport is identified by a single bit so that a peer's
//! capabilities fit in one byte on the wire.

use std::fmt;
use std::str::FromStr;

/// Physical transport kinds. Discriminants are the wire bitmask values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MediaType {
    /// Short-range radio (ESP-NOW class)
    RadioShort = 0x01,
    /// Mesh radio
    RadioMesh = 0x02,
    /// Long-range radio (LoRa class)
    RadioLong = 0x04,
    /// Cellular modem
    Cellular = 0x08,
    /// I2C bus
    BusI2c = 0x10,
    /// CAN bus
    BusCan = 0x20,
    /// TTL serial line
    BusTtl = 0x40,
}

impl MediaType {
    /// All media, in bit order.
    pub const ALL: [MediaType; 7] = [
        MediaType::RadioShort,
        MediaType::RadioMesh,
        MediaType::RadioLong,
        MediaType::Cellular,
        MediaType::BusI2c,
        MediaType::BusCan,
        MediaType::BusTtl,
    ];

    /// Bit value of this media in a [`MediaMask`].
    pub const fn bit(self) -> u8 {
        self as u8
    }

    /// Tie-break rank used by media selection. Higher wins.
    ///
    /// Wired buses rank above long-range radio, which ranks above
    /// short-range radio: reliability over speed.
    pub const fn priority(self) -> u8 {
        match self {
            MediaType::BusCan => 7,
            MediaType::BusI2c => 6,
            MediaType::BusTtl => 5,
            MediaType::RadioLong => 4,
            MediaType::Cellular => 3,
            MediaType::RadioMesh => 2,
            MediaType::RadioShort => 1,
        }
    }

    /// True for the wired bus transports
    pub const fn is_wired(self) -> bool {
        matches!(
            self,
            MediaType::BusI2c | MediaType::BusCan | MediaType::BusTtl
        )
    }

    /// Short lowercase name, also accepted by `FromStr`.
    pub const fn name(self) -> &'static str {
        match self {
            MediaType::RadioShort => "radio-short",
            MediaType::RadioMesh => "radio-mesh",
            MediaType::RadioLong => "radio-long",
            MediaType::Cellular => "cellular",
            MediaType::BusI2c => "bus-i2c",
            MediaType::BusCan => "bus-can",
            MediaType::BusTtl => "bus-ttl",
        }
    }
}

impl TryFrom<u8> for MediaType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        MediaType::ALL
            .into_iter()
            .find(|m| m.bit() == value)
            .ok_or(value)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MediaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MediaType::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown media type: {s}"))
    }
}

/// Set of media, one bit per [`MediaType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MediaMask(u8);

impl MediaMask {
    /// No media
    pub const EMPTY: MediaMask = MediaMask(0);

    /// Build from raw bits. Unknown bits are discarded.
    pub const fn from_bits(bits: u8) -> Self {
        MediaMask(bits & 0x7F)
    }

    /// Raw bit value
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Check membership
    pub const fn contains(self, media: MediaType) -> bool {
        self.0 & media.bit() != 0
    }

    /// Add a media
    pub fn insert(&mut self, media: MediaType) {
        self.0 |= media.bit();
    }

    /// Remove a media
    pub fn remove(&mut self, media: MediaType) {
        self.0 &= !media.bit();
    }

    /// Media present in both masks
    pub const fn intersection(self, other: MediaMask) -> MediaMask {
        MediaMask(self.0 & other.0)
    }

    /// True when no media is set
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate the contained media in bit order
    pub fn iter(self) -> impl Iterator<Item = MediaType> {
        MediaType::ALL.into_iter().filter(move |m| self.contains(*m))
    }
}

impl From<MediaType> for MediaMask {
    fn from(media: MediaType) -> Self {
        MediaMask(media.bit())
    }
}

impl FromIterator<MediaType> for MediaMask {
    fn from_iter<I: IntoIterator<Item = MediaType>>(iter: I) -> Self {
        let mut mask = MediaMask::EMPTY;
        for media in iter {
            mask.insert(media);
        }
        mask
    }
}

impl fmt::Display for MediaMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(MediaType::name).collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// 6-byte hardware address of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Broadcast address
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);

    /// Raw bytes
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(format!("invalid hardware address: {s}"));
        }
        let mut out = [0u8; 6];
        for (slot, part) in out.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| format!("invalid hardware address: {s}"))?;
        }
        Ok(MacAddress(out))
    }
}

/// How a driver identifies the sender of an inbound frame.
///
/// Bandwidth-poor media carry only the 32-bit relation id instead of the
/// full hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenderId {
    /// Full hardware address
    Address(MacAddress),
    /// Relation id shared by the two peers
    Relation(u32),
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SenderId::Address(addr) => write!(f, "{addr}"),
            SenderId::Relation(id) => write!(f, "rel:{id:08x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_bits_match_wire_values() {
        assert_eq!(MediaType::RadioShort.bit(), 1);
        assert_eq!(MediaType::RadioMesh.bit(), 2);
        assert_eq!(MediaType::RadioLong.bit(), 4);
        assert_eq!(MediaType::Cellular.bit(), 8);
        assert_eq!(MediaType::BusI2c.bit(), 16);
        assert_eq!(MediaType::BusCan.bit(), 32);
        assert_eq!(MediaType::BusTtl.bit(), 64);
    }

    #[test]
    fn test_media_try_from() {
        assert_eq!(MediaType::try_from(0x20), Ok(MediaType::BusCan));
        assert_eq!(MediaType::try_from(0x03), Err(0x03));
        assert_eq!(MediaType::try_from(0x80), Err(0x80));
    }

    #[test]
    fn test_priority_order() {
        assert!(MediaType::BusCan.priority() > MediaType::RadioLong.priority());
        assert!(MediaType::BusTtl.priority() > MediaType::RadioLong.priority());
        assert!(MediaType::RadioLong.priority() > MediaType::RadioShort.priority());
    }

    #[test]
    fn test_mask_operations() {
        let mut mask = MediaMask::EMPTY;
        assert!(mask.is_empty());
        mask.insert(MediaType::RadioShort);
        mask.insert(MediaType::BusCan);
        assert_eq!(mask.bits(), 0x21);
        assert!(mask.contains(MediaType::BusCan));
        assert!(!mask.contains(MediaType::Cellular));

        let other: MediaMask = [MediaType::BusCan, MediaType::Cellular].into_iter().collect();
        let common = mask.intersection(other);
        assert_eq!(common.iter().collect::<Vec<_>>(), vec![MediaType::BusCan]);

        mask.remove(MediaType::BusCan);
        assert_eq!(mask, MediaMask::from(MediaType::RadioShort));
        assert_eq!(mask.to_string(), "radio-short");
    }

    #[test]
    fn test_mask_drops_unknown_bits() {
        assert_eq!(MediaMask::from_bits(0xFF).bits(), 0x7F);
    }

    #[test]
    fn test_media_name_roundtrip() {
        for media in MediaType::ALL {
            assert_eq!(media.name().parse::<MediaType>(), Ok(media));
        }
        assert!("token-ring".parse::<MediaType>().is_err());
    }

    #[test]
    fn test_mac_parse_display() {
        let addr: MacAddress = "24:6f:28:aa:01:ff".parse().unwrap();
        assert_eq!(addr.0, [0x24, 0x6f, 0x28, 0xaa, 0x01, 0xff]);
        assert_eq!(addr.to_string(), "24:6f:28:aa:01:ff");
        assert!("24:6f:28".parse::<MacAddress>().is_err());
        assert!("zz:6f:28:aa:01:ff".parse::<MacAddress>().is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_mask_bits_roundtrip(bits in 0u8..0x80) {
            let mask = MediaMask::from_bits(bits);
            let rebuilt: MediaMask = mask.iter().collect();
            proptest::prop_assert_eq!(rebuilt.bits(), bits);
        }

        #[test]
        fn prop_mac_display_parses_back(bytes in proptest::prelude::any::<[u8; 6]>()) {
            let addr = MacAddress(bytes);
            proptest::prop_assert_eq!(addr.to_string().parse::<MacAddress>(), Ok(addr));
        }
    }
}
