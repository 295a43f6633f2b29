//! Nebula v1 certificates.
//!
//! A certificate is a protobuf `RawNebulaCertificate` holding the encoded
//! details and an Ed25519 signature over exactly those encoded bytes,
//! armoured in a `NEBULA CERTIFICATE` PEM block. Addresses and networks
//! travel as `[address, mask]` u32 pairs; the issuer is the raw SHA-256
//! fingerprint of the signing CA certificate.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use prost::Message;

use crate::digest::sha256_hex;
use crate::keys::{decode_pem, encode_pem, verify_signature, CaSigningKey, CryptoError};

pub const CERTIFICATE_BANNER: &str = "NEBULA CERTIFICATE";

// ── Wire format ─────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
enum Curve {
    Curve25519 = 0,
    P256 = 1,
}

#[derive(Clone, PartialEq, prost::Message)]
struct RawCertificate {
    #[prost(message, optional, tag = "1")]
    details: Option<RawDetails>,
    #[prost(bytes = "vec", tag = "2")]
    signature: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct RawDetails {
    #[prost(string, tag = "1")]
    name: String,
    #[prost(uint32, repeated, tag = "2")]
    ips: Vec<u32>,
    #[prost(uint32, repeated, tag = "3")]
    subnets: Vec<u32>,
    #[prost(string, repeated, tag = "4")]
    groups: Vec<String>,
    #[prost(int64, tag = "5")]
    not_before: i64,
    #[prost(int64, tag = "6")]
    not_after: i64,
    #[prost(bytes = "vec", tag = "7")]
    public_key: Vec<u8>,
    #[prost(bool, tag = "8")]
    is_ca: bool,
    #[prost(bytes = "vec", tag = "9")]
    issuer: Vec<u8>,
    #[prost(enumeration = "Curve", tag = "100")]
    curve: i32,
}

// ── Networks ────────────────────────────────────────────────────────

/// An IPv4 address with a prefix length, e.g. `192.168.100.10/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Network {
    addr: Ipv4Addr,
    prefix_len: u8,
}

impl Network {
    /// Prefix lengths above 32 are clamped to 32.
    pub const fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        let prefix_len = if prefix_len > 32 { 32 } else { prefix_len };
        Self { addr, prefix_len }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn mask(&self) -> u32 {
        match self.prefix_len {
            0 => 0,
            n => u32::MAX << (32 - u32::from(n)),
        }
    }

    /// Whether `ip` falls inside this network.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = self.mask();
        u32::from(ip) & mask == u32::from(self.addr) & mask
    }

    /// Whether `other` lies entirely inside this network.
    pub fn covers(&self, other: &Network) -> bool {
        other.prefix_len >= self.prefix_len && self.contains(other.addr)
    }

    fn from_pair(addr: u32, mask: u32) -> Result<Self, CryptoError> {
        if mask.leading_ones() + mask.trailing_zeros() != 32 {
            return Err(CryptoError::Decode(format!(
                "non-contiguous netmask {mask:#010x}"
            )));
        }
        Ok(Self::new(Ipv4Addr::from(addr), mask.leading_ones() as u8))
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for Network {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| CryptoError::Decode(format!("missing prefix length in {s:?}")))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|e| CryptoError::Decode(format!("{s:?}: {e}")))?;
        let len: u8 = len
            .parse()
            .map_err(|e| CryptoError::Decode(format!("{s:?}: {e}")))?;
        if len > 32 {
            return Err(CryptoError::Decode(format!("{s:?}: prefix length exceeds 32")));
        }
        Ok(Self::new(addr, len))
    }
}

fn pairs(networks: &[Network]) -> Vec<u32> {
    networks
        .iter()
        .flat_map(|n| [u32::from(n.addr), n.mask()])
        .collect()
}

fn unpair(values: &[u32]) -> Result<Vec<Network>, CryptoError> {
    if values.len() % 2 != 0 {
        return Err(CryptoError::Decode(
            "address list has an odd number of entries".to_string(),
        ));
    }
    values
        .chunks_exact(2)
        .map(|pair| Network::from_pair(pair[0], pair[1]))
        .collect()
}

// ── Certificates ────────────────────────────────────────────────────

/// The signed portion of a certificate.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateDetails {
    pub name: String,
    pub ips: Vec<Network>,
    pub subnets: Vec<Network>,
    pub groups: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub public_key: Vec<u8>,
    pub is_ca: bool,
    /// Hex fingerprint of the signing CA; empty when self-signed.
    pub issuer: String,
}

impl CertificateDetails {
    fn to_raw(&self) -> Result<RawDetails, CryptoError> {
        let issuer = if self.issuer.is_empty() {
            Vec::new()
        } else {
            hex::decode(&self.issuer)
                .map_err(|e| CryptoError::Decode(format!("issuer fingerprint: {e}")))?
        };
        Ok(RawDetails {
            name: self.name.clone(),
            ips: pairs(&self.ips),
            subnets: pairs(&self.subnets),
            groups: self.groups.clone(),
            not_before: self.not_before.timestamp(),
            not_after: self.not_after.timestamp(),
            public_key: self.public_key.clone(),
            is_ca: self.is_ca,
            issuer,
            curve: Curve::Curve25519 as i32,
        })
    }

    fn from_raw(raw: RawDetails) -> Result<Self, CryptoError> {
        if raw.curve != Curve::Curve25519 as i32 {
            return Err(CryptoError::Decode(format!(
                "unsupported curve {}",
                raw.curve
            )));
        }
        let timestamp = |secs: i64| {
            DateTime::from_timestamp(secs, 0)
                .ok_or_else(|| CryptoError::Decode(format!("timestamp {secs} out of range")))
        };
        Ok(Self {
            name: raw.name,
            ips: unpair(&raw.ips)?,
            subnets: unpair(&raw.subnets)?,
            groups: raw.groups,
            not_before: timestamp(raw.not_before)?,
            not_after: timestamp(raw.not_after)?,
            public_key: raw.public_key,
            is_ca: raw.is_ca,
            issuer: hex::encode(raw.issuer),
        })
    }
}

/// A signed Nebula certificate.
#[derive(Debug, Clone)]
pub struct NebulaCertificate {
    details: CertificateDetails,
    signature: Vec<u8>,
}

impl NebulaCertificate {
    /// Sign `details` with the CA key.
    pub fn sign(details: CertificateDetails, key: &CaSigningKey) -> Result<Self, CryptoError> {
        let encoded = details.to_raw()?.encode_to_vec();
        let signature = key.sign(&encoded).to_vec();
        Ok(Self { details, signature })
    }

    pub fn details(&self) -> &CertificateDetails {
        &self.details
    }

    pub fn is_ca(&self) -> bool {
        self.details.is_ca
    }

    /// True outside the `[not_before, not_after]` window.
    pub fn expired(&self, at: DateTime<Utc>) -> bool {
        at < self.details.not_before || at > self.details.not_after
    }

    /// Check the signature against `public_key`.
    pub fn verify(&self, public_key: &[u8]) -> Result<(), CryptoError> {
        let encoded = self.details.to_raw()?.encode_to_vec();
        verify_signature(public_key, &encoded, &self.signature)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let raw = RawCertificate {
            details: Some(self.details.to_raw()?),
            signature: self.signature.clone(),
        };
        Ok(raw.encode_to_vec())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw = RawCertificate::decode(bytes).map_err(|e| CryptoError::Decode(e.to_string()))?;
        let details = raw
            .details
            .ok_or_else(|| CryptoError::Decode("certificate has no details".to_string()))?;
        Ok(Self {
            details: CertificateDetails::from_raw(details)?,
            signature: raw.signature,
        })
    }

    pub fn to_pem(&self) -> Result<String, CryptoError> {
        Ok(encode_pem(CERTIFICATE_BANNER, &self.to_bytes()?))
    }

    pub fn from_pem(input: &[u8]) -> Result<Self, CryptoError> {
        Self::from_bytes(&decode_pem(input, CERTIFICATE_BANNER)?)
    }

    /// Lowercase hex SHA-256 of the encoded certificate.
    pub fn fingerprint(&self) -> Result<String, CryptoError> {
        Ok(sha256_hex(&self.to_bytes()?))
    }
}
