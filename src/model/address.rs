use std::fmt::{Display, Formatter};

use data_encoding::BASE32_NOPAD;
use ed25519_dalek::VerifyingKey;
use thiserror::Error;

use crate::crypto::{public_key_from_bytes, CryptoError};
use crate::model::{hash::TxHash, network::NetworkParams};

pub const PAYLOAD_LEN: usize = 32;
const CHECKSUM_LEN: usize = 4;
/// Length of the raw form embedded in transactions: prefix, kind, payload.
pub const RAW_LEN: usize = 2 + PAYLOAD_LEN;

/// What an address commits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    /// Pays to, and is controlled by, an Ed25519 public key.
    PubKey,
    /// Pays to the hash of a script. Carries no public key.
    Script,
}

impl AddressKind {
    const fn tag(self) -> char {
        match self {
            Self::PubKey => 'k',
            Self::Script => 'c',
        }
    }

    fn from_tag(tag: char) -> Option<Self> {
        match tag {
            'k' => Some(Self::PubKey),
            'c' => Some(Self::Script),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address is empty or truncated")]
    Truncated,
    #[error("address belongs to network '{found}', expected '{expected}'")]
    Network { expected: char, found: char },
    #[error("unknown address type '{0}'")]
    Kind(char),
    #[error("address is not valid base32")]
    Encoding,
    #[error("address checksum mismatch")]
    Checksum,
    #[error("address does not carry a public key")]
    NotPublicKey,
    #[error(transparent)]
    Key(#[from] CryptoError),
}

/// A network-bound address.
///
/// The text form is `<network prefix><kind tag><base32(payload || checksum)>`,
/// where the checksum is the first four bytes of the double SHA-256 of the
/// prefix, tag and payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    prefix: char,
    kind: AddressKind,
    payload: [u8; PAYLOAD_LEN],
}

impl Address {
    pub fn from_public_key(params: &NetworkParams, key: &VerifyingKey) -> Self {
        Self {
            prefix: params.addr_prefix,
            kind: AddressKind::PubKey,
            payload: key.to_bytes(),
        }
    }

    pub fn from_script_hash(params: &NetworkParams, hash: [u8; PAYLOAD_LEN]) -> Self {
        Self {
            prefix: params.addr_prefix,
            kind: AddressKind::Script,
            payload: hash,
        }
    }

    /// Decode the text form, insisting that it belongs to `params`' network.
    pub fn decode(s: &str, params: &NetworkParams) -> Result<Self, AddressError> {
        let mut chars = s.chars();
        let prefix = chars.next().ok_or(AddressError::Truncated)?;
        if prefix != params.addr_prefix {
            return Err(AddressError::Network {
                expected: params.addr_prefix,
                found: prefix,
            });
        }
        let tag = chars.next().ok_or(AddressError::Truncated)?;
        let kind = AddressKind::from_tag(tag).ok_or(AddressError::Kind(tag))?;

        let data = BASE32_NOPAD
            .decode(chars.as_str().as_bytes())
            .map_err(|_| AddressError::Encoding)?;
        if data.len() != PAYLOAD_LEN + CHECKSUM_LEN {
            return Err(AddressError::Truncated);
        }
        let (payload, checksum) = data.split_at(PAYLOAD_LEN);
        let mut address = Self {
            prefix,
            kind,
            payload: [0; PAYLOAD_LEN],
        };
        address.payload.copy_from_slice(payload);
        if address.checksum() != checksum {
            return Err(AddressError::Checksum);
        }
        Ok(address)
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    pub fn prefix(&self) -> char {
        self.prefix
    }

    /// The key that controls this address, if it is a public key address.
    pub fn verifying_key(&self) -> Result<VerifyingKey, AddressError> {
        match self.kind {
            AddressKind::PubKey => Ok(public_key_from_bytes(&self.payload)?),
            AddressKind::Script => Err(AddressError::NotPublicKey),
        }
    }

    /// The fixed-width form embedded in transaction outputs.
    pub fn to_raw(&self) -> [u8; RAW_LEN] {
        let mut raw = [0; RAW_LEN];
        raw[0] = self.prefix as u8;
        raw[1] = self.kind.tag() as u8;
        raw[2..].copy_from_slice(&self.payload);
        raw
    }

    /// Inverse of [`Address::to_raw`]. Network membership is not checked
    /// here; transactions are decoded before their network is known.
    pub fn from_raw(raw: &[u8; RAW_LEN]) -> Result<Self, AddressError> {
        let prefix = raw[0] as char;
        if !prefix.is_ascii_alphabetic() {
            return Err(AddressError::Encoding);
        }
        let tag = raw[1] as char;
        let kind = AddressKind::from_tag(tag).ok_or(AddressError::Kind(tag))?;
        let mut payload = [0; PAYLOAD_LEN];
        payload.copy_from_slice(&raw[2..]);
        Ok(Self {
            prefix,
            kind,
            payload,
        })
    }

    fn checksum(&self) -> [u8; CHECKSUM_LEN] {
        let hash = TxHash::of(&self.to_raw());
        let mut checksum = [0; CHECKSUM_LEN];
        checksum.copy_from_slice(&hash.as_bytes()[..CHECKSUM_LEN]);
        checksum
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut data = Vec::with_capacity(PAYLOAD_LEN + CHECKSUM_LEN);
        data.extend_from_slice(&self.payload);
        data.extend_from_slice(&self.checksum());
        write!(
            f,
            "{}{}{}",
            self.prefix,
            self.kind.tag(),
            BASE32_NOPAD.encode(&data)
        )
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;

    use super::*;

    fn key() -> VerifyingKey {
        SigningKey::from_bytes(&[3; 32]).verifying_key()
    }

    #[test]
    fn public_key_address_round_trip() {
        let params = NetworkParams::simnet();
        let address = Address::from_public_key(&params, &key());
        let text = address.to_string();
        assert!(text.starts_with("Sk"));
        let decoded = Address::decode(&text, &params).unwrap();
        assert_eq!(decoded, address);
        assert_eq!(decoded.verifying_key().unwrap(), key());
    }

    #[test]
    fn script_address_has_no_key() {
        let params = NetworkParams::simnet();
        let address = Address::from_script_hash(&params, [9; 32]);
        let decoded = Address::decode(&address.to_string(), &params).unwrap();
        assert_eq!(decoded.kind(), AddressKind::Script);
        assert_eq!(decoded.verifying_key(), Err(AddressError::NotPublicKey));
    }

    #[test]
    fn wrong_network_is_rejected() {
        let address = Address::from_public_key(&NetworkParams::mainnet(), &key());
        assert_eq!(
            Address::decode(&address.to_string(), &NetworkParams::simnet()),
            Err(AddressError::Network {
                expected: 'S',
                found: 'D'
            })
        );
    }

    #[test]
    fn malformed_text_is_rejected() {
        let params = NetworkParams::simnet();
        assert_eq!(Address::decode("", &params), Err(AddressError::Truncated));
        assert_eq!(Address::decode("S", &params), Err(AddressError::Truncated));
        assert_eq!(Address::decode("Sx", &params), Err(AddressError::Kind('x')));
        assert_eq!(
            Address::decode("Sk!!!", &params),
            Err(AddressError::Encoding)
        );

        // Corrupt one character of the base32 body.
        let mut text = Address::from_public_key(&params, &key()).to_string();
        let last = text.pop().unwrap();
        text.push(if last == 'A' { 'B' } else { 'A' });
        assert!(matches!(
            Address::decode(&text, &params),
            Err(AddressError::Checksum | AddressError::Encoding)
        ));
    }

    #[test]
    fn raw_form_round_trip() {
        let params = NetworkParams::testnet();
        let address = Address::from_public_key(&params, &key());
        assert_eq!(Address::from_raw(&address.to_raw()).unwrap(), address);
        let mut raw = address.to_raw();
        raw[1] = b'z';
        assert_eq!(Address::from_raw(&raw), Err(AddressError::Kind('z')));
    }
}
