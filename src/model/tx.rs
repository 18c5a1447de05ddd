//! Binary transaction codec.
//!
//! Layout, little endian throughout:
//!
//! ```text
//! version:u16  type:u8
//! n_in:u32   { prev_hash:[u8;32] prev_index:u32 value:i64 } * n_in
//! n_out:u32  { value:i64 address:[u8;34] } * n_out
//! lock_time:u32
//! ```
//!
//! A ticket purchase has type 1, its first output is the voting output (whose
//! value is the ticket price) and its second output commits the ticket to the
//! owner's commitment address.

use data_encoding::HEXLOWER_PERMISSIVE;
use thiserror::Error;

use super::address::{Address, AddressError, RAW_LEN as ADDRESS_LEN};
use super::hash::{TxHash, HASH_LEN};

const INPUT_LEN: usize = HASH_LEN + 4 + 8;
const OUTPUT_LEN: usize = 8 + ADDRESS_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxError {
    #[error("transaction is not valid hex")]
    Hex,
    #[error("transaction ends unexpectedly")]
    UnexpectedEof,
    #[error("{0} unexpected bytes after transaction")]
    TrailingBytes(usize),
    #[error("unknown transaction type {0}")]
    TxType(u8),
    #[error("negative output value {0}")]
    NegativeValue(i64),
    #[error("invalid output address: {0}")]
    Address(#[from] AddressError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxType {
    Regular = 0,
    Ticket = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub prev_hash: TxHash,
    pub prev_index: u32,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub value: i64,
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u16,
    pub tx_type: TxType,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

/// Cursor over transaction bytes that fails instead of panicking on short input.
struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], TxError> {
        if self.bytes.len() < n {
            return Err(TxError::UnexpectedEof);
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], TxError> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, TxError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, TxError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, TxError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, TxError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    /// Read an item count, refusing counts the remaining bytes cannot hold.
    fn count(&mut self, item_len: usize) -> Result<usize, TxError> {
        let count = self.u32()? as usize;
        if count.saturating_mul(item_len) > self.bytes.len() {
            return Err(TxError::UnexpectedEof);
        }
        Ok(count)
    }
}

impl Transaction {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TxError> {
        let mut r = Reader { bytes };
        let version = r.u16()?;
        let tx_type = match r.u8()? {
            0 => TxType::Regular,
            1 => TxType::Ticket,
            other => return Err(TxError::TxType(other)),
        };

        let n_in = r.count(INPUT_LEN)?;
        let mut inputs = Vec::with_capacity(n_in);
        for _ in 0..n_in {
            inputs.push(TxInput {
                prev_hash: TxHash::from_bytes(r.array()?),
                prev_index: r.u32()?,
                value: r.i64()?,
            });
        }

        let n_out = r.count(OUTPUT_LEN)?;
        let mut outputs = Vec::with_capacity(n_out);
        for _ in 0..n_out {
            let value = r.i64()?;
            if value < 0 {
                return Err(TxError::NegativeValue(value));
            }
            let address = Address::from_raw(&r.array()?)?;
            outputs.push(TxOutput { value, address });
        }

        let lock_time = r.u32()?;
        if !r.bytes.is_empty() {
            return Err(TxError::TrailingBytes(r.bytes.len()));
        }
        Ok(Self {
            version,
            tx_type,
            inputs,
            outputs,
            lock_time,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            2 + 1 + 8 + self.inputs.len() * INPUT_LEN + self.outputs.len() * OUTPUT_LEN + 4,
        );
        out.extend_from_slice(&self.version.to_le_bytes());
        out.push(self.tx_type as u8);
        out.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            out.extend_from_slice(input.prev_hash.as_bytes());
            out.extend_from_slice(&input.prev_index.to_le_bytes());
            out.extend_from_slice(&input.value.to_le_bytes());
        }
        out.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            out.extend_from_slice(&output.value.to_le_bytes());
            out.extend_from_slice(&output.address.to_raw());
        }
        out.extend_from_slice(&self.lock_time.to_le_bytes());
        out
    }

    pub fn from_hex(hex: &str) -> Result<Self, TxError> {
        let bytes = HEXLOWER_PERMISSIVE
            .decode(hex.trim().as_bytes())
            .map_err(|_| TxError::Hex)?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.to_bytes())
    }

    pub fn hash(&self) -> TxHash {
        TxHash::of(&self.to_bytes())
    }

    /// Is this structurally a ticket purchase?
    pub fn is_ticket(&self) -> bool {
        self.tx_type == TxType::Ticket && self.outputs.len() >= 2
    }

    /// The price paid for a ticket, if this is one.
    pub fn ticket_price(&self) -> Option<i64> {
        self.is_ticket().then(|| self.outputs[0].value)
    }

    /// The address a ticket's owner committed to, if this is a ticket.
    pub fn commitment_address(&self) -> Option<Address> {
        self.is_ticket().then(|| self.outputs[1].address)
    }

    /// Total value of the outputs paying `address`, or `None` if it does not
    /// fit in an `i64`.
    pub fn amount_paid_to(&self, address: &Address) -> Option<i64> {
        self.outputs
            .iter()
            .filter(|o| &o.address == address)
            .try_fold(0i64, |total, o| total.checked_add(o.value))
    }
}
