use std::time::Duration;

use anyhow::{bail, Context, Result};
use prost::Message;
use rand::Rng;

/// Encode a byte + u64 prefix key.
///
/// Big-endian encoding keeps keys sharing a prefix ordered by the encoded value.
///
/// NOTE: if any data in a tree is encoded with a prefix, then all data in that tree will need
/// to be encoded with a well-defined prefix as well in order to avoid unintended collisions.
pub fn encode_byte_prefix(prefix: &[u8; 1], val: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = prefix[0];
    key[1..].copy_from_slice(&encode_u64(val));
    key
}

/// Encode the given u64 as an array of big-endian bytes.
pub fn encode_u64(val: u64) -> [u8; 8] {
    val.to_be_bytes()
}

/// Decode the given bytes as a u64.
pub fn decode_u64(val: &[u8]) -> Result<u64> {
    match <[u8; 8]>::try_from(val) {
        Ok(bytes) => Ok(u64::from_be_bytes(bytes)),
        Err(_) => bail!("invalid byte array given to decode as u64, invalid len {} needed 8", val.len()),
    }
}

/// Encode the given model into a bytes vec.
pub fn encode_model<M: Message>(model: &M) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(model.encoded_len());
    model.encode(&mut buf).context("error serializing data model")?;
    Ok(buf)
}

/// Decode an object from the given buffer.
pub fn decode_model<M: Message + Default>(data: &[u8]) -> Result<M> {
    M::decode(data).context("error decoding object from storage")
}

/// Add up to 20% of random jitter to the given duration.
pub fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0..1.2);
    base.mul_f64(factor)
}
