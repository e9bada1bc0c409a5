use std::time::Duration;

use anyhow::Result;

use crate::utils;

const PREFIX_A: &[u8; 1] = b"a";
const PREFIX_B: &[u8; 1] = b"b";

#[test]
fn byte_prefix_keys_sort_by_prefix_then_value() -> Result<()> {
    let keys = vec![
        utils::encode_byte_prefix(PREFIX_A, 1),
        utils::encode_byte_prefix(PREFIX_A, 256),
        utils::encode_byte_prefix(PREFIX_A, u64::MAX),
        utils::encode_byte_prefix(PREFIX_B, 0),
    ];
    let mut sorted = keys.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, keys, "expected encoded keys to sort by prefix then value");
    assert_eq!(utils::decode_u64(&keys[1][1..])?, 256, "expected encoded value to decode");
    assert!(utils::decode_u64(&keys[1][2..]).is_err(), "expected short buffers to be rejected");

    Ok(())
}

#[test]
fn jitter_stays_within_bounds() {
    let base = Duration::from_secs(1);
    for _ in 0..1_000 {
        let val = utils::jitter(base);
        assert!(val >= base && val < base.mul_f64(1.2), "jitter of {:?} out of bounds", val);
    }
}
