//! Source/target wire contract codecs.
//!
//! Deposit memos, exit-note payloads and ZEC amount strings all cross
//! process boundaries; everything here is pure and round-trip tested.

use miden_objects::Felt;

use crate::derive::RecipientHash;

/// 1 native coin = 10^8 base units, on both legs.
pub const COIN: u64 = 100_000_000;

/// Shielded memos are zero-padded to this size on the wire.
const MEMO_SIZE: usize = 512;

/// Longest address we accept in an exit payload. Unified addresses are
/// the longest shielded encoding in practice (~230 chars).
const MAX_ADDRESS_LEN: usize = 512;

const ADDRESS_HRPS: [&str; 6] = ["u", "utest", "uregtest", "zs", "ztestsapling", "zregtestsapling"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    Memo(String),
    Payload(String),
    Amount(String),
    Address(String),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Memo(msg) => write!(f, "bad memo: {msg}"),
            WireError::Payload(msg) => write!(f, "bad exit payload: {msg}"),
            WireError::Amount(msg) => write!(f, "bad amount: {msg}"),
            WireError::Address(msg) => write!(f, "bad address: {msg}"),
        }
    }
}

impl std::error::Error for WireError {}

/// Parses a deposit memo into a recipient hash.
///
/// A valid memo is the UTF-8 encoding of a 64-character lowercase hex
/// string, optionally `0x`-prefixed, zero-padded to the wire size. Any
/// other shape rejects the deposit as unclaimable.
pub fn parse_deposit_memo(memo: &[u8]) -> Result<RecipientHash, WireError> {
    if memo.len() > MEMO_SIZE {
        return Err(WireError::Memo(format!("{} bytes", memo.len())));
    }
    let end = memo
        .iter()
        .rposition(|&b| b != 0)
        .map(|p| p + 1)
        .unwrap_or(0);
    let text = std::str::from_utf8(&memo[..end])
        .map_err(|_| WireError::Memo("not utf-8".into()))?
        .trim();
    let hex_part = text.strip_prefix("0x").unwrap_or(text);
    if hex_part.len() != 64 {
        return Err(WireError::Memo(format!("{} hex chars", hex_part.len())));
    }
    if !hex_part
        .chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(WireError::Memo("not lowercase hex".into()));
    }
    let decoded = hex::decode(hex_part).map_err(|e| WireError::Memo(e.to_string()))?;
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&decoded);
    Ok(RecipientHash::from_bytes(bytes))
}

/// Encodes an exit-note payload: `[amount, addr_len, addr chunks...]`
/// with the destination address UTF-8 bytes packed four per element,
/// big-endian. Every element stays far below the field modulus.
pub fn encode_exit_payload(address: &str, amount_base: u64) -> Result<Vec<Felt>, WireError> {
    let bytes = address.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_ADDRESS_LEN {
        return Err(WireError::Payload(format!(
            "address length {}",
            bytes.len()
        )));
    }
    let mut elements = Vec::with_capacity(2 + bytes.len().div_ceil(4));
    elements.push(Felt::new(amount_base));
    elements.push(Felt::new(bytes.len() as u64));
    for chunk in bytes.chunks(4) {
        let mut packed = [0u8; 4];
        packed[..chunk.len()].copy_from_slice(chunk);
        elements.push(Felt::new(u32::from_be_bytes(packed) as u64));
    }
    Ok(elements)
}

/// Decodes an exit-note payload back into `(address, amount_base)`.
pub fn decode_exit_payload(elements: &[Felt]) -> Result<(String, u64), WireError> {
    if elements.len() < 2 {
        return Err(WireError::Payload(format!(
            "{} elements",
            elements.len()
        )));
    }
    let amount_base = elements[0].as_int();
    let addr_len = elements[1].as_int() as usize;
    if addr_len == 0 || addr_len > MAX_ADDRESS_LEN {
        return Err(WireError::Payload(format!("address length {addr_len}")));
    }
    let chunks = addr_len.div_ceil(4);
    if elements.len() != 2 + chunks {
        return Err(WireError::Payload(format!(
            "expected {} elements, got {}",
            2 + chunks,
            elements.len()
        )));
    }
    let mut bytes = Vec::with_capacity(chunks * 4);
    for element in &elements[2..] {
        let value = element.as_int();
        if value > u32::MAX as u64 {
            return Err(WireError::Payload("chunk exceeds 32 bits".into()));
        }
        bytes.extend_from_slice(&(value as u32).to_be_bytes());
    }
    bytes.truncate(addr_len);
    let address =
        String::from_utf8(bytes).map_err(|_| WireError::Payload("address not utf-8".into()))?;
    Ok((address, amount_base))
}

/// Parses a ZEC decimal string (as the wallet RPC reports amounts)
/// into zatoshis. Integer arithmetic only.
pub fn zec_to_zatoshis(input: &str) -> Result<u64, WireError> {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed.starts_with('-') || trimmed.starts_with('+') {
        return Err(WireError::Amount(format!("'{trimmed}'")));
    }
    let (whole, frac) = match trimmed.split_once('.') {
        Some((w, f)) => (w, f),
        None => (trimmed, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(WireError::Amount(format!("'{trimmed}'")));
    }
    if frac.len() > 8 {
        return Err(WireError::Amount(format!("more than 8 decimals: '{trimmed}'")));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(WireError::Amount(format!("'{trimmed}'")));
    }
    let whole_part: u64 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| WireError::Amount(format!("'{trimmed}'")))?
    };
    let mut frac_part: u64 = 0;
    if !frac.is_empty() {
        frac_part = frac
            .parse()
            .map_err(|_| WireError::Amount(format!("'{trimmed}'")))?;
        frac_part *= 10u64.pow(8 - frac.len() as u32);
    }
    whole_part
        .checked_mul(COIN)
        .and_then(|w| w.checked_add(frac_part))
        .ok_or_else(|| WireError::Amount(format!("overflow: '{trimmed}'")))
}

/// Formats zatoshis as the fixed-point decimal the wallet RPC expects.
pub fn zatoshis_to_zec_string(amount_base: u64) -> String {
    format!("{}.{:08}", amount_base / COIN, amount_base % COIN)
}

/// Sanity-checks a shielded destination address: must be bech32 with a
/// known shielded prefix. Transparent addresses are rejected, the pool
/// only pays out shielded.
pub fn validate_zcash_address(address: &str) -> Result<(), WireError> {
    let (hrp, _data) =
        bech32::decode(address).map_err(|e| WireError::Address(e.to_string()))?;
    if ADDRESS_HRPS.contains(&hrp.as_str()) {
        Ok(())
    } else {
        Err(WireError::Address(format!("unknown prefix '{}'", hrp.as_str())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded_memo(text: &str) -> Vec<u8> {
        let mut memo = text.as_bytes().to_vec();
        memo.resize(MEMO_SIZE, 0);
        memo
    }

    #[test]
    fn memo_parses_plain_and_prefixed_hex() {
        let hex64 = "ab".repeat(32);
        let plain = parse_deposit_memo(&padded_memo(&hex64)).unwrap();
        let prefixed = parse_deposit_memo(&padded_memo(&format!("0x{hex64}"))).unwrap();
        assert_eq!(plain, prefixed);
        assert_eq!(plain.to_hex(), hex64);
    }

    #[test]
    fn memo_rejects_text() {
        assert!(parse_deposit_memo(&padded_memo("hello")).is_err());
    }

    #[test]
    fn memo_rejects_uppercase_hex() {
        let hex64 = "AB".repeat(32);
        assert!(parse_deposit_memo(&padded_memo(&hex64)).is_err());
    }

    #[test]
    fn memo_rejects_wrong_lengths() {
        assert!(parse_deposit_memo(&padded_memo(&"ab".repeat(31))).is_err());
        assert!(parse_deposit_memo(&padded_memo(&"ab".repeat(33))).is_err());
        assert!(parse_deposit_memo(&[]).is_err());
    }

    #[test]
    fn exit_payload_round_trips() {
        let address = "utest1v665kkka8xak9gyqwyv0pynwzv6ka4dyg3cgfvz8wcy3p";
        let elements = encode_exit_payload(address, 50_000_000).unwrap();
        let (decoded_addr, decoded_amount) = decode_exit_payload(&elements).unwrap();
        assert_eq!(decoded_addr, address);
        assert_eq!(decoded_amount, 50_000_000);
    }

    #[test]
    fn exit_payload_round_trips_awkward_lengths() {
        for len in 1..12 {
            let address: String = "a".repeat(len);
            let elements = encode_exit_payload(&address, 1).unwrap();
            let (decoded, _) = decode_exit_payload(&elements).unwrap();
            assert_eq!(decoded, address);
        }
    }

    #[test]
    fn exit_payload_rejects_truncation() {
        let elements = encode_exit_payload("utest1abcdef", 10).unwrap();
        assert!(decode_exit_payload(&elements[..elements.len() - 1]).is_err());
        assert!(decode_exit_payload(&elements[..1]).is_err());
    }

    #[test]
    fn zec_amounts_parse_exactly() {
        assert_eq!(zec_to_zatoshis("0.30000000").unwrap(), 30_000_000);
        assert_eq!(zec_to_zatoshis("0.3").unwrap(), 30_000_000);
        assert_eq!(zec_to_zatoshis("1").unwrap(), COIN);
        assert_eq!(zec_to_zatoshis("0.00000001").unwrap(), 1);
        assert_eq!(zec_to_zatoshis("21000000").unwrap(), 21_000_000 * COIN);
    }

    #[test]
    fn zec_amounts_reject_garbage() {
        assert!(zec_to_zatoshis("").is_err());
        assert!(zec_to_zatoshis("-1").is_err());
        assert!(zec_to_zatoshis("1.234567890").is_err());
        assert!(zec_to_zatoshis("1.2e3").is_err());
        assert!(zec_to_zatoshis(".").is_err());
    }

    #[test]
    fn zatoshi_formatting_round_trips() {
        for amount in [0, 1, 30_000_000, COIN, COIN + 1, 12_345_678_901] {
            let formatted = zatoshis_to_zec_string(amount);
            assert_eq!(zec_to_zatoshis(&formatted).unwrap(), amount);
        }
    }

    #[test]
    fn address_validation_checks_prefix() {
        // bech32 test vector with an hrp we do not pay out to
        assert!(validate_zcash_address("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4").is_err());
        assert!(validate_zcash_address("not an address").is_err());
    }

    #[test]
    fn address_validation_accepts_shielded_prefixes() {
        let hrp = bech32::Hrp::parse("utest").unwrap();
        let addr = bech32::encode::<bech32::Bech32m>(hrp, &[7u8; 40]).unwrap();
        validate_zcash_address(&addr).unwrap();
    }
}
