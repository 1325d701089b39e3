//! Minimal Solidity ABI codec for the drug registry contract.
//!
//! Only the shapes the contract uses are supported:
//!
//! | Item | Shape |
//! |------|-------|
//! | `addDrug`, `updateHistory` calls | `(uint256, string)` |
//! | `getDrug` call | `(uint256)` |
//! | `getDrug` return | `(uint256, string, address, string[])` |
//! | `DrugAdded` event | `(uint256, string, address)` |
//! | `HistoryUpdated` event | `(uint256, string)` |
//!
//! Drug ids are `uint256` on chain and decimal strings everywhere else;
//! [`parse_uint256`] and [`format_uint256`] convert between the two.

use sha3::{Digest, Keccak256};

use crate::{
    client::{LedgerEvent, OnChainDrug},
    error::{DecodeError, LedgerError},
};

/// ABI word size in bytes.
pub const WORD: usize = 32;

/// Canonical signature of the `addDrug` function.
pub const ADD_DRUG_SIGNATURE: &str = "addDrug(uint256,string)";
/// Canonical signature of the `updateHistory` function.
pub const UPDATE_HISTORY_SIGNATURE: &str = "updateHistory(uint256,string)";
/// Canonical signature of the `getDrug` function.
pub const GET_DRUG_SIGNATURE: &str = "getDrug(uint256)";
/// Canonical signature of the `DrugAdded` event.
pub const DRUG_ADDED_SIGNATURE: &str = "DrugAdded(uint256,string,address)";
/// Canonical signature of the `HistoryUpdated` event.
pub const HISTORY_UPDATED_SIGNATURE: &str = "HistoryUpdated(uint256,string)";

/// A 256-bit big-endian word.
pub type Word = [u8; WORD];

/// Keccak-256 digest of `data`.
pub fn keccak256(data: &[u8]) -> Word {
    let mut word = [0u8; WORD];
    word.copy_from_slice(&Keccak256::digest(data));
    word
}

/// The four-byte function selector for `signature`.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// The log topic identifying the event `signature`.
pub fn event_topic(signature: &str) -> Word {
    keccak256(signature.as_bytes())
}

/// `0x`-prefixed lowercase hex.
pub fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Decodes `0x`-prefixed (or bare) hex.
pub fn from_hex(s: &str) -> Result<Vec<u8>, DecodeError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(digits).map_err(|e| DecodeError::InvalidHex(e.to_string()))
}

/// Parses a decimal string into a `uint256` word.
///
/// # Errors
///
/// [`LedgerError::InvalidDrugId`] if the string is empty, contains anything
/// but ASCII digits or does not fit in 256 bits.
pub fn parse_uint256(decimal: &str) -> Result<Word, LedgerError> {
    if decimal.is_empty() || !decimal.bytes().all(|b| b.is_ascii_digit()) {
        return Err(LedgerError::invalid_drug_id(decimal));
    }
    let mut word = [0u8; WORD];
    for digit in decimal.bytes().map(|b| u32::from(b - b'0')) {
        let mut carry = digit;
        for byte in word.iter_mut().rev() {
            let v = u32::from(*byte) * 10 + carry;
            *byte = (v & 0xff) as u8;
            carry = v >> 8;
        }
        if carry != 0 {
            return Err(LedgerError::invalid_drug_id(decimal));
        }
    }
    Ok(word)
}

/// Renders a `uint256` word as a decimal string without leading zeros.
pub fn format_uint256(word: &Word) -> String {
    let mut value = *word;
    let mut digits = Vec::new();
    while value.iter().any(|&b| b != 0) {
        let mut rem = 0u32;
        for byte in value.iter_mut() {
            let acc = (rem << 8) | u32::from(*byte);
            *byte = (acc / 10) as u8;
            rem = acc % 10;
        }
        digits.push(b'0' + rem as u8);
    }
    if digits.is_empty() {
        return "0".to_owned();
    }
    digits.iter().rev().map(|&d| char::from(d)).collect()
}

/// Normalises a decimal drug id (`"007"` becomes `"7"`).
pub fn canonical_drug_id(id: &str) -> Result<String, LedgerError> {
    parse_uint256(id).map(|word| format_uint256(&word))
}

/// Returns `true` if the word is zero, the contract's "absent" sentinel.
pub fn is_zero(word: &Word) -> bool {
    word.iter().all(|&b| b == 0)
}

fn usize_word(value: usize) -> Word {
    let mut word = [0u8; WORD];
    word[WORD - 8..].copy_from_slice(&(value as u64).to_be_bytes());
    word
}

fn padded(bytes: &[u8]) -> Vec<u8> {
    let mut out = bytes.to_vec();
    out.resize(bytes.len().div_ceil(WORD) * WORD, 0);
    out
}

fn string_tail(s: &str) -> Vec<u8> {
    let mut out = usize_word(s.len()).to_vec();
    out.extend(padded(s.as_bytes()));
    out
}

fn address_word(address: &str) -> Result<Word, DecodeError> {
    let bytes = from_hex(address)?;
    if bytes.len() != 20 {
        return Err(DecodeError::InvalidHex(format!("address must be 20 bytes: {address}")));
    }
    let mut word = [0u8; WORD];
    word[12..].copy_from_slice(&bytes);
    Ok(word)
}

/// Encodes `signature(uint256, string)` call data.
pub fn encode_id_string_call(signature: &str, id: &Word, text: &str) -> Vec<u8> {
    let mut out = selector(signature).to_vec();
    out.extend_from_slice(id);
    out.extend_from_slice(&usize_word(2 * WORD));
    out.extend(string_tail(text));
    out
}

/// Encodes `getDrug(uint256)` call data.
pub fn encode_get_drug(id: &Word) -> Vec<u8> {
    let mut out = selector(GET_DRUG_SIGNATURE).to_vec();
    out.extend_from_slice(id);
    out
}

fn checked(a: usize, b: usize) -> Result<usize, DecodeError> {
    a.checked_add(b).ok_or(DecodeError::InvalidOffset { value: format!("{a} + {b}") })
}

/// Cursor over ABI-encoded data.
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn slice(&self, offset: usize, needed: usize) -> Result<&'a [u8], DecodeError> {
        offset
            .checked_add(needed)
            .and_then(|end| self.data.get(offset..end))
            .ok_or(DecodeError::Truncated { offset, needed, len: self.data.len() })
    }

    fn word(&self, offset: usize) -> Result<Word, DecodeError> {
        let mut word = [0u8; WORD];
        word.copy_from_slice(self.slice(offset, WORD)?);
        Ok(word)
    }

    fn usize_at(&self, offset: usize) -> Result<usize, DecodeError> {
        let word = self.word(offset)?;
        if word[..WORD - 8].iter().any(|&b| b != 0) {
            return Err(DecodeError::InvalidOffset { value: format_uint256(&word) });
        }
        let mut be = [0u8; 8];
        be.copy_from_slice(&word[WORD - 8..]);
        usize::try_from(u64::from_be_bytes(be))
            .map_err(|_| DecodeError::InvalidOffset { value: format_uint256(&word) })
    }

    fn address(&self, offset: usize) -> Result<String, DecodeError> {
        let word = self.word(offset)?;
        Ok(to_hex(&word[12..]))
    }

    /// Reads a string whose head word sits at `head`, relative to `base`.
    fn string(&self, base: usize, head: usize) -> Result<String, DecodeError> {
        let start = checked(base, self.usize_at(head)?)?;
        let len = self.usize_at(start)?;
        let bytes = self.slice(checked(start, WORD)?, len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    fn string_array(&self, head: usize) -> Result<Vec<String>, DecodeError> {
        let start = self.usize_at(head)?;
        let count = self.usize_at(start)?;
        let elements = checked(start, WORD)?;
        // Each element needs at least its offset word.
        self.slice(elements, count.saturating_mul(WORD))?;
        (0..count).map(|i| self.string(elements, elements + i * WORD)).collect()
    }
}

/// Decodes the `(uint256, string, address, string[])` return of `getDrug`.
pub fn decode_get_drug(data: &[u8]) -> Result<OnChainDrug, DecodeError> {
    let r = Reader::new(data);
    Ok(OnChainDrug {
        id: format_uint256(&r.word(0)?),
        name: r.string(0, WORD)?,
        manufacturer: r.address(2 * WORD)?,
        history_raw: r.string_array(3 * WORD)?,
    })
}

/// Decodes a contract log into a [`LedgerEvent`].
///
/// The id is read from `topics[1]` when the contract indexes it, otherwise
/// from the first data word.
pub fn decode_log(topics: &[Word], data: &[u8]) -> Result<LedgerEvent, DecodeError> {
    let topic = topics.first().ok_or(DecodeError::MissingTopic)?;
    let r = Reader::new(data);
    let (id, base) = match topics.get(1) {
        Some(indexed) => (format_uint256(indexed), 0),
        None => (format_uint256(&r.word(0)?), WORD),
    };
    if *topic == event_topic(DRUG_ADDED_SIGNATURE) {
        Ok(LedgerEvent::DrugAdded {
            id,
            name: r.string(0, base)?,
            manufacturer: r.address(base + WORD)?,
        })
    } else if *topic == event_topic(HISTORY_UPDATED_SIGNATURE) {
        Ok(LedgerEvent::HistoryUpdated { id, event_detail: r.string(0, base)? })
    } else {
        Err(DecodeError::UnknownTopic(to_hex(topic)))
    }
}

/// Encodes a `getDrug` return value; the inverse of [`decode_get_drug`].
pub fn encode_get_drug_return(drug: &OnChainDrug) -> Result<Vec<u8>, LedgerError> {
    let id = parse_uint256(&drug.id)?;
    let name = string_tail(&drug.name);

    let mut array = usize_word(drug.history_raw.len()).to_vec();
    let tails: Vec<Vec<u8>> = drug.history_raw.iter().map(|s| string_tail(s)).collect();
    let mut offset = drug.history_raw.len() * WORD;
    for tail in &tails {
        array.extend_from_slice(&usize_word(offset));
        offset += tail.len();
    }
    tails.iter().for_each(|tail| array.extend_from_slice(tail));

    let mut out = id.to_vec();
    out.extend_from_slice(&usize_word(4 * WORD));
    out.extend_from_slice(&address_word(&drug.manufacturer)?);
    out.extend_from_slice(&usize_word(4 * WORD + name.len()));
    out.extend(name);
    out.extend(array);
    Ok(out)
}

/// Encodes an event as `(topics, data)` with the id in the data section.
pub fn encode_log(event: &LedgerEvent) -> Result<(Vec<Word>, Vec<u8>), LedgerError> {
    match event {
        LedgerEvent::DrugAdded { id, name, manufacturer } => {
            let mut data = parse_uint256(id)?.to_vec();
            data.extend_from_slice(&usize_word(3 * WORD));
            data.extend_from_slice(&address_word(manufacturer)?);
            data.extend(string_tail(name));
            Ok((vec![event_topic(DRUG_ADDED_SIGNATURE)], data))
        },
        LedgerEvent::HistoryUpdated { id, event_detail } => {
            let mut data = parse_uint256(id)?.to_vec();
            data.extend_from_slice(&usize_word(2 * WORD));
            data.extend(string_tail(event_detail));
            Ok((vec![event_topic(HISTORY_UPDATED_SIGNATURE)], data))
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_keccak_known_vector() {
        assert_eq!(
            to_hex(&event_topic("Transfer(address,address,uint256)")),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
        assert_eq!(to_hex(&selector("transfer(address,uint256)")), "0xa9059cbb");
    }

    #[rstest]
    #[case("0", "0")]
    #[case("007", "7")]
    #[case("1001", "1001")]
    #[case(
        "115792089237316195423570985008687907853269984665640564039457584007913129639935",
        "115792089237316195423570985008687907853269984665640564039457584007913129639935"
    )]
    fn test_canonical_ids(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(canonical_drug_id(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("12a")]
    #[case("-1")]
    #[case(" 1")]
    #[case("115792089237316195423570985008687907853269984665640564039457584007913129639936")]
    fn test_invalid_ids(#[case] input: &str) {
        assert!(matches!(parse_uint256(input), Err(LedgerError::InvalidDrugId { .. })));
    }

    #[test]
    fn test_add_drug_call_layout() {
        let data = encode_id_string_call(ADD_DRUG_SIGNATURE, &parse_uint256("1").unwrap(), "Aspirin");
        assert_eq!(&data[..4], &selector(ADD_DRUG_SIGNATURE));
        assert_eq!(data.len(), 4 + 4 * WORD);
        assert_eq!(data[4 + WORD - 1], 1);
        assert_eq!(data[4 + 2 * WORD - 1], 0x40);
        assert_eq!(data[4 + 3 * WORD - 1], 7);
        assert_eq!(&data[4 + 3 * WORD..4 + 3 * WORD + 7], b"Aspirin");
    }

    #[test]
    fn test_get_drug_return_decodes() {
        let drug = OnChainDrug {
            id: "1001".into(),
            name: "Aspirin".into(),
            manufacturer: "0x00000000000000000000000000000000000000aa".into(),
            history_raw: vec!["Manufactured".into(), "Distributed by Dist Co (supplier)".into()],
        };
        let encoded = encode_get_drug_return(&drug).unwrap();
        assert_eq!(decode_get_drug(&encoded).unwrap(), drug);
    }

    #[test]
    fn test_absent_drug_decodes_to_zero_id() {
        let drug = OnChainDrug {
            id: "0".into(),
            name: String::new(),
            manufacturer: "0x0000000000000000000000000000000000000000".into(),
            history_raw: vec![],
        };
        let decoded = decode_get_drug(&encode_get_drug_return(&drug).unwrap()).unwrap();
        assert_eq!(decoded.id, "0");
    }

    #[test]
    fn test_truncated_return_is_an_error() {
        let err = decode_get_drug(&[0u8; 40]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));
    }

    #[test]
    fn test_unknown_topic() {
        let err = decode_log(&[keccak256(b"Other()")], &[]).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownTopic(_)));
        assert_eq!(decode_log(&[], &[]).unwrap_err(), DecodeError::MissingTopic);
    }

    #[test]
    fn test_indexed_id_is_read_from_topic() {
        let mut data = usize_word(WORD).to_vec();
        data.extend(string_tail("Shipped"));
        let topics = [event_topic(HISTORY_UPDATED_SIGNATURE), parse_uint256("42").unwrap()];
        assert_eq!(
            decode_log(&topics, &data).unwrap(),
            LedgerEvent::HistoryUpdated { id: "42".into(), event_detail: "Shipped".into() }
        );
    }

    #[test]
    fn test_huge_offset_is_rejected() {
        let mut data = parse_uint256("1").unwrap().to_vec();
        data.extend_from_slice(&[0xff; WORD]);
        let err = decode_log(&[event_topic(HISTORY_UPDATED_SIGNATURE)], &data).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidOffset { .. }));
    }

    proptest! {
        #[test]
        fn decimal_conversion_matches_u128(value in any::<u128>()) {
            let word = parse_uint256(&value.to_string()).unwrap();
            prop_assert_eq!(format_uint256(&word), value.to_string());
            prop_assert_eq!(&word[WORD - 16..], &value.to_be_bytes()[..]);
        }

        #[test]
        fn decode_log_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode_log(&[event_topic(DRUG_ADDED_SIGNATURE)], &data);
            let _ = decode_get_drug(&data);
        }

        #[test]
        fn event_strings_survive_encoding(name in "\\PC{0,80}", id in any::<u64>()) {
            let event = LedgerEvent::DrugAdded {
                id: id.to_string(),
                name: name.clone(),
                manufacturer: "0x1111111111111111111111111111111111111111".into(),
            };
            let (topics, data) = encode_log(&event).unwrap();
            prop_assert_eq!(decode_log(&topics, &data).unwrap(), event);
        }
    }
}
