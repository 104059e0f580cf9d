use crate::error::{AbiError, Result};

const CHARMAP: &[u8; 32] = b".12345abcdefghijklmnopqrstuvwxyz";

/// Renders a 64-bit account/action name into its base32 string form.
pub fn name_to_string(value: u64) -> String {
    let mut chars = [b'.'; 13];
    let mut tmp = value;
    for i in 0..13 {
        let mask = if i == 0 { 0x0f } else { 0x1f };
        chars[12 - i] = CHARMAP[(tmp & mask) as usize];
        tmp >>= if i == 0 { 4 } else { 5 };
    }
    let end = chars
        .iter()
        .rposition(|c| *c != b'.')
        .map(|pos| pos + 1)
        .unwrap_or(0);
    String::from_utf8_lossy(&chars[..end]).into_owned()
}

fn char_to_symbol(c: u8) -> Option<u64> {
    match c {
        b'a'..=b'z' => Some((c - b'a') as u64 + 6),
        b'1'..=b'5' => Some((c - b'1') as u64 + 1),
        b'.' => Some(0),
        _ => None,
    }
}

pub fn string_to_name(name: &str) -> Result<u64> {
    let bytes = name.as_bytes();
    if bytes.len() > 13 {
        return Err(AbiError::invalid("name", format!("{name} is longer than 13 characters")));
    }
    let mut value: u64 = 0;
    for (i, c) in bytes.iter().enumerate() {
        let symbol = char_to_symbol(*c)
            .ok_or_else(|| AbiError::invalid("name", format!("invalid character in {name}")))?;
        if i < 12 {
            value |= (symbol & 0x1f) << (64 - 5 * (i + 1));
        } else {
            if symbol > 0x0f {
                return Err(AbiError::invalid(
                    "name",
                    format!("thirteenth character of {name} must be in [.1-5a-j]"),
                ));
            }
            value |= symbol;
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names() {
        assert_eq!(string_to_name("eosio").unwrap(), 6138663577826885632);
        assert_eq!(name_to_string(6138663577826885632), "eosio");
        assert_eq!(name_to_string(0), "");
        assert_eq!(
            name_to_string(string_to_name("eosio.token").unwrap()),
            "eosio.token"
        );
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(string_to_name("EOSIO").is_err());
        assert!(string_to_name("abcdefghijklmn").is_err());
        assert!(string_to_name("aaaaaaaaaaaaz").is_err());
    }
}
