//! JSON rendering of the built-in ABI types.
//!
//! Integers up to 64 bits are plain JSON numbers, 128-bit integers are decimal
//! strings, checksums and `bytes` are lowercase hex, keys and signatures are
//! `PUB_<curve>_<hex>` / `SIG_<curve>_<hex>`.

use chrono::{DateTime, NaiveDateTime};
use serde_json::{json, Value};

use crate::error::{AbiError, Result};
use crate::name::{name_to_string, string_to_name};
use crate::stream::{AbiReader, AbiWriter};

/// 2000-01-01T00:00:00Z in milliseconds
const BLOCK_TIMESTAMP_EPOCH_MS: i64 = 946_684_800_000;
const BLOCK_INTERVAL_MS: i64 = 500;

const KEY_CURVES: [&str; 3] = ["K1", "R1", "WA"];

pub(crate) fn is_builtin(type_name: &str) -> bool {
    matches!(
        type_name,
        "bool"
            | "int8"
            | "uint8"
            | "int16"
            | "uint16"
            | "int32"
            | "uint32"
            | "int64"
            | "uint64"
            | "int128"
            | "uint128"
            | "varuint32"
            | "varint32"
            | "float32"
            | "float64"
            | "float128"
            | "time_point"
            | "time_point_sec"
            | "block_timestamp_type"
            | "name"
            | "bytes"
            | "string"
            | "checksum160"
            | "checksum256"
            | "checksum512"
            | "public_key"
            | "signature"
            | "symbol"
            | "symbol_code"
            | "asset"
            | "extended_asset"
    )
}

fn format_time(millis: i64, with_millis: bool) -> Result<String> {
    let datetime = DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| AbiError::invalid("time", format!("{millis} ms is out of range")))?;
    Ok(if with_millis {
        datetime.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
    } else {
        datetime.format("%Y-%m-%dT%H:%M:%S").to_string()
    })
}

fn parse_time_millis(type_name: &str, value: &str) -> Result<i64> {
    let trimmed = value.trim_end_matches('Z');
    let parsed = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|err| AbiError::invalid(type_name, format!("{value}: {err}")))?;
    Ok(parsed.and_utc().timestamp_millis())
}

fn symbol_code_to_string(mut raw: u64) -> String {
    let mut code = String::new();
    while raw > 0 {
        code.push((raw & 0xff) as u8 as char);
        raw >>= 8;
    }
    code
}

fn string_to_symbol_code(code: &str) -> Result<u64> {
    if code.is_empty() || code.len() > 7 || !code.bytes().all(|c| c.is_ascii_uppercase()) {
        return Err(AbiError::invalid("symbol_code", format!("invalid symbol code {code:?}")));
    }
    Ok(code
        .bytes()
        .rev()
        .fold(0u64, |acc, c| (acc << 8) | c as u64))
}

fn symbol_to_string(raw: u64) -> String {
    format!("{},{}", raw & 0xff, symbol_code_to_string(raw >> 8))
}

fn string_to_symbol(value: &str) -> Result<u64> {
    let (precision, code) = value
        .split_once(',')
        .ok_or_else(|| AbiError::invalid("symbol", format!("expected precision,CODE got {value:?}")))?;
    let precision: u8 = precision
        .parse()
        .map_err(|_| AbiError::invalid("symbol", format!("invalid precision in {value:?}")))?;
    Ok((string_to_symbol_code(code)? << 8) | precision as u64)
}

pub(crate) fn format_asset(amount: i64, symbol: u64) -> String {
    let precision = (symbol & 0xff) as u32;
    let code = symbol_code_to_string(symbol >> 8);
    let negative = amount < 0;
    let abs = (amount as i128).unsigned_abs();
    let divisor = 10u128.pow(precision);
    let integer = abs / divisor;
    let fraction = abs % divisor;
    let sign = if negative { "-" } else { "" };
    if precision == 0 {
        format!("{sign}{integer} {code}")
    } else {
        format!(
            "{sign}{integer}.{fraction:0width$} {code}",
            width = precision as usize
        )
    }
}

pub(crate) fn parse_asset(value: &str) -> Result<(i64, u64)> {
    let (amount, code) = value
        .trim()
        .split_once(' ')
        .ok_or_else(|| AbiError::invalid("asset", format!("expected \"AMOUNT CODE\" got {value:?}")))?;
    let (negative, digits) = match amount.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, amount),
    };
    let (integer, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    let precision = fraction.len();
    let joined = format!("{integer}{fraction}");
    let magnitude: i64 = joined
        .parse()
        .map_err(|_| AbiError::invalid("asset", format!("invalid amount in {value:?}")))?;
    let symbol = (string_to_symbol_code(code)? << 8) | precision as u64;
    Ok((if negative { -magnitude } else { magnitude }, symbol))
}

fn read_key_like(reader: &mut AbiReader, type_name: &str, prefix: &str, data_len: usize) -> Result<Value> {
    let curve = reader.read_u8()? as usize;
    let curve_name = KEY_CURVES
        .get(curve)
        .ok_or_else(|| AbiError::invalid(type_name, format!("unknown key type {curve}")))?;
    let start = reader.position();
    reader.read_bytes(data_len)?;
    if curve == 2 {
        if type_name == "public_key" {
            // user presence + relying party id
            reader.read_u8()?;
            reader.read_byte_vec()?;
        } else {
            // authenticator data + client json
            reader.read_byte_vec()?;
            reader.read_byte_vec()?;
        }
    }
    let end = reader.position();
    Ok(Value::String(format!(
        "{prefix}_{curve_name}_{}",
        hex::encode(reader.slice(start, end))
    )))
}

fn write_key_like(writer: &mut AbiWriter, type_name: &str, prefix: &str, value: &str) -> Result<()> {
    let rest = value
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .ok_or_else(|| AbiError::invalid(type_name, format!("expected {prefix}_ prefix")))?;
    let (curve, data) = rest
        .split_once('_')
        .ok_or_else(|| AbiError::invalid(type_name, "missing curve"))?;
    let curve = KEY_CURVES
        .iter()
        .position(|c| *c == curve)
        .ok_or_else(|| AbiError::invalid(type_name, format!("unknown curve {curve}")))?;
    let bytes = hex::decode(data).map_err(|err| AbiError::invalid(type_name, err.to_string()))?;
    writer.write_u8(curve as u8);
    writer.write_bytes(&bytes);
    Ok(())
}

fn read_checksum(reader: &mut AbiReader, len: usize) -> Result<Value> {
    Ok(Value::String(hex::encode(reader.read_bytes(len)?)))
}

pub(crate) fn decode(type_name: &str, reader: &mut AbiReader) -> Result<Value> {
    Ok(match type_name {
        "bool" => Value::Bool(reader.read_bool()?),
        "int8" => json!(reader.read_i8()?),
        "uint8" => json!(reader.read_u8()?),
        "int16" => json!(reader.read_i16()?),
        "uint16" => json!(reader.read_u16()?),
        "int32" => json!(reader.read_i32()?),
        "uint32" => json!(reader.read_u32()?),
        "int64" => json!(reader.read_i64()?),
        "uint64" => json!(reader.read_u64()?),
        "int128" => Value::String(reader.read_i128()?.to_string()),
        "uint128" => Value::String(reader.read_u128()?.to_string()),
        "varuint32" => json!(reader.read_varuint32()?),
        "varint32" => json!(reader.read_varint32()?),
        "float32" => json!(reader.read_f32()? as f64),
        "float64" => json!(reader.read_f64()?),
        "float128" => read_checksum(reader, 16)?,
        "time_point" => {
            let micros = reader.read_i64()?;
            Value::String(format_time(micros / 1000, true)?)
        }
        "time_point_sec" => {
            let secs = reader.read_u32()? as i64;
            Value::String(format_time(secs * 1000, false)?)
        }
        "block_timestamp_type" => {
            let slot = reader.read_u32()? as i64;
            Value::String(format_time(
                slot * BLOCK_INTERVAL_MS + BLOCK_TIMESTAMP_EPOCH_MS,
                true,
            )?)
        }
        "name" => Value::String(name_to_string(reader.read_u64()?)),
        "bytes" => Value::String(hex::encode(reader.read_byte_vec()?)),
        "string" => Value::String(reader.read_string()?),
        "checksum160" => read_checksum(reader, 20)?,
        "checksum256" => read_checksum(reader, 32)?,
        "checksum512" => read_checksum(reader, 64)?,
        "public_key" => read_key_like(reader, type_name, "PUB", 33)?,
        "signature" => read_key_like(reader, type_name, "SIG", 65)?,
        "symbol" => Value::String(symbol_to_string(reader.read_u64()?)),
        "symbol_code" => Value::String(symbol_code_to_string(reader.read_u64()?)),
        "asset" => {
            let amount = reader.read_i64()?;
            let symbol = reader.read_u64()?;
            Value::String(format_asset(amount, symbol))
        }
        "extended_asset" => {
            let amount = reader.read_i64()?;
            let symbol = reader.read_u64()?;
            let contract = name_to_string(reader.read_u64()?);
            json!({"quantity": format_asset(amount, symbol), "contract": contract})
        }
        other => return Err(AbiError::UnknownType(other.to_string())),
    })
}

fn as_str<'v>(type_name: &str, value: &'v Value) -> Result<&'v str> {
    value
        .as_str()
        .ok_or_else(|| AbiError::invalid(type_name, format!("expected string, got {value}")))
}

fn as_i64(type_name: &str, value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| AbiError::invalid(type_name, format!("{n} is not a signed integer"))),
        Value::String(s) => s
            .parse()
            .map_err(|_| AbiError::invalid(type_name, format!("{s} is not a signed integer"))),
        other => Err(AbiError::invalid(type_name, format!("expected number, got {other}"))),
    }
}

fn as_u64(type_name: &str, value: &Value) -> Result<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| AbiError::invalid(type_name, format!("{n} is not an unsigned integer"))),
        Value::String(s) => s
            .parse()
            .map_err(|_| AbiError::invalid(type_name, format!("{s} is not an unsigned integer"))),
        other => Err(AbiError::invalid(type_name, format!("expected number, got {other}"))),
    }
}

fn narrow<T: TryFrom<i64>>(type_name: &str, value: i64) -> Result<T> {
    T::try_from(value).map_err(|_| AbiError::invalid(type_name, format!("{value} out of range")))
}

fn write_hex(writer: &mut AbiWriter, type_name: &str, value: &Value, len: Option<usize>) -> Result<()> {
    let bytes = hex::decode(as_str(type_name, value)?)
        .map_err(|err| AbiError::invalid(type_name, err.to_string()))?;
    match len {
        Some(len) if bytes.len() != len => Err(AbiError::invalid(
            type_name,
            format!("expected {len} bytes, got {}", bytes.len()),
        )),
        Some(_) => {
            writer.write_bytes(&bytes);
            Ok(())
        }
        None => {
            writer.write_byte_vec(&bytes);
            Ok(())
        }
    }
}

pub(crate) fn encode(type_name: &str, value: &Value, writer: &mut AbiWriter) -> Result<()> {
    match type_name {
        "bool" => writer.write_bool(
            value
                .as_bool()
                .ok_or_else(|| AbiError::invalid(type_name, "expected bool"))?,
        ),
        "int8" => writer.write_i8(narrow(type_name, as_i64(type_name, value)?)?),
        "uint8" => writer.write_u8(narrow(type_name, as_i64(type_name, value)?)?),
        "int16" => writer.write_i16(narrow(type_name, as_i64(type_name, value)?)?),
        "uint16" => writer.write_u16(narrow(type_name, as_i64(type_name, value)?)?),
        "int32" => writer.write_i32(narrow(type_name, as_i64(type_name, value)?)?),
        "uint32" => writer.write_u32(narrow(type_name, as_i64(type_name, value)?)?),
        "varuint32" => writer.write_varuint32(narrow(type_name, as_i64(type_name, value)?)?),
        "varint32" => writer.write_varint32(narrow(type_name, as_i64(type_name, value)?)?),
        "int64" => writer.write_i64(as_i64(type_name, value)?),
        "uint64" => writer.write_u64(as_u64(type_name, value)?),
        "int128" => writer.write_i128(
            as_str(type_name, value)?
                .parse()
                .map_err(|_| AbiError::invalid(type_name, "invalid int128"))?,
        ),
        "uint128" => writer.write_u128(
            as_str(type_name, value)?
                .parse()
                .map_err(|_| AbiError::invalid(type_name, "invalid uint128"))?,
        ),
        "float32" => writer.write_f32(
            value
                .as_f64()
                .ok_or_else(|| AbiError::invalid(type_name, "expected number"))? as f32,
        ),
        "float64" => writer.write_f64(
            value
                .as_f64()
                .ok_or_else(|| AbiError::invalid(type_name, "expected number"))?,
        ),
        "float128" => write_hex(writer, type_name, value, Some(16))?,
        "time_point" => {
            writer.write_i64(parse_time_millis(type_name, as_str(type_name, value)?)? * 1000)
        }
        "time_point_sec" => {
            let millis = parse_time_millis(type_name, as_str(type_name, value)?)?;
            writer.write_u32(narrow(type_name, millis / 1000)?)
        }
        "block_timestamp_type" => {
            let millis = parse_time_millis(type_name, as_str(type_name, value)?)?;
            writer.write_u32(narrow(
                type_name,
                (millis - BLOCK_TIMESTAMP_EPOCH_MS) / BLOCK_INTERVAL_MS,
            )?)
        }
        "name" => writer.write_u64(string_to_name(as_str(type_name, value)?)?),
        "bytes" => write_hex(writer, type_name, value, None)?,
        "string" => writer.write_string(as_str(type_name, value)?),
        "checksum160" => write_hex(writer, type_name, value, Some(20))?,
        "checksum256" => write_hex(writer, type_name, value, Some(32))?,
        "checksum512" => write_hex(writer, type_name, value, Some(64))?,
        "public_key" => write_key_like(writer, type_name, "PUB", as_str(type_name, value)?)?,
        "signature" => write_key_like(writer, type_name, "SIG", as_str(type_name, value)?)?,
        "symbol" => writer.write_u64(string_to_symbol(as_str(type_name, value)?)?),
        "symbol_code" => writer.write_u64(string_to_symbol_code(as_str(type_name, value)?)?),
        "asset" => {
            let (amount, symbol) = parse_asset(as_str(type_name, value)?)?;
            writer.write_i64(amount);
            writer.write_u64(symbol);
        }
        "extended_asset" => {
            let quantity = value
                .get("quantity")
                .ok_or_else(|| AbiError::invalid(type_name, "missing quantity"))?;
            let contract = value
                .get("contract")
                .ok_or_else(|| AbiError::invalid(type_name, "missing contract"))?;
            let (amount, symbol) = parse_asset(as_str(type_name, quantity)?)?;
            writer.write_i64(amount);
            writer.write_u64(symbol);
            writer.write_u64(string_to_name(as_str(type_name, contract)?)?);
        }
        other => return Err(AbiError::UnknownType(other.to_string())),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_formatting() {
        let (amount, symbol) = parse_asset("1.0000 EOS").unwrap();
        assert_eq!(amount, 10_000);
        assert_eq!(symbol & 0xff, 4);
        assert_eq!(format_asset(amount, symbol), "1.0000 EOS");
        assert_eq!(format_asset(-5, symbol), "-0.0005 EOS");
        let (amount, symbol) = parse_asset("42 WAX").unwrap();
        assert_eq!(format_asset(amount, symbol), "42 WAX");
    }

    #[test]
    fn block_timestamp_renders_half_second_slots() {
        let mut writer = AbiWriter::new();
        writer.write_u32(3);
        let bytes = writer.into_bytes();
        let value = decode("block_timestamp_type", &mut AbiReader::new(&bytes)).unwrap();
        assert_eq!(value, json!("2000-01-01T00:00:01.500"));
    }

    #[test]
    fn public_key_keeps_curve_prefix() {
        let mut writer = AbiWriter::new();
        writer.write_u8(0);
        writer.write_bytes(&[7u8; 33]);
        let bytes = writer.into_bytes();
        let value = decode("public_key", &mut AbiReader::new(&bytes)).unwrap();
        let rendered = value.as_str().unwrap();
        assert!(rendered.starts_with("PUB_K1_0707"));

        let mut writer = AbiWriter::new();
        encode("public_key", &value, &mut writer).unwrap();
        assert_eq!(writer.into_bytes(), bytes);
    }
}
