// Little-endian record codec driven by compact format strings.
//
// Format grammar: a leading `<` selects little-endian (mandatory), then a
// sequence of fields, each optionally preceded by a decimal repeat count:
//   b/c = 1 byte, h = 2, i/l = 4, q = 8; upper case is unsigned, lower
//   case sign-extends. `x` skips one byte (count repeats), `Ns` reads an
//   N-byte blob. Decoding consumes from a caller offset and allocates
//   nothing beyond the returned values.

use fathom_core::{FsError, FsResult};

/// One decoded field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Uint(u64),
    Int(i64),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_uint(&self) -> FsResult<u64> {
        match self {
            Value::Uint(v) => Ok(*v),
            other => Err(FsError::InvalidState(format!(
                "expected unsigned field, got {:?}",
                other
            ))),
        }
    }

    pub fn as_int(&self) -> FsResult<i64> {
        match self {
            Value::Int(v) => Ok(*v),
            other => Err(FsError::InvalidState(format!(
                "expected signed field, got {:?}",
                other
            ))),
        }
    }

    pub fn as_bytes(&self) -> FsResult<&[u8]> {
        match self {
            Value::Bytes(v) => Ok(v),
            other => Err(FsError::InvalidState(format!(
                "expected byte field, got {:?}",
                other
            ))),
        }
    }
}

struct Token {
    letter: char,
    count: usize,
}

fn tokenize(fmt: &str) -> FsResult<Vec<Token>> {
    let mut chars = fmt.chars().peekable();
    match chars.next() {
        Some('<') => {}
        _ => {
            return Err(FsError::InvalidArgument(format!(
                "format {:?} must start with '<'",
                fmt
            )))
        }
    }

    let mut tokens = Vec::new();
    while let Some(c) = chars.next() {
        let mut count = None;
        let mut c = c;
        if let Some(first_digit) = c.to_digit(10) {
            let mut n = first_digit as usize;
            while let Some(d) = chars.peek().and_then(|p| p.to_digit(10)) {
                n = n * 10 + d as usize;
                chars.next();
            }
            count = Some(n);
            c = chars.next().ok_or_else(|| {
                FsError::InvalidArgument(format!("format {:?} ends after a count", fmt))
            })?;
        }
        match c {
            'b' | 'B' | 'c' | 'C' | 'h' | 'H' | 'i' | 'I' | 'l' | 'L' | 'q' | 'Q' | 'x' => {
                for _ in 0..count.unwrap_or(1) {
                    tokens.push(Token {
                        letter: c,
                        count: 1,
                    });
                }
            }
            's' => tokens.push(Token {
                letter: 's',
                count: count.unwrap_or(1),
            }),
            other => {
                return Err(FsError::InvalidArgument(format!(
                    "unknown format letter {:?} in {:?}",
                    other, fmt
                )))
            }
        }
    }
    Ok(tokens)
}

fn width_of(letter: char) -> usize {
    match letter.to_ascii_lowercase() {
        'b' | 'c' | 'x' => 1,
        'h' => 2,
        'i' | 'l' => 4,
        'q' => 8,
        _ => 0,
    }
}

/// Number of bytes a format consumes.
pub fn size_of(fmt: &str) -> FsResult<usize> {
    let tokens = tokenize(fmt)?;
    Ok(tokens
        .iter()
        .map(|t| if t.letter == 's' { t.count } else { width_of(t.letter) })
        .sum())
}

/// Decode `fmt` from `data` starting at `offset`; returns the fields and
/// the offset just past the consumed bytes.
pub fn unpack_at(fmt: &str, data: &[u8], offset: usize) -> FsResult<(Vec<Value>, usize)> {
    let tokens = tokenize(fmt)?;
    let mut pos = offset;
    let mut out = Vec::new();
    for token in tokens {
        let width = if token.letter == 's' {
            token.count
        } else {
            width_of(token.letter)
        };
        let end = pos.checked_add(width).ok_or_else(|| {
            FsError::InvalidState("record offset overflow".to_string())
        })?;
        if end > data.len() {
            return Err(FsError::CorruptFilesystem(format!(
                "record truncated: need {} bytes at offset {}, have {}",
                width,
                pos,
                data.len()
            )));
        }
        let raw = &data[pos..end];
        pos = end;
        match token.letter {
            'x' => {}
            's' => out.push(Value::Bytes(raw.to_vec())),
            letter => {
                let mut word = 0u64;
                for (i, &byte) in raw.iter().enumerate() {
                    word |= (byte as u64) << (8 * i);
                }
                if letter.is_ascii_uppercase() {
                    out.push(Value::Uint(word));
                } else {
                    let shift = 64 - 8 * width as u32;
                    out.push(Value::Int(((word << shift) as i64) >> shift));
                }
            }
        }
    }
    Ok((out, pos))
}

/// Decode a whole record from the start of `data`.
pub fn unpack(fmt: &str, data: &[u8]) -> FsResult<Vec<Value>> {
    Ok(unpack_at(fmt, data, 0)?.0)
}

/// Encode `values` according to `fmt`. `x` emits a zero byte; a blob
/// shorter than its field is zero-padded, a longer one is rejected.
pub fn pack(fmt: &str, values: &[Value]) -> FsResult<Vec<u8>> {
    let tokens = tokenize(fmt)?;
    let mut out = Vec::with_capacity(size_of(fmt)?);
    let mut next = values.iter();
    for token in tokens {
        match token.letter {
            'x' => out.push(0),
            's' => {
                let value = next.next().ok_or_else(|| {
                    FsError::InvalidState(format!("too few values for format {:?}", fmt))
                })?;
                let bytes = value.as_bytes()?;
                if bytes.len() > token.count {
                    return Err(FsError::InvalidState(format!(
                        "blob of {} bytes exceeds {}-byte field",
                        bytes.len(),
                        token.count
                    )));
                }
                out.extend_from_slice(bytes);
                out.resize(out.len() + token.count - bytes.len(), 0);
            }
            letter => {
                let value = next.next().ok_or_else(|| {
                    FsError::InvalidState(format!("too few values for format {:?}", fmt))
                })?;
                let width = width_of(letter);
                let word = if letter.is_ascii_uppercase() {
                    value.as_uint()?
                } else {
                    value.as_int()? as u64
                };
                for i in 0..width {
                    out.push((word >> (8 * i)) as u8);
                }
            }
        }
    }
    if next.next().is_some() {
        return Err(FsError::InvalidState(format!(
            "too many values for format {:?}",
            fmt
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpacks_mixed_widths() {
        let data = [0x34, 0x12, 0xFF, 0x78, 0x56, 0x34, 0x12, b'A', b'B'];
        let v = unpack("<HbL2s", &data).unwrap();
        assert_eq!(v[0].as_uint().unwrap(), 0x1234);
        assert_eq!(v[1].as_int().unwrap(), -1);
        assert_eq!(v[2].as_uint().unwrap(), 0x12345678);
        assert_eq!(v[3].as_bytes().unwrap(), b"AB");
    }

    #[test]
    fn skip_bytes_consume_without_producing() {
        let data = [0xAA, 0xBB, 0xCC, 0x01, 0x02];
        let (v, consumed) = unpack_at("<3xH", &data, 0).unwrap();
        assert_eq!(consumed, 5);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].as_uint().unwrap(), 0x0201);
    }

    #[test]
    fn offset_is_honored() {
        let data = [0x00, 0x00, 0x78, 0x56];
        let (v, consumed) = unpack_at("<H", &data, 2).unwrap();
        assert_eq!(consumed, 4);
        assert_eq!(v[0].as_uint().unwrap(), 0x5678);
    }

    #[test]
    fn pack_round_trips() {
        let fmt = "<B3sHxL";
        let values = vec![
            Value::Uint(0x7F),
            Value::Bytes(b"abc".to_vec()),
            Value::Uint(0xBEEF),
            Value::Uint(0xDEADBEEF),
        ];
        let bytes = pack(fmt, &values).unwrap();
        assert_eq!(bytes.len(), size_of(fmt).unwrap());
        assert_eq!(unpack(fmt, &bytes).unwrap(), values);
    }

    #[test]
    fn sign_extension_matches_width() {
        let data = [0x80, 0x80, 0x00];
        let v = unpack("<bh", &data).unwrap();
        assert_eq!(v[0].as_int().unwrap(), -128);
        assert_eq!(v[1].as_int().unwrap(), 0x0080);
    }

    #[test]
    fn truncated_record_is_rejected() {
        assert!(matches!(
            unpack("<L", &[0x01, 0x02]),
            Err(FsError::CorruptFilesystem(_))
        ));
    }

    #[test]
    fn rejects_missing_endian_prefix() {
        assert!(matches!(
            unpack("H", &[0, 0]),
            Err(FsError::InvalidArgument(_))
        ));
    }
}
