use binrw::{BinRead, BinResult};

use crate::constant_info::ConstantInfo;
use crate::ClassError;

/// Reads `count - 1` pool entries, inserting an `Unusable` slot after every
/// Long and Double so indices line up with the class file's numbering.
#[binrw::parser(reader, endian)]
pub fn read_const_pool(count: u16) -> BinResult<Vec<ConstantInfo>> {
    let slots = usize::from(count.saturating_sub(1));
    let mut pool = Vec::with_capacity(slots);
    while pool.len() < slots {
        let entry = ConstantInfo::read_options(reader, endian, ())?;
        let wide = entry.is_wide();
        pool.push(entry);
        if wide {
            pool.push(ConstantInfo::Unusable);
        }
    }
    Ok(pool)
}

#[binrw::parser(reader)]
pub fn read_modified_utf8(length: u16) -> BinResult<String> {
    let pos = reader.stream_position()?;
    let mut bytes = vec![0u8; usize::from(length)];
    reader.read_exact(&mut bytes)?;
    decode_modified_utf8(&bytes).map_err(|e| binrw::Error::Custom {
        pos,
        err: Box::new(e.to_string()),
    })
}

#[binrw::writer(writer)]
pub fn write_modified_utf8(value: &String) -> BinResult<()> {
    writer.write_all(&encode_modified_utf8(value))?;
    Ok(())
}

/// Decodes the JVM's modified UTF-8. Unpaired surrogates become U+FFFD.
pub fn decode_modified_utf8(bytes: &[u8]) -> Result<String, ClassError> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            0x01..=0x7f => {
                units.push(u16::from(b));
                i += 1;
            }
            0xc0..=0xdf => {
                let b2 = continuation(bytes, i + 1)?;
                units.push((u16::from(b & 0x1f) << 6) | b2);
                i += 2;
            }
            0xe0..=0xef => {
                let b2 = continuation(bytes, i + 1)?;
                let b3 = continuation(bytes, i + 2)?;
                units.push((u16::from(b & 0x0f) << 12) | (b2 << 6) | b3);
                i += 3;
            }
            _ => return Err(ClassError::ModifiedUtf8(i)),
        }
    }
    Ok(String::from_utf16_lossy(&units))
}

fn continuation(bytes: &[u8], at: usize) -> Result<u16, ClassError> {
    match bytes.get(at) {
        Some(b) if b & 0xc0 == 0x80 => Ok(u16::from(b & 0x3f)),
        _ => Err(ClassError::ModifiedUtf8(at)),
    }
}

pub fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007f => out.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                out.push(0xc0 | ((unit >> 6) & 0x1f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                out.push(0xe0 | ((unit >> 12) & 0x0f) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nul_is_two_bytes() {
        assert_eq!(encode_modified_utf8("a\0b"), vec![b'a', 0xc0, 0x80, b'b']);
        assert_eq!(decode_modified_utf8(&[b'a', 0xc0, 0x80, b'b']).unwrap(), "a\0b");
    }

    #[test]
    fn test_supplementary_uses_surrogates() {
        let encoded = encode_modified_utf8("\u{1F600}");
        assert_eq!(encoded.len(), 6);
        assert_eq!(decode_modified_utf8(&encoded).unwrap(), "\u{1F600}");
    }

    #[test]
    fn test_truncated_sequence_is_rejected() {
        assert!(matches!(
            decode_modified_utf8(&[b'x', 0xe2, 0x82]),
            Err(ClassError::ModifiedUtf8(3))
        ));
    }
}
