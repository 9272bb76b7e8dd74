//! Hexdump output

use std::io::{self, Write};

const BYTES_PER_LINE: usize = 16;

/// Write `data` as a hexdump whose offsets start at `base`
pub fn hexdump<W: Write>(out: &mut W, base: u64, data: &[u8]) -> io::Result<()> {
    for (index, line) in data.chunks(BYTES_PER_LINE).enumerate() {
        let offset = base + (index * BYTES_PER_LINE) as u64;
        write!(out, "{:08x}:", offset)?;

        for column in 0..BYTES_PER_LINE {
            if column % 8 == 0 {
                write!(out, " ")?;
            }
            match line.get(column) {
                Some(byte) => write!(out, " {:02x}", byte)?,
                None => write!(out, "   ")?,
            }
        }

        let text: String = line
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        writeln!(out, "  |{}|", text)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hexdump_full_line() {
        let data: Vec<u8> = (0x41..0x51).collect();
        let mut out = Vec::new();
        hexdump(&mut out, 0x200, &data).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "00000200:  41 42 43 44 45 46 47 48  49 4a 4b 4c 4d 4e 4f 50  |ABCDEFGHIJKLMNOP|\n"
        );
    }

    #[test]
    fn test_hexdump_partial_line() {
        let mut out = Vec::new();
        hexdump(&mut out, 0, &[0x00, 0x7f, b'a']).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("00000000:  00 7f 61"));
        assert!(text.ends_with("|..a|\n"));
    }

    #[test]
    fn test_hexdump_empty() {
        let mut out = Vec::new();
        hexdump(&mut out, 0, &[]).unwrap();
        assert!(out.is_empty());
    }
}
