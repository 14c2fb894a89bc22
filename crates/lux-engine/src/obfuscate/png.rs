//! Minimal PNG codec for the image-encoded bytecode layer
//!
//! The serialiser hides encrypted byte streams as 8-bit grayscale PNG
//! images. Only the subset the dumper produces is supported: one IHDR,
//! consecutive IDAT chunks holding a zlib stream of filter-0 scanlines,
//! and IEND. Chunk CRCs are verified on decode; anything else fails the
//! load rather than risking a tampered image.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::LoadError;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

fn chunk(out: &mut Vec<u8>, kind: &[u8; 4], payload: &[u8]) {
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(payload);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(kind);
    hasher.update(payload);
    out.extend_from_slice(&hasher.finalize().to_be_bytes());
}

/// Encode `width * height` grayscale pixels as a PNG byte stream.
/// `pixels` must hold exactly `width * height` bytes.
pub fn encode(pixels: &[u8], width: u32, height: u32) -> Vec<u8> {
    debug_assert_eq!(pixels.len(), width as usize * height as usize);

    let mut out = Vec::with_capacity(pixels.len() / 2 + 64);
    out.extend_from_slice(&PNG_SIGNATURE);

    let mut ihdr = Vec::with_capacity(13);
    ihdr.extend_from_slice(&width.to_be_bytes());
    ihdr.extend_from_slice(&height.to_be_bytes());
    ihdr.push(8); // bit depth
    ihdr.push(0); // grayscale
    ihdr.push(0); // deflate
    ihdr.push(0); // adaptive filtering
    ihdr.push(0); // no interlace
    chunk(&mut out, b"IHDR", &ihdr);

    // filter byte 0 before every scanline
    let mut raw = Vec::with_capacity(pixels.len() + height as usize);
    for row in pixels.chunks(width as usize) {
        raw.push(0);
        raw.extend_from_slice(row);
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw).expect("in-memory deflate");
    let idat = encoder.finish().expect("in-memory deflate");
    chunk(&mut out, b"IDAT", &idat);

    chunk(&mut out, b"IEND", &[]);
    out
}

/// Decode a PNG produced by [`encode`], returning the pixel bytes and
/// dimensions
pub fn decode(data: &[u8]) -> Result<(Vec<u8>, u32, u32), LoadError> {
    if data.len() < 8 || data[..8] != PNG_SIGNATURE {
        return Err(LoadError::BadImage("missing PNG signature"));
    }

    let mut pos = 8;
    let mut width = 0u32;
    let mut height = 0u32;
    let mut idat = Vec::new();
    let mut saw_ihdr = false;
    let mut saw_iend = false;

    while pos + 8 <= data.len() {
        let len = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        let kind: [u8; 4] = data[pos + 4..pos + 8].try_into().unwrap();
        let payload_start = pos + 8;
        let crc_start = payload_start + len;
        if crc_start + 4 > data.len() {
            return Err(LoadError::BadImage("truncated chunk"));
        }
        let payload = &data[payload_start..crc_start];

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&kind);
        hasher.update(payload);
        let crc = u32::from_be_bytes(data[crc_start..crc_start + 4].try_into().unwrap());
        if hasher.finalize() != crc {
            return Err(LoadError::BadImage("chunk CRC mismatch"));
        }

        match &kind {
            b"IHDR" => {
                if payload.len() != 13 {
                    return Err(LoadError::BadImage("malformed IHDR"));
                }
                width = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                height = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                if payload[8] != 8 || payload[9] != 0 {
                    return Err(LoadError::BadImage("unsupported pixel format"));
                }
                saw_ihdr = true;
            }
            b"IDAT" => idat.extend_from_slice(payload),
            b"IEND" => {
                saw_iend = true;
                break;
            }
            _ => {} // ancillary chunks are ignored
        }
        pos = crc_start + 4;
    }

    if !saw_ihdr || !saw_iend {
        return Err(LoadError::BadImage("missing IHDR or IEND"));
    }

    let mut raw = Vec::new();
    ZlibDecoder::new(idat.as_slice())
        .read_to_end(&mut raw)
        .map_err(|_| LoadError::BadImage("corrupt deflate stream"))?;

    let stride = width as usize + 1;
    if raw.len() != stride * height as usize {
        return Err(LoadError::BadImage("scanline size mismatch"));
    }
    let mut pixels = Vec::with_capacity(width as usize * height as usize);
    for row in raw.chunks(stride) {
        if row[0] != 0 {
            return Err(LoadError::BadImage("unsupported scanline filter"));
        }
        pixels.extend_from_slice(&row[1..]);
    }
    Ok((pixels, width, height))
}

/// Image dimensions the dumper uses for a payload of `n` bytes:
/// `width = ceil(sqrt(n))`, zero-padded to `width * height`
pub fn dimensions(n: usize) -> (u32, u32) {
    let width = (n as f64).sqrt().ceil().max(1.0) as u32;
    let height = (n as u32).div_ceil(width).max(1);
    (width, height)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let pixels: Vec<u8> = (0..=255).cycle().take(1000).collect();
        let (w, h) = dimensions(pixels.len());
        let mut padded = pixels.clone();
        padded.resize((w * h) as usize, 0);

        let png = encode(&padded, w, h);
        let (decoded, dw, dh) = decode(&png).unwrap();
        assert_eq!((dw, dh), (w, h));
        assert_eq!(decoded, padded);
    }

    #[test]
    fn test_dimensions_cover_payload() {
        for n in [0usize, 1, 2, 63, 64, 65, 4096, 10_000] {
            let (w, h) = dimensions(n);
            assert!((w * h) as usize >= n, "{n}: {w}x{h}");
        }
    }

    #[test]
    fn test_bit_flip_is_detected() {
        let pixels = vec![7u8; 64];
        let mut png = encode(&pixels, 8, 8);
        // flip one bit inside the IDAT payload
        let idat_pos = png.windows(4).position(|w| w == b"IDAT").unwrap();
        png[idat_pos + 6] ^= 1;
        assert!(decode(&png).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(decode(&[0u8; 16]).is_err());
        assert!(decode(b"not a png at all").is_err());
    }
}
