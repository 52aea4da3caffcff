use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Returns the compressed bytes, or an empty vector when encoding fails so
/// callers fall back to the uncompressed body.
pub fn gzip_compress(input: &[u8], level: u32) -> Vec<u8> {
    if input.is_empty() {
        return Vec::new();
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level.min(9)));
    if encoder.write_all(input).is_err() {
        return Vec::new();
    }
    encoder.finish().unwrap_or_default()
}

pub fn gzip_decompress(input: &[u8]) -> Vec<u8> {
    if input.is_empty() {
        return Vec::new();
    }
    let mut decoder = GzDecoder::new(input);
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out) {
        Ok(_) => out,
        Err(_) => Vec::new(),
    }
}

pub fn supports_gzip(accept_encoding: &str) -> bool {
    parse_accept_encoding(accept_encoding)
        .iter()
        .any(|encoding| encoding.eq_ignore_ascii_case("gzip"))
}

// Splits on ',', trims, and drops quality parameters ("gzip;q=0.8" -> "gzip").
pub fn parse_accept_encoding(accept_encoding: &str) -> Vec<String> {
    accept_encoding
        .split(',')
        .filter_map(|token| {
            let token = token.split(';').next().unwrap_or("").trim();
            if token.is_empty() {
                None
            } else {
                Some(token.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{gzip_compress, gzip_decompress, parse_accept_encoding, supports_gzip};

    #[test]
    fn compress_then_decompress_restores_input() {
        let input = b"The quick brown fox jumps over the lazy dog. ".repeat(64);
        let compressed = gzip_compress(&input, 6);
        assert!(!compressed.is_empty());
        assert!(compressed.len() < input.len());
        assert_eq!(gzip_decompress(&compressed), input);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(gzip_compress(b"", 6).is_empty());
        assert!(gzip_decompress(b"").is_empty());
        assert!(gzip_decompress(b"not gzip data").is_empty());
    }

    #[test]
    fn accept_encoding_detection_handles_quality_params() {
        assert!(supports_gzip("gzip"));
        assert!(supports_gzip("deflate, gzip;q=0.8, br"));
        assert!(supports_gzip("GZIP"));
        assert!(!supports_gzip("deflate, br"));
        assert!(!supports_gzip(""));
    }

    #[test]
    fn accept_encoding_list_is_trimmed() {
        assert_eq!(
            parse_accept_encoding(" gzip ; q=1.0 , deflate ,, br "),
            vec!["gzip", "deflate", "br"]
        );
    }
}
