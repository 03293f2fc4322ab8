use std::io::{Read, Write};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};

/// Encodings the rewritten manifest can be sent back in. Media bytes are never re-encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Zstd,
    Gzip,
    Identity,
}

impl ContentEncoding {
    /// apple's player sends "gzip, deflate" or "identity" and both have to be respected
    pub fn negotiate(accept_encoding: Option<&str>) -> Self {
        let Some(accepted) = accept_encoding else {
            return Self::Identity;
        };

        let offers: Vec<&str> = accepted
            .split(',')
            .map(|v| v.split(';').next().unwrap_or("").trim())
            .collect();

        if offers.first() == Some(&"identity") {
            Self::Identity
        } else if offers.contains(&"zstd") {
            Self::Zstd
        } else if offers.contains(&"gzip") {
            Self::Gzip
        } else {
            Self::Identity
        }
    }

    pub fn header_value(&self) -> Option<&'static str> {
        match self {
            Self::Zstd => Some("zstd"),
            Self::Gzip => Some("gzip"),
            Self::Identity => None,
        }
    }

    pub fn encode(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Self::Zstd => zstd::encode_all(data, 3),
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
            Self::Identity => Ok(data.to_vec()),
        }
    }
}

/// undoes an upstream `Content-Encoding` so the manifest text can be rewritten
pub fn decode_body(content_encoding: Option<&str>, body: &[u8]) -> std::io::Result<Vec<u8>> {
    match content_encoding.map(str::trim) {
        Some("zstd") => zstd::decode_all(body),
        Some("gzip") | Some("x-gzip") => {
            let mut decoded = Vec::new();
            GzDecoder::new(body).read_to_end(&mut decoded)?;
            Ok(decoded)
        }
        _ => Ok(body.to_vec()),
    }
}
