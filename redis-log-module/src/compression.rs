// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Optional gzip compression of records

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};

/// Compresses a record with gzip.
pub(crate) fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Decompresses a gzip-compressed record, useful for consumers of the Redis list.
pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut result = Vec::new();
    GzDecoder::new(data).read_to_end(&mut result)?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn known_value() {
        let original = b"Q2FkZHkgUmVkaXMgU3RvcmFnZQ==";
        let compressed = compress(original).unwrap();
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
        assert_eq!(decompress(&compressed).unwrap(), original);
    }

    #[test]
    fn garbage() {
        assert!(decompress(b"not gzip data").is_err());
    }

    mod properties {
        use super::super::*;

        use proptest::prelude::*;

        proptest! {
            #[test]
            fn round_trip(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
                let compressed = compress(&data).unwrap();
                prop_assert_eq!(decompress(&compressed).unwrap(), data);
            }
        }
    }
}
