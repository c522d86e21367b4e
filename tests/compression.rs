//! Tests for the input and output codecs.

use anyhow::Result;
use reshard::io::compression::{Compression, open_decompressed, wrap_compress};
use std::io::{Cursor, Read, Write};

const TEXT: &[u8] = b"id,city\n1,Lisbon\n2,Porto\n3,Faro\n";

fn compress(codec: Compression, data: &[u8]) -> Result<Vec<u8>> {
    let mut writer = wrap_compress(Vec::new(), codec, "part_00000.csv")?;
    writer.write_all(data)?;
    Ok(writer.finish()?)
}

fn decompress(name: &str, data: Vec<u8>) -> Result<(Compression, Vec<u8>)> {
    let (codec, mut reader) = open_decompressed(Box::new(Cursor::new(data)), name, None)?;
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok((codec, out))
}

#[test]
fn test_plain_passes_through() -> Result<()> {
    let packed = compress(Compression::None, TEXT)?;
    assert_eq!(packed, TEXT);
    assert_eq!(decompress("data.csv", packed)?, (Compression::None, TEXT.to_vec()));
    Ok(())
}

#[cfg(feature = "compression-gzip")]
mod gzip {
    use super::*;

    #[test]
    fn test_gzip_round_trip_by_extension_and_magic() -> Result<()> {
        let packed = compress(Compression::Gzip, TEXT)?;
        assert_eq!(&packed[..2], &[0x1f, 0x8b]);
        assert_eq!(decompress("in/data.csv.gz", packed.clone())?, (Compression::Gzip, TEXT.to_vec()));
        assert_eq!(decompress("in/data", packed)?, (Compression::Gzip, TEXT.to_vec()));
        Ok(())
    }

    #[test]
    fn test_concatenated_members_read_as_one_stream() -> Result<()> {
        let mut packed = compress(Compression::Gzip, b"a,1\n")?;
        packed.extend(compress(Compression::Gzip, b"b,2\n")?);
        let (_, text) = decompress("two.gz", packed)?;
        assert_eq!(text, b"a,1\nb,2\n");
        Ok(())
    }

    #[test]
    fn test_truncated_gzip_is_an_error() -> Result<()> {
        let mut packed = compress(Compression::Gzip, TEXT)?;
        packed.truncate(packed.len() - 6);
        assert!(decompress("cut.gz", packed).is_err());
        Ok(())
    }
}

#[cfg(feature = "compression-zip")]
mod zip {
    use super::*;
    use std::io::ErrorKind;

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    #[test]
    fn test_zip_round_trip_writes_a_complete_archive() -> Result<()> {
        let packed = compress(Compression::Zip, TEXT)?;
        assert!(packed.starts_with(b"PK\x03\x04"));
        assert!(find(&packed, b"PK\x01\x02").is_some());
        assert!(packed[packed.len() - 22..].starts_with(b"PK\x05\x06"));
        assert!(find(&packed, b"part_00000.csv").is_some());

        assert_eq!(decompress("out.zip", packed.clone())?, (Compression::Zip, TEXT.to_vec()));
        assert_eq!(decompress("out", packed)?, (Compression::Zip, TEXT.to_vec()));
        Ok(())
    }

    #[test]
    fn test_corrupt_descriptor_crc_is_invalid_data() -> Result<()> {
        let mut packed = compress(Compression::Zip, TEXT)?;
        let descriptor = find(&packed, b"PK\x07\x08").ok_or_else(|| anyhow::anyhow!("no descriptor"))?;
        packed[descriptor + 4] ^= 0xff;

        let (_, mut reader) = open_decompressed(Box::new(Cursor::new(packed)), "bad.zip", None)?;
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        Ok(())
    }

    /// A stored entry with its sizes in the local header.
    fn stored_archive(name: &[u8], body: &[u8], sizes: u32) -> Vec<u8> {
        let mut archive = Vec::new();
        archive.extend_from_slice(b"PK\x03\x04");
        archive.extend_from_slice(&20u16.to_le_bytes());
        archive.extend_from_slice(&0u16.to_le_bytes());
        archive.extend_from_slice(&0u16.to_le_bytes());
        archive.extend_from_slice(&[0, 0, 0x21, 0]);
        archive.extend_from_slice(&crc32fast::hash(body).to_le_bytes());
        archive.extend_from_slice(&sizes.to_le_bytes());
        archive.extend_from_slice(&sizes.to_le_bytes());
        archive.extend_from_slice(&(name.len() as u16).to_le_bytes());
        archive.extend_from_slice(&0u16.to_le_bytes());
        archive.extend_from_slice(name);
        archive.extend_from_slice(body);
        archive
    }

    #[test]
    fn test_stored_entry_is_read_and_checked() -> Result<()> {
        let mut archive = stored_archive(b"a.csv", TEXT, TEXT.len() as u32);
        archive.extend_from_slice(b"PK\x01\x02 central directory ignored");

        assert_eq!(decompress("a.zip", archive)?, (Compression::Zip, TEXT.to_vec()));
        Ok(())
    }

    #[test]
    fn test_zip64_entry_is_rejected() {
        let archive = stored_archive(b"big.csv", TEXT, u32::MAX);
        let err = open_decompressed(Box::new(Cursor::new(archive)), "big.zip", None)
            .err()
            .map(|e| e.kind());
        assert_eq!(err, Some(ErrorKind::InvalidData));
    }

    #[test]
    fn test_missing_local_header_is_rejected() {
        let outcome = open_decompressed(Box::new(Cursor::new(b"not a zip".to_vec())), "x.zip", None);
        assert!(outcome.is_err());
    }
}
