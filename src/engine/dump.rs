//! Whole-database snapshot stream used to bootstrap replicas
//!
//! Format:
//! ```text
//! [MAGIC "RKVDUMP1"]
//! ([TAG_RECORD][KEY_LEN:u32][KEY][REC_LEN:u64][RECORD])*
//! [TAG_END][COUNT:u64][CRC32:u32]
//! ```
//! Integers are little-endian. `RECORD` is the encoded [`Record`] so absolute
//! expiries survive the transfer. The CRC covers every byte before it.

use crate::common::utils::MAX_KEY_LEN;
use crate::common::{Error, Result};
use crate::engine::{Engine, Record};
use std::io::{self, BufReader, BufWriter, Read, Write};

pub const DUMP_MAGIC: [u8; 8] = *b"RKVDUMP1";
const TAG_END: u8 = 0;
const TAG_RECORD: u8 = 1;

/// Write every live record of `engine` to `writer`. Returns bytes written.
pub fn export<E: Engine + ?Sized>(engine: &E, writer: &mut dyn Write) -> Result<u64> {
    let mut out = ChecksumWriter::new(BufWriter::new(writer));
    out.write_all(&DUMP_MAGIC)?;

    let mut count: u64 = 0;
    engine.scan_records(&mut |key, record| {
        let encoded = record.encode();
        out.write_all(&[TAG_RECORD])?;
        out.write_all(&(key.len() as u32).to_le_bytes())?;
        out.write_all(key)?;
        out.write_all(&(encoded.len() as u64).to_le_bytes())?;
        out.write_all(&encoded)?;
        count += 1;
        Ok(())
    })?;

    out.write_all(&[TAG_END])?;
    out.write_all(&count.to_le_bytes())?;
    let checksum = out.hasher.clone().finalize();
    out.write_all(&checksum.to_le_bytes())?;
    out.flush()?;

    tracing::debug!(records = count, bytes = out.written, "exported {} engine", engine.name());
    Ok(out.written)
}

/// Load a stream produced by [`export`] into `engine`. Returns bytes consumed.
///
/// Records are restored as they are read; the caller is expected to start
/// from an empty engine and treat any error as fatal.
pub fn import<E: Engine + ?Sized>(engine: &E, reader: &mut dyn Read) -> Result<u64> {
    let mut input = ChecksumReader::new(BufReader::new(reader));

    let magic: [u8; 8] = read_array(&mut input)?;
    if magic != DUMP_MAGIC {
        return Err(Error::Corrupted("not a relaykv dump (bad magic)".into()));
    }

    let mut count: u64 = 0;
    loop {
        let [tag] = read_array::<1>(&mut input)?;
        match tag {
            TAG_RECORD => {
                let key_len = u32::from_le_bytes(read_array(&mut input)?) as usize;
                if key_len > MAX_KEY_LEN {
                    return Err(Error::Corrupted(format!("dump key too long ({} bytes)", key_len)));
                }
                let key = read_vec(&mut input, key_len as u64)?;
                let rec_len = u64::from_le_bytes(read_array(&mut input)?);
                let raw = read_vec(&mut input, rec_len)?;
                engine.restore(&key, Record::decode(&raw)?)?;
                count += 1;
            }
            TAG_END => {
                let declared = u64::from_le_bytes(read_array(&mut input)?);
                let expected = input.hasher.clone().finalize();
                let checksum = u32::from_le_bytes(read_array(&mut input)?);
                if checksum != expected {
                    return Err(Error::Corrupted(format!(
                        "dump checksum mismatch (expected {:08x}, found {:08x})",
                        expected, checksum
                    )));
                }
                if declared != count {
                    return Err(Error::Corrupted(format!(
                        "dump declares {} records, found {}",
                        declared, count
                    )));
                }
                break;
            }
            other => {
                return Err(Error::Corrupted(format!("unknown dump tag {}", other)));
            }
        }
    }

    tracing::debug!(records = count, bytes = input.read, "imported into {} engine", engine.name());
    Ok(input.read)
}

fn read_array<const N: usize>(r: &mut impl Read) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf)
}

fn read_vec(r: &mut impl Read, len: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let n = r.take(len).read_to_end(&mut buf)?;
    if (n as u64) < len {
        return Err(Error::Corrupted("dump truncated".into()));
    }
    Ok(buf)
}

fn truncated(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::Corrupted("dump truncated".into())
    } else {
        Error::Io(e)
    }
}

struct ChecksumWriter<W: Write> {
    inner: W,
    hasher: crc32fast::Hasher,
    written: u64,
}

impl<W: Write> ChecksumWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
            written: 0,
        }
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct ChecksumReader<R: Read> {
    inner: R,
    hasher: crc32fast::Hasher,
    read: u64,
}

impl<R: Read> ChecksumReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
            read: 0,
        }
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.read += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ManualClock;
    use crate::engine::{MemoryEngine, WriteInput};
    use std::sync::Arc;
    use std::time::Duration;

    fn engine_at(nanos: u64) -> (MemoryEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_nanos(nanos));
        (MemoryEngine::with_clock(clock.clone()), clock)
    }

    #[test]
    fn test_export_import() {
        let (src, _) = engine_at(1_000);
        src.write(&WriteInput::set("a", "1")).unwrap();
        src.write(&WriteInput::set("b", "2").with_ttl(Duration::from_nanos(500)))
            .unwrap();
        src.write(&WriteInput::set("c", Vec::new())).unwrap();

        let mut buf = Vec::new();
        let written = src.export(&mut buf).unwrap();
        assert_eq!(written, buf.len() as u64);
        assert_eq!(&buf[..8], &DUMP_MAGIC);

        let (dst, _) = engine_at(1_000);
        let consumed = dst.import(&mut buf.as_slice()).unwrap();
        assert_eq!(consumed, written);

        assert_eq!(dst.read(b"a").unwrap().value, Some(b"1".to_vec()));
        let b = dst.read(b"b").unwrap();
        assert!(b.exists);
        assert_eq!(b.ttl, Some(Duration::from_nanos(500)));
        assert!(dst.read(b"c").unwrap().exists);
    }

    #[test]
    fn test_expired_records_not_exported() {
        let (src, clock) = engine_at(1_000);
        src.write(&WriteInput::set("gone", "x").with_ttl(Duration::from_nanos(10)))
            .unwrap();
        src.write(&WriteInput::set("kept", "y")).unwrap();
        clock.advance(Duration::from_nanos(10));

        let mut buf = Vec::new();
        src.export(&mut buf).unwrap();

        let (dst, _) = engine_at(1_000);
        dst.import(&mut buf.as_slice()).unwrap();
        assert!(!dst.read(b"gone").unwrap().exists);
        assert!(dst.read(b"kept").unwrap().exists);
    }

    #[test]
    fn test_empty_dump() {
        let (src, _) = engine_at(1);
        let mut buf = Vec::new();
        let written = src.export(&mut buf).unwrap();
        // magic + end tag + count + crc
        assert_eq!(written, 8 + 1 + 8 + 4);

        let (dst, _) = engine_at(1);
        assert_eq!(dst.import(&mut buf.as_slice()).unwrap(), written);
    }

    #[test]
    fn test_import_rejects_corruption() {
        let (src, _) = engine_at(1);
        src.write(&WriteInput::set("key", "value")).unwrap();
        let mut buf = Vec::new();
        src.export(&mut buf).unwrap();

        let mut flipped = buf.clone();
        flipped[12] ^= 0xff;
        let (dst, _) = engine_at(1);
        assert!(matches!(
            dst.import(&mut flipped.as_slice()),
            Err(Error::Corrupted(_))
        ));

        let short = &buf[..buf.len() - 3];
        let (dst, _) = engine_at(1);
        assert!(matches!(
            dst.import(&mut &short[..]),
            Err(Error::Corrupted(_))
        ));

        let mut bad_magic = buf.clone();
        bad_magic[0] = b'X';
        let (dst, _) = engine_at(1);
        assert!(dst.import(&mut bad_magic.as_slice()).is_err());
    }

    #[test]
    fn test_import_stops_at_trailer() {
        let (src, _) = engine_at(1);
        src.write(&WriteInput::set("k", "v")).unwrap();
        let mut buf = Vec::new();
        let written = src.export(&mut buf).unwrap();
        buf.extend_from_slice(b"trailing garbage");

        let (dst, _) = engine_at(1);
        assert_eq!(dst.import(&mut buf.as_slice()).unwrap(), written);
    }
}
