use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Frame overhead: u32 length prefix + u32 CRC trailer.
const FRAME_OVERHEAD: u64 = 8;

/// Larger length prefixes can only come from corruption.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode a single event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Result of scanning a log file.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Byte offset just past the last intact entry.
    pub valid_len: u64,
    /// True if bytes after `valid_len` were discarded (torn write or corruption).
    pub torn_tail: bool,
}

/// Append-only event log; the engine's durable store.
///
/// Entry format: `[u32 len][bincode Event][u32 crc32]`, little endian.
/// A torn or corrupt tail is cut off when the log is opened, so appends
/// made after a crash stay reachable on the next replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log at `path`, truncating any torn tail.
    pub fn open(path: &Path) -> io::Result<Self> {
        let replay = Self::replay(path)?;
        if replay.torn_tail {
            tracing::warn!(
                path = %path.display(),
                valid_len = replay.valid_len,
                "discarding torn WAL tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync a single event. Production code batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event; durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write a compacted log next to `path`. Slow; runs before the swap.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the log and reopen for append.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        // Buffered-but-unflushed bytes belong to the old file.
        self.writer.flush()?;
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Scan the log, stopping at the first truncated or corrupt entry.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        while let Frame::Entry(event, payload_len) = read_frame(&mut reader)? {
            replay.valid_len += FRAME_OVERHEAD + payload_len;
            replay.events.push(event);
        }
        replay.torn_tail = replay.valid_len < file_len;
        Ok(replay)
    }
}

enum Frame {
    Entry(Event, u64),
    /// Clean end of file.
    End,
    /// Truncated, CRC mismatch or undecodable payload.
    Torn,
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(reader, &mut len_buf)? {
        ReadOutcome::Eof => return Ok(Frame::End),
        ReadOutcome::Partial => return Ok(Frame::Torn),
        ReadOutcome::Full => {}
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(Frame::Torn);
    }

    let mut payload = vec![0u8; len];
    if !matches!(read_exact_or_eof(reader, &mut payload)?, ReadOutcome::Full) {
        return Ok(Frame::Torn);
    }
    let mut crc_buf = [0u8; 4];
    if !matches!(read_exact_or_eof(reader, &mut crc_buf)?, ReadOutcome::Full) {
        return Ok(Frame::Torn);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Frame::Torn);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Frame::Entry(event, len as u64)),
        Err(_) => Ok(Frame::Torn),
    }
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 && !buf.is_empty() {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(ReadOutcome::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("offhire_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn listing_event(id: Ulid) -> Event {
        Event::ListingSynced {
            listing: Listing {
                id,
                owner_id: Ulid::new(),
                listing_type: ListingType::Rent,
                status: ListingStatus::Active,
                status_changed_at: 0,
            },
        }
    }

    fn block_event(listing_id: Ulid) -> Event {
        Event::BlockCreated {
            block: Block {
                id: Ulid::new(),
                listing_id,
                range: DateRange::new(
                    "2026-06-01".parse().unwrap(),
                    "2026-06-05".parse().unwrap(),
                ),
                is_available: false,
                reason: Some("maintenance".into()),
                request_id: None,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let lid = Ulid::new();
        let events = vec![listing_event(lid), block_event(lid)];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, events);
        assert!(!replay.torn_tail);
        assert_eq!(replay.valid_len, fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert!(!replay.torn_tail);
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let event = Event::ListingRemoved { id: Ulid::new() };
        {
            let payload = bincode::serialize(&event).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert!(replay.torn_tail);
    }

    #[test]
    fn open_truncates_torn_tail_so_later_appends_survive() {
        let path = tmp_path("torn_tail.wal");
        let lid = Ulid::new();
        let first = listing_event(lid);
        let second = block_event(lid);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        // Simulate a crash mid-write
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&second).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events, vec![first, second]);
        assert!(!replay.torn_tail);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let lid = Ulid::new();
        let snapshot = vec![listing_event(lid)];
        let later = block_event(lid);
        {
            let mut wal = Wal::open(&path).unwrap();
            for _ in 0..10 {
                wal.append(&block_event(lid)).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(&snapshot).unwrap();
            assert!(fs::metadata(&path).unwrap().len() < before);
            assert_eq!(wal.appends_since_compact(), 0);
            wal.append(&later).unwrap();
        }
        let replay = Wal::replay(&path).unwrap();
        assert_eq!(replay.events.len(), 2);
        assert_eq!(replay.events[0], snapshot[0]);
        assert_eq!(replay.events[1], later);
    }

    #[test]
    fn buffered_appends_count_until_flush() {
        let path = tmp_path("buffered_flush.wal");
        let events: Vec<Event> = (0..5).map(|_| listing_event(Ulid::new())).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().events, events);
    }
}
