use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// A length prefix above this is treated as corruption rather than allocated.
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

fn write_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// `Ok(false)` when the file ends before `buf` is full.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

enum Record {
    /// A decoded event and the bytes its record occupies.
    Event(Event, u64),
    /// Clean end of file.
    End,
    /// Torn or damaged tail; everything from here on is ignored.
    Damaged(&'static str),
}

fn read_record(reader: &mut impl Read) -> io::Result<Record> {
    let mut len_buf = [0u8; 4];
    if !fill(reader, &mut len_buf)? {
        return Ok(Record::End);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(Record::Damaged("oversized length prefix"));
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if !fill(reader, &mut payload)? || !fill(reader, &mut crc_buf)? {
        return Ok(Record::Damaged("truncated record"));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Record::Damaged("checksum mismatch"));
    }
    Ok(match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Record::Event(event, 8 + len as u64),
        Err(_) => Record::Damaged("undecodable payload"),
    })
}

/// Append-only event log backing the engine.
///
/// Each record is `[u32 len][bincode Event][u32 crc32]`, little-endian, where `len`
/// counts the payload only. Replay stops at the first record that is cut short or
/// fails its checksum, which is what a crash mid-append leaves behind.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    records_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            records_since_compact: 0,
        })
    }

    /// Append one event and fsync. Test helper; the engine batches through
    /// `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one record. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_record(&mut self.writer, event)?;
        self.records_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.compact")
    }

    /// First compaction phase: write `events` to a side file and fsync it.
    /// The live log is untouched until `swap_compact_file`.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            write_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Second phase: rename the side file over the log and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.records_since_compact = 0;
        Ok(())
    }

    /// Both compaction phases in one call. Test helper.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Records appended since open or the last compaction.
    pub fn records_since_compact(&self) -> u64 {
        self.records_since_compact
    }

    /// Every intact event in the log, in append order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::scan(path).map(|(events, _)| events)
    }

    /// Replay, then cut any damaged tail off the file so later appends land directly
    /// after the last intact record. Run this before `open` on startup.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, intact) = Self::scan(path)?;
        let file = match OpenOptions::new().write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(events),
            Err(e) => return Err(e),
        };
        let len = file.metadata()?.len();
        if len > intact {
            warn!(path = %path.display(), from = len, to = intact, "truncating damaged WAL tail");
            file.set_len(intact)?;
            file.sync_all()?;
        }
        Ok(events)
    }

    /// Intact events plus the byte length of the prefix holding them.
    fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut intact: u64 = 0;
        loop {
            match read_record(&mut reader)? {
                Record::Event(event, size) => {
                    events.push(event);
                    intact += size;
                }
                Record::End => break,
                Record::Damaged(reason) => {
                    warn!(path = %path.display(), kept = events.len(), reason, "damaged WAL tail");
                    break;
                }
            }
        }
        Ok((events, intact))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookingStatus, StockLevel};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("stockbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn item_created(id: Ulid, total_quantity: u32) -> Event {
        Event::ItemCreated {
            id,
            location_id: Ulid::new(),
            name: Some("Folding table".into()),
            total_quantity,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let _ = fs::remove_file(&path);

        let item = Ulid::new();
        let events = vec![
            item_created(item, 4),
            Event::StatusChanged {
                booking_id: Ulid::new(),
                status: BookingStatus::Confirmed,
                stock: vec![StockLevel {
                    item_id: item,
                    available_quantity: 2,
                }],
                at: 1_700_000_000_000,
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_discards_truncated_tail() {
        let path = tmp_path("truncation.wal");
        let _ = fs::remove_file(&path);

        let event = item_created(Ulid::new(), 1);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }

        // A crash mid-write leaves a partial length prefix behind
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed, vec![event]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let _ = fs::remove_file(&path);

        let event = Event::PickupConfirmed {
            booking_id: Ulid::new(),
            at: 0,
        };
        {
            let payload = bincode::serialize(&event).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_rejects_oversized_length_prefix() {
        let path = tmp_path("oversized.wal");
        let _ = fs::remove_file(&path);

        let event = item_created(Ulid::new(), 2);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[1u8; 32]).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_truncates_damaged_tail_before_appending() {
        let path = tmp_path("recover.wal");
        let _ = fs::remove_file(&path);

        let first = item_created(Ulid::new(), 3);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let intact = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9, 0, 0, 0, 1, 2]).unwrap();
        }

        assert_eq!(Wal::recover(&path).unwrap(), vec![first.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact);

        let second = item_created(Ulid::new(), 4);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&second).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, second]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_missing_file_is_empty() {
        let path = tmp_path("recover_missing.wal");
        let _ = fs::remove_file(&path);
        assert!(Wal::recover(&path).unwrap().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn compact_shrinks_and_accepts_new_appends() {
        let path = tmp_path("compact.wal");
        let _ = fs::remove_file(&path);

        let item = Ulid::new();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&item_created(item, 10)).unwrap();
            for q in 0..10 {
                wal.append(&Event::ItemCapacitySet {
                    id: item,
                    total_quantity: 10,
                    available_quantity: q,
                })
                .unwrap();
            }
        }
        let before = fs::metadata(&path).unwrap().len();

        let compacted = vec![
            item_created(item, 10),
            Event::ItemCapacitySet {
                id: item,
                total_quantity: 10,
                available_quantity: 9,
            },
        ];
        let later = Event::PickupConfirmed {
            booking_id: Ulid::new(),
            at: 5,
        };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(&compacted).unwrap();
            assert_eq!(wal.records_since_compact(), 0);
            wal.append(&later).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 3);
        assert_eq!(&replayed[..2], &compacted[..]);
        assert_eq!(replayed[2], later);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let _ = fs::remove_file(&path);

        let events: Vec<Event> = (0..5).map(|q| item_created(Ulid::new(), q)).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.records_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);

        let _ = fs::remove_file(&path);
    }
}
