use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// First bytes of every WAL file. Bump the trailing digit when the record
/// encoding changes.
pub const WAL_MAGIC: &[u8; 8] = b"RSVDWAL1";

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Open for appending. Bytes past `valid_len` (a torn tail left by a crash
/// or a failed write) are cut off so new records follow the last good one.
fn open_append(path: &Path, valid_len: u64) -> io::Result<File> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let len = file.metadata()?.len();
    // A crash while creating the file can leave a partial header.
    if len < WAL_MAGIC.len() as u64 {
        file.set_len(0)?;
        file.write_all(WAL_MAGIC)?;
        file.sync_all()?;
    } else if valid_len >= WAL_MAGIC.len() as u64 && len > valid_len {
        tracing::warn!(path = %path.display(), dropped = len - valid_len, "truncating WAL tail");
        file.set_len(valid_len)?;
        file.sync_all()?;
    }
    Ok(file)
}

/// Append-only Write-Ahead Log.
///
/// File layout: `WAL_MAGIC`, then per entry `[u32: len][bincode: Event][u32: crc32]`.
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Truncated last entry (crash) is discarded via length-prefix + CRC check.
/// - A batch is written whole or not at all: on error the file is cut back
///   to `committed_len` before the error is returned.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// File length after the last successful fsync.
    committed_len: u64,
    /// Set when a rollback itself failed; retried before the next batch.
    needs_rollback: bool,
    appends_since_compact: u64,
    #[cfg(test)]
    fail_write_after: Option<usize>,
}

impl Wal {
    /// Open (or create) the WAL file at `path`, keeping whatever is on disk.
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::open_at(path, u64::MAX)
    }

    /// Open the WAL and drop everything past `valid_len`, the end of the
    /// last record `replay_prefix` accepted.
    pub fn open_at(path: &Path, valid_len: u64) -> io::Result<Self> {
        let file = open_append(path, valid_len)?;
        let committed_len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            committed_len,
            needs_rollback: false,
            appends_since_compact: 0,
            #[cfg(test)]
            fail_write_after: None,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_batch(std::slice::from_ref(event))
    }

    /// Write a batch of events and fsync once. Either every event in the
    /// batch is durable or none is.
    pub fn append_batch<'a>(
        &mut self,
        events: impl IntoIterator<Item = &'a Event>,
    ) -> io::Result<()> {
        if self.needs_rollback {
            self.rollback()?;
        }

        let mut buf = Vec::new();
        let mut count = 0u64;
        for event in events {
            encode_event(&mut buf, event)?;
            count += 1;
        }

        match self.write_synced(&buf) {
            Ok(()) => {
                self.committed_len += buf.len() as u64;
                self.appends_since_compact += count;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback() {
                    tracing::error!(path = %self.path.display(), error = %rollback_err, "WAL rollback failed");
                    self.needs_rollback = true;
                }
                Err(e)
            }
        }
    }

    fn write_synced(&mut self, buf: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if let Some(limit) = self.fail_write_after.take() {
            self.file.write_all(&buf[..limit.min(buf.len())])?;
            return Err(io::Error::other("injected write failure"));
        }
        self.file.write_all(buf)?;
        self.file.sync_all()
    }

    /// Cut the file back to the last committed length and reopen it.
    fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        file.set_len(self.committed_len)?;
        file.sync_all()?;
        self.file = file;
        self.needs_rollback = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write compacted events to a temp file next to `path` and fsync.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::compact_tmp_path(path))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(WAL_MAGIC)?;
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the WAL and reopen it for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        self.file = open_append(&self.path, u64::MAX)?;
        self.committed_len = self.file.metadata()?.len();
        self.needs_rollback = false;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid events.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::replay_prefix(path).map(|(events, _)| events)
    }

    /// Replay the WAL and also report the byte length of the valid prefix.
    /// A file that does not start with `WAL_MAGIC` is refused; a truncated
    /// or corrupt tail is dropped with a warning.
    pub fn replay_prefix(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();

        let mut magic = [0u8; 8];
        match reader.read_exact(&mut magic) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok((events, 0)),
            Err(e) => return Err(e),
        }
        if &magic != WAL_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a reservd WAL", path.display()),
            ));
        }
        let mut valid_len = WAL_MAGIC.len() as u64;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            let mut crc_buf = [0u8; 4];
            let complete = reader
                .read_exact(&mut payload)
                .and_then(|()| reader.read_exact(&mut crc_buf));
            match complete {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::warn!(path = %path.display(), replayed = events.len(), "WAL ends in a truncated record");
                    break;
                }
                Err(e) => return Err(e),
            }

            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                tracing::warn!(path = %path.display(), replayed = events.len(), "WAL record failed CRC check");
                break;
            }
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "undecodable WAL record");
                    break;
                }
            }
            valid_len += (4 + len + 4) as u64;
        }

        Ok((events, valid_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceType, Reservation, Span};
    use ulid::Ulid;

    fn device_created(name: &str) -> Event {
        Event::DeviceCreated {
            id: Ulid::new(),
            name: name.into(),
            device_type_id: None,
            at: 1_000,
        }
    }

    fn reservation_created(device_id: Ulid, start: i64, end: i64) -> Event {
        Event::ReservationCreated {
            reservation: Reservation {
                id: Ulid::new(),
                device_id,
                span: Span::new(start, end),
                queued: false,
                created_at: 1_000,
                modified_at: 1_000,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wal");
        let dev = Ulid::new();
        let events = vec![
            Event::DeviceTypeCreated {
                device_type: DeviceType {
                    id: Ulid::new(),
                    name: "scope".into(),
                    created_at: 1,
                    modified_at: 1,
                },
            },
            device_created("scope-1"),
            reservation_created(dev, 1_000, 2_000),
            Event::ReservationDeleted { id: Ulid::new(), device_id: dev },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn new_file_starts_with_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wal");
        drop(Wal::open(&path).unwrap());
        assert_eq!(fs::read(&path).unwrap(), WAL_MAGIC.to_vec());
        assert!(Wal::replay(&path).unwrap().is_empty());

        // Reopening must not write a second header.
        drop(Wal::open(&path).unwrap());
        assert_eq!(fs::metadata(&path).unwrap().len(), WAL_MAGIC.len() as u64);
    }

    #[test]
    fn foreign_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wal");
        fs::write(&path, b"PGDMP\0\0\0 some other format").unwrap();
        let err = Wal::replay(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn replay_handles_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wal");
        let event = device_created("bench-psu");

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0x20, 0, 0, 0, 1, 2]).unwrap(); // length prefix plus a partial payload
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wal");
        let good = device_created("a");
        let bad = Event::DeviceDeleted { id: Ulid::new() };

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn replay_nonexistent_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Wal::replay(&dir.path().join("missing.wal")).unwrap().is_empty());
    }

    #[test]
    fn compact_then_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wal");
        let create = device_created("rig");
        let Event::DeviceCreated { id: dev, .. } = create else {
            unreachable!()
        };

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&create).unwrap();
        for i in 0..20 {
            let e = reservation_created(dev, i * 10, i * 10 + 5);
            wal.append(&e).unwrap();
            if let Event::ReservationCreated { reservation } = e {
                wal.append(&Event::ReservationDeleted { id: reservation.id, device_id: dev })
                    .unwrap();
            }
        }
        assert_eq!(wal.appends_since_compact(), 41);
        let before = fs::metadata(&path).unwrap().len();

        wal.compact(std::slice::from_ref(&create)).unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);

        let late = reservation_created(dev, 500, 600);
        wal.append(&late).unwrap();
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![create, late]);
    }

    #[test]
    fn append_batch_commits_all_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wal");
        let events: Vec<Event> = (0..5).map(|i| device_created(&format!("rig-{i}"))).collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append_batch(&events).unwrap();
            assert_eq!(wal.appends_since_compact(), 5);
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn failed_batch_leaves_no_torn_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wal");
        let first = device_created("rig-0");
        let lost = vec![device_created("rig-1"), device_created("rig-2")];
        let later = device_created("rig-3");

        let mut wal = Wal::open(&path).unwrap();
        wal.append(&first).unwrap();
        let committed = fs::metadata(&path).unwrap().len();

        // Half of the first record reaches the file before the write fails.
        wal.fail_write_after = Some(10);
        assert!(wal.append_batch(&lost).is_err());
        assert_eq!(fs::metadata(&path).unwrap().len(), committed);
        assert_eq!(wal.appends_since_compact(), 1);

        wal.append(&later).unwrap();
        assert_eq!(wal.appends_since_compact(), 2);
        drop(wal);

        assert_eq!(Wal::replay(&path).unwrap(), vec![first, later]);
    }

    #[test]
    fn reopen_drops_torn_tail_before_appending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wal");
        let first = device_created("rig-0");
        let later = device_created("rig-1");

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0x40, 0, 0, 0, 9, 9, 9]).unwrap();
        }

        let (events, valid_len) = Wal::replay_prefix(&path).unwrap();
        assert_eq!(events, vec![first.clone()]);
        {
            let mut wal = Wal::open_at(&path, valid_len).unwrap();
            assert_eq!(fs::metadata(&path).unwrap().len(), valid_len);
            wal.append(&later).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![first, later]);
    }
}
