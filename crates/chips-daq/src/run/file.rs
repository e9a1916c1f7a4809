// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 CHIPS Collaboration

//! The per-run archival file (.chips).
//!
//! # Format Overview
//!
//! ```text
//! +---------------------------------------------------------+
//! |                  File Header (64 bytes)                 |
//! |  Magic (8) | Version (4) | Flags (4) | SpillRows (8)    |
//! |  OptHitRows (8) | RunParamsWritten (4) | Reserved (28)  |
//! +---------------------------------------------------------+
//! |                  Segment 0                              |
//! |  SegmentHeader (12) | Row[] | CRC32 (4)                 |
//! +---------------------------------------------------------+
//! |                  Segment 1 ...                          |
//! +---------------------------------------------------------+
//! ```
//!
//! Three tables are appended incrementally as tagged segments; rows are
//! independently addressable by their running per-table index:
//!
//! - `opt_hits` (19 bytes/row): `plane:u32 channel:u8 tai_s:u64 tai_ns:u32
//!   tot:u8 adc0:u8` - time-sorted within the scope of a single spill.
//! - `spills` (48 bytes/row): `number:u64 tai_started:{u64,u32}
//!   tai_stopped:{u64,u32} opt_hits_begin:u64 opt_hits_end:u64`.
//! - `run_params` (33 bytes, one row): `number:u64 type:u8
//!   utc_started:{u64,u32} utc_stopped:{u64,u32}`, written at run end.
//!
//! All integers little-endian. Each segment carries a CRC32 of its rows.

use crate::hit::HitQueue;
use crate::run::DataRun;
use crate::spill::Spill;
use crate::time::{TaiTimestamp, UtcTimestamp};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;

/// Magic bytes: `"CHPSRUN\0"`.
pub const MAGIC: [u8; 8] = [0x43, 0x48, 0x50, 0x53, 0x52, 0x55, 0x4E, 0x00];

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

const HEADER_SIZE: usize = 64;
const SEGMENT_HEADER_SIZE: usize = 12;

const TABLE_SPILLS: u8 = 1;
const TABLE_OPT_HITS: u8 = 2;
const TABLE_RUN_PARAMS: u8 = 3;

const OPT_HIT_ROW_SIZE: usize = 19;
const SPILL_ROW_SIZE: usize = 48;
const RUN_PARAMS_ROW_SIZE: usize = 33;

/// Run file errors.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid run file magic")]
    InvalidMagic,

    #[error("version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },

    #[error("CRC mismatch in segment {segment}")]
    CrcMismatch { segment: usize },

    #[error("unknown table id {0}")]
    UnknownTable(u8),
}

/// The per-run output file, open for appending spills.
pub struct RunFile {
    writer: BufWriter<File>,
    n_spill_rows: u64,
    n_opt_hit_rows: u64,
    run_params_written: bool,
}

impl RunFile {
    /// Create the run file and write its header. Called once at run start.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, FormatError> {
        let file = File::create(path)?;
        let mut this = Self {
            writer: BufWriter::new(file),
            n_spill_rows: 0,
            n_opt_hit_rows: 0,
            run_params_written: false,
        };
        this.write_header()?;
        Ok(this)
    }

    fn write_header(&mut self) -> Result<(), FormatError> {
        let w = &mut self.writer;
        w.write_all(&MAGIC)?;
        w.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        w.write_u32::<LittleEndian>(0)?; // flags
        w.write_u64::<LittleEndian>(self.n_spill_rows)?;
        w.write_u64::<LittleEndian>(self.n_opt_hit_rows)?;
        w.write_u32::<LittleEndian>(u32::from(self.run_params_written))?;
        w.write_all(&[0u8; 28])?; // reserved
        Ok(())
    }

    fn write_segment(&mut self, table_id: u8, row_count: u64, rows: &[u8]) -> Result<(), FormatError> {
        let w = &mut self.writer;
        w.write_u8(table_id)?;
        // Row counts per segment are bounded by one spill's content.
        w.write_u24::<LittleEndian>((row_count.min(0x00FF_FFFF)) as u32)?;
        w.write_u64::<LittleEndian>(rows.len() as u64)?;
        w.write_all(rows)?;
        w.write_u32::<LittleEndian>(crc32fast::hash(rows))?;
        Ok(())
    }

    /// Append one closed spill: its merged hits as an `opt_hits` segment
    /// and one `spills` row referencing the hit-row range just written.
    pub fn write_spill(&mut self, spill: &Spill, merged_hits: &HitQueue) -> Result<(), FormatError> {
        let opt_hits_begin = self.n_opt_hit_rows;

        let mut rows = Vec::with_capacity(merged_hits.len() * OPT_HIT_ROW_SIZE);
        for hit in merged_hits {
            rows.write_u32::<LittleEndian>(hit.plane_number)?;
            rows.write_u8(hit.channel_number)?;
            rows.write_u64::<LittleEndian>(hit.timestamp.secs)?;
            rows.write_u32::<LittleEndian>(hit.timestamp.nanosecs)?;
            rows.write_u8(hit.tot)?;
            rows.write_u8(hit.adc0)?;
        }
        self.write_segment(TABLE_OPT_HITS, merged_hits.len() as u64, &rows)?;
        self.n_opt_hit_rows += merged_hits.len() as u64;

        let opt_hits_end = self.n_opt_hit_rows;

        let mut row = Vec::with_capacity(SPILL_ROW_SIZE);
        row.write_u64::<LittleEndian>(spill.spill_number())?;
        row.write_u64::<LittleEndian>(spill.start_time().secs)?;
        row.write_u32::<LittleEndian>(spill.start_time().nanosecs)?;
        row.write_u64::<LittleEndian>(spill.end_time().secs)?;
        row.write_u32::<LittleEndian>(spill.end_time().nanosecs)?;
        row.write_u64::<LittleEndian>(opt_hits_begin)?;
        row.write_u64::<LittleEndian>(opt_hits_end)?;
        self.write_segment(TABLE_SPILLS, 1, &row)?;
        self.n_spill_rows += 1;

        Ok(())
    }

    /// Append the single `run_params` row. Called at run end, once the
    /// run's stop time is frozen.
    pub fn write_run_parameters(&mut self, run: &DataRun) -> Result<(), FormatError> {
        let mut row = Vec::with_capacity(RUN_PARAMS_ROW_SIZE);
        row.write_u64::<LittleEndian>(run.number())?;
        row.write_u8(run.run_type().code())?;
        row.write_u64::<LittleEndian>(run.time_started().secs)?;
        row.write_u32::<LittleEndian>(run.time_started().nanosecs)?;
        row.write_u64::<LittleEndian>(run.time_stopped().secs)?;
        row.write_u32::<LittleEndian>(run.time_stopped().nanosecs)?;
        self.write_segment(TABLE_RUN_PARAMS, 1, &row)?;
        self.run_params_written = true;
        Ok(())
    }

    /// Push buffered data to the OS so a crash loses at most one spill.
    pub fn flush(&mut self) -> Result<(), FormatError> {
        self.writer.flush()?;
        Ok(())
    }

    /// Patch the header row counts and close the file.
    pub fn close(mut self) -> Result<(), FormatError> {
        self.writer.seek(SeekFrom::Start(0))?;
        self.write_header()?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn n_spill_rows(&self) -> u64 {
        self.n_spill_rows
    }

    pub fn n_opt_hit_rows(&self) -> u64 {
        self.n_opt_hit_rows
    }
}

/// One `opt_hits` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptHitRow {
    pub plane_number: u32,
    pub channel_number: u8,
    pub tai_time: TaiTimestamp,
    pub tot: u8,
    pub adc0: u8,
}

/// One `spills` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpillRow {
    pub number: u64,
    pub tai_time_started: TaiTimestamp,
    pub tai_time_stopped: TaiTimestamp,
    pub opt_hits_begin: u64,
    pub opt_hits_end: u64,
}

/// The single `run_params` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunParamsRow {
    pub number: u64,
    pub run_type: u8,
    pub utc_time_started: UtcTimestamp,
    pub utc_time_stopped: UtcTimestamp,
}

/// Fully decoded run file, for consumers and tests.
#[derive(Debug, Default)]
pub struct RunFileContents {
    pub run_params: Option<RunParamsRow>,
    pub spills: Vec<SpillRow>,
    pub opt_hits: Vec<OptHitRow>,
}

/// Sequential run file reader.
pub struct RunFileReader {
    reader: BufReader<File>,
    n_spill_rows: u64,
    n_opt_hit_rows: u64,
}

impl RunFileReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FormatError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let version = reader.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(FormatError::VersionMismatch { expected: FORMAT_VERSION, got: version });
        }

        let _flags = reader.read_u32::<LittleEndian>()?;
        let n_spill_rows = reader.read_u64::<LittleEndian>()?;
        let n_opt_hit_rows = reader.read_u64::<LittleEndian>()?;
        let _run_params_written = reader.read_u32::<LittleEndian>()?;
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;

        Ok(Self { reader, n_spill_rows, n_opt_hit_rows })
    }

    /// Header row counts, as patched at close time.
    pub fn row_counts(&self) -> (u64, u64) {
        (self.n_spill_rows, self.n_opt_hit_rows)
    }

    /// Decode every segment into memory.
    pub fn read_all(mut self) -> Result<RunFileContents, FormatError> {
        let mut contents = RunFileContents::default();
        let mut segment = 0usize;

        loop {
            let table_id = match self.reader.read_u8() {
                Ok(id) => id,
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            };
            let row_count = self.reader.read_u24::<LittleEndian>()?;
            let data_size = self.reader.read_u64::<LittleEndian>()?;

            let mut rows = vec![0u8; data_size as usize];
            self.reader.read_exact(&mut rows)?;
            let crc = self.reader.read_u32::<LittleEndian>()?;
            if crc != crc32fast::hash(&rows) {
                return Err(FormatError::CrcMismatch { segment });
            }

            let mut cursor = io::Cursor::new(rows);
            match table_id {
                TABLE_OPT_HITS => {
                    for _ in 0..row_count {
                        contents.opt_hits.push(OptHitRow {
                            plane_number: cursor.read_u32::<LittleEndian>()?,
                            channel_number: cursor.read_u8()?,
                            tai_time: TaiTimestamp::new(
                                cursor.read_u64::<LittleEndian>()?,
                                cursor.read_u32::<LittleEndian>()?,
                            ),
                            tot: cursor.read_u8()?,
                            adc0: cursor.read_u8()?,
                        });
                    }
                }
                TABLE_SPILLS => {
                    for _ in 0..row_count {
                        contents.spills.push(SpillRow {
                            number: cursor.read_u64::<LittleEndian>()?,
                            tai_time_started: TaiTimestamp::new(
                                cursor.read_u64::<LittleEndian>()?,
                                cursor.read_u32::<LittleEndian>()?,
                            ),
                            tai_time_stopped: TaiTimestamp::new(
                                cursor.read_u64::<LittleEndian>()?,
                                cursor.read_u32::<LittleEndian>()?,
                            ),
                            opt_hits_begin: cursor.read_u64::<LittleEndian>()?,
                            opt_hits_end: cursor.read_u64::<LittleEndian>()?,
                        });
                    }
                }
                TABLE_RUN_PARAMS => {
                    contents.run_params = Some(RunParamsRow {
                        number: cursor.read_u64::<LittleEndian>()?,
                        run_type: cursor.read_u8()?,
                        utc_time_started: UtcTimestamp::new(
                            cursor.read_u64::<LittleEndian>()?,
                            cursor.read_u32::<LittleEndian>()?,
                        ),
                        utc_time_stopped: UtcTimestamp::new(
                            cursor.read_u64::<LittleEndian>()?,
                            cursor.read_u32::<LittleEndian>()?,
                        ),
                    });
                }
                other => return Err(FormatError::UnknownTable(other)),
            }

            segment += 1;
        }

        Ok(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hit::Hit;
    use crate::run::{RunType, SchedulerKind};

    fn open_spill() -> Spill {
        Spill::created(TaiTimestamp::new(100, 0), TaiTimestamp::new(200, 0))
    }

    fn hit(plane: u32, secs: u64, nanos: u32) -> Hit {
        Hit {
            plane_number: plane,
            channel_number: 3,
            timestamp: TaiTimestamp::new(secs, nanos),
            tot: 42,
            adc0: Hit::NO_ADC0,
            cpu_trigger: false,
        }
    }

    #[test]
    fn test_header_roundtrip_empty_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.chips");

        RunFile::create(&path).expect("create").close().expect("close");

        let reader = RunFileReader::open(&path).expect("open");
        assert_eq!(reader.row_counts(), (0, 0));
        let contents = reader.read_all().expect("read");
        assert!(contents.spills.is_empty());
        assert!(contents.opt_hits.is_empty());
        assert!(contents.run_params.is_none());
    }

    #[test]
    fn test_rejects_foreign_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bogus.chips");
        std::fs::write(&path, b"definitely not a run file").expect("write");
        assert!(matches!(
            RunFileReader::open(&path),
            Err(FormatError::InvalidMagic)
        ));
    }

    #[test]
    fn test_spill_rows_reference_hit_ranges() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.chips");

        let mut file = RunFile::create(&path).expect("create");
        let spill = open_spill();

        let first = vec![hit(1, 100, 10), hit(2, 100, 20)];
        file.write_spill(&spill, &first).expect("write spill 0");

        let second = vec![hit(1, 101, 0)];
        file.write_spill(&spill, &second).expect("write spill 1");
        file.flush().expect("flush");
        file.close().expect("close");

        let contents = RunFileReader::open(&path)
            .expect("open")
            .read_all()
            .expect("read");

        assert_eq!(contents.spills.len(), 2);
        assert_eq!(contents.opt_hits.len(), 3);
        assert_eq!(contents.spills[0].opt_hits_begin, 0);
        assert_eq!(contents.spills[0].opt_hits_end, 2);
        assert_eq!(contents.spills[1].opt_hits_begin, 2);
        assert_eq!(contents.spills[1].opt_hits_end, 3);

        assert_eq!(contents.opt_hits[0].plane_number, 1);
        assert_eq!(contents.opt_hits[0].tai_time, TaiTimestamp::new(100, 10));
        assert_eq!(contents.opt_hits[2].tai_time, TaiTimestamp::new(101, 0));
    }

    #[test]
    fn test_run_params_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.chips");
        let run = DataRun::new(7, RunType::Calibration, SchedulerKind::Infinite, dir.path());
        run.start();
        run.stop();

        let mut file = RunFile::create(&path).expect("create");
        file.write_run_parameters(&run).expect("params");
        file.close().expect("close");

        let contents = RunFileReader::open(&path)
            .expect("open")
            .read_all()
            .expect("read");
        let params = contents.run_params.expect("one run_params row");
        assert_eq!(params.number, 7);
        assert_eq!(params.run_type, RunType::Calibration.code());
        assert!(params.utc_time_stopped >= params.utc_time_started);
    }

    #[test]
    fn test_corrupted_segment_is_detected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.chips");

        let mut file = RunFile::create(&path).expect("create");
        let spill = open_spill();
        file.write_spill(&spill, &vec![hit(1, 100, 10)]).expect("write");
        file.close().expect("close");

        // Flip a byte inside the first segment's row data.
        let mut bytes = std::fs::read(&path).expect("read file");
        let at = HEADER_SIZE + SEGMENT_HEADER_SIZE + 2;
        bytes[at] ^= 0xFF;
        std::fs::write(&path, &bytes).expect("rewrite");

        let result = RunFileReader::open(&path).expect("open").read_all();
        assert!(matches!(result, Err(FormatError::CrcMismatch { segment: 0 })));
    }
}
