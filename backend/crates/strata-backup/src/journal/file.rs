use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::{ImageBlockKind, Journal};
use crate::error::{BackupError, Result};

const LOG_FILE: &str = "journal.log";

/// Journal kept in a directory: `journal.log` holds records as
/// little-endian `u32` length prefixes followed by the record bytes, and each
/// image block lives in `image-<kind>.bin`.
pub struct FileJournal {
    dir: PathBuf,
    log: Mutex<File>,
}

fn open_log(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).read(true).open(path)
}

/// Complete records in `data` and the offset just past the last of them.
fn parse_frames(data: &[u8]) -> (Vec<&[u8]>, usize) {
    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= data.len() {
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&data[pos..pos + 4]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if pos + 4 + len > data.len() {
            break;
        }
        records.push(&data[pos + 4..pos + 4 + len]);
        pos += 4 + len;
    }
    (records, pos)
}

fn write_frame(file: &mut File, len: u32, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(&len.to_le_bytes())?;
    file.write_all(bytes)
}

fn frame_len(bytes: &[u8]) -> Result<u32> {
    u32::try_from(bytes.len())
        .map_err(|_| BackupError::Other(format!("journal record too large: {} bytes", bytes.len())))
}

impl FileJournal {
    /// Open or create the journal in `dir`. A record torn by a crash during
    /// append is cut off so later appends start on a frame boundary.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE);
        let log = open_log(&path)?;

        let data = fs::read(&path)?;
        let (records, valid) = parse_frames(&data);
        if valid < data.len() {
            log::warn!(
                "Truncating torn journal tail at offset {} ({} trailing byte(s) after {} record(s))",
                valid,
                data.len() - valid,
                records.len()
            );
            log.set_len(valid as u64)?;
            log.sync_data()?;
        }
        log::debug!("Opened backup journal at {}", dir.display());
        Ok(Self {
            dir,
            log: Mutex::new(log),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn image_path(&self, kind: ImageBlockKind) -> PathBuf {
        self.dir.join(format!("image-{}.bin", kind.as_str()))
    }
}

impl Journal for FileJournal {
    fn append_record(&self, bytes: &[u8]) -> Result<()> {
        let len = frame_len(bytes)?;
        let mut file = self.log.lock();
        let start = file.metadata()?.len();
        if let Err(e) = write_frame(&mut file, len, bytes).and_then(|_| file.sync_data()) {
            if let Err(undo) = file.set_len(start) {
                log::error!(
                    "Failed to cut partial journal record at offset {}: {}",
                    start,
                    undo
                );
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn read_records(&self) -> Result<Vec<Vec<u8>>> {
        let _guard = self.log.lock();
        let data = fs::read(self.log_path())?;
        let (records, valid) = parse_frames(&data);
        if valid < data.len() {
            log::warn!(
                "Ignoring truncated journal record at offset {} ({} trailing byte(s))",
                valid,
                data.len() - valid
            );
        }
        Ok(records.into_iter().map(<[u8]>::to_vec).collect())
    }

    fn retain_records(&self, keep: &mut dyn FnMut(&[u8]) -> bool) -> Result<usize> {
        let mut file = self.log.lock();
        let path = self.log_path();
        let data = fs::read(&path)?;
        let (records, _) = parse_frames(&data);
        let total = records.len();
        let kept: Vec<&[u8]> = records.into_iter().filter(|record| keep(*record)).collect();
        let dropped = total - kept.len();
        if dropped == 0 {
            return Ok(0);
        }

        let tmp = path.with_extension("log.tmp");
        {
            let mut out = File::create(&tmp)?;
            for record in &kept {
                write_frame(&mut out, frame_len(record)?, record)?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        *file = open_log(&path)?;
        log::debug!("Compacted backup journal: {} record(s) dropped, {} kept", dropped, kept.len());
        Ok(dropped)
    }

    fn write_image_block(&self, kind: ImageBlockKind, bytes: &[u8]) -> Result<()> {
        let path = self.image_path(kind);
        let tmp = path.with_extension("bin.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_image_block(&self, kind: ImageBlockKind) -> Result<Option<Vec<u8>>> {
        let path = self.image_path(kind);
        if !path.exists() {
            return Ok(None);
        }
        let mut buf = Vec::new();
        File::open(&path)?.read_to_end(&mut buf)?;
        Ok(Some(buf))
    }
}
