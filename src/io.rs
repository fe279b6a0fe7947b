//! Fixed-size block reads and writes over a file or a RAM buffer.

use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

/// Container path meaning "RAM buffer, no persistence".
pub const MEMORY_PATH: &str = ":memory:";

/// The reserved null block id.
pub const BLOCK_NULL: u64 = 0;
/// The first addressable block id.
pub const BLOCK_FIRST: u64 = 1;

/// Settings for opening a container.
pub struct IoConfig {
    /// Path to the backing file, or [`MEMORY_PATH`].
    pub path: PathBuf,
    /// Size of one block in bytes.
    pub block_size: usize,
    /// Optional cap on the number of blocks. Required in memory mode.
    pub max_blocks: Option<u64>,
}

enum Backing {
    File(File),
    Memory(Vec<u8>),
}

/// A block-addressed container.
///
/// Positions are expressed in blocks; writes compose up to three byte
/// segments into one block, reads fill destinations the same way.
pub struct BlockIo {
    backing: Backing,
    block_size: usize,
    last_block: u64,
}

impl BlockIo {
    /// Opens the container described by `config`.
    ///
    /// A file container must already exist; its size determines the block
    /// capacity, `floor(file_size / block_size)`, further limited by
    /// `max_blocks`.
    pub fn open(config: &IoConfig) -> Result<Self> {
        if config.block_size == 0 {
            return Err(Error::Invalid);
        }
        if config.path.as_os_str() == MEMORY_PATH {
            Self::open_memory(config)
        } else {
            Self::open_file(config)
        }
    }

    fn open_file(config: &IoConfig) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.path)?;
        let mut num_blocks = file.metadata()?.len() / config.block_size as u64;
        if let Some(max) = config.max_blocks {
            num_blocks = num_blocks.min(max);
        }
        if num_blocks == 0 {
            return Err(Error::NoSpace);
        }
        Ok(Self {
            backing: Backing::File(file),
            block_size: config.block_size,
            last_block: num_blocks - 1,
        })
    }

    fn open_memory(config: &IoConfig) -> Result<Self> {
        let num_blocks = match config.max_blocks {
            Some(max) if max > 0 => max,
            _ => return Err(Error::Invalid),
        };
        let size = num_blocks as usize * config.block_size;
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(size).map_err(|_| Error::OutOfMemory)?;
        buffer.resize(size, 0);
        Ok(Self {
            backing: Backing::Memory(buffer),
            block_size: config.block_size,
            last_block: num_blocks - 1,
        })
    }

    /// Writes one segment into `block`.
    pub fn write(&mut self, block: u64, data: &[u8]) -> Result<()> {
        self.write3(block, data, &[], &[])
    }

    /// Writes two segments into `block`, back to back.
    pub fn write2(&mut self, block: u64, data: &[u8], data2: &[u8]) -> Result<()> {
        self.write3(block, data, data2, &[])
    }

    /// Writes three segments into `block`, back to back.
    pub fn write3(&mut self, block: u64, data: &[u8], data2: &[u8], data3: &[u8]) -> Result<()> {
        if block > self.last_block {
            return Err(Error::Overflow);
        }
        let total = data.len() + data2.len() + data3.len();
        if total > self.block_size {
            return Err(Error::Invalid);
        }
        let mut buffer = Vec::with_capacity(total);
        buffer.extend_from_slice(data);
        buffer.extend_from_slice(data2);
        buffer.extend_from_slice(data3);
        let start = block * self.block_size as u64;
        match &mut self.backing {
            Backing::File(file) => file.write_all_at(&buffer, start)?,
            Backing::Memory(mem) => {
                let start = start as usize;
                mem[start..start + total].copy_from_slice(&buffer);
            }
        }
        Ok(())
    }

    /// Fills `data` from the beginning of `block`.
    pub fn read(&self, block: u64, data: &mut [u8]) -> Result<()> {
        self.read_slice(block, 0, data)
    }

    /// Fills `data` from `block`, starting `skip` bytes in.
    pub fn read_slice(&self, block: u64, skip: usize, data: &mut [u8]) -> Result<()> {
        if block > self.last_block {
            return Err(Error::Overflow);
        }
        if skip + data.len() > self.block_size {
            return Err(Error::Invalid);
        }
        let start = block * self.block_size as u64 + skip as u64;
        match &self.backing {
            Backing::File(file) => file.read_exact_at(data, start)?,
            Backing::Memory(mem) => {
                let start = start as usize;
                data.copy_from_slice(&mem[start..start + data.len()]);
            }
        }
        Ok(())
    }

    /// Flushes to durable storage. A no-op in memory mode.
    pub fn sync(&mut self) -> Result<()> {
        match &self.backing {
            Backing::File(file) => file.sync_all().map_err(Error::from),
            Backing::Memory(_) => Ok(()),
        }
    }

    /// Returns the size of one block in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the first valid block id.
    pub fn block_first(&self) -> u64 {
        BLOCK_FIRST
    }

    /// Returns the last valid block id.
    pub fn block_last(&self) -> u64 {
        self.last_block
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    fn memory(block_size: usize, max_blocks: u64) -> BlockIo {
        BlockIo::open(&IoConfig {
            path: PathBuf::from(MEMORY_PATH),
            block_size,
            max_blocks: Some(max_blocks),
        })
        .unwrap()
    }

    #[test]
    fn memory_write_read() {
        let mut io = memory(16, 10);
        io.write2(1, b"One", b"Three").unwrap();
        io.write(2, b"Two").unwrap();

        let mut buffer = [0u8; 8];
        io.read(1, &mut buffer).unwrap();
        assert_eq!(&buffer, b"OneThree");

        let mut buffer = [0u8; 5];
        io.read_slice(1, 3, &mut buffer).unwrap();
        assert_eq!(&buffer, b"Three");

        let mut buffer = [0u8; 3];
        io.read(2, &mut buffer).unwrap();
        assert_eq!(&buffer, b"Two");
    }

    #[test]
    fn memory_bounds() {
        let mut io = memory(16, 10);
        assert!(matches!(io.write(10, b"x"), Err(Error::Overflow)));
        assert!(matches!(io.write(1, &[0u8; 17]), Err(Error::Invalid)));
        assert!(matches!(
            io.write3(1, &[0u8; 8], &[0u8; 8], &[0u8; 1]),
            Err(Error::Invalid)
        ));
        let mut buffer = [0u8; 9];
        assert!(matches!(io.read_slice(1, 8, &mut buffer), Err(Error::Invalid)));
    }

    #[test]
    fn memory_requires_cap() {
        let config = IoConfig {
            path: PathBuf::from(MEMORY_PATH),
            block_size: 16,
            max_blocks: None,
        };
        assert!(matches!(BlockIo::open(&config), Err(Error::Invalid)));
    }

    #[test]
    fn file_write_read() {
        let path = std::env::temp_dir().join(format!("appendfs-io-{}.bin", std::process::id()));
        fs::write(&path, vec![0u8; 16 * 10]).unwrap();

        let config = IoConfig {
            path: path.clone(),
            block_size: 16,
            max_blocks: None,
        };
        {
            let mut io = BlockIo::open(&config).unwrap();
            assert_eq!(io.block_first(), 1);
            assert_eq!(io.block_last(), 9);
            io.write2(1, b"One", b"Three").unwrap();
            io.sync().unwrap();
        }
        {
            let io = BlockIo::open(&config).unwrap();
            let mut buffer = [0u8; 8];
            io.read(1, &mut buffer).unwrap();
            assert_eq!(&buffer, b"OneThree");
        }
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn file_capacity() {
        let path = std::env::temp_dir().join(format!("appendfs-cap-{}.bin", std::process::id()));
        fs::write(&path, vec![0u8; 15]).unwrap();
        let config = IoConfig {
            path: path.clone(),
            block_size: 16,
            max_blocks: None,
        };
        assert!(matches!(BlockIo::open(&config), Err(Error::NoSpace)));
        fs::remove_file(&path).unwrap();
    }
}
