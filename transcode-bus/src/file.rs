use std::{
    fs::File,
    io::{BufWriter, Read, Seek, SeekFrom, Write},
};

use anyhow::Context;

use crate::stage::{ByteSink, ByteSource};

/// Reads the input from a local file.
pub struct FileSource {
    location: String,
    file: Option<File>,
    size: Option<u64>,
}

impl FileSource {
    pub fn new(location: &str) -> Self {
        Self {
            location: location.to_string(),
            file: None,
            size: None,
        }
    }

    fn file(&mut self) -> anyhow::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or(anyhow::anyhow!("file source {} is not open", self.location))
    }
}

impl ByteSource for FileSource {
    fn location(&self) -> &str {
        &self.location
    }

    fn open(&mut self) -> anyhow::Result<()> {
        let file = File::open(&self.location)
            .with_context(|| format!("could not open {} for reading", self.location))?;
        self.size = file.metadata().ok().map(|m| m.len());
        self.file = Some(file);
        Ok(())
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let location = self.location.clone();
        self.file()?
            .read(buf)
            .with_context(|| format!("read error on {}", location))
    }

    fn seek(&mut self, pos: SeekFrom) -> anyhow::Result<u64> {
        Ok(self.file()?.seek(pos)?)
    }
}

/// Writes the output to a local file, truncating it.
pub struct FileSink {
    location: String,
    writer: Option<BufWriter<File>>,
}

impl FileSink {
    pub fn new(location: &str) -> Self {
        Self {
            location: location.to_string(),
            writer: None,
        }
    }

    fn writer(&mut self) -> anyhow::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or(anyhow::anyhow!("file sink {} is not open", self.location))
    }
}

impl ByteSink for FileSink {
    fn location(&self) -> &str {
        &self.location
    }

    fn open(&mut self) -> anyhow::Result<()> {
        let file = File::create(&self.location)
            .with_context(|| format!("could not open {} for writing", self.location))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let location = self.location.clone();
        self.writer()?
            .write_all(data)
            .with_context(|| format!("write error on {}", location))
    }

    fn seek(&mut self, pos: SeekFrom) -> anyhow::Result<u64> {
        // BufWriter flushes pending bytes before seeking.
        Ok(self.writer()?.seek(pos)?)
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "file_test.rs"]
mod file_test;
