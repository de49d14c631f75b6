//! TSV report files

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Writer for the `status\tpath` report format
pub struct TsvReport {
    writer: BufWriter<File>,
}

impl TsvReport {
    pub fn create(path: &Path) -> io::Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "status\tpath")?;
        Ok(Self { writer })
    }

    /// `status` may itself carry a tab-separated detail, e.g.
    /// `failed\t<reason>`.
    pub fn row(&mut self, status: &str, path: &str) -> io::Result<()> {
        writeln!(self.writer, "{status}\t{path}")
    }

    pub fn finish(mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
