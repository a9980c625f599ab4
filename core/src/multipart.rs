//! Streamed `multipart/form-data` bodies.
//!
//! # Design
//! A background thread writes the multipart payload into a bounded in-memory
//! pipe while the transport reads the other end, so attached files are never
//! loaded into memory as a whole. The producer writes one file part per
//! attachment (in attachment order) followed by one field part per string
//! parameter.
//!
//! A file that cannot be opened is logged and skipped by default, and one
//! whose read fails part-way is sent truncated; both are listed in the
//! [`UploadReport`] returned when the stream is finished. With strict
//! uploads the producer instead poisons the pipe, which fails the in-flight
//! request, and `finish` returns the file error.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Chunks in flight between producer and transport.
const PIPE_CAPACITY: usize = 8;
const CHUNK_SIZE: usize = 32 * 1024;

/// Outcome of a finished upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Files whose contents were written in full.
    pub files: Vec<PathBuf>,
    /// Files that could not be opened. No part was sent for them.
    pub skipped: Vec<PathBuf>,
    /// Files whose read failed part-way. Their part was sent with whatever
    /// had been read so far.
    pub truncated: Vec<PathBuf>,
    pub fields: usize,
    /// Payload bytes copied from files.
    pub bytes: u64,
}

fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = bounded(PIPE_CAPACITY);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            chunk: Vec::new(),
            pos: 0,
            consumed: 0,
            failed: false,
        },
    )
}

struct PipeWriter {
    tx: Sender<io::Result<Vec<u8>>>,
}

impl PipeWriter {
    /// Make the reading side fail with `err`.
    fn fail(&self, err: io::Error) {
        let _ = self.tx.send(Err(err));
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(Ok(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "upload stream closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct PipeReader {
    rx: Receiver<io::Result<Vec<u8>>>,
    chunk: Vec<u8>,
    pos: usize,
    consumed: u64,
    failed: bool,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos == self.chunk.len() {
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Ok(Err(err)) => {
                    self.failed = true;
                    return Err(err);
                }
                // Producer hung up: end of body.
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        self.consumed += n as u64;
        Ok(n)
    }
}

/// Read side of a multipart upload, consumed by the transport.
pub struct UploadStream {
    reader: PipeReader,
    producer: JoinHandle<Result<UploadReport>>,
}

impl UploadStream {
    /// Bytes handed to the transport so far.
    pub fn consumed(&self) -> u64 {
        self.reader.consumed
    }

    /// Whether nothing has been read yet and the producer has not failed.
    pub fn is_fresh(&self) -> bool {
        self.reader.consumed == 0 && !self.reader.failed
    }

    /// Close the read side and wait for the producer.
    pub fn finish(self) -> Result<UploadReport> {
        let UploadStream { reader, producer } = self;
        drop(reader);
        producer
            .join()
            .map_err(|_| Error::UploadTask("multipart producer panicked".to_string()))?
    }
}

impl Read for UploadStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl fmt::Debug for UploadStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadStream")
            .field("consumed", &self.reader.consumed)
            .finish()
    }
}

/// Start producing a multipart body. Returns the `Content-Type` header value
/// and the stream to send.
pub fn spawn(
    files: Vec<(String, PathBuf)>,
    fields: Vec<(String, String)>,
    strict: bool,
) -> Result<(String, UploadStream)> {
    let boundary = Uuid::new_v4().simple().to_string();
    let content_type = format!("multipart/form-data; boundary={boundary}");
    let (writer, reader) = pipe();

    let producer = thread::Builder::new()
        .name("multipart-upload".to_string())
        .spawn(move || {
            let mut parts = MultipartWriter::new(BufWriter::with_capacity(CHUNK_SIZE, writer), boundary);
            let result = write_parts(&mut parts, &files, &fields, strict)
                .and_then(|report| parts.close().map(|_| report).map_err(closed_by_transport));
            if let Err(Error::FileIo { path, source }) = &result {
                parts
                    .get_ref()
                    .get_ref()
                    .fail(io::Error::new(source.kind(), format!("{}: {source}", path.display())));
            }
            result
        })
        .map_err(|e| Error::UploadTask(e.to_string()))?;

    Ok((content_type, UploadStream { reader, producer }))
}

fn closed_by_transport(err: io::Error) -> Error {
    Error::Transport(err.into())
}

/// Write every file part, then every field part.
fn write_parts<W: Write>(
    parts: &mut MultipartWriter<W>,
    files: &[(String, PathBuf)],
    fields: &[(String, String)],
    strict: bool,
) -> Result<UploadReport> {
    let mut report = UploadReport::default();
    for (field, path) in files {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(source) if strict => {
                return Err(Error::FileIo {
                    path: path.clone(),
                    source,
                })
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping upload file");
                report.skipped.push(path.clone());
                continue;
            }
        };

        parts
            .start_file(field, &file_name(path))
            .map_err(closed_by_transport)?;
        match copy_file(&mut file, parts) {
            Ok(n) => {
                report.bytes += n;
                report.files.push(path.clone());
            }
            Err(CopyError::Read(source)) if strict => {
                return Err(Error::FileIo {
                    path: path.clone(),
                    source,
                })
            }
            Err(CopyError::Read(err)) => {
                warn!(path = %path.display(), error = %err, "upload file truncated");
                report.truncated.push(path.clone());
            }
            Err(CopyError::Write(err)) => return Err(closed_by_transport(err)),
        }
    }
    for (name, value) in fields {
        parts.field(name, value).map_err(closed_by_transport)?;
        report.fields += 1;
    }
    debug!(files = report.files.len(), fields = report.fields, "multipart body written");
    Ok(report)
}

enum CopyError {
    Read(io::Error),
    Write(io::Error),
}

fn copy_file<W: Write>(file: &mut File, parts: &mut MultipartWriter<W>) -> Result<u64, CopyError> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::Read(e)),
        };
        parts.write_all(&buf[..n]).map_err(CopyError::Write)?;
        total += n as u64;
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn escape_quotes(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Minimal `multipart/form-data` encoder.
struct MultipartWriter<W: Write> {
    out: W,
    boundary: String,
    parts: usize,
}

impl<W: Write> MultipartWriter<W> {
    fn new(out: W, boundary: String) -> Self {
        Self {
            out,
            boundary,
            parts: 0,
        }
    }

    fn get_ref(&self) -> &W {
        &self.out
    }

    fn start_part(&mut self, disposition: &str, content_type: Option<&str>) -> io::Result<()> {
        if self.parts > 0 {
            self.out.write_all(b"\r\n")?;
        }
        write!(
            self.out,
            "--{}\r\nContent-Disposition: {disposition}\r\n",
            self.boundary
        )?;
        if let Some(content_type) = content_type {
            write!(self.out, "Content-Type: {content_type}\r\n")?;
        }
        self.out.write_all(b"\r\n")?;
        self.parts += 1;
        Ok(())
    }

    fn start_file(&mut self, field: &str, file_name: &str) -> io::Result<()> {
        let disposition = format!(
            "form-data; name=\"{}\"; filename=\"{}\"",
            escape_quotes(field),
            escape_quotes(file_name)
        );
        self.start_part(&disposition, Some("application/octet-stream"))
    }

    fn field(&mut self, name: &str, value: &str) -> io::Result<()> {
        let disposition = format!("form-data; name=\"{}\"", escape_quotes(name));
        self.start_part(&disposition, None)?;
        self.out.write_all(value.as_bytes())
    }

    fn close(&mut self) -> io::Result<()> {
        if self.parts > 0 {
            self.out.write_all(b"\r\n")?;
        }
        write!(self.out, "--{}--\r\n", self.boundary)?;
        self.out.flush()
    }
}

impl<W: Write> Write for MultipartWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}
