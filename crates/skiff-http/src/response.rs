//! HTTP/1.1 response builder.
//!
//! Resolves the request path under the document root, maps the outcome
//! to a status code, rewrites error statuses onto their error documents,
//! and emits the status line and headers into the connection's write
//! buffer. File bodies are served from a read-only memory mapping handed
//! to the writer as an independent transfer segment; they are never
//! copied into the header buffer.

use std::fs::{self, File};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;

use skiff_core::Buffer;

/// Advertised alongside `Connection: keep-alive`.
const KEEP_ALIVE_MAX: u32 = 6;
const KEEP_ALIVE_TIMEOUT: u32 = 120;

/// World-readable permission bit; files without it are forbidden.
const S_IROTH: u32 = 0o004;

fn reason_phrase(code: u16) -> Option<&'static str> {
    match code {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        403 => Some("Forbidden"),
        404 => Some("Not Found"),
        _ => None,
    }
}

/// Error statuses are served from fixed documents under the root.
fn error_document(code: u16) -> Option<&'static str> {
    match code {
        400 => Some("/400.html"),
        403 => Some("/403.html"),
        404 => Some("/404.html"),
        _ => None,
    }
}

fn mime_type(path: &str) -> &'static str {
    let suffix = match path.rfind('.') {
        Some(i) => &path[i..],
        None => return "text/plain",
    };
    match suffix {
        ".html" => "text/html",
        ".xml" => "text/xml",
        ".xhtml" => "application/xhtml+xml",
        ".txt" => "text/plain",
        ".rtf" => "application/rtf",
        ".pdf" => "application/pdf",
        ".word" => "application/nsword",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".au" => "audio/basic",
        ".mpeg" | ".mpg" => "video/mpeg",
        ".avi" => "video/x-msvideo",
        ".gz" => "application/x-gzip",
        ".tar" => "application/x-tar",
        ".css" => "text/css",
        ".js" => "text/javascript",
        _ => "text/plain",
    }
}

/// Read-only, privately-mapped view of a file.
///
/// `release` is idempotent; `Drop` unmaps whatever is still held, so a
/// mapping is returned to the kernel exactly once however the owning
/// connection goes away.
pub struct MappedFile {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MappedFile {
    /// Map `len` bytes of `file`. Zero-length and failed mappings both
    /// yield `None`; the caller decides the fallback.
    fn map(file: &File, len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        Some(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }

    /// Unmap; safe to call more than once.
    pub fn release(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
            self.ptr = std::ptr::null_mut();
            self.len = 0;
        }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        self.release();
    }
}

// Safety: the mapping is read-only and owned by exactly one connection;
// single-shot dispatch means at most one worker touches it at a time.
unsafe impl Send for MappedFile {}

pub struct HttpResponse {
    code: Option<u16>,
    path: String,
    src_dir: String,
    keep_alive: bool,
    file: Option<MappedFile>,
    file_len: u64,
}

impl HttpResponse {
    pub fn new() -> Self {
        Self {
            code: None,
            path: String::new(),
            src_dir: String::new(),
            keep_alive: false,
            file: None,
            file_len: 0,
        }
    }

    /// Prepare for a fresh response, releasing any previous mapping.
    /// `code` of `None` lets the filesystem outcome pick the status.
    pub fn init(&mut self, src_dir: &str, path: &str, keep_alive: bool, code: Option<u16>) {
        assert!(!src_dir.is_empty());
        self.unmap();
        self.code = code;
        self.keep_alive = keep_alive;
        self.path = path.to_string();
        self.src_dir = src_dir.to_string();
        self.file_len = 0;
    }

    /// Build the response: status from a stat of the resolved target,
    /// error-document rewrite, then status line + headers + body.
    pub fn make(&mut self, buf: &mut Buffer) {
        let code = match fs::metadata(self.resolved_path()) {
            Err(_) => 404,
            Ok(md) if md.is_dir() => 404,
            Ok(md) if md.mode() & S_IROTH == 0 => 403,
            Ok(md) => {
                self.file_len = md.len();
                self.code.unwrap_or(200)
            }
        };
        self.code = Some(code);
        self.rewrite_error_document();
        self.append_status_line(buf);
        self.append_headers(buf);
        self.append_content(buf);
    }

    pub fn status_code(&self) -> u16 {
        self.code.unwrap_or(0)
    }

    /// The memory-mapped body segment, if the response has one.
    pub fn file(&self) -> Option<&MappedFile> {
        self.file.as_ref()
    }

    /// Release the mapped body. Idempotent.
    pub fn unmap(&mut self) {
        if let Some(file) = &mut self.file {
            file.release();
        }
        self.file = None;
    }

    fn resolved_path(&self) -> String {
        format!("{}{}", self.src_dir, self.path)
    }

    fn rewrite_error_document(&mut self) {
        if let Some(doc) = error_document(self.code.unwrap_or(0)) {
            self.path = doc.to_string();
            self.file_len = fs::metadata(self.resolved_path())
                .map(|md| md.len())
                .unwrap_or(0);
        }
    }

    /// Unrecognized codes degrade to 400 with its reason phrase.
    fn append_status_line(&mut self, buf: &mut Buffer) {
        let (code, reason) = match reason_phrase(self.code.unwrap_or(0)) {
            Some(reason) => (self.code.unwrap_or(0), reason),
            None => {
                self.code = Some(400);
                (400, "Bad Request")
            }
        };
        buf.append(format!("HTTP/1.1 {} {}\r\n", code, reason).as_bytes());
    }

    fn append_headers(&self, buf: &mut Buffer) {
        buf.append(b"Connection: ");
        if self.keep_alive {
            buf.append(b"keep-alive\r\n");
            buf.append(
                format!(
                    "keep-alive: max={}, timeout={}\r\n",
                    KEEP_ALIVE_MAX, KEEP_ALIVE_TIMEOUT
                )
                .as_bytes(),
            );
        } else {
            buf.append(b"close\r\n");
        }
        buf.append(format!("Content-Type: {}\r\n", mime_type(&self.path)).as_bytes());
    }

    /// Map the resolved file and emit `Content-Length` plus the blank
    /// line. The mapping itself is handed to the writer separately; on
    /// any open/map failure a synthesized error body goes inline.
    fn append_content(&mut self, buf: &mut Buffer) {
        let file = match File::open(self.resolved_path()) {
            Ok(file) => file,
            Err(err) => {
                log::debug!("open {} failed: {}", self.resolved_path(), err);
                self.append_error_body(buf, "file not found");
                return;
            }
        };
        if self.file_len == 0 {
            buf.append(b"Content-Length: 0\r\n\r\n");
            return;
        }
        match MappedFile::map(&file, self.file_len as usize) {
            Some(mapped) => {
                buf.append(format!("Content-Length: {}\r\n\r\n", self.file_len).as_bytes());
                self.file = Some(mapped);
            }
            None => self.append_error_body(buf, "file not found"),
        }
    }

    /// Synthesized HTML body for error responses whose document is
    /// missing or unmappable.
    fn append_error_body(&self, buf: &mut Buffer, message: &str) {
        let code = self.code.unwrap_or(400);
        let status = reason_phrase(code).unwrap_or("Bad Request");
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p><hr><em>skiff</em></body></html>",
            code, status, message
        );
        buf.append(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
        buf.append(body.as_bytes());
    }
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}
