use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use regex::bytes::Regex;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info, warn};

use crate::config::{Settings, Source};
use crate::error::IngestError;

/// `<meta charset=..>` or `<meta http-equiv=.. content="..; charset=..">`.
static META_CHARSET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<meta[^>]*?charset\s*=\s*["']?\s*([A-Za-z0-9_.:\-]+)"#).unwrap()
});

/// How many leading bytes are scanned for a `<meta>` charset.
const SNIFF_LEN: usize = 1024;

/// Upper bound for a single retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// A fetched payload. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub text: String,
    /// HTTP status, `None` when served from the snapshot.
    pub status: Option<u16>,
    /// Encoding the payload was decoded with.
    pub encoding: &'static str,
    pub from_snapshot: bool,
}

pub struct Fetcher {
    client: reqwest::Client,
    max_attempts: u32,
    base_backoff: Duration,
}

impl Fetcher {
    pub fn new(
        user_agent: &str,
        timeout: Duration,
        max_attempts: u32,
        base_backoff: Duration,
    ) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::Config(format!("http client: {}", e)))?;
        Ok(Self::with_client(client, max_attempts, base_backoff))
    }

    pub fn with_client(client: reqwest::Client, max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            client,
            max_attempts: max_attempts.max(1),
            base_backoff,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, IngestError> {
        Self::new(
            &settings.user_agent,
            settings.timeout(),
            settings.max_attempts,
            settings.base_backoff(),
        )
    }

    /// Snapshot first unless forced; the network otherwise, writing the
    /// decoded text back to the snapshot.
    pub async fn fetch(&self, source: &Source, force_refresh: bool) -> Result<RawDocument, IngestError> {
        let Some(url) = source.url.as_deref() else {
            return read_snapshot(&source.snapshot).await;
        };

        if !force_refresh && tokio::fs::try_exists(&source.snapshot).await.unwrap_or(false) {
            match read_snapshot(&source.snapshot).await {
                Ok(doc) => {
                    debug!(source = %source.id, path = ?source.snapshot, "serving snapshot");
                    return Ok(doc);
                }
                Err(e) => warn!(source = %source.id, error = %e, "snapshot unreadable, fetching"),
            }
        }

        let (bytes, status, content_type) = self.get_with_retry(url).await?;
        let (text, encoding) = decode(&bytes, content_type.as_deref());
        info!(source = %source.id, status, encoding, bytes = bytes.len(), "fetched");

        write_snapshot(&source.snapshot, &text).await;

        Ok(RawDocument {
            text,
            status: Some(status),
            encoding,
            from_snapshot: false,
        })
    }

    async fn get_with_retry(&self, url: &str) -> Result<(Vec<u8>, u16, Option<String>), IngestError> {
        let mut attempt = 1;
        loop {
            let result = self.get_once(url).await;
            let transient = matches!(&result, Err(e) if is_transient(e));
            if !transient || attempt >= self.max_attempts {
                return result;
            }

            let backoff = backoff_for(self.base_backoff, attempt);
            if let Err(e) = &result {
                warn!(
                    url,
                    attempt,
                    max_attempts = self.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "transient fetch failure, backing off"
                );
            }
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    async fn get_once(&self, url: &str) -> Result<(Vec<u8>, u16, Option<String>), IngestError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| IngestError::fetch(url, None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::fetch(
                url,
                Some(status.as_u16()),
                status.canonical_reason().unwrap_or("unexpected status"),
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| IngestError::fetch(url, None, format!("reading body: {}", e)))?;

        Ok((bytes.to_vec(), status.as_u16(), content_type))
    }
}

/// Delay after the given failed attempt: doubles each time, capped at
/// `MAX_BACKOFF`.
fn backoff_for(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

/// Transport failures and 429/5xx are worth another attempt.
fn is_transient(e: &IngestError) -> bool {
    match e {
        IngestError::Fetch { status: None, .. } => true,
        IngestError::Fetch { status: Some(s), .. } => *s == 429 || *s >= 500,
        _ => false,
    }
}

async fn read_snapshot(path: &Path) -> Result<RawDocument, IngestError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        debug!(path = ?path, error = %e, "snapshot unreadable");
        IngestError::NotFound(path.to_path_buf())
    })?;
    let (text, encoding) = decode(&bytes, None);
    Ok(RawDocument {
        text,
        status: None,
        encoding,
        from_snapshot: true,
    })
}

/// Best effort: a failed write is logged, never surfaced.
async fn write_snapshot(path: &Path, text: &str) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(path = ?parent, error = %e, "cannot create snapshot dir");
            return;
        }
    }
    if let Err(e) = tokio::fs::write(path, text).await {
        warn!(path = ?path, error = %e, "snapshot write failed");
    }
}

/// UTF-8, then the declared charset, then a sniffed `<meta>` charset, then
/// windows-1252. The last step is lossy and cannot fail.
pub fn decode(bytes: &[u8], content_type: Option<&str>) -> (String, &'static str) {
    let body = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    if let Ok(text) = std::str::from_utf8(body) {
        return (text.to_string(), UTF_8.name());
    }

    if let Some(declared) = content_type
        .and_then(charset_param)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
    {
        let (text, had_errors) = declared.decode_without_bom_handling(bytes);
        if !had_errors {
            return (text.into_owned(), declared.name());
        }
    }

    let sniffed = sniff_charset(bytes).unwrap_or(WINDOWS_1252);
    let (text, used, _) = sniffed.decode(bytes);
    (text.into_owned(), used.name())
}

fn charset_param(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches(&['"', '\''][..]))
    })
}

fn sniff_charset(bytes: &[u8]) -> Option<&'static Encoding> {
    let head = &bytes[..bytes.len().min(SNIFF_LEN)];
    let label = META_CHARSET.captures(head)?.get(1)?;
    Encoding::for_label(label.as_bytes())
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::config::SourceMode;

    fn response(status: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            status,
            content_type,
            body.len()
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    /// Serves the canned responses in order, one per connection.
    async fn serve(responses: Vec<Vec<u8>>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            for canned in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(&canned).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{}/releases", addr), hits)
    }

    fn fetcher() -> Fetcher {
        let client = reqwest::Client::builder()
            .user_agent("test-agent")
            .timeout(Duration::from_secs(5))
            .no_proxy()
            .build()
            .unwrap();
        Fetcher::with_client(client, 3, Duration::from_millis(1))
    }

    fn source(dir: &tempfile::TempDir, url: Option<String>) -> Source {
        let mut s = Source::snapshot_only(
            "test",
            dir.path().join("snaps/test.html"),
            SourceMode::StructuredDocument,
        );
        s.url = url;
        s
    }

    #[tokio::test]
    async fn network_fetch_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (url, hits) = serve(vec![response("200 OK", "text/html", b"<h2>Game A</h2>")]).await;
        let src = source(&dir, Some(url));

        let doc = fetcher().fetch(&src, false).await.unwrap();
        assert_eq!(doc.status, Some(200));
        assert!(!doc.from_snapshot);
        assert_eq!(doc.text, "<h2>Game A</h2>");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read_to_string(&src.snapshot).unwrap(), "<h2>Game A</h2>");
    }

    #[tokio::test]
    async fn existing_snapshot_skips_network_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        let (url, hits) = serve(vec![response("200 OK", "text/html", b"fresh")]).await;
        let src = source(&dir, Some(url));
        std::fs::create_dir_all(src.snapshot.parent().unwrap()).unwrap();
        std::fs::write(&src.snapshot, "cached").unwrap();

        let doc = fetcher().fetch(&src, false).await.unwrap();
        assert!(doc.from_snapshot);
        assert_eq!(doc.text, "cached");
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let doc = fetcher().fetch(&src, true).await.unwrap();
        assert_eq!(doc.text, "fresh");
        assert_eq!(std::fs::read_to_string(&src.snapshot).unwrap(), "fresh");
    }

    #[tokio::test]
    async fn snapshot_only_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(&dir, None);
        let err = fetcher().fetch(&src, true).await.unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));

        std::fs::create_dir_all(src.snapshot.parent().unwrap()).unwrap();
        std::fs::write(&src.snapshot, "<p>local</p>").unwrap();
        let doc = fetcher().fetch(&src, true).await.unwrap();
        assert_eq!(doc.text, "<p>local</p>");
        assert!(doc.status.is_none());
    }

    #[tokio::test]
    async fn retries_transient_status_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let (url, hits) = serve(vec![
            response("503 Service Unavailable", "text/plain", b"busy"),
            response("429 Too Many Requests", "text/plain", b"slow down"),
            response("200 OK", "text/html", b"ok"),
        ])
        .await;
        let doc = fetcher().fetch(&source(&dir, Some(url)), true).await.unwrap();
        assert_eq!(doc.text, "ok");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_exhausted_surface_status() {
        let dir = tempfile::tempdir().unwrap();
        let (url, hits) = serve(vec![
            response("502 Bad Gateway", "text/plain", b""),
            response("502 Bad Gateway", "text/plain", b""),
            response("502 Bad Gateway", "text/plain", b""),
        ])
        .await;
        let err = fetcher().fetch(&source(&dir, Some(url)), true).await.unwrap_err();
        assert_eq!(err.status(), Some(502));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let (url, hits) = serve(vec![response("404 Not Found", "text/plain", b"")]).await;
        let src = source(&dir, Some(url));
        let err = fetcher().fetch(&src, true).await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!src.snapshot.exists());
    }

    #[tokio::test]
    async fn transport_failure_has_no_status() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = fetcher()
            .fetch(&source(&dir, Some(format!("http://{}/", addr))), true)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Fetch { status: None, .. }));
    }

    #[tokio::test]
    async fn snapshot_write_failure_still_returns_text() {
        let dir = tempfile::tempdir().unwrap();
        let (url, _) = serve(vec![response("200 OK", "text/html", b"body")]).await;
        let mut src = source(&dir, Some(url));
        // A directory cannot be overwritten as a file.
        src.snapshot = dir.path().to_path_buf();
        let doc = fetcher().fetch(&src, true).await.unwrap();
        assert_eq!(doc.text, "body");
    }

    #[tokio::test]
    async fn unreadable_snapshot_falls_back_to_network() {
        let dir = tempfile::tempdir().unwrap();
        let (url, hits) = serve(vec![response("200 OK", "text/html", b"fresh")]).await;
        let mut src = source(&dir, Some(url));
        src.snapshot = dir.path().to_path_buf();

        let doc = fetcher().fetch(&src, false).await.unwrap();
        assert!(!doc.from_snapshot);
        assert_eq!(doc.text, "fresh");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_for(base, 1), Duration::from_millis(100));
        assert_eq!(backoff_for(base, 3), Duration::from_millis(400));
        assert_eq!(backoff_for(base, 40), MAX_BACKOFF);
        assert_eq!(backoff_for(Duration::from_secs(u64::MAX), 2), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn many_attempts_do_not_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        let fetcher = Fetcher::with_client(client, 40, Duration::ZERO);
        let err = fetcher
            .fetch(&source(&dir, Some(format!("http://{}/", addr))), true)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Fetch { status: None, .. }));
    }

    #[test]
    fn decode_prefers_utf8() {
        let (text, enc) = decode("Erscheinungsdatum: März".as_bytes(), Some("text/html; charset=iso-8859-1"));
        assert_eq!(text, "Erscheinungsdatum: März");
        assert_eq!(enc, "UTF-8");
    }

    #[test]
    fn decode_uses_declared_charset() {
        let (text, enc) = decode(b"M\xe4rz", Some("text/html; Charset=\"ISO-8859-1\""));
        assert_eq!(text, "März");
        assert_eq!(enc, "windows-1252");
    }

    #[test]
    fn decode_sniffs_meta_charset() {
        let (text, enc) = decode(b"<meta charset=\"iso-8859-15\"><p>\xa4 5</p>", Some("text/html"));
        assert_eq!(text, "<meta charset=\"iso-8859-15\"><p>€ 5</p>");
        assert_eq!(enc, "ISO-8859-15");
    }

    #[test]
    fn decode_never_fails() {
        let (text, enc) = decode(b"caf\xe9 \xff", None);
        assert_eq!(enc, "windows-1252");
        assert!(text.starts_with("café"));
    }

    #[test]
    fn charset_param_parsing() {
        assert_eq!(charset_param("text/html; charset=utf-8"), Some("utf-8"));
        assert_eq!(charset_param("text/html"), None);
        assert_eq!(charset_param("text/html;charset='koi8-r' ; q=1"), Some("koi8-r"));
    }
}
