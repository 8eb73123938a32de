//! Render service: HTML page → PDF bytes.
//!
//! Rasterising HTML is delegated to an external engine (a headless browser
//! behind an HTTP endpoint, or a local command such as `wkhtmltopdf - -`).
//! [`RenderService`] is the seam; the worker only ever sees
//! `html in, pdf bytes out`.
//!
//! Backends are resolved from [`ArchiveConfig`] most specific first:
//! an explicit `renderer`, then `render_url`, then `render_command`, then the
//! `CONVO_RENDER_URL` environment variable.

use crate::config::{ArchiveConfig, RENDER_URL_ENV};
use crate::error::{ArchiveError, RenderError};
use futures::future::BoxFuture;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

const PDF_MAGIC: &[u8] = b"%PDF";

/// Longest stderr/body excerpt kept in an error message.
const EXCERPT_LEN: usize = 400;

/// Converts one standalone HTML document into a PDF.
pub trait RenderService: Send + Sync {
    /// Short label for logs, e.g. the endpoint or program.
    fn name(&self) -> &str;

    fn render<'a>(&'a self, html: &'a str) -> BoxFuture<'a, Result<Vec<u8>, RenderError>>;
}

/// Pick the render backend configured in `config`.
pub fn resolve_renderer(config: &ArchiveConfig) -> Result<Arc<dyn RenderService>, ArchiveError> {
    if let Some(renderer) = &config.renderer {
        return Ok(Arc::clone(renderer));
    }
    let timeout = Duration::from_secs(config.render_timeout_secs);
    if let Some(url) = &config.render_url {
        return Ok(Arc::new(HttpRenderService::new(url.clone(), timeout)?));
    }
    if let Some(command) = &config.render_command {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| ArchiveError::InvalidConfig("render command must name a program".into()))?;
        return Ok(Arc::new(CommandRenderService::new(program.clone(), args.to_vec())));
    }
    if let Some(url) = std::env::var(RENDER_URL_ENV).ok().filter(|u| !u.trim().is_empty()) {
        info!("Using render endpoint from {}", RENDER_URL_ENV);
        return Ok(Arc::new(HttpRenderService::new(url, timeout)?));
    }
    Err(ArchiveError::RendererNotConfigured)
}

fn check_pdf(bytes: Vec<u8>) -> Result<Vec<u8>, RenderError> {
    if !bytes.starts_with(PDF_MAGIC) {
        return Err(RenderError::NotAPdf {
            len: bytes.len(),
            magic: bytes.iter().take(8).copied().collect(),
        });
    }
    Ok(bytes)
}

fn excerpt(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    match text.char_indices().nth(EXCERPT_LEN) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

// ── HTTP backend ─────────────────────────────────────────────────────────────

/// POSTs the page to an endpoint that answers with a PDF body.
#[derive(Debug, Clone)]
pub struct HttpRenderService {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpRenderService {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ArchiveError> {
        let endpoint = endpoint.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ArchiveError::InvalidConfig(format!("render client for '{endpoint}': {e}")))?;
        Ok(Self { endpoint, client })
    }

    async fn post(&self, html: &str) -> Result<Vec<u8>, RenderError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "text/html; charset=utf-8")
            .body(html.to_owned())
            .send()
            .await
            .map_err(|e| RenderError::Http {
                endpoint: self.endpoint.clone(),
                detail: e.to_string(),
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| RenderError::Http {
            endpoint: self.endpoint.clone(),
            detail: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(RenderError::Status {
                endpoint: self.endpoint.clone(),
                status: status.as_u16(),
                body: excerpt(&body),
            });
        }
        debug!("Render service returned {} bytes", body.len());
        check_pdf(body.to_vec())
    }
}

impl RenderService for HttpRenderService {
    fn name(&self) -> &str {
        &self.endpoint
    }

    fn render<'a>(&'a self, html: &'a str) -> BoxFuture<'a, Result<Vec<u8>, RenderError>> {
        Box::pin(self.post(html))
    }
}

// ── Command backend ──────────────────────────────────────────────────────────

/// Runs a program that reads HTML on stdin and writes a PDF to stdout.
#[derive(Debug, Clone)]
pub struct CommandRenderService {
    program: String,
    args: Vec<String>,
}

impl CommandRenderService {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    async fn run(&self, html: &str) -> Result<Vec<u8>, RenderError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RenderError::Command {
                program: self.program.clone(),
                status: "spawn failed".into(),
                stderr: e.to_string(),
            })?;

        let stdin = child.stdin.take();
        let input = html.as_bytes().to_vec();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        if let Err(e) = fed {
            // a renderer may exit before draining stdin; its status decides
            debug!("Writing HTML to '{}' failed: {}", self.program, e);
        }

        if !output.status.success() {
            return Err(RenderError::Command {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: excerpt(&output.stderr),
            });
        }
        check_pdf(output.stdout)
    }
}

impl RenderService for CommandRenderService {
    fn name(&self) -> &str {
        &self.program
    }

    fn render<'a>(&'a self, html: &'a str) -> BoxFuture<'a, Result<Vec<u8>, RenderError>> {
        Box::pin(self.run(html))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn explicit_renderer_wins() {
        let custom: Arc<dyn RenderService> = Arc::new(CommandRenderService::new("custom", vec![]));
        let config = ArchiveConfig::builder()
            .renderer(custom)
            .render_url("http://localhost:9/render")
            .build()
            .unwrap();
        assert_eq!(resolve_renderer(&config).unwrap().name(), "custom");
    }

    #[test]
    fn url_beats_command() {
        let config = ArchiveConfig::builder()
            .render_url("http://localhost:9/render")
            .render_command(vec!["wkhtmltopdf".into()])
            .build()
            .unwrap();
        assert_eq!(resolve_renderer(&config).unwrap().name(), "http://localhost:9/render");
    }

    #[test]
    fn command_is_split_into_program_and_args() {
        let config = ArchiveConfig::builder()
            .render_command(vec!["wkhtmltopdf".into(), "-".into(), "-".into()])
            .build()
            .unwrap();
        assert_eq!(resolve_renderer(&config).unwrap().name(), "wkhtmltopdf");
    }

    #[test]
    fn non_pdf_body_is_rejected() {
        let err = check_pdf(b"<html>oops</html>".to_vec()).unwrap_err();
        match err {
            RenderError::NotAPdf { len, magic } => {
                assert_eq!(len, 17);
                assert_eq!(magic, b"<html>oo".to_vec());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(check_pdf(b"%PDF-1.7".to_vec()).is_ok());
    }

    #[test]
    fn excerpt_is_bounded() {
        let long = "x".repeat(EXCERPT_LEN * 2);
        assert_eq!(excerpt(long.as_bytes()).chars().count(), EXCERPT_LEN + 1);
        assert_eq!(excerpt(b"  short \n"), "short");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_backend_returns_stdout() {
        let svc = CommandRenderService::new(
            "sh",
            vec!["-c".into(), "cat >/dev/null; printf '%%PDF-1.4 fake'".into()],
        );
        let pdf = svc.render("<html></html>").await.unwrap();
        assert_eq!(pdf, b"%PDF-1.4 fake");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_failure_carries_stderr() {
        let svc = CommandRenderService::new("sh", vec!["-c".into(), "echo boom >&2; exit 3".into()]);
        match svc.render("<html></html>").await.unwrap_err() {
            RenderError::Command { program, stderr, .. } => {
                assert_eq!(program, "sh");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_command_error() {
        let svc = CommandRenderService::new("definitely-not-a-real-renderer-binary", vec![]);
        assert!(matches!(
            svc.render("<p>x</p>").await,
            Err(RenderError::Command { .. })
        ));
    }

    /// Serve one canned HTTP response and return the request body.
    async fn serve_once(listener: TcpListener, response: Vec<u8>) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length || n == 0 {
                    socket.write_all(&response).await.unwrap();
                    socket.shutdown().await.ok();
                    return text[end + 4..].to_string();
                }
            }
            if n == 0 {
                return String::new();
            }
        }
    }

    #[tokio::test]
    async fn http_backend_posts_html() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/render", listener.local_addr().unwrap());
        let body = b"%PDF-1.4 tiny";
        let mut response =
            format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", body.len())
                .into_bytes();
        response.extend_from_slice(body);
        let server = tokio::spawn(serve_once(listener, response));

        let svc = HttpRenderService::new(url, Duration::from_secs(5)).unwrap();
        let pdf = svc.render("<p>hello</p>").await.unwrap();
        assert_eq!(pdf, body);
        assert_eq!(server.await.unwrap(), "<p>hello</p>");
    }

    #[tokio::test]
    async fn http_error_status_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/render", listener.local_addr().unwrap());
        let response =
            b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbusy".to_vec();
        let server = tokio::spawn(serve_once(listener, response));

        let svc = HttpRenderService::new(url, Duration::from_secs(5)).unwrap();
        match svc.render("<p>x</p>").await.unwrap_err() {
            RenderError::Status { status, body, .. } => {
                assert_eq!(status, 503);
                assert_eq!(body, "busy");
            }
            other => panic!("unexpected {other:?}"),
        }
        server.await.unwrap();
    }
}
