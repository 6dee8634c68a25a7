//! Browser automation for UI verification.
//!
//! The dispatcher only manages lifecycle (lazy launch, reuse, close) through
//! the [`BrowserLauncher`]/[`BrowserSession`] traits. The production backend
//! speaks the W3C WebDriver protocol to a driver such as chromedriver.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::io::config::BrowserSettings;

/// W3C key under which element references are returned.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// One live browser.
pub trait BrowserSession {
    /// Load `url`; returns the page title.
    fn navigate(&mut self, url: &str) -> Result<String>;
    /// PNG bytes of the current viewport.
    fn screenshot(&mut self) -> Result<Vec<u8>>;
    fn click(&mut self, selector: &str) -> Result<()>;
    fn fill(&mut self, selector: &str, value: &str) -> Result<()>;
    fn evaluate(&mut self, script: &str) -> Result<Value>;
    fn close(&mut self) -> Result<()>;
}

/// Creates browser sessions on demand.
pub trait BrowserLauncher {
    fn launch(&self) -> Result<Box<dyn BrowserSession>>;
}

/// Launcher used when no WebDriver endpoint is configured.
#[derive(Debug, Clone, Default)]
pub struct UnavailableLauncher;

impl BrowserLauncher for UnavailableLauncher {
    fn launch(&self) -> Result<Box<dyn BrowserSession>> {
        bail!(
            "browser automation is not configured; set [browser] webdriver_url in \
             the autopilot config file (e.g. \"http://localhost:9515\" for chromedriver)"
        )
    }
}

/// Pick the launcher for the configured settings.
pub fn launcher_from_settings(settings: &BrowserSettings) -> Result<Box<dyn BrowserLauncher>> {
    match &settings.webdriver_url {
        Some(url) => Ok(Box::new(WebDriverLauncher::new(url, settings.headless)?)),
        None => Ok(Box::new(UnavailableLauncher)),
    }
}

#[derive(Debug, Clone)]
pub struct WebDriverLauncher {
    client: Client,
    base_url: String,
    headless: bool,
}

impl WebDriverLauncher {
    pub fn new(base_url: &str, headless: bool) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build WebDriver HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            headless,
        })
    }

    fn capabilities(&self) -> Value {
        let mut args = vec!["--no-sandbox", "--window-size=1280,900"];
        if self.headless {
            args.push("--headless=new");
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": args },
                },
            },
        })
    }
}

impl BrowserLauncher for WebDriverLauncher {
    #[instrument(skip_all, fields(base_url = %self.base_url))]
    fn launch(&self) -> Result<Box<dyn BrowserSession>> {
        let value = call(
            &self.client,
            reqwest::Method::POST,
            &format!("{}/session", self.base_url),
            Some(&self.capabilities()),
        )
        .context("create WebDriver session")?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("WebDriver did not return a session id"))?;
        debug!(session_id, "browser session created");
        Ok(Box::new(WebDriverSession {
            client: self.client.clone(),
            session_url: format!("{}/session/{session_id}", self.base_url),
            closed: false,
        }))
    }
}

#[derive(Debug)]
pub struct WebDriverSession {
    client: Client,
    session_url: String,
    closed: bool,
}

impl WebDriverSession {
    fn command(&self, method: reqwest::Method, path: &str, body: Option<&Value>) -> Result<Value> {
        call(
            &self.client,
            method,
            &format!("{}{path}", self.session_url),
            body,
        )
    }

    fn find(&self, selector: &str) -> Result<String> {
        let value = self
            .command(
                reqwest::Method::POST,
                "/element",
                Some(&json!({ "using": "css selector", "value": selector })),
            )
            .with_context(|| format!("find element '{selector}'"))?;
        value
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("no element reference for '{selector}'"))
    }
}

impl BrowserSession for WebDriverSession {
    fn navigate(&mut self, url: &str) -> Result<String> {
        self.command(reqwest::Method::POST, "/url", Some(&json!({ "url": url })))
            .with_context(|| format!("navigate to {url}"))?;
        let title = self.command(reqwest::Method::GET, "/title", None)?;
        Ok(title.as_str().unwrap_or_default().to_string())
    }

    fn screenshot(&mut self) -> Result<Vec<u8>> {
        let value = self.command(reqwest::Method::GET, "/screenshot", None)?;
        let encoded = value
            .as_str()
            .ok_or_else(|| anyhow!("screenshot response is not a string"))?;
        STANDARD.decode(encoded).context("decode screenshot")
    }

    fn click(&mut self, selector: &str) -> Result<()> {
        let element = self.find(selector)?;
        self.command(
            reqwest::Method::POST,
            &format!("/element/{element}/click"),
            Some(&json!({})),
        )
        .with_context(|| format!("click '{selector}'"))?;
        Ok(())
    }

    fn fill(&mut self, selector: &str, value: &str) -> Result<()> {
        let element = self.find(selector)?;
        self.command(
            reqwest::Method::POST,
            &format!("/element/{element}/clear"),
            Some(&json!({})),
        )
        .with_context(|| format!("clear '{selector}'"))?;
        self.command(
            reqwest::Method::POST,
            &format!("/element/{element}/value"),
            Some(&json!({ "text": value })),
        )
        .with_context(|| format!("type into '{selector}'"))?;
        Ok(())
    }

    fn evaluate(&mut self, script: &str) -> Result<Value> {
        self.command(
            reqwest::Method::POST,
            "/execute/sync",
            Some(&json!({ "script": wrap_script(script), "args": [] })),
        )
        .context("evaluate script")
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.command(reqwest::Method::DELETE, "", None)
            .context("delete WebDriver session")?;
        Ok(())
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(err = %format!("{err:#}"), "failed to close browser session");
        }
    }
}

/// WebDriver executes function bodies; bare expressions need a `return`.
pub fn wrap_script(script: &str) -> String {
    let trimmed = script.trim();
    if trimmed.starts_with("return ") || trimmed.contains("\nreturn ") || trimmed.contains("; return ") {
        trimmed.to_string()
    } else {
        format!("return ({});", trimmed.trim_end_matches(';'))
    }
}

fn call(client: &Client, method: reqwest::Method, url: &str, body: Option<&Value>) -> Result<Value> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(body);
    }
    let response = request.send().with_context(|| format!("WebDriver request {url}"))?;
    let status = response.status();
    let payload: Value = response.json().context("parse WebDriver response")?;
    let value = payload.get("value").cloned().unwrap_or(Value::Null);
    if !status.is_success() {
        bail!("{}", driver_error(&value, status.as_u16()));
    }
    Ok(value)
}

fn driver_error(value: &Value, status: u16) -> String {
    let kind = value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .lines()
        .next()
        .unwrap_or_default();
    format!("WebDriver {kind} (HTTP {status}): {message}")
}

/// Write screenshot bytes under `dir`, returning the file path.
///
/// `name` is reduced to its final component so it cannot leave `dir`.
pub fn save_screenshot(dir: &Path, name: Option<&str>, bytes: &[u8]) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let file_name = name
        .and_then(|name| Path::new(name).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| {
            format!(
                "screenshot-{}.png",
                chrono::Utc::now().format("%Y%m%dT%H%M%S%3f")
            )
        });
    let file_name = if file_name.ends_with(".png") {
        file_name
    } else {
        format!("{file_name}.png")
    };
    let path = dir.join(file_name);
    fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verifies bare expressions are wrapped so they return a value.
    #[test]
    fn expressions_are_wrapped_in_return() {
        assert_eq!(wrap_script("document.title"), "return (document.title);");
        assert_eq!(wrap_script("1 + 1;"), "return (1 + 1);");
        assert_eq!(
            wrap_script("return document.title"),
            "return document.title"
        );
        assert_eq!(
            wrap_script("const a = 1; return a"),
            "const a = 1; return a"
        );
    }

    /// Verifies WebDriver error bodies are reduced to their message.
    #[test]
    fn driver_errors_are_readable() {
        let value = json!({ "error": "no such element", "message": "Unable to locate\nstack" });
        assert_eq!(
            driver_error(&value, 404),
            "WebDriver no such element (HTTP 404): Unable to locate"
        );
    }

    /// Verifies the unconfigured launcher says how to configure it.
    #[test]
    fn unavailable_launcher_explains_configuration() {
        let err = UnavailableLauncher.launch().err().expect("error");
        assert!(err.to_string().contains("webdriver_url"));
    }

    /// Verifies screenshot names cannot leave the screenshot directory.
    #[test]
    fn screenshots_stay_in_their_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = save_screenshot(temp.path(), Some("../../evil"), b"png").expect("save");
        assert_eq!(path, temp.path().join("evil.png"));
        let generated = save_screenshot(temp.path(), None, b"png").expect("save");
        assert!(generated.starts_with(temp.path()));
        assert!(generated.to_string_lossy().ends_with(".png"));
    }
}
