//! Minimal W3C WebDriver client for an already running chromedriver.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{Driver, DriverError, DriverFactory};
use crate::config::BrowserSettings;

/// W3C key under which element references are returned.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

pub struct WebDriverFactory {
    client: Client,
    settings: BrowserSettings,
}

impl WebDriverFactory {
    pub fn new(settings: BrowserSettings) -> Result<Self, DriverError> {
        let client = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| DriverError::Protocol(e.to_string()))?;
        Ok(WebDriverFactory { client, settings })
    }

    fn capabilities(&self) -> Value {
        let mut args = vec![
            "--disable-blink-features=AutomationControlled".to_string(),
            "--disable-gpu".to_string(),
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            format!("user-agent={}", self.settings.user_agent),
        ];
        if self.settings.headless {
            args.push("--headless=new".to_string());
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": {
                        "args": args,
                        "excludeSwitches": ["enable-automation"],
                    },
                    "timeouts": { "pageLoad": self.settings.page_load_timeout_ms },
                }
            }
        })
    }
}

#[async_trait]
impl DriverFactory for WebDriverFactory {
    async fn session(&self) -> Result<Box<dyn Driver>, DriverError> {
        let url = format!("{}/session", self.settings.webdriver_url.trim_end_matches('/'));
        let value = send(&self.client, Method::POST, &url, Some(self.capabilities())).await?;
        let id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Protocol("new session response without sessionId".into()))?;
        debug!("Opened webdriver session {}", id);
        Ok(Box::new(WebDriverSession {
            client: self.client.clone(),
            base: format!("{}/session/{}", self.settings.webdriver_url.trim_end_matches('/'), id),
            closed: false,
        }))
    }
}

pub struct WebDriverSession {
    client: Client,
    base: String,
    closed: bool,
}

impl WebDriverSession {
    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, DriverError> {
        send(&self.client, method, &format!("{}{}", self.base, path), body).await
    }

    async fn find(&self, selector: &str) -> Result<String, DriverError> {
        let (using, value) = locator(selector);
        let found = self
            .call(Method::POST, "/element", Some(json!({ "using": using, "value": value })))
            .await?;
        found
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| DriverError::ElementNotFound(selector.to_string()))
    }
}

#[async_trait]
impl Driver for WebDriverSession {
    async fn open(&mut self, url: &str) -> Result<(), DriverError> {
        debug!("Navigating to {}", url);
        self.call(Method::POST, "/url", Some(json!({ "url": url }))).await?;
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<(), DriverError> {
        let id = self.find(selector).await?;
        // Center the element first; overlays on the reply panel swallow edge clicks.
        let _ = self
            .call(
                Method::POST,
                "/execute/sync",
                Some(json!({
                    "script": "arguments[0].scrollIntoView({block: 'center'});",
                    "args": [{ ELEMENT_KEY: id }],
                })),
            )
            .await;
        self.call(Method::POST, &format!("/element/{}/click", id), Some(json!({})))
            .await?;
        Ok(())
    }

    async fn read_text(&mut self, selector: &str) -> Result<String, DriverError> {
        let id = self.find(selector).await?;
        let value = self.call(Method::GET, &format!("/element/{}/text", id), None).await?;
        Ok(value.as_str().unwrap_or_default().trim().to_string())
    }

    async fn current_page_html(&mut self) -> Result<String, DriverError> {
        let value = self.call(Method::GET, "/source", None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.call(Method::DELETE, "", None).await?;
        Ok(())
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if !self.closed {
            warn!("Webdriver session {} dropped without close", self.base);
        }
    }
}

/// `xpath:` prefix selects the XPath strategy, anything else is CSS.
fn locator(selector: &str) -> (&'static str, &str) {
    match selector.strip_prefix("xpath:") {
        Some(xpath) => ("xpath", xpath),
        None => ("css selector", selector),
    }
}

async fn send(client: &Client, method: Method, url: &str, body: Option<Value>) -> Result<Value, DriverError> {
    let mut req = client.request(method, url);
    if let Some(body) = body {
        req = req.json(&body);
    }
    let resp = req.send().await.map_err(transport_error)?;
    let status = resp.status();
    let payload: Value = resp.json().await.map_err(|e| {
        if status.is_server_error() {
            DriverError::Network(format!("HTTP {}: {}", status, e))
        } else {
            DriverError::Protocol(format!("HTTP {}: unreadable body: {}", status, e))
        }
    })?;
    let value = payload.get("value").cloned().unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(value);
    }
    let code = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Err(classify(code, message))
}

fn transport_error(e: reqwest::Error) -> DriverError {
    if e.is_timeout() {
        DriverError::Timeout(e.to_string())
    } else {
        DriverError::Network(e.to_string())
    }
}

/// Map a W3C error code onto the retry taxonomy.
fn classify(code: &str, message: String) -> DriverError {
    match code {
        "timeout" | "script timeout" => DriverError::Timeout(message),
        "invalid session id" | "session not created" | "stale element reference" => {
            DriverError::StaleSession(message)
        }
        "no such element" => DriverError::ElementNotFound(message),
        "element click intercepted" | "element not interactable" => DriverError::StaleSession(message),
        "no such window" | "unexpected alert open" => DriverError::StaleSession(message),
        "invalid argument" | "invalid selector" => DriverError::InvalidArgument(message),
        "unknown error" if message.contains("net::ERR_") => DriverError::Network(message),
        "unknown error" if is_lost_tab(&message) => DriverError::StaleSession(message),
        other => DriverError::Protocol(format!("{}: {}", other, message)),
    }
}

/// chromedriver reports crashed or detached tabs as `unknown error`.
fn is_lost_tab(message: &str) -> bool {
    const MARKERS: &[&str] = &[
        "page crash",
        "session deleted",
        "disconnected",
        "cannot determine loading status",
        "target window already closed",
    ];
    let lower = message.to_ascii_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Classify;

    #[test]
    fn xpath_prefix() {
        assert_eq!(locator("xpath://button"), ("xpath", "//button"));
        assert_eq!(locator("button.reply-button"), ("css selector", "button.reply-button"));
    }

    #[test]
    fn w3c_codes() {
        assert!(matches!(classify("no such element", String::new()), DriverError::ElementNotFound(_)));
        assert!(classify("timeout", String::new()).is_retryable());
        assert!(classify("invalid session id", String::new()).is_retryable());
        assert!(classify("unknown error", "net::ERR_CONNECTION_RESET".into()).is_retryable());
        assert!(!classify("invalid selector", String::new()).is_retryable());
    }

    #[test]
    fn lost_tabs_are_retryable() {
        let cases = [
            ("unknown error", "session deleted because of page crash"),
            ("unknown error", "cannot determine loading status\nfrom tab crashed"),
            ("unknown error", "disconnected: not connected to DevTools"),
            ("no such window", "target window already closed"),
            ("unexpected alert open", "{Alert text : Leave site?}"),
        ];
        for (code, message) in cases {
            let err = classify(code, message.to_string());
            assert!(matches!(err, DriverError::StaleSession(_)), "{code}: {err:?}");
            assert!(err.is_retryable());
        }
        assert!(!classify("unknown error", "chrome not reachable at startup".into()).is_retryable());
    }

    #[test]
    fn headless_flag_in_capabilities() {
        let factory = WebDriverFactory::new(BrowserSettings::default()).unwrap();
        let caps = factory.capabilities();
        let args = caps["capabilities"]["alwaysMatch"]["goog:chromeOptions"]["args"]
            .as_array()
            .unwrap();
        assert!(args.iter().any(|a| a == "--headless=new"));
    }
}
