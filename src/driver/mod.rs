//! Browser automation seam.
//!
//! Stages talk to a [`Driver`] session and never to a concrete browser. One
//! session belongs to exactly one task; [`DriverFactory`] hands out a fresh one
//! per attempt so a stale session never leaks into a retry.

pub mod webdriver;

use std::time::Duration;

use async_trait::async_trait;

use crate::retry::Classify;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("network error: {0}")]
    Network(String),
    /// The site answered with its anti-bot / rate-limit page.
    #[error("blocked by site: {0}")]
    Blocked(String),
    #[error("browser session is gone: {0}")]
    StaleSession(String),
    #[error("no element matches {0}")]
    ElementNotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("webdriver protocol error: {0}")]
    Protocol(String),
}

impl Classify for DriverError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::Timeout(_)
                | DriverError::Network(_)
                | DriverError::Blocked(_)
                | DriverError::StaleSession(_)
        )
    }
}

/// One exclusive browser session.
#[async_trait]
pub trait Driver: Send {
    async fn open(&mut self, url: &str) -> Result<(), DriverError>;
    async fn click(&mut self, selector: &str) -> Result<(), DriverError>;

    /// Fixed suspension point for the site's reveal animations.
    async fn wait(&mut self, duration: Duration) -> Result<(), DriverError> {
        tokio::time::sleep(duration).await;
        Ok(())
    }

    async fn read_text(&mut self, selector: &str) -> Result<String, DriverError>;
    async fn current_page_html(&mut self) -> Result<String, DriverError>;
    async fn close(&mut self) -> Result<(), DriverError>;
}

#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn session(&self) -> Result<Box<dyn Driver>, DriverError>;
}

#[cfg(test)]
pub mod testing {
    //! In-memory browser used by stage and pipeline tests.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::interrupt::InterruptRouter;

    #[derive(Default, Clone)]
    pub struct FakePage {
        pub html: String,
        /// selector -> text
        pub texts: HashMap<String, String>,
        /// Selectors that can be clicked.
        pub clickable: Vec<String>,
        /// Retryable failures `open` returns before the page loads.
        pub flaky_opens: usize,
        pub fatal: bool,
        /// Interrupts delivered to the router when the page is opened.
        pub interrupts: usize,
    }

    #[derive(Default)]
    pub struct FakeSite {
        pub pages: Mutex<HashMap<String, FakePage>>,
        pub opens: Mutex<HashMap<String, usize>>,
        pub sessions: AtomicUsize,
        pub router: Mutex<Option<Arc<InterruptRouter>>>,
    }

    impl FakeSite {
        pub fn new() -> Arc<Self> {
            Arc::new(FakeSite::default())
        }

        pub fn page(&self, url: &str, page: FakePage) {
            self.pages.lock().unwrap().insert(url.to_string(), page);
        }

        pub fn interrupt_via(&self, router: Arc<InterruptRouter>) {
            *self.router.lock().unwrap() = Some(router);
        }

        pub fn opens_of(&self, url: &str) -> usize {
            self.opens.lock().unwrap().get(url).copied().unwrap_or(0)
        }
    }

    pub struct FakeFactory(pub Arc<FakeSite>);

    #[async_trait]
    impl DriverFactory for FakeFactory {
        async fn session(&self) -> Result<Box<dyn Driver>, DriverError> {
            self.0.sessions.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeDriver {
                site: Arc::clone(&self.0),
                current: None,
            }))
        }
    }

    pub struct FakeDriver {
        site: Arc<FakeSite>,
        current: Option<FakePage>,
    }

    impl FakeDriver {
        fn page(&self) -> Result<&FakePage, DriverError> {
            self.current
                .as_ref()
                .ok_or_else(|| DriverError::InvalidArgument("no page open".into()))
        }
    }

    #[async_trait]
    impl Driver for FakeDriver {
        async fn open(&mut self, url: &str) -> Result<(), DriverError> {
            let seen = {
                let mut opens = self.site.opens.lock().unwrap();
                let n = opens.entry(url.to_string()).or_default();
                *n += 1;
                *n
            };
            let page = self
                .site
                .pages
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| DriverError::Network(format!("unknown url {url}")))?;

            if seen == 1 && page.interrupts > 0 {
                if let Some(router) = self.site.router.lock().unwrap().as_ref() {
                    for _ in 0..page.interrupts {
                        router.interrupt();
                    }
                }
            }
            if page.fatal {
                return Err(DriverError::InvalidArgument(format!("refused {url}")));
            }
            if seen <= page.flaky_opens {
                return Err(DriverError::Timeout(format!("loading {url}")));
            }
            self.current = Some(page);
            Ok(())
        }

        async fn click(&mut self, selector: &str) -> Result<(), DriverError> {
            if self.page()?.clickable.iter().any(|s| s == selector) {
                Ok(())
            } else {
                Err(DriverError::ElementNotFound(selector.to_string()))
            }
        }

        async fn wait(&mut self, _duration: Duration) -> Result<(), DriverError> {
            tokio::task::yield_now().await;
            Ok(())
        }

        async fn read_text(&mut self, selector: &str) -> Result<String, DriverError> {
            self.page()?
                .texts
                .get(selector)
                .cloned()
                .ok_or_else(|| DriverError::ElementNotFound(selector.to_string()))
        }

        async fn current_page_html(&mut self) -> Result<String, DriverError> {
            Ok(self.page()?.html.clone())
        }

        async fn close(&mut self) -> Result<(), DriverError> {
            self.current = None;
            Ok(())
        }
    }
}
