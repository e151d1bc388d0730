//! Browser session driver: launch, Telegram Web login, mini-app entry and
//! session-state persistence over the Chrome DevTools Protocol.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, SetCookiesParams, TimeSinceEpoch,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::Config;
use crate::models::{LocalStorageState, SerializableCookie, SessionState};

/// Telegram Web entry points. One branch breaks often enough that all three
/// are tried in order.
const TG_WEB_URLS: [&str; 3] = [
    "https://web.telegram.org/k/",
    "https://web.telegram.org/a/",
    "https://web.telegram.org/z/",
];

const GIFT_ENTRY_URL: &str = "https://t.me/gifts";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";

/// Hides `navigator.webdriver` before any page script runs.
const STEALTH_SCRIPT: &str =
    "Object.defineProperty(navigator, 'webdriver', { get: () => undefined });";

/// Re-poll interval for bounded element/text waits.
const POLL_STEP: Duration = Duration::from_millis(300);

const NAV_FULL_TIMEOUT: Duration = Duration::from_secs(60);
const NAV_FALLBACK_TIMEOUT: Duration = Duration::from_secs(90);
const ANY_CONTENT_TIMEOUT: Duration = Duration::from_secs(15);
const OPEN_APP_TIMEOUT: Duration = Duration::from_secs(5);

/// Marker for cycle failures caused by navigation timeouts, letting the
/// poll loop log them as routine rather than as errors.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct NavTimeout(pub String);

/// One launched Chrome with its CDP event drain and the entry page.
pub struct SessionDriver {
    browser: Browser,
    handler_task: JoinHandle<()>,
    page: Page,
}

impl SessionDriver {
    /// Launch Chrome with the hunting profile: fixed desktop user agent,
    /// automation fingerprint disabled, optional proxy.
    pub async fn launch(cfg: &Config) -> Result<Self> {
        let chrome_path = find_chrome_executable()?;

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .viewport(None)
            .no_sandbox()
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--window-size=1366,768")
            .arg(format!("--user-agent={}", USER_AGENT));

        if let Some(proxy) = &cfg.proxy_server {
            builder = builder.arg(format!("--proxy-server={}", proxy));
        }
        if !cfg.headless {
            builder = builder.with_head();
        }

        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {}", e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("Failed to launch browser")?;

        // Drain CDP events for the lifetime of the browser.
        let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });

        let page = browser
            .new_page("about:blank")
            .await
            .context("Failed to create initial page")?;

        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(STEALTH_SCRIPT))
            .await
            .context("Failed to install stealth script")?;

        Ok(Self {
            browser,
            handler_task,
            page,
        })
    }

    /// Navigate to Telegram Web and, if the operator is logged out, wait
    /// without bound for them to finish QR/code login, then save session
    /// state so later cycles come back logged in.
    pub async fn ensure_login(&self, cfg: &Config) -> Result<()> {
        let mut loaded = false;

        // Fast path: full load on any of the entry URLs.
        for url in TG_WEB_URLS {
            match tokio::time::timeout(NAV_FULL_TIMEOUT, self.navigate(url)).await {
                Ok(Ok(())) => {
                    loaded = true;
                    break;
                }
                Ok(Err(e)) => tracing::debug!("Failed to load {}: {}", url, e),
                Err(_) => tracing::debug!("Timed out loading {}", url),
            }
        }

        // Slow path: settle for DOM content plus any rendered element.
        if !loaded {
            for url in TG_WEB_URLS {
                match tokio::time::timeout(NAV_FALLBACK_TIMEOUT, self.page.goto(url)).await {
                    Ok(Ok(_)) => {
                        wait_for_element(&self.page, "div,button,input", ANY_CONTENT_TIMEOUT)
                            .await;
                        loaded = true;
                        break;
                    }
                    Ok(Err(e)) => tracing::debug!("Fallback load of {} failed: {}", url, e),
                    Err(_) => tracing::debug!("Fallback load of {} timed out", url),
                }
            }
        }

        if !loaded {
            return Err(NavTimeout("Telegram Web is unreachable on all entry URLs".to_string()).into());
        }

        let url = self.current_url().await?;
        if url.contains("login") || url.contains("auth") {
            tracing::info!("Log in to Telegram Web (QR or code). Waiting...");
            loop {
                tokio::time::sleep(Duration::from_secs(2)).await;
                let url = self.current_url().await?;
                if logged_in_url(&url) {
                    break;
                }
            }
            self.save_state(cfg).await?;
            tracing::info!(
                "Session state saved to {}",
                cfg.session_state_file.display()
            );
        }

        Ok(())
    }

    /// Open the gifts entry chat and launch the mini-app. Returns the page
    /// hosting the app: the newest page when the entry click spawned one,
    /// otherwise the entry page itself.
    pub async fn open_gifts_webapp(&mut self) -> Result<Page> {
        tokio::time::timeout(NAV_FALLBACK_TIMEOUT, self.navigate(GIFT_ENTRY_URL))
            .await
            .map_err(|_| NavTimeout(format!("Timed out opening {}", GIFT_ENTRY_URL)))?
            .with_context(|| format!("Failed to open {}", GIFT_ENTRY_URL))?;

        // Refresh the target registry so pre-click pages are all counted.
        let _ = self.browser.fetch_targets().await;
        let before = self.browser.pages().await.map(|p| p.len()).unwrap_or(1);

        if !click_text_button(&self.page, &["open", "открыть"], OPEN_APP_TIMEOUT).await {
            tracing::debug!("No open control on the gifts entry page; staying put");
        }
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let _ = self.browser.fetch_targets().await;
        let mut pages = self.browser.pages().await.unwrap_or_default();
        if pages.len() > before {
            if let Some(newest) = pages.pop() {
                tracing::debug!("Mini-app opened in a separate page");
                return Ok(newest);
            }
        }
        Ok(self.page.clone())
    }

    /// Restore cookies and localStorage captured by an earlier login.
    /// Returns false when no usable state file exists.
    pub async fn restore_state(&self, cfg: &Config) -> Result<bool> {
        let raw = match std::fs::read_to_string(&cfg.session_state_file) {
            Ok(raw) => raw,
            Err(_) => return Ok(false),
        };
        let state: SessionState = match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(
                    "Ignoring unreadable session state {}: {}",
                    cfg.session_state_file.display(),
                    e
                );
                return Ok(false);
            }
        };

        self.set_cookies(&state.cookies).await?;

        if !state.local_storage.items.is_empty() && !state.local_storage.origin.is_empty() {
            // localStorage is origin-scoped; land on the origin first.
            self.page
                .goto(state.local_storage.origin.as_str())
                .await
                .context("Failed to open origin for localStorage restore")?;
            self.page.wait_for_navigation().await.ok();
            self.set_local_storage(&state.local_storage).await?;
        }

        tracing::debug!(
            "Restored session state from {} (saved at {})",
            cfg.session_state_file.display(),
            state.saved_at
        );
        Ok(true)
    }

    /// Capture cookies plus localStorage into the session-state file.
    pub async fn save_state(&self, cfg: &Config) -> Result<()> {
        let state = SessionState {
            cookies: self.export_cookies().await?,
            local_storage: self.capture_local_storage().await?,
            saved_at: chrono::Utc::now().to_rfc3339(),
        };

        let data = serde_json::to_vec_pretty(&state)?;
        std::fs::write(&cfg.session_state_file, data).with_context(|| {
            format!("Failed to write {}", cfg.session_state_file.display())
        })?;
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        self.browser.close().await?;
        self.handler_task.abort();
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.page.goto(url).await.context("Navigation failed")?;
        self.page.wait_for_navigation().await.ok();
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn export_cookies(&self) -> Result<Vec<SerializableCookie>> {
        let cookies = self.page.get_cookies().await?;
        Ok(cookies
            .into_iter()
            .map(|cookie| SerializableCookie {
                name: cookie.name,
                value: cookie.value,
                domain: cookie.domain,
                path: cookie.path,
                expires: if cookie.session {
                    None
                } else {
                    Some(cookie.expires)
                },
                secure: cookie.secure,
                http_only: cookie.http_only,
                same_site: cookie.same_site,
            })
            .collect())
    }

    async fn set_cookies(&self, cookies: &[SerializableCookie]) -> Result<()> {
        if cookies.is_empty() {
            return Ok(());
        }
        let params: Vec<CookieParam> = cookies
            .iter()
            .map(|cookie| {
                let mut param = CookieParam::new(cookie.name.clone(), cookie.value.clone());
                param.domain = Some(cookie.domain.clone());
                param.path = Some(cookie.path.clone());
                param.secure = Some(cookie.secure);
                param.http_only = Some(cookie.http_only);
                param.same_site = cookie.same_site.clone();
                param.expires = cookie.expires.map(TimeSinceEpoch::new);
                param
            })
            .collect();

        self.page.execute(SetCookiesParams::new(params)).await?;
        Ok(())
    }

    async fn capture_local_storage(&self) -> Result<LocalStorageState> {
        let origin: String = self
            .page
            .evaluate("location.origin")
            .await
            .context("Failed to evaluate location.origin")?
            .into_value()
            .context("Failed to parse location.origin")?;

        let entries: Vec<(String, String)> = self
            .page
            .evaluate(
                "(() => { try { return Object.entries(localStorage); } catch (_) { return []; } })()",
            )
            .await
            .context("Failed to read localStorage entries")?
            .into_value()
            .context("Failed to parse localStorage entries")?;

        let items: HashMap<String, String> = entries.into_iter().collect();
        Ok(LocalStorageState { origin, items })
    }

    async fn set_local_storage(&self, state: &LocalStorageState) -> Result<()> {
        let payload = serde_json::to_string(&state.items)?;
        let script = format!(
            r#"(function() {{
                const items = {};
                try {{ localStorage.clear(); }} catch (_) {{}}
                for (const [k, v] of Object.entries(items)) {{
                    try {{ localStorage.setItem(k, v); }} catch (_) {{}}
                }}
            }})()"#,
            payload
        );
        self.page.evaluate(script).await?;
        Ok(())
    }
}

/// True once Telegram Web has left the login/auth surface.
pub fn logged_in_url(url: &str) -> bool {
    ["/k/", "/a/", "/z/"].iter().any(|m| url.contains(m))
}

/// Poll for a CSS selector until it appears or the bound elapses.
pub async fn wait_for_element(page: &Page, selector: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if page.find_element(selector).await.is_ok() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_STEP).await;
    }
}

/// Click the first button-like element whose text contains any needle,
/// case-insensitively. Polls until the bound elapses; false when nothing
/// matched in time. Needles must already be lower-case.
pub async fn click_text_button(page: &Page, needles: &[&str], timeout: Duration) -> bool {
    let script = match text_button_script(needles, true) {
        Ok(script) => script,
        Err(_) => return false,
    };
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(eval) = page.evaluate(script.as_str()).await {
            if let Ok(Some(true)) = eval.into_value::<Option<bool>>() {
                return true;
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_STEP).await;
    }
}

/// Wait for a button-like element whose text contains any needle and return
/// its trimmed label without clicking it.
pub async fn wait_text_button(page: &Page, needles: &[&str], timeout: Duration) -> Option<String> {
    let script = text_button_script(needles, false).ok()?;
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(eval) = page.evaluate(script.as_str()).await {
            if let Ok(Some(label)) = eval.into_value::<Option<String>>() {
                return Some(label);
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(POLL_STEP).await;
    }
}

/// Build the injected matcher. With `click` the script clicks the match and
/// yields true; without, it yields the match's trimmed label. No match
/// yields null either way.
fn text_button_script(needles: &[&str], click: bool) -> Result<String> {
    let needles_json = serde_json::to_string(needles)?;
    let action = if click {
        "el.click(); return true;"
    } else {
        "return (el.innerText || '').trim();"
    };
    Ok(format!(
        r#"(() => {{
            const needles = {needles_json};
            const els = Array.from(document.querySelectorAll('button, [role="button"], a'));
            for (const el of els) {{
                const text = (el.innerText || '').trim().toLowerCase();
                if (needles.some(n => text.includes(n))) {{
                    {action}
                }}
            }}
            return null;
        }})()"#
    ))
}

/// Write a full-page screenshot and the page HTML next to the ledgers so a
/// silent empty catalog can be diagnosed offline.
pub async fn dump_debug_artifacts(page: &Page, dir: &Path) -> Result<()> {
    let shot = page
        .screenshot(
            chromiumoxide::page::ScreenshotParams::builder()
                .format(CaptureScreenshotFormat::Png)
                .full_page(true)
                .build(),
        )
        .await?;
    tokio::fs::write(dir.join("debug_no_cards.png"), &shot).await?;

    let html = page.content().await?;
    tokio::fs::write(dir.join("debug_no_cards.html"), html).await?;
    Ok(())
}

/// Find a usable Chrome/Chromium binary: the Playwright-managed build
/// first (full Chromium, works headed for login), then system installs.
fn find_chrome_executable() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        let caches = [
            home.join(".cache/ms-playwright"),
            home.join("Library/Caches/ms-playwright"),
        ];
        for cache in caches {
            if !cache.exists() {
                continue;
            }
            if let Ok(entries) = std::fs::read_dir(&cache) {
                let mut chromium_dirs: Vec<_> = entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_name().to_string_lossy().starts_with("chromium-"))
                    .collect();
                chromium_dirs.sort_by_key(|d| std::cmp::Reverse(d.file_name()));

                for dir in chromium_dirs {
                    let candidates = [
                        dir.path().join("chrome-linux/chrome"),
                        dir.path().join("chrome-mac/Chromium.app/Contents/MacOS/Chromium"),
                    ];
                    for binary in candidates {
                        if binary.exists() {
                            tracing::info!("Using Playwright Chromium at: {:?}", binary);
                            return Ok(binary);
                        }
                    }
                }
            }
        }
    }

    let paths = [
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
    ];

    for path in &paths {
        let p = PathBuf::from(path);
        if p.exists() {
            tracing::info!("Found Chrome at: {}", path);
            return Ok(p);
        }
    }

    anyhow::bail!(
        "Chrome/Chromium not found. Install Chrome or run: npx playwright install chromium"
    )
}
