//! Chromium-backed [`ProbeSession`] over the Chrome DevTools Protocol.
//!
//! One Chromium process per session, one session per worker slot.
//! Disposable sessions launch against a throwaway `mailsweep-profile-*`
//! directory; the directory doubles as the process signature the reaper and
//! the PID discovery below both key on.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use mailsweep_core::error::AppError;
use mailsweep_core::registry::{ProcessInfo, ProcessTable, SysinfoProcessTable};
use mailsweep_core::session::{ProbeSession, ProfileMode, SessionFactory};

const ELEMENT_POLL: Duration = Duration::from_millis(250);

/// A live Chromium instance driving one portal tab.
pub struct ChromiumSession {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
    pid: Option<u32>,
    // Held for its Drop: the profile directory is removed when the session
    // closes, on every exit path.
    profile_dir: Option<TempDir>,
}

impl ProbeSession for ChromiumSession {
    async fn navigate(&self, url: &str) -> Result<(), AppError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| AppError::transport(format!("navigation to {url} failed: {e}")))?;
        Ok(())
    }

    async fn wait_for_element(&self, selector: &str, timeout: Duration) -> Result<bool, AppError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(ELEMENT_POLL).await;
        }
    }

    async fn current_url(&self) -> Result<String, AppError> {
        let url = self
            .page
            .url()
            .await
            .map_err(|e| AppError::transport(format!("could not read url: {e}")))?;
        Ok(url.unwrap_or_default())
    }

    async fn page_text(&self) -> Result<String, AppError> {
        self.page
            .content()
            .await
            .map_err(|e| AppError::transport(format!("could not read page content: {e}")))
    }

    async fn click(&self, selector: &str) -> Result<(), AppError> {
        self.page
            .find_element(selector)
            .await
            .map_err(|e| AppError::transport(format!("element {selector} not found: {e}")))?
            .click()
            .await
            .map_err(|e| AppError::transport(format!("click on {selector} failed: {e}")))?;
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), AppError> {
        self.page
            .find_element(selector)
            .await
            .map_err(|e| AppError::transport(format!("element {selector} not found: {e}")))?
            .click()
            .await
            .map_err(|e| AppError::transport(format!("focus on {selector} failed: {e}")))?
            .type_str(text)
            .await
            .map_err(|e| AppError::transport(format!("typing into {selector} failed: {e}")))?;
        Ok(())
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }

    async fn is_alive(&self) -> bool {
        self.page.url().await.is_ok()
    }

    async fn close(self) {
        let ChromiumSession {
            mut browser,
            page,
            handler_task,
            pid,
            profile_dir,
        } = self;

        let _ = page.close().await;
        if let Err(e) = browser.close().await {
            tracing::debug!(pid, error = %e, "browser close was not clean");
        }
        let _ = browser.wait().await;
        handler_task.abort();
        drop(profile_dir);
    }
}

/// Launches Chromium sessions. Cheap to clone into worker slots.
#[derive(Clone)]
pub struct ChromiumSessionFactory {
    headless: bool,
}

impl ChromiumSessionFactory {
    pub fn new(headless: bool) -> Self {
        Self { headless }
    }
}

impl SessionFactory for ChromiumSessionFactory {
    type Session = ChromiumSession;

    async fn create(&self, profile: ProfileMode) -> Result<ChromiumSession, AppError> {
        let profile_dir = match profile {
            ProfileMode::Disposable => Some(
                tempfile::Builder::new()
                    .prefix("mailsweep-profile-")
                    .tempdir()?,
            ),
            ProfileMode::Shared => None,
        };

        let mut builder = BrowserConfig::builder().no_sandbox();
        if !self.headless {
            builder = builder.with_head();
        }
        if let Some(bin) = find_chrome_binary() {
            tracing::debug!(binary = %bin.display(), "using chrome binary");
            builder = builder.chrome_executable(bin);
        }
        if let Some(dir) = &profile_dir {
            builder = builder.user_data_dir(dir.path());
        }

        let config = builder
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-translate")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::Generic(format!("browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::transport(format!("failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection
        // to work.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| AppError::transport(format!("could not open page: {e}")))?;

        let pid = profile_dir
            .as_ref()
            .and_then(|dir| discover_pid(&dir.path().to_string_lossy()));
        if pid.is_none() {
            tracing::debug!("session pid unknown, reaper will rely on the profile signature");
        }

        Ok(ChromiumSession {
            browser,
            page,
            handler_task,
            pid,
            profile_dir,
        })
    }
}

/// Find the root Chromium process for a profile directory: the matching
/// process whose parent is not itself a match.
fn pid_for_profile(processes: &[ProcessInfo], profile_path: &str) -> Option<u32> {
    let matches: Vec<&ProcessInfo> = processes
        .iter()
        .filter(|p| p.cmdline.contains(profile_path))
        .collect();
    let pids: HashSet<u32> = matches.iter().map(|p| p.pid).collect();
    matches
        .iter()
        .find(|p| p.parent.is_none_or(|parent| !pids.contains(&parent)))
        .map(|p| p.pid)
}

fn discover_pid(profile_path: &str) -> Option<u32> {
    let mut table = SysinfoProcessTable::new();
    table.refresh();
    pid_for_profile(&table.processes(), profile_path)
}

/// Locate a usable Chrome/Chromium binary.
///
/// Snap's `/snap/bin/chromium` wrapper strips unknown CLI flags and breaks
/// headless launches, so the real binary inside the snap comes first. A
/// `CHROME_BIN` override beats everything.
fn find_chrome_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    let candidates: &[&str] = &[
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ];

    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}
