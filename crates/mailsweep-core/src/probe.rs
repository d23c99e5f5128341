//! The probe flow: drive one email through the portal's entry form and
//! classify what comes back.
//!
//! The flow is submit-then-watch. After clicking submit the page is sampled
//! on a fixed interval until something decisive happens (URL transition,
//! invalid marker, debounced error banner) or the transition budget runs
//! out, then the password-field probe and final classification settle the
//! verdict. The whole attempt sits under a hard deadline that maps to
//! [`Outcome::Timeout`] instead of an error.

use std::time::Duration;

use crate::classify::{
    self, ClassifyPolicy, UnknownErrorDebounce, apply_url_change_override, classify,
};
use crate::error::AppError;
use crate::session::ProbeSession;
use crate::task::{Outcome, ProbeTiming};

/// Budget for the best-effort phone-hint capture after a valid verdict.
const HINT_TIMEOUT: Duration = Duration::from_secs(10);

/// Portal endpoint and selectors. Everything DOM-specific the engine knows
/// lives here so a portal change is a config change.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub portal_url: String,
    pub email_selector: String,
    pub submit_selector: String,
    pub password_selector: String,
    /// Link or button that opens the password-reset flow. Used only for the
    /// optional phone-hint capture.
    pub forgot_selector: String,
    /// Chase the masked phone number after a valid verdict.
    pub capture_phone_hint: bool,
    pub timing: ProbeTiming,
    pub classify: ClassifyPolicy,
}

impl ProbeConfig {
    pub fn new(portal_url: impl Into<String>) -> Self {
        Self {
            portal_url: portal_url.into(),
            email_selector: "input[type='email'], input[name='email']".into(),
            submit_selector: "button[type='submit']".into(),
            password_selector: "input[type='password'], input[name='password']".into(),
            forgot_selector: "a[href*='forgot'], a[href*='reset']".into(),
            capture_phone_hint: true,
            timing: ProbeTiming::default(),
            classify: ClassifyPolicy::default(),
        }
    }

    pub fn with_timing(mut self, timing: ProbeTiming) -> Self {
        self.timing = timing;
        self
    }
}

/// Everything one probe attempt produced.
#[derive(Debug, Clone)]
pub struct ProbeOutput {
    pub outcome: Outcome,
    pub phone_hint: Option<String>,
    pub final_url: String,
}

/// Run one probe attempt against a ready session.
///
/// Transport failures bubble up as errors and leave the rotation decision
/// to the caller; a blown deadline is a verdict, not an error.
pub async fn run_probe<S: ProbeSession>(
    session: &S,
    config: &ProbeConfig,
    email: &str,
) -> Result<ProbeOutput, AppError> {
    match tokio::time::timeout(
        config.timing.probe_deadline,
        probe_inner(session, config, email),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(email, "probe deadline elapsed");
            let final_url = session.current_url().await.unwrap_or_default();
            Ok(ProbeOutput {
                outcome: Outcome::Timeout,
                phone_hint: None,
                final_url,
            })
        }
    }
}

async fn probe_inner<S: ProbeSession>(
    session: &S,
    config: &ProbeConfig,
    email: &str,
) -> Result<ProbeOutput, AppError> {
    let timing = &config.timing;

    session.navigate(&config.portal_url).await?;

    if !session
        .wait_for_element(&config.email_selector, timing.element_timeout)
        .await?
    {
        // The form never appeared. A bot wall explains that better than a
        // slow page, so check for markers before calling it a timeout.
        let text = session.page_text().await.unwrap_or_default();
        let url = session.current_url().await.unwrap_or_default();
        if let Some(marker) =
            classify::first_detection_marker(&url.to_lowercase(), &text.to_lowercase())
        {
            return Err(AppError::Detection(format!("detected_marker:{marker}")));
        }
        return Err(AppError::Timeout(timing.element_timeout.as_secs()));
    }

    tokio::time::sleep(timing.settle).await;
    session.type_text(&config.email_selector, email).await?;

    let pre_url = session.current_url().await?;

    if !session
        .wait_for_element(&config.submit_selector, timing.submit_timeout)
        .await?
    {
        return Err(AppError::Timeout(timing.submit_timeout.as_secs()));
    }
    session.click(&config.submit_selector).await?;

    // Post-submit monitor. The grace window shields the flaky banners a
    // submit transiently shows; the debounce catches the persistent one.
    let mut debounce = UnknownErrorDebounce::new(timing.debounce_threshold);
    let started = tokio::time::Instant::now();
    let mut decisive: Option<Outcome> = None;
    let mut url_changed = false;

    for _ in 0..timing.transition_samples() {
        tokio::time::sleep(timing.sample_interval).await;
        let url = session.current_url().await?;
        let text = session.page_text().await?.to_lowercase();
        let in_grace = started.elapsed() < timing.grace;

        if url != pre_url {
            url_changed = true;
            break;
        }
        if let Some(marker) = classify::first_invalid_marker(&text) {
            decisive = Some(Outcome::Invalid {
                reason: format!("invalid_marker:{marker}"),
            });
            break;
        }
        if !in_grace {
            if let Some(marker) = classify::first_detection_marker(&url.to_lowercase(), &text) {
                decisive = Some(Outcome::Detected {
                    reason: format!("detected_marker:{marker}"),
                });
                break;
            }
            if debounce.observe(classify::has_unknown_error(&text)) {
                decisive = Some(Outcome::Detected {
                    reason: "unknown_error_debounced".into(),
                });
                break;
            }
        }
    }

    let outcome = match decisive {
        Some(outcome) => outcome,
        None => {
            if session
                .wait_for_element(&config.password_selector, timing.password_probe_timeout)
                .await?
            {
                Outcome::Valid {
                    reason: "password_page".into(),
                }
            } else {
                let url = session.current_url().await?;
                let text = session.page_text().await?;
                let mut verdict = classify(&config.classify, &url, &text);
                if matches!(&verdict, Outcome::Invalid { reason } if reason == classify::FALLBACK_INVALID)
                {
                    // One re-check: slow pages routinely settle within 1.5 s
                    // and a late detection wall must win over the fallback.
                    tokio::time::sleep(timing.recheck_delay).await;
                    let url = session.current_url().await?;
                    let text = session.page_text().await?;
                    verdict = classify(&config.classify, &url, &text);
                }
                let url = session.current_url().await?;
                apply_url_change_override(verdict, url_changed || url != pre_url)
            }
        }
    };

    let phone_hint = if outcome.is_valid() && config.capture_phone_hint {
        capture_phone_hint(session, config).await
    } else {
        None
    };

    let final_url = session.current_url().await.unwrap_or_default();
    Ok(ProbeOutput {
        outcome,
        phone_hint,
        final_url,
    })
}

/// Best effort only. Any failure here leaves the verdict untouched.
async fn capture_phone_hint<S: ProbeSession>(
    session: &S,
    config: &ProbeConfig,
) -> Option<String> {
    match session
        .wait_for_element(&config.forgot_selector, Duration::from_secs(2))
        .await
    {
        Ok(true) => {}
        _ => return None,
    }
    if session.click(&config.forgot_selector).await.is_err() {
        return None;
    }

    let deadline = tokio::time::Instant::now() + HINT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if let Ok(text) = session.page_text().await {
            if let Some(hint) = parse_phone_hint(&text) {
                tracing::debug!(hint, "phone hint captured");
                return Some(hint);
            }
        }
        tokio::time::sleep(config.timing.sample_interval).await;
    }
    None
}

/// Pull the trailing digits out of a masked "ending in ••• 12" phrase and
/// normalise them to the `***NN` display form.
pub fn parse_phone_hint(page_text: &str) -> Option<String> {
    let lower = page_text.to_lowercase();
    let idx = lower.find("ending in").or_else(|| lower.find("ending with"))?;
    let tail = &lower[idx..];
    let digits: String = tail
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        None
    } else {
        Some(format!("***{digits}"))
    }
}
