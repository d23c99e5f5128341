//! Page classification engine.
//!
//! Maps a (final URL, page text) pair to a probe verdict: does the portal
//! consider this account real, absent, or did it detect the automation?
//! Everything here is a pure function of its inputs, no I/O and no clocks,
//! so the priority ordering and marker tables can be tested exhaustively.

use serde::{Deserialize, Serialize};

use crate::task::Outcome;

/// Explicit "no such account" messages. Matching any of these in the page
/// text is a definitive invalid signal.
pub const INVALID_MARKERS: &[&str] = &[
    "account not found",
    "we couldn't find",
    "couldn't find",
    "no account",
    "not registered",
    "no user found",
    "email not found",
    "invalid email",
];

/// Substrings indicating the portal has flagged or blocked the session:
/// CAPTCHAs, rate limits, torn-down windows, corrupted responses. The
/// generic "please try again" banner text is deliberately absent here; it
/// only escalates through [`UnknownErrorDebounce`].
pub const DETECTION_MARKERS: &[&str] = &[
    "access denied",
    "unusual traffic",
    "have detected",
    "captcha",
    "recaptcha",
    "blocked",
    "error 403",
    "error 429",
    "corrupt",
    "corrupted",
    "connection reset",
    "no such window",
    "web view not found",
    "target window already closed",
    "something went wrong",
    "temporary issue",
    "service unavailable",
    "try again later",
    "browser not supported",
    "javascript required",
    "cookies required",
    "request blocked",
    "access restricted",
    "verification required",
];

/// The generic error banner the portal shows both during normal page loads
/// and when it silently blocks a session. Too noisy to act on from a single
/// sample; see [`UnknownErrorDebounce`].
pub const UNKNOWN_ERROR_MARKERS: &[&str] = &["an unknown error occurred", "unknown error occurred"];

/// Reason string produced when classification found nothing conclusive.
/// Callers must re-check once before accepting this as final.
pub const FALLBACK_INVALID: &str = "fallback_invalid";

/// Classification policy knobs.
///
/// Whether the password signal outranks detection markers is a judgement
/// call that has flipped before, so the ordering is a policy field rather
/// than a hard-coded truth. `password_first` is the default and the
/// better-behaved variant: a password prompt is proof the email was
/// accepted, even on a page that also happens to mention a captcha.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyPolicy {
    pub password_first: bool,
    /// URL fragment marking the password-entry step.
    pub password_url_fragment: String,
}

impl Default for ClassifyPolicy {
    fn default() -> Self {
        Self {
            password_first: true,
            password_url_fragment: "/password".to_string(),
        }
    }
}

/// True when the URL or markup shows the portal advanced to password entry.
pub fn password_signal(policy: &ClassifyPolicy, url: &str, text: &str) -> bool {
    url.contains(&policy.password_url_fragment)
        || text.contains("input type='password'")
        || text.contains("input type=\"password\"")
        || text.contains("name=\"password\"")
}

/// First matching invalid marker in the page text, if any.
pub fn first_invalid_marker(text: &str) -> Option<&'static str> {
    INVALID_MARKERS.iter().copied().find(|m| text.contains(m))
}

/// First matching detection marker in the URL or page text, if any.
pub fn first_detection_marker(url: &str, text: &str) -> Option<&'static str> {
    DETECTION_MARKERS
        .iter()
        .copied()
        .find(|m| url.contains(m) || text.contains(m))
}

/// True when the page shows the debounced generic-error banner.
pub fn has_unknown_error(text: &str) -> bool {
    UNKNOWN_ERROR_MARKERS.iter().any(|m| text.contains(m))
}

/// Classify a settled page. Inputs are lowercased internally; identical
/// inputs always yield identical outputs.
///
/// Priority (with `password_first`): password signal, invalid markers,
/// detection markers, fallback-invalid. The caller owns the two stateful
/// refinements that cannot live in a pure function: the unknown-error
/// debounce during transition monitoring, and the single fallback re-check.
pub fn classify(policy: &ClassifyPolicy, final_url: &str, page_text: &str) -> Outcome {
    let url = final_url.to_lowercase();
    let text = page_text.to_lowercase();

    if policy.password_first && password_signal(policy, &url, &text) {
        return Outcome::Valid {
            reason: "password_page".to_string(),
        };
    }

    if let Some(marker) = first_invalid_marker(&text) {
        return Outcome::Invalid {
            reason: format!("invalid_marker:{marker}"),
        };
    }

    if let Some(marker) = first_detection_marker(&url, &text) {
        return Outcome::Detected {
            reason: format!("detected_marker:{marker}"),
        };
    }

    if !policy.password_first && password_signal(policy, &url, &text) {
        return Outcome::Valid {
            reason: "password_page".to_string(),
        };
    }

    Outcome::Invalid {
        reason: FALLBACK_INVALID.to_string(),
    }
}

/// Upgrade an inconclusive verdict when the post-submit URL moved.
///
/// A changed URL with no explicit rejection is evidence of progression past
/// the email check. Explicit invalid markers and detections are never
/// overridden.
pub fn apply_url_change_override(outcome: Outcome, url_changed: bool) -> Outcome {
    if !url_changed {
        return outcome;
    }
    match &outcome {
        Outcome::Invalid { reason } if !reason.starts_with("invalid_marker:") => Outcome::Valid {
            reason: "url_changed_redirect".to_string(),
        },
        _ => outcome,
    }
}

/// Debounce counter for the generic "unknown error" banner.
///
/// The banner must be observed on `threshold` consecutive samples before it
/// escalates to a detection; a single transient sighting during page load is
/// ignored. Sampling cadence and the post-submit grace window are owned by
/// the probe monitor loop.
#[derive(Debug, Clone)]
pub struct UnknownErrorDebounce {
    threshold: u32,
    seen: u32,
}

impl UnknownErrorDebounce {
    pub fn new(threshold: u32) -> Self {
        Self { threshold, seen: 0 }
    }

    /// Feed one sample. Returns true once the marker has persisted for
    /// `threshold` consecutive samples.
    pub fn observe(&mut self, marker_present: bool) -> bool {
        if marker_present {
            self.seen += 1;
        } else {
            if self.seen > 0 {
                tracing::debug!(seen = self.seen, "unknown-error banner cleared, was transient");
            }
            self.seen = 0;
        }
        self.seen >= self.threshold
    }

    pub fn consecutive_seen(&self) -> u32 {
        self.seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ClassifyPolicy {
        ClassifyPolicy::default()
    }

    #[test]
    fn classify_is_deterministic() {
        let inputs = [
            ("https://portal.example.com/password", "enter your password"),
            ("https://portal.example.com/login", "account not found"),
            ("https://portal.example.com/login", "please solve the captcha"),
            ("https://portal.example.com/login", "welcome"),
        ];
        for (url, text) in inputs {
            assert_eq!(
                classify(&policy(), url, text),
                classify(&policy(), url, text)
            );
        }
    }

    #[test]
    fn password_url_is_valid() {
        let outcome = classify(&policy(), "https://portal.example.com/password", "loading");
        assert_eq!(
            outcome,
            Outcome::Valid {
                reason: "password_page".into()
            }
        );
    }

    #[test]
    fn password_markup_is_valid() {
        let outcome = classify(
            &policy(),
            "https://portal.example.com/login",
            "<input type=\"password\" name=\"password\">",
        );
        assert!(outcome.is_valid());
    }

    #[test]
    fn password_signal_outranks_detection_markers() {
        // Password page that also happens to mention a captcha widget.
        let outcome = classify(
            &policy(),
            "https://portal.example.com/password",
            "complete the captcha below",
        );
        assert_eq!(
            outcome,
            Outcome::Valid {
                reason: "password_page".into()
            }
        );
    }

    #[test]
    fn detection_first_ordering_flips_the_tie() {
        let detection_first = ClassifyPolicy {
            password_first: false,
            ..ClassifyPolicy::default()
        };
        let outcome = classify(
            &detection_first,
            "https://portal.example.com/password",
            "complete the captcha below",
        );
        assert!(outcome.is_detected());
    }

    #[test]
    fn invalid_marker_maps_with_reason() {
        let outcome = classify(
            &policy(),
            "https://portal.example.com/login",
            "Sorry, account not found for that address",
        );
        assert_eq!(
            outcome,
            Outcome::Invalid {
                reason: "invalid_marker:account not found".into()
            }
        );
    }

    #[test]
    fn invalid_markers_outrank_detection_markers() {
        let outcome = classify(
            &policy(),
            "https://portal.example.com/login",
            "account not found - complete the captcha to retry",
        );
        assert!(outcome.is_invalid());
    }

    #[test]
    fn detection_marker_maps_with_reason() {
        let outcome = classify(&policy(), "https://portal.example.com/login", "captcha");
        assert_eq!(
            outcome,
            Outcome::Detected {
                reason: "detected_marker:captcha".into()
            }
        );
    }

    #[test]
    fn detection_marker_in_url_counts() {
        let outcome = classify(
            &policy(),
            "https://portal.example.com/blocked",
            "redirecting",
        );
        assert!(outcome.is_detected());
    }

    #[test]
    fn unknown_error_is_not_an_immediate_detection() {
        // The full banner, retry suffix included, must not match the plain
        // detection table; it only escalates through the debounce.
        let outcome = classify(
            &policy(),
            "https://portal.example.com/login",
            "An unknown error occurred. Please try again.",
        );
        assert!(!outcome.is_detected());
        assert!(has_unknown_error(
            &"An unknown error occurred. Please try again.".to_lowercase()
        ));
    }

    #[test]
    fn fallback_when_nothing_matches() {
        let outcome = classify(&policy(), "https://portal.example.com/login", "welcome back");
        assert_eq!(
            outcome,
            Outcome::Invalid {
                reason: FALLBACK_INVALID.into()
            }
        );
    }

    #[test]
    fn url_change_upgrades_fallback() {
        let fallback = Outcome::Invalid {
            reason: FALLBACK_INVALID.into(),
        };
        let upgraded = apply_url_change_override(fallback, true);
        assert_eq!(
            upgraded,
            Outcome::Valid {
                reason: "url_changed_redirect".into()
            }
        );
    }

    #[test]
    fn url_change_does_not_override_explicit_invalid() {
        let explicit = Outcome::Invalid {
            reason: "invalid_marker:no account".into(),
        };
        assert_eq!(
            apply_url_change_override(explicit.clone(), true),
            explicit
        );
    }

    #[test]
    fn url_change_does_not_override_detection() {
        let detected = Outcome::Detected {
            reason: "detected_marker:captcha".into(),
        };
        assert_eq!(
            apply_url_change_override(detected.clone(), true),
            detected
        );
    }

    #[test]
    fn unchanged_url_leaves_fallback_alone() {
        let fallback = Outcome::Invalid {
            reason: FALLBACK_INVALID.into(),
        };
        assert_eq!(
            apply_url_change_override(fallback.clone(), false),
            fallback
        );
    }

    #[test]
    fn debounce_requires_three_consecutive_sightings() {
        let mut debounce = UnknownErrorDebounce::new(3);
        assert!(!debounce.observe(true));
        assert!(!debounce.observe(true));
        assert!(debounce.observe(true));
    }

    #[test]
    fn debounce_resets_when_banner_clears() {
        let mut debounce = UnknownErrorDebounce::new(3);
        assert!(!debounce.observe(true));
        assert!(!debounce.observe(true));
        assert!(!debounce.observe(false));
        assert_eq!(debounce.consecutive_seen(), 0);
        assert!(!debounce.observe(true));
        assert!(!debounce.observe(true));
        assert!(debounce.observe(true));
    }

    #[test]
    fn unknown_error_marker_detection() {
        assert!(has_unknown_error("an unknown error occurred. please try again."));
        assert!(has_unknown_error("unknown error occurred"));
        assert!(!has_unknown_error("everything is fine"));
    }
}
