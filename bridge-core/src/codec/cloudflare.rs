//! Cloudflare interstitial-challenge detection (spec §4.A).
//!
//! A single match anywhere in an accumulated buffer, or an upstream error
//! message, is enough to raise `error(cloudflare, ...)`.

const MARKERS: &[&str] = &[
    "Just a moment",
    "cf-browser-verification",
    "Checking your browser before accessing",
    "challenge-platform",
    "Enable JavaScript and cookies to continue",
];

/// Returns a human-readable message if `text` looks like a Cloudflare
/// interstitial, otherwise `None`.
pub fn detect(text: &str) -> Option<String> {
    for marker in MARKERS {
        if text.contains(marker) {
            return Some(
                "The upstream returned a Cloudflare challenge page; the browser peer has been \
                 asked to refresh. Please complete the challenge and retry."
                    .to_string(),
            );
        }
    }
    None
}
