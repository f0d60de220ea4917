//! Browser-like request headers.
//!
//! The fixed values are what the control service is told the probe sent;
//! the `random_*` variants vary across requests so that measurements are
//! not trivially fingerprintable.

use rand::seq::SliceRandom;

const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const ACCEPT_LANGUAGE: &str = "en-US;q=0.8,en;q=0.5";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/74.0.3729.169 Safari/537.36";

const ACCEPTS: &[&str] = &[
    ACCEPT,
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
];

const ACCEPT_LANGUAGES: &[&str] = &[ACCEPT_LANGUAGE, "en-US,en;q=0.9", "en-US,en;q=0.5"];

const USER_AGENTS: &[&str] = &[
    USER_AGENT,
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_4) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/83.0.4103.97 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:77.0) Gecko/20100101 Firefox/77.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:76.0) Gecko/20100101 Firefox/76.0",
];

fn pick(values: &'static [&'static str], fallback: &'static str) -> &'static str {
    values
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(fallback)
}

#[must_use]
pub fn accept() -> &'static str {
    ACCEPT
}

#[must_use]
pub fn accept_language() -> &'static str {
    ACCEPT_LANGUAGE
}

#[must_use]
pub fn user_agent() -> &'static str {
    USER_AGENT
}

#[must_use]
pub fn random_accept() -> &'static str {
    pick(ACCEPTS, ACCEPT)
}

#[must_use]
pub fn random_accept_language() -> &'static str {
    pick(ACCEPT_LANGUAGES, ACCEPT_LANGUAGE)
}

#[must_use]
pub fn random_user_agent() -> &'static str {
    pick(USER_AGENTS, USER_AGENT)
}
