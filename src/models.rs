//! Serde models for the persisted browser session state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use chromiumoxide::cdp::browser_protocol::network::CookieSameSite;

/// Cookie shape stored in the session-state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializableCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    #[serde(default)]
    pub expires: Option<f64>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub same_site: Option<CookieSameSite>,
}

/// Local storage snapshot for the Telegram Web origin.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LocalStorageState {
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub items: HashMap<String, String>,
}

/// Everything needed to come back logged in: cookies plus localStorage,
/// captured after a successful login and restored at every launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub cookies: Vec<SerializableCookie>,
    #[serde(default)]
    pub local_storage: LocalStorageState,
    #[serde(default)]
    pub saved_at: String,
}
