use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const PLATFORM_ENV: &str = "PADEL_PLATFORM";
pub const NETWORK_TYPE_ENV: &str = "PADEL_NETWORK_EFFECTIVE_TYPE";
pub const TOUCH_ENV: &str = "PADEL_TOUCH";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Web,
    Ios,
    Android,
    Desktop,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Ios => "ios",
            Self::Android => "android",
            Self::Desktop => "desktop",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "web" => Some(Self::Web),
            "ios" => Some(Self::Ios),
            "android" => Some(Self::Android),
            "desktop" => Some(Self::Desktop),
            _ => None,
        }
    }

    /// Platform of the compilation target.
    pub fn current() -> Self {
        if cfg!(target_os = "ios") {
            Self::Ios
        } else if cfg!(target_os = "android") {
            Self::Android
        } else if cfg!(target_family = "wasm") {
            Self::Web
        } else {
            Self::Desktop
        }
    }

    pub fn is_native(self) -> bool {
        matches!(self, Self::Ios | Self::Android)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Connection class such as `4g`, `3g` or `wifi`.
    pub effective_type: String,
}

/// Host capabilities, detected once at startup. Anything the host cannot
/// tell us stays `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub platform: Platform,
    pub network: Option<NetworkInfo>,
    pub touch: Option<bool>,
}

impl Capabilities {
    pub fn detect<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let platform = match lookup(PLATFORM_ENV) {
            Some(raw) => Platform::parse(&raw).unwrap_or_else(|| {
                let fallback = Platform::current();
                warn!(
                    key = PLATFORM_ENV,
                    value = %raw,
                    fallback = fallback.as_str(),
                    "unknown platform override; using target platform"
                );
                fallback
            }),
            None => Platform::current(),
        };

        let network = lookup(NETWORK_TYPE_ENV)
            .map(|raw| raw.trim().to_ascii_lowercase())
            .filter(|raw| !raw.is_empty())
            .map(|effective_type| NetworkInfo { effective_type });

        let touch = lookup(TOUCH_ENV).and_then(|raw| parse_flag(&raw));

        let detected = Self {
            platform,
            network,
            touch,
        };
        info!(
            platform = detected.platform.as_str(),
            network = ?detected.network.as_ref().map(|info| info.effective_type.as_str()),
            touch = ?detected.touch,
            "capabilities detected"
        );
        detected
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Shared online/offline flag fed by the host's connectivity events.
#[derive(Debug, Clone)]
pub struct ConnectivityProbe {
    online: Arc<AtomicBool>,
}

impl ConnectivityProbe {
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous != online {
            info!(online, "connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn is_offline(&self) -> bool {
        !self.is_online()
    }
}

impl Default for ConnectivityProbe {
    fn default() -> Self {
        Self::new(true)
    }
}
