use serde::{Deserialize, Serialize};
use std::fmt;

/// Link quality classification. Ordered worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    Offline,
    Poor,
    Good,
    Excellent,
}

impl NetworkQuality {
    pub fn is_online(self) -> bool {
        self != NetworkQuality::Offline
    }
}

impl fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkQuality::Offline => write!(f, "offline"),
            NetworkQuality::Poor => write!(f, "poor"),
            NetworkQuality::Good => write!(f, "good"),
            NetworkQuality::Excellent => write!(f, "excellent"),
        }
    }
}
