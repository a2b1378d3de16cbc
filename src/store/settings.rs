//! Persisted engine configuration

use serde::{Deserialize, Serialize};

/// Engine settings, persisted as a single local row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Retry bound for optimistic-concurrency transactions
    pub max_transaction_retries: u32,
    /// Whether data-only push payloads are rendered as local notifications
    pub enable_notifications: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_transaction_retries: 5,
            enable_notifications: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_default() {
        let settings = Settings::default();
        assert_eq!(settings.max_transaction_retries, 5);
        assert!(settings.enable_notifications);
    }
}
