//! Secret types for values that must never reach a log line.
//!
//! Re-exports [`secrecy`] so services name one path for secrets. Connection
//! strings such as `REDIS_URL` routinely embed passwords
//! (`redis://:pw@host:6379`), so the coordinator keeps them as
//! [`SecretString`] from the moment they are read from the environment.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! let url = SecretString::from("redis://:hunter2@cache:6379");
//! assert!(!format!("{url:?}").contains("hunter2"));
//! assert!(url.expose_secret().starts_with("redis://"));
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_string_is_redacted() {
        let secret = SecretString::from("redis://:hunter2@cache:6379");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("hunter2"));
    }

    #[test]
    fn test_struct_holding_secret_is_safe_to_debug() {
        #[allow(dead_code)]
        #[derive(Debug)]
        struct StoreSettings {
            key_prefix: String,
            url: SecretString,
        }

        let settings = StoreSettings {
            key_prefix: "room".to_string(),
            url: SecretString::from("redis://:pw@localhost"),
        };

        let debug_str = format!("{settings:?}");
        assert!(debug_str.contains("room"));
        assert!(!debug_str.contains(":pw@"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("redis://localhost:6379");
        assert_eq!(secret.expose_secret(), "redis://localhost:6379");
    }
}
