//! Configuration types and defaults

use crate::{ClassCallError, IceServer, NegotiationConfig, PolitenessPolicy, TransportSettings};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Call configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallConfig {
    /// Base URL of the classroom REST API
    pub api_url: String,
    /// Base URL of the signaling WebSocket server
    pub ws_url: String,
    /// Bearer token for both REST and WebSocket
    pub auth_token: Option<String>,
    /// STUN/TURN servers
    pub ice_servers: Vec<IceServer>,
    /// Restrict ICE to relay candidates
    pub force_relay: bool,
    /// Length of the diagnostics window
    pub diagnostics_window: Duration,
    /// How long a stable call waits for the playback report before the
    /// diagnostics window closes
    pub playback_grace: Duration,
    /// Delay between checks for late local media
    pub media_retry_interval: Duration,
    /// Number of checks for late local media
    pub media_retry_attempts: u32,
    /// How collision politeness is assigned
    pub politeness_policy: PolitenessPolicy,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000/api/".to_string(),
            ws_url: "ws://localhost:8000".to_string(),
            auth_token: None,
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
            ],
            force_relay: false,
            diagnostics_window: classcall_diagnostics::DEFAULT_WINDOW,
            playback_grace: classcall_diagnostics::PLAYBACK_GRACE,
            media_retry_interval: Duration::from_millis(500),
            media_retry_attempts: 20,
            politeness_policy: PolitenessPolicy::default(),
        }
    }
}

impl CallConfig {
    /// Defaults overridden by `CLASSCALL_*` environment variables
    pub fn from_env() -> Result<Self, ClassCallError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ClassCallError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(url) = lookup("CLASSCALL_API_URL") {
            config.api_url = url;
        }
        if let Some(url) = lookup("CLASSCALL_WS_URL") {
            config.ws_url = url;
        }
        if let Some(token) = lookup("CLASSCALL_TOKEN") {
            config.auth_token = Some(token);
        }
        if let Some(value) = lookup("CLASSCALL_FORCE_RELAY") {
            config.force_relay = parse_flag("CLASSCALL_FORCE_RELAY", &value)?;
        }
        if let Some(value) = lookup("CLASSCALL_DIAGNOSTICS_WINDOW_SECS") {
            let secs = value.trim().parse::<u64>().map_err(|_| ClassCallError::Initialization {
                reason: format!("CLASSCALL_DIAGNOSTICS_WINDOW_SECS must be a number, got {value:?}"),
            })?;
            config.diagnostics_window = Duration::from_secs(secs);
        }

        if let Some(url) = lookup("CLASSCALL_TURN_URL") {
            let username = lookup("CLASSCALL_TURN_USERNAME").ok_or_else(|| {
                ClassCallError::MissingConfiguration {
                    field: "CLASSCALL_TURN_USERNAME".to_string(),
                }
            })?;
            let credential = lookup("CLASSCALL_TURN_CREDENTIAL").ok_or_else(|| {
                ClassCallError::MissingConfiguration {
                    field: "CLASSCALL_TURN_CREDENTIAL".to_string(),
                }
            })?;
            config.ice_servers.push(IceServer::turn(url, username, credential));
        }

        if config.force_relay && !config.ice_servers.iter().any(IceServer::is_relay) {
            return Err(ClassCallError::MissingConfiguration {
                field: "CLASSCALL_TURN_URL".to_string(),
            });
        }
        Ok(config)
    }

    /// Engine-relevant subset
    pub fn negotiation_config(&self) -> NegotiationConfig {
        NegotiationConfig {
            media_retry_interval: self.media_retry_interval,
            media_retry_attempts: self.media_retry_attempts,
        }
    }

    /// Settings for new transport endpoints
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            ice_servers: self.ice_servers.clone(),
            force_relay: self.force_relay,
        }
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ClassCallError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ClassCallError::Initialization {
            reason: format!("{name} must be a boolean, got {value:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.diagnostics_window, Duration::from_secs(20));
        assert_eq!(config.playback_grace, Duration::from_secs(2));
        assert_eq!(config.media_retry_attempts, 20);
        assert!(!config.force_relay);
        assert!(config.ice_servers.iter().all(|s| !s.is_relay()));
        assert_eq!(config.politeness_policy, PolitenessPolicy::ByRole);
    }

    #[test]
    fn test_environment_overrides() {
        let config = CallConfig::from_lookup(lookup(&[
            ("CLASSCALL_API_URL", "https://school.example/api/"),
            ("CLASSCALL_WS_URL", "wss://school.example"),
            ("CLASSCALL_TOKEN", "abc"),
            ("CLASSCALL_FORCE_RELAY", "true"),
            ("CLASSCALL_TURN_URL", "turn:turn.school.example:3478"),
            ("CLASSCALL_TURN_USERNAME", "user"),
            ("CLASSCALL_TURN_CREDENTIAL", "pass"),
        ]))
        .unwrap();
        assert_eq!(config.api_url, "https://school.example/api/");
        assert_eq!(config.auth_token.as_deref(), Some("abc"));
        assert!(config.force_relay);
        assert!(config.transport_settings().ice_servers.iter().any(IceServer::is_relay));
    }

    #[test]
    fn test_forced_relay_requires_turn_server() {
        let err = CallConfig::from_lookup(lookup(&[("CLASSCALL_FORCE_RELAY", "1")])).unwrap_err();
        assert_eq!(err.error_code(), "MISSING_CONFIGURATION");

        let err = CallConfig::from_lookup(lookup(&[("CLASSCALL_FORCE_RELAY", "maybe")])).unwrap_err();
        assert_eq!(err.error_code(), "INITIALIZATION_FAILED");
    }
}
