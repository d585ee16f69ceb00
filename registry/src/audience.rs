//! Audience resolution: maps an incoming hostname to a local/anycast
//! signing domain, optionally qualified by a domain-remap account name.

use crate::config::Config;
use crate::validation::is_valid_account_name;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audience {
    pub anycast: bool,
    pub account_name: String,
}

impl Audience {
    pub fn is_domain_remapped(&self) -> bool {
        !self.account_name.is_empty()
    }

    /// Inverse of `identify_audience`: reconstructs `head.tail` when an
    /// account name is present.
    pub fn hostname(&self, cfg: &Config) -> String {
        let tail = if self.anycast {
            cfg.anycast_api_public_hostname
                .clone()
                .unwrap_or_else(|| cfg.api_public_hostname.clone())
        } else {
            cfg.api_public_hostname.clone()
        };
        if self.account_name.is_empty() {
            tail
        } else {
            format!("{}.{}", self.account_name, tail)
        }
    }

    /// The signing/verification key set valid for this audience: the
    /// anycast keys for anycast audiences, otherwise the local keys.
    /// Index 0 is the active signing key.
    pub fn issuer_keys<'a>(&self, cfg: &'a Config) -> &'a [crate::config::IssuerKey] {
        if self.anycast {
            &cfg.anycast_issuer_keys
        } else {
            &cfg.issuer_keys
        }
    }
}

/// Resolves the audience for hostname `h` against the configured public
/// hostnames.
pub fn identify_audience(h: &str, cfg: &Config) -> Audience {
    if h == cfg.api_public_hostname {
        return Audience {
            anycast: false,
            account_name: String::new(),
        };
    }
    if let Some(anycast_host) = &cfg.anycast_api_public_hostname {
        if h == anycast_host {
            return Audience {
                anycast: true,
                account_name: String::new(),
            };
        }
    }

    if let Some((head, tail)) = h.split_once('.') {
        if is_valid_account_name(head) {
            if tail == cfg.api_public_hostname {
                return Audience {
                    anycast: false,
                    account_name: head.to_string(),
                };
            }
            if let Some(anycast_host) = &cfg.anycast_api_public_hostname {
                if tail == anycast_host {
                    return Audience {
                        anycast: true,
                        account_name: head.to_string(),
                    };
                }
            }
        }
    }

    Audience {
        anycast: false,
        account_name: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    #[test]
    fn exact_local_hostname_resolves_default() {
        let cfg = test_config();
        let a = identify_audience(&cfg.api_public_hostname.clone(), &cfg);
        assert_eq!(a, Audience { anycast: false, account_name: String::new() });
    }

    #[test]
    fn exact_anycast_hostname_resolves_anycast() {
        let cfg = test_config();
        let anycast = cfg.anycast_api_public_hostname.clone().unwrap();
        let a = identify_audience(&anycast, &cfg);
        assert!(a.anycast);
        assert!(a.account_name.is_empty());
    }

    #[test]
    fn domain_remapped_local_hostname_resolves_account() {
        let cfg = test_config();
        let h = format!("test1.{}", cfg.api_public_hostname);
        let a = identify_audience(&h, &cfg);
        assert_eq!(a.account_name, "test1");
        assert!(!a.anycast);
    }

    #[test]
    fn unrecognized_hostname_is_default() {
        let cfg = test_config();
        let a = identify_audience("totally-unrelated.example.net", &cfg);
        assert_eq!(a, Audience { anycast: false, account_name: String::new() });
    }

    #[test]
    fn hostname_round_trips_for_classified_audiences() {
        let cfg = test_config();
        for h in [
            cfg.api_public_hostname.clone(),
            cfg.anycast_api_public_hostname.clone().unwrap(),
            format!("test1.{}", cfg.api_public_hostname),
        ] {
            let a = identify_audience(&h, &cfg);
            assert_eq!(a.hostname(&cfg), h);
        }
    }
}
