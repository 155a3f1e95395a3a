//! Origin allowlist for WebSocket upgrades.
//!
//! Entries are either exact origins (`https://chat.example.com`) or a
//! wildcard over subdomains (`https://*.example.com`). The apex host does not
//! match its own wildcard; list it separately if needed.

use roomcast_core::error::{Result, RoomcastError};

#[derive(Debug, Clone, PartialEq, Eq)]
enum OriginRule {
    Exact(String),
    /// `scheme` includes `://`; `suffix` starts with `.`.
    Subdomain { scheme: String, suffix: String },
}

#[derive(Debug, Clone)]
pub struct OriginAllowlist {
    rules: Vec<OriginRule>,
}

impl OriginAllowlist {
    pub fn compile(raw: &[String]) -> Result<Self> {
        let mut rules = Vec::with_capacity(raw.len());
        for entry in raw {
            let entry = entry.trim().trim_end_matches('/').to_ascii_lowercase();
            let (scheme, host) = entry.split_once("://").ok_or_else(|| {
                RoomcastError::BadRequest(format!("invalid allowed_origins entry: {entry} (expected scheme://host)"))
            })?;
            if scheme.is_empty() || host.is_empty() {
                return Err(RoomcastError::BadRequest(format!("invalid allowed_origins entry: {entry}")));
            }

            let rule = match host.strip_prefix("*.") {
                Some(rest) if !rest.is_empty() && !rest.contains('*') => OriginRule::Subdomain {
                    scheme: format!("{scheme}://"),
                    suffix: format!(".{rest}"),
                },
                Some(_) => {
                    return Err(RoomcastError::BadRequest(format!("invalid wildcard origin: {entry}")));
                }
                None if host.contains('*') => {
                    return Err(RoomcastError::BadRequest(format!("wildcard must lead the host: {entry}")));
                }
                None => OriginRule::Exact(entry.clone()),
            };
            rules.push(rule);
        }
        Ok(Self { rules })
    }

    /// A request without an `Origin` header is never allowed.
    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return false;
        };
        let origin = origin.trim().to_ascii_lowercase();

        self.rules.iter().any(|rule| match rule {
            OriginRule::Exact(o) => *o == origin,
            OriginRule::Subdomain { scheme, suffix } => origin
                .strip_prefix(scheme.as_str())
                .and_then(|host| host.strip_suffix(suffix.as_str()))
                .is_some_and(|sub| !sub.is_empty() && !sub.contains('/')),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn list(entries: &[&str]) -> OriginAllowlist {
        let raw: Vec<String> = entries.iter().map(|s| s.to_string()).collect();
        OriginAllowlist::compile(&raw).unwrap()
    }

    #[test]
    fn exact_match_ignores_case_and_trailing_slash() {
        let l = list(&["https://Chat.Example.com/"]);
        assert!(l.is_allowed(Some("https://chat.example.com")));
        assert!(!l.is_allowed(Some("http://chat.example.com")));
        assert!(!l.is_allowed(None));
    }

    #[test]
    fn wildcard_covers_subdomains_not_apex() {
        let l = list(&["https://*.example.com"]);
        assert!(l.is_allowed(Some("https://app.example.com")));
        assert!(l.is_allowed(Some("https://a.b.example.com")));
        assert!(!l.is_allowed(Some("https://example.com")));
        assert!(!l.is_allowed(Some("https://evilexample.com")));
        assert!(!l.is_allowed(Some("http://app.example.com")));
    }

    #[test]
    fn malformed_entries_are_rejected() {
        for bad in ["example.com", "https://", "https://*.", "https://a.*.com"] {
            assert!(OriginAllowlist::compile(&[bad.to_string()]).is_err(), "{bad}");
        }
    }
}
