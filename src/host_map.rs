//! `HostMap` (§4.4): normalizes the `Host:` header and maps it to a
//! `{server, location, tls ctx}` binding.
//!
//! Generalized from `HttpConnection::resolve_config`'s linear scan over
//! `config_list: Vec<Arc<ServerConfig>>` by `server_name` string equality
//! into a normalized-key lookup table with port handling and a fixed
//! default, as §4.4 requires.

use crate::prelude::*;

/// `{server, tls-ctx, location}` (§3). `server_ref` is left generic over
/// whatever opaque identifier the embedding application uses for its server
/// blocks — this core never interprets it. `tls_ctx` is likewise opaque
/// (§1: "TLS library integration abstracted as an opaque per-vhost security
/// context").
#[derive(Debug, Clone)]
pub struct VHostBinding {
    pub server_ref: String,
    pub tls_ctx: Option<String>,
    pub location: String,
}

/// Normalized host -> binding table (§4.4). Immutable after startup except
/// for on-demand TLS SNI cert insertion (§5), which only ever happens on
/// the owning driver's own thread, so no lock is needed here; callers that
/// need concurrent mutation (the SNI hook) wrap a `HostMap` in their own
/// `Mutex` at that call site instead of baking one in here.
#[derive(Debug, Clone, Default)]
pub struct HostMap {
    entries: HashMap<String, VHostBinding>,
    default_key: Option<String>,
}

impl HostMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// §4.4 `insert`: `<proto>://<host>` becomes the canonical location
    /// unless the caller already built a more specific one. The first
    /// inserted entry becomes the default unless a later one is explicitly
    /// flagged.
    pub fn insert(
        &mut self,
        proto: &str,
        host: &str,
        server_ref: impl Into<String>,
        tls_ctx: Option<String>,
        is_default: bool,
    ) {
        let key = host.to_ascii_lowercase();
        let location = format!("{proto}://{host}");
        let first = self.entries.is_empty();
        self.entries.insert(
            key.clone(),
            VHostBinding {
                server_ref: server_ref.into(),
                tls_ctx,
                location,
            },
        );
        if is_default || (first && self.default_key.is_none()) {
            self.default_key = Some(key);
        }
    }

    pub fn default_binding(&self) -> Option<&VHostBinding> {
        self.default_key.as_ref().and_then(|k| self.entries.get(k))
    }

    /// §4.4 `lookup`: parses/normalizes `raw_host_header`, then tries exact
    /// port, then the driver's default port (without an explicit port
    /// suffix), then each of `listen_ports` in turn.
    pub fn lookup(&self, raw_host_header: &str, default_port: u16, listen_ports: &[u16]) -> Option<&VHostBinding> {
        let (host, port) = parse_host_header(raw_host_header)?;
        let normalized = host.to_ascii_lowercase();

        if let Some(p) = port {
            let key = format!("{normalized}:{p}");
            if let Some(b) = self.entries.get(&key) {
                return Some(b);
            }
            if p == default_port {
                if let Some(b) = self.entries.get(&normalized) {
                    return Some(b);
                }
            }
        } else if let Some(b) = self.entries.get(&normalized) {
            return Some(b);
        }

        for p in listen_ports {
            let key = format!("{normalized}:{p}");
            if let Some(b) = self.entries.get(&key) {
                return Some(b);
            }
        }

        None
    }
}

/// Parses a raw `Host:` value: trims a trailing dot (RFC 2976), recognizes
/// bracketed IP-literals, and extracts an explicit port.
fn parse_host_header(raw: &str) -> Option<(String, Option<u16>)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Some(rest) = raw.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = after.strip_prefix(':').and_then(|p| p.parse().ok());
        return Some((trim_trailing_dot(host), port));
    }

    match raw.rsplit_once(':') {
        Some((host, port_str)) if port_str.chars().all(|c| c.is_ascii_digit()) && !port_str.is_empty() => {
            Some((trim_trailing_dot(host), port_str.parse().ok()))
        }
        _ => Some((trim_trailing_dot(raw), None)),
    }
}

fn trim_trailing_dot(host: &str) -> String {
    host.strip_suffix('.').unwrap_or(host).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_matches_explicit_port() {
        let mut hm = HostMap::new();
        hm.insert("http", "a.example:80", "srv-a", None, true);
        let b = hm.lookup("a.example:80", 80, &[80]).unwrap();
        assert_eq!(b.server_ref, "srv-a");
    }

    #[test]
    fn lookup_without_port_falls_back_to_default_port_entry() {
        let mut hm = HostMap::new();
        hm.insert("http", "a.example", "srv-a", None, true);
        let b = hm.lookup("a.example:80", 80, &[80]).unwrap();
        assert_eq!(b.server_ref, "srv-a");
    }

    #[test]
    fn lookup_normalizes_case_and_trailing_dot() {
        let mut hm = HostMap::new();
        hm.insert("http", "a.example", "srv-a", None, true);
        let b = hm.lookup("A.Example.:80", 80, &[80]).unwrap();
        assert_eq!(b.server_ref, "srv-a");
    }

    #[test]
    fn lookup_recognizes_ip_literal_brackets() {
        let mut hm = HostMap::new();
        hm.insert("http", "::1:8080", "srv-v6", None, true);
        let b = hm.lookup("[::1]:8080", 80, &[8080]).unwrap();
        assert_eq!(b.server_ref, "srv-v6");
    }

    #[test]
    fn unmatched_host_returns_none() {
        let mut hm = HostMap::new();
        hm.insert("http", "a.example", "srv-a", None, true);
        assert!(hm.lookup("b.example", 80, &[80]).is_none());
    }

    #[test]
    fn first_inserted_entry_is_default_without_explicit_flag() {
        let mut hm = HostMap::new();
        hm.insert("http", "a.example", "srv-a", None, false);
        hm.insert("http", "b.example", "srv-b", None, false);
        assert_eq!(hm.default_binding().unwrap().server_ref, "srv-a");
    }
}
