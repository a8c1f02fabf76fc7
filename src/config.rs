//! The driver's own tuning-knob configuration (§6's "Configuration options").
//!
//! `DriverOptions` models only the driver core's own knobs — nothing about
//! routes, server names, CGI, or per-vhost application config, which stay
//! the application layer's concern. It derives `FromYaml` through the
//! workspace's own hand-rolled YAML stack (`parser` + `derive_yaml`), the
//! same mechanism `kill-ux-01-server`'s `config_handler/types.rs` already
//! used for `ServerConfig`/`RouteConfig`, so a driver's knobs can be loaded
//! from a YAML fragment without this crate knowing anything about the rest
//! of the application's configuration file.

use derive_yaml::FromYaml;
use parser::{FromYaml as _, YamlError, YamlValue};
use std::time::Duration;

const DEFAULT_PORT: u16 = 8080;

/// Listen ports. Encoded on the wire as a whitespace-separated list
/// ("a whitespace-separated list of 0-65535", §6), not a YAML sequence,
/// though a sequence of scalars is accepted too since it costs nothing
/// extra to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortList(pub Vec<u16>);

impl Default for PortList {
    fn default() -> Self {
        PortList(vec![DEFAULT_PORT])
    }
}

impl parser::FromYaml for PortList {
    fn from_yaml(value: &YamlValue) -> Result<Self, YamlError> {
        match value {
            YamlValue::Scalar(s) => {
                let mut ports = Vec::new();
                for tok in s.split_whitespace() {
                    let p: u16 = tok
                        .parse()
                        .map_err(|e| YamlError::Generic(format!("invalid port '{tok}': {e}")))?;
                    ports.push(p);
                }
                if ports.is_empty() {
                    return Err(YamlError::Generic("port list is empty".to_string()));
                }
                Ok(PortList(ports))
            }
            YamlValue::List(items) => {
                let mut ports = Vec::with_capacity(items.len());
                for item in items {
                    ports.push(u16::from_yaml(item)?);
                }
                Ok(PortList(ports))
            }
            _ => Err(YamlError::Generic("expected a port list".to_string())),
        }
    }
}

#[derive(Debug, Clone, FromYaml)]
pub struct DriverOptions {
    pub ports: PortList,
    pub bufsize: usize,
    pub maxinput: usize,
    pub maxupload: usize,
    pub readahead: usize,
    pub maxline: usize,
    pub maxheaders: usize,
    pub maxqueuesize: usize,
    pub sendwait_secs: u64,
    pub recvwait_secs: u64,
    pub closewait_secs: u64,
    pub keepwait_secs: u64,
    pub backlog: i32,
    pub driverthreads: usize,
    pub reuseport: bool,
    pub acceptsize: usize,
    pub sockacceptlog: usize,
    pub keepalivemaxuploadsize: usize,
    pub keepalivemaxdownloadsize: usize,
    pub uploadpath: String,
    pub spoolerthreads: usize,
    pub writerthreads: usize,
    pub writersize: usize,
    pub writerbufsize: usize,
    pub writerratelimit: usize,
    pub writerstreaming: bool,
    pub vhostcertificates: Option<String>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        let bufsize = 16 * 1024;
        // SOCKLISTENBACKLOG_INT in naviserver's own nsconf.h agrees on 32;
        // the driver spec leaves backlog/acceptsize/sockacceptlog otherwise
        // undocumented, so acceptsize and sockacceptlog default to it too.
        let backlog = 32;
        Self {
            ports: PortList::default(),
            bufsize,
            maxinput: 1024 * 1024,
            maxupload: 0,
            readahead: bufsize,
            maxline: 8 * 1024,
            maxheaders: 128,
            maxqueuesize: 1024,
            sendwait_secs: 30,
            recvwait_secs: 30,
            closewait_secs: 2,
            keepwait_secs: 5,
            backlog,
            driverthreads: 1,
            reuseport: false,
            acceptsize: backlog as usize,
            sockacceptlog: backlog as usize,
            keepalivemaxuploadsize: 0,
            keepalivemaxdownloadsize: 0,
            uploadpath: std::env::temp_dir().to_string_lossy().into_owned(),
            spoolerthreads: 0,
            writerthreads: 0,
            writersize: 1024 * 1024,
            writerbufsize: 8 * 1024,
            writerratelimit: 0,
            writerstreaming: false,
            vhostcertificates: None,
        }
    }
}

impl DriverOptions {
    pub fn from_yaml_str(source: &str) -> Result<Self, YamlError> {
        <Self as parser::FromYaml>::from_str(source)
    }

    pub fn sendwait(&self) -> Duration {
        Duration::from_secs(self.sendwait_secs)
    }

    pub fn recvwait(&self) -> Duration {
        Duration::from_secs(self.recvwait_secs)
    }

    pub fn closewait(&self) -> Duration {
        Duration::from_secs(self.closewait_secs)
    }

    pub fn keepwait(&self) -> Duration {
        Duration::from_secs(self.keepwait_secs)
    }

    /// Whether `driverthreads > 1` is actually usable; the knob requires
    /// `SO_REUSEPORT` (§6).
    pub fn needs_reuseport(&self) -> bool {
        self.driverthreads > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let opts = DriverOptions::default();
        assert_eq!(opts.bufsize, 16 * 1024);
        assert_eq!(opts.maxinput, 1024 * 1024);
        assert_eq!(opts.maxline, 8 * 1024);
        assert_eq!(opts.maxheaders, 128);
        assert_eq!(opts.readahead, opts.bufsize);
        assert_eq!(opts.sendwait(), Duration::from_secs(30));
        assert_eq!(opts.keepwait(), Duration::from_secs(5));
        assert_eq!(opts.ports, PortList(vec![DEFAULT_PORT]));
    }

    #[test]
    fn yaml_fragment_overrides_only_named_fields() {
        let yaml = "bufsize: 32000\nmaxheaders: 64\nports: \"80 443\"\n";
        let opts = DriverOptions::from_yaml_str(yaml).expect("valid fragment");
        assert_eq!(opts.bufsize, 32000);
        assert_eq!(opts.maxheaders, 64);
        assert_eq!(opts.ports, PortList(vec![80, 443]));
        // Untouched fields keep their documented default.
        assert_eq!(opts.maxinput, 1024 * 1024);
        assert_eq!(opts.writerthreads, 0);
    }

    #[test]
    fn port_list_accepts_yaml_sequence_too() {
        let yaml = "ports:\n  - 80\n  - 8080\n";
        let opts = DriverOptions::from_yaml_str(yaml).expect("valid fragment");
        assert_eq!(opts.ports, PortList(vec![80, 8080]));
    }

    #[test]
    fn rejects_non_numeric_port() {
        let err = PortList::from_yaml(&YamlValue::Scalar("abc")).unwrap_err();
        assert!(matches!(err, YamlError::Generic(_)));
    }
}
