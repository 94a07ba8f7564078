pub mod capabilities;
pub mod forwarding;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("couldn't read IPv4 forwarding control file: {0}")]
    ReadIpv4Setting(String),

    #[error("couldn't read IPv6 forwarding control file: {0}")]
    ReadIpv6Setting(String),

    #[error("couldn't read process capability set: {0}")]
    ReadCapabilities(String),

    #[error("'{flag}' flag not set on '{capability}' capability")]
    CapabilityNotSet {
        capability: &'static str,
        flag: &'static str,
    },
}
