pub mod udp_resolver;

pub use udp_resolver::UdpResolver;
