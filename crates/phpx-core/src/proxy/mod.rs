//! In-process network mediation: a filtering HTTP/CONNECT proxy, a filtering
//! SOCKS5 proxy, and the per-execution manager that owns them.

pub mod filter;
pub mod http;
pub mod manager;
pub mod socks5;

pub use filter::DomainFilter;
pub use http::HttpProxy;
pub use manager::{ManagerConfig, ProxyManager, SANDBOX_BRIDGE_PORT};
pub use socks5::Socks5Proxy;
