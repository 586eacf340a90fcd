pub mod error;
pub mod resolver;
pub mod server;
pub mod socks5;
pub mod util;
