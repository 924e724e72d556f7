pub mod http;
pub mod keepalive;
pub mod logging;
pub mod redact;
pub mod telegram;
pub mod timing;
