mod cache;
mod codec;

pub use cache::AddressCache;
pub use codec::{BRACKET_TOKEN, GatewayPath, PathParseError, decode, encode};
