mod dialer;
mod peer_cache;

pub use dialer::{race_dial, AggregatedCauses, DialFailure, Dialer, RaceDialError};
pub use peer_cache::PeerCache;
