pub mod broker;
pub mod client;
pub mod config;
pub mod drone;
pub mod hub;
pub mod protocol;
pub mod rpc;
pub mod session;

use rand::Rng;

/// A random 16-hex-digit token, used for session identities and process ids.
pub fn random_token() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}
