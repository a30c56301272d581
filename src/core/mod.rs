pub mod config;
pub mod decode;
pub mod finder;
pub mod fingerprint;
pub mod hash;
pub mod matcher;
pub mod store;
pub mod sync;
