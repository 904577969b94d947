//! Domain layer: values exchanged with the token and the rules about them.

pub mod app;
pub mod constants;
pub mod secret;
pub mod types;

pub use app::AppBinary;
pub use secret::Secret;
pub use types::{
    HashAlgorithm, NameVersion, PublicKey, SignOptions, SignedMessage, TokenMode, Udi,
};
