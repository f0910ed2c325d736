pub mod loader;
pub mod types;
mod validator;

pub use loader::{expand_env_entry, expand_environment, expand_home, parse_forwards, ManifestLoader};
pub use types::{DevSpec, EnvEntry, ForwardPair, TargetWorkload};
