pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Project name we register under when asking the port registry for our own port
pub const REGISTRY_PROJECT: &str = APP_NAME;
pub const REGISTRY_DESCRIPTION: &str = "pmctl web dashboard";
