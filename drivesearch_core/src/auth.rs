use std::collections::HashMap;

/// Credential map exchanged between the registry layer and connectors.
///
/// Keys are connector-defined (see each connector's `config_schema`); for the
/// OneDrive connector they are `tenant_id`, `client_id` and `client_secret`.
pub type AuthDetails = HashMap<String, String>;
