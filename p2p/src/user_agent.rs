//! User agent formatting and validation.

use bitcoin_network_channel::Error;

/// The user agent advertised when the configuration leaves it empty.
///
/// Follows the network convention of `/name:version/`.
pub fn default_user_agent() -> String {
    format!("/bitcoin-network:{}/", env!("CARGO_PKG_VERSION"))
}

/// Validate the `/name:version/` user agent convention.
///
/// # Examples
///
/// ```
/// use bitcoin_network_p2p::validate_user_agent;
///
/// assert!(validate_user_agent("/bitcoin-network:0.1.0/").is_ok());
/// assert!(validate_user_agent("bitcoin-network").is_err());
/// ```
pub fn validate_user_agent(user_agent: &str) -> Result<(), Error> {
    if !user_agent.starts_with('/') || !user_agent.ends_with('/') || user_agent.len() < 2 {
        return Err(Error::OperationFailed);
    }

    let contents = &user_agent[1..user_agent.len() - 1];
    let parts: Vec<&str> = contents.split(':').collect();
    match parts.as_slice() {
        [name, version] if !name.is_empty() && !version.is_empty() => Ok(()),
        _ => Err(Error::OperationFailed),
    }
}
