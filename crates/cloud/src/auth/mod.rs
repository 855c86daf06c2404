//! Request signing for catalogs and asset hosts.

mod none;
mod service_account;

pub use none::NoAuth;
pub use service_account::ServiceAccountAuth;

use crate::error::Result;

/// Adds authentication headers to outgoing requests.
pub trait CloudAuth: Send + Sync {
    /// Sign a request by appending headers to `headers`.
    ///
    /// `url` is the full request URL and `method` the HTTP verb.
    fn sign_request(
        &self,
        url: &str,
        method: &str,
        headers: &mut Vec<(String, String)>,
    ) -> Result<()>;
}
