pub mod filename;
pub mod pipe;
pub mod retry;

use url::Url;
use which::which;

/// Whether `binary` resolves to an executable on `PATH`.
pub fn binary_on_path(binary: &str) -> bool {
    which(binary).is_ok()
}

/// Connection URL with the password masked, safe for logs.
pub fn redact_url(connection_url: &str) -> String {
    match Url::parse(connection_url) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("****"));
            }
            url.to_string()
        }
        Err(_) => "<unparseable connection url>".to_string(),
    }
}
