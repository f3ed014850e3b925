pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod hook_executor;
pub mod notifier;
pub mod processor_client;
pub mod setup;
pub mod signature;
pub mod sweep_worker;

const ERROR_BODY_LIMIT: usize = 512;

/// Cap an upstream error body for logging without splitting a multi-byte
/// character.
pub(crate) fn error_snippet(body: &str) -> &str {
    if body.len() <= ERROR_BODY_LIMIT {
        return body;
    }
    let mut end = ERROR_BODY_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
