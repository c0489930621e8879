#![allow(dead_code, unused_macros)]

pub mod fixtures;
pub mod socket_guard;

/// Binds a wiremock server or returns early from the enclosing test.
macro_rules! require_mock_server {
    () => {{
        let Some(server) = $crate::support::socket_guard::start_mock_server_or_skip().await else {
            return $crate::support::socket_guard::skipped();
        };
        server
    }};
}
