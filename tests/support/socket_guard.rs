//! Skips wiremock tests in sandboxes that forbid binding localhost sockets.
//!
//! Set `HARVESTER_REQUIRE_SOCKET_TESTS=1` in CI so a missing socket fails the
//! test instead of silently skipping it.

use std::net::TcpListener;
use std::panic::Location;

use wiremock::MockServer;

const REQUIRE_ENV: &str = "HARVESTER_REQUIRE_SOCKET_TESTS";

fn sockets_required() -> bool {
    std::env::var(REQUIRE_ENV)
        .is_ok_and(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Starts a mock server, or returns `None` (after logging where) when the
/// environment cannot bind one.
#[track_caller]
pub fn start_mock_server_or_skip() -> impl Future<Output = Option<MockServer>> {
    let caller = Location::caller();
    async move {
        if TcpListener::bind("127.0.0.1:0").is_ok() {
            return Some(MockServer::start().await);
        }
        assert!(
            !sockets_required(),
            "{}:{} needs a localhost socket and {REQUIRE_ENV} is set",
            caller.file(),
            caller.line()
        );
        eprintln!(
            "skipping socket-bound test at {}:{}: cannot bind localhost",
            caller.file(),
            caller.line()
        );
        None
    }
}

/// Value a skipped test returns.
pub trait Skipped {
    fn skipped() -> Self;
}

impl Skipped for () {
    fn skipped() -> Self {}
}

impl<E> Skipped for Result<(), E> {
    fn skipped() -> Self {
        Ok(())
    }
}

pub fn skipped<T: Skipped>() -> T {
    T::skipped()
}
