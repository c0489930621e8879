use std::net::TcpListener;
use std::panic::Location;

use wiremock::MockServer;

const REQUIRE_ENV: &str = "HARVESTER_REQUIRE_SOCKET_TESTS";

/// Starts a mock server, or returns `None` when localhost sockets are not
/// available and `HARVESTER_REQUIRE_SOCKET_TESTS` is unset.
#[track_caller]
pub(crate) fn start_mock_server_or_skip() -> impl Future<Output = Option<MockServer>> {
    let caller = Location::caller();
    async move {
        if TcpListener::bind("127.0.0.1:0").is_ok() {
            return Some(MockServer::start().await);
        }
        let required = std::env::var(REQUIRE_ENV)
            .is_ok_and(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"));
        assert!(
            !required,
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
