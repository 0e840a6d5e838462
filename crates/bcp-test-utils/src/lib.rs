// bcp-test-utils: Shared test doubles for the bridge suites.
//
// Provides a scripted machine host and a mock media controller (real TCP)
// for integration testing of the session, router, and facade layers.

pub mod mock_peer;

pub use bcp_bridge::test_support::{MockHost, ShowCommand};
pub use mock_peer::{MockPeer, PeerConn};
