//! Pairs worker activity with the requests it produced at the mock peer.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::peer::{MockNetworkPeer, RecordedRequest};

#[derive(Debug, Clone)]
pub struct RequestCorrelator {
    peer: Arc<MockNetworkPeer>,
}

impl RequestCorrelator {
    pub fn new(peer: Arc<MockNetworkPeer>) -> Self {
        Self { peer }
    }

    /// Oldest unread request, or `RequestTimeout` if none arrives in time.
    pub fn take_request(&self, timeout: Duration) -> HarnessResult<RecordedRequest> {
        match self.peer.take_request_with_timeout(timeout) {
            Some(request) => {
                debug!(
                    sequence = request.sequence,
                    method = %request.method,
                    path = %request.path,
                    "correlated request"
                );
                Ok(request)
            }
            None => {
                warn!(?timeout, "worker never contacted the mock peer");
                Err(HarnessError::RequestTimeout { timeout })
            }
        }
    }

    /// Like [`take_request`](Self::take_request), but the request must target
    /// a path starting with `path_prefix`.
    pub fn take_request_for(
        &self,
        path_prefix: &str,
        timeout: Duration,
    ) -> HarnessResult<RecordedRequest> {
        let request = self.take_request(timeout)?;
        if request.path_only().starts_with(path_prefix) {
            Ok(request)
        } else {
            Err(HarnessError::UnexpectedRequest {
                method: request.method,
                path: request.path,
                expected: path_prefix.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::peer::MockResponse;
    use proptest::prelude::*;
    use std::io::{Read, Write};

    fn get(peer: &MockNetworkPeer, path: &str) {
        let mut stream = std::net::TcpStream::connect(peer.addr()).unwrap();
        write!(
            stream,
            "GET {path} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            peer.addr()
        )
        .unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).unwrap();
    }

    #[test]
    fn test_take_request_times_out_without_traffic() {
        let correlator = RequestCorrelator::new(Arc::new(MockNetworkPeer::start().unwrap()));
        let err = correlator
            .take_request(Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_take_request_for_checks_prefix() {
        let peer = Arc::new(MockNetworkPeer::start().unwrap());
        peer.enqueue(MockResponse::new(200));
        peer.enqueue(MockResponse::new(200));
        get(&peer, "/downloads/file?retry=1");
        get(&peer, "/elsewhere");

        let correlator = RequestCorrelator::new(Arc::clone(&peer));
        let first = correlator
            .take_request_for("/downloads", Duration::from_secs(5))
            .unwrap();
        assert_eq!(first.path, "/downloads/file?retry=1");

        let err = correlator
            .take_request_for("/downloads", Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, HarnessError::UnexpectedRequest { .. }));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        // Requests come back in recording order, each exactly once.
        #[test]
        fn test_requests_returned_in_order_once(count in 1usize..6) {
            let peer = Arc::new(MockNetworkPeer::start().unwrap());
            for _ in 0..count {
                peer.enqueue(MockResponse::new(204));
            }
            for index in 0..count {
                get(&peer, &format!("/r/{index}"));
            }

            let correlator = RequestCorrelator::new(Arc::clone(&peer));
            for index in 0..count {
                let request = correlator.take_request(Duration::from_secs(5)).unwrap();
                prop_assert_eq!(request.path, format!("/r/{index}"));
                prop_assert_eq!(request.sequence, index as u64 + 1);
            }
            prop_assert!(correlator.take_request(Duration::from_millis(10)).is_err());
        }
    }
}
