//! Plain-HTTP inspector
//!
//! Applies to outbound TCP port 80. Decodes the request line and headers;
//! when the Host header disagrees with the domain the connection was
//! resolved from, the entity is re-resolved against the filter lists and
//! the connection is blocked if the real host is denied.

use crate::{Inspector, InspectorFactory, StreamOutcome};
use std::sync::Arc;
use warden_conntrack::{ConnState, Connection};
use warden_packet::{Direction, PacketInfo, Protocol};

/// Re-resolution of a host name against the filter lists
pub trait HostPolicy: Send + Sync {
    /// Whether traffic of this connection to `host` is permitted
    fn host_permitted(&self, state: &ConnState, host: &str) -> bool;
}

pub struct HttpInspector {
    policy: Arc<dyn HostPolicy>,
}

impl HttpInspector {
    /// Factory for the registration table: applies to outbound TCP 80
    pub fn factory(policy: Arc<dyn HostPolicy>) -> InspectorFactory {
        Box::new(move |_conn: &Connection, state: &mut ConnState, info: &PacketInfo| {
            if info.protocol == Protocol::Tcp
                && info.direction.is_outbound()
                && state.entity.remote_port == 80
            {
                Some(Box::new(HttpInspector { policy: policy.clone() }) as Box<dyn Inspector>)
            } else {
                None
            }
        })
    }
}

impl Inspector for HttpInspector {
    fn name(&self) -> &'static str {
        "http"
    }

    fn handle_stream(
        &mut self,
        state: &mut ConnState,
        direction: Direction,
        stream: &[u8],
    ) -> Result<StreamOutcome, warden_common::Error> {
        if direction.is_inbound() {
            return Ok(StreamOutcome::need_more());
        }

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(stream) {
            Ok(httparse::Status::Partial) => return Ok(StreamOutcome::need_more()),
            Ok(httparse::Status::Complete(_)) => {}
            Err(_) => return Ok(StreamOutcome::give_up()),
        }

        let Some(host) = request
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("host"))
            .and_then(|h| std::str::from_utf8(h.value).ok())
        else {
            return Ok(StreamOutcome::accept());
        };
        // strip an explicit port
        let host = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);

        match &state.entity.domain {
            Some(domain) if host.eq_ignore_ascii_case(domain.trim_end_matches('.')) => {
                Ok(StreamOutcome::accept())
            }
            _ => {
                tracing::debug!(host = %host, "HTTP Host differs from resolved domain");
                if self.policy.host_permitted(state, host) {
                    state.entity.domain = Some(host.to_string());
                    Ok(StreamOutcome::accept())
                } else {
                    Ok(StreamOutcome::block(format!("host {host} is denied")))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use warden_common::Timestamp;
    use warden_packet::{IpVersion, Verdict};

    struct ListPolicy {
        denied: &'static str,
    }

    impl HostPolicy for ListPolicy {
        fn host_permitted(&self, _state: &ConnState, host: &str) -> bool {
            host != self.denied
        }
    }

    async fn conn_with_domain(domain: Option<&str>) -> Connection {
        let info = PacketInfo {
            direction: Direction::Outbound,
            version: IpVersion::V4,
            protocol: Protocol::Tcp,
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 80)),
            src_port: 40000,
            dst_port: 80,
            process_id: None,
            seen_at: Timestamp::now(),
            in_tunnel: false,
            icmp: None,
        };
        let conn = Connection::from_first_packet(&info);
        conn.lock().await.entity.domain = domain.map(|d| d.to_string());
        conn
    }

    fn inspector() -> HttpInspector {
        HttpInspector {
            policy: Arc::new(ListPolicy { denied: "evil.example" }),
        }
    }

    #[tokio::test]
    async fn test_matching_host_accepts() {
        let conn = conn_with_domain(Some("example.com")).await;
        let mut state = conn.lock().await;
        let out = inspector()
            .handle_stream(
                &mut state,
                Direction::Outbound,
                b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
            )
            .unwrap();
        assert_eq!(out.verdict, Verdict::Accept);
    }

    #[tokio::test]
    async fn test_mismatched_denied_host_blocks() {
        let conn = conn_with_domain(Some("example.com")).await;
        let mut state = conn.lock().await;
        let out = inspector()
            .handle_stream(
                &mut state,
                Direction::Outbound,
                b"GET / HTTP/1.1\r\nHost: evil.example\r\n\r\n",
            )
            .unwrap();
        assert_eq!(out.verdict, Verdict::Block);
        assert!(out.reason.unwrap().contains("evil.example"));
    }

    #[tokio::test]
    async fn test_mismatched_permitted_host_reresolves() {
        let conn = conn_with_domain(Some("example.com")).await;
        let mut state = conn.lock().await;
        let out = inspector()
            .handle_stream(
                &mut state,
                Direction::Outbound,
                b"GET / HTTP/1.1\r\nHost: other.example:80\r\n\r\n",
            )
            .unwrap();
        assert_eq!(out.verdict, Verdict::Accept);
        assert_eq!(state.entity.domain.as_deref(), Some("other.example"));
    }

    #[tokio::test]
    async fn test_partial_request_needs_more() {
        let conn = conn_with_domain(Some("example.com")).await;
        let mut state = conn.lock().await;
        let out = inspector()
            .handle_stream(&mut state, Direction::Outbound, b"GET / HTT")
            .unwrap();
        assert_eq!(out.verdict, Verdict::Undecided);
        assert!(!out.done);
    }

    #[tokio::test]
    async fn test_non_http_gives_up() {
        let conn = conn_with_domain(None).await;
        let mut state = conn.lock().await;
        let out = inspector()
            .handle_stream(&mut state, Direction::Outbound, b"\x00\x01\x02binary\r\n\r\n")
            .unwrap();
        assert_eq!(out.verdict, Verdict::Undeterminable);
    }
}
