use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::cache::AnswerCache;
use crate::error::ForwardError;
use crate::proto::{MAX_UDP_PACKET, Message, Question, Sections};

/// Dedicated socket to the single upstream resolver.
///
/// `exchange` takes `&mut self`, so a send is always followed by its own
/// receive before the next query can go out. Replies that arrive after their
/// query timed out stay queued on the socket and are discarded before the
/// next send.
pub struct UpstreamClient {
    socket: UdpSocket,
    addr: SocketAddr,
    timeout: Duration,
    buf: Vec<u8>,
}

impl UpstreamClient {
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> std::io::Result<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if let Err(e) = socket.set_recv_buffer_size(1024 * 1024) {
            warn!("failed to set upstream recv buffer size: {}", e);
        }
        let local: SocketAddr = if addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        socket.bind(&local.into())?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        socket.connect(addr).await?;
        Ok(Self {
            socket,
            addr,
            timeout,
            buf: vec![0u8; MAX_UDP_PACKET],
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Sends one query and waits for the next datagram from the upstream.
    pub async fn exchange(&mut self, query: &[u8]) -> Result<&[u8], ForwardError> {
        self.discard_late_replies();
        self.socket.send(query).await?;
        let len = match timeout(self.timeout, self.socket.recv(&mut self.buf)).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(ForwardError::UpstreamTimeout {
                    upstream: self.addr,
                    timeout: self.timeout,
                });
            }
        };
        Ok(&self.buf[..len])
    }

    fn discard_late_replies(&mut self) {
        let mut discarded = 0usize;
        loop {
            match self.socket.try_recv(&mut self.buf) {
                Ok(_) => discarded += 1,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(
                        upstream = %self.addr,
                        error = %e,
                        "upstream socket error while draining"
                    );
                    break;
                }
            }
        }
        if discarded > 0 {
            debug!(upstream = %self.addr, discarded, "discarded late upstream replies");
        }
    }
}

/// Answers client queries from the cache, asking the upstream for misses.
pub struct Forwarder {
    cache: AnswerCache,
    upstream: UpstreamClient,
}

impl Forwarder {
    pub fn new(cache: AnswerCache, upstream: UpstreamClient) -> Self {
        Self { cache, upstream }
    }

    #[allow(dead_code)]
    pub fn cache(&self) -> &AnswerCache {
        &self.cache
    }

    /// Collects the records for every question. Cache hits come first, then
    /// each miss is forwarded on its own. Any upstream failure fails the
    /// whole call; misses already answered stay cached.
    pub async fn resolve(
        &mut self,
        questions: &[Question],
        now: Instant,
    ) -> Result<Sections, ForwardError> {
        let mut resolved = Sections::default();
        let mut misses = Vec::new();
        for question in questions {
            match self.cache.lookup(question, now) {
                Some(hit) => {
                    debug!(question = %question, records = hit.len(), "served from cache");
                    resolved.extend_from(&hit);
                }
                None => misses.push(question),
            }
        }

        for question in misses {
            debug!(question = %question, upstream = %self.upstream.addr(), "asking upstream");
            let sections = self.forward(question, now).await?;
            resolved.extend_from(&sections);
            self.cache.store(question.clone(), sections);
        }
        Ok(resolved)
    }

    async fn forward(
        &mut self,
        question: &Question,
        now: Instant,
    ) -> Result<Sections, ForwardError> {
        let id = fastrand::u16(..);
        let query = Message::query(id, question.clone()).encode(now)?;
        let reply = self.upstream.exchange(&query).await?;
        let reply = Message::decode(reply, now)?;
        if reply.id != id {
            return Err(ForwardError::UpstreamIntegrity {
                expected: id,
                received: reply.id,
            });
        }
        Ok(reply.sections)
    }

    /// Decodes a client query, resolves it and encodes the response under the
    /// client's transaction id.
    pub async fn answer(&mut self, packet: &[u8], now: Instant) -> Result<Bytes, ForwardError> {
        let query = Message::decode(packet, now)?;
        let sections = self.resolve(&query.questions, now).await?;
        let response = Message::response(query.id, query.questions, sections);
        Ok(response.encode(now)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::proto::{MessageKind, Name, ResourceRecord};
    use hickory_proto::op::{Message as HickoryMessage, MessageType};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{RData, Record};
    use hickory_proto::serialize::binary::BinEncodable;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Upstream stand-in on loopback that counts the datagrams it receives.
    pub(crate) struct MockUpstream {
        pub addr: SocketAddr,
        pub hits: Arc<AtomicUsize>,
    }

    impl MockUpstream {
        pub async fn spawn<F>(reply: F) -> Self
        where
            F: Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static,
        {
            Self::spawn_delayed(reply, Duration::ZERO).await
        }

        /// Like `spawn`, but the reply to the first datagram is held back for
        /// `first_delay` while later datagrams are answered at once.
        pub async fn spawn_delayed<F>(reply: F, first_delay: Duration) -> Self
        where
            F: Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static,
        {
            let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind mock upstream");
            let socket = Arc::new(socket);
            let addr = socket.local_addr().expect("local addr");
            let hits = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&hits);
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_UDP_PACKET];
                loop {
                    let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                        continue;
                    };
                    let seen = counter.fetch_add(1, Ordering::SeqCst);
                    let Some(resp) = reply(&buf[..len]) else {
                        continue;
                    };
                    if seen == 0 && !first_delay.is_zero() {
                        let socket = Arc::clone(&socket);
                        tokio::spawn(async move {
                            tokio::time::sleep(first_delay).await;
                            let _ = socket.send_to(&resp, peer).await;
                        });
                    } else {
                        let _ = socket.send_to(&resp, peer).await;
                    }
                }
            });
            Self { addr, hits }
        }

        pub fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    /// Replies with one A record per question, built and compressed by hickory.
    pub(crate) fn a_responder(
        ttl: u32,
        ip: Ipv4Addr,
    ) -> impl Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static {
        move |query: &[u8]| {
            let request = HickoryMessage::from_vec(query).ok()?;
            let mut response = HickoryMessage::new();
            response.set_id(request.id());
            response.set_message_type(MessageType::Response);
            for q in request.queries() {
                response.add_query(q.clone());
                response.add_answer(Record::from_rdata(q.name().clone(), ttl, RData::A(A(ip))));
            }
            response.to_bytes().ok()
        }
    }

    pub(crate) fn client_query(id: u16, names: &[&str]) -> Bytes {
        let questions = names
            .iter()
            .map(|n| Question::new(n.parse().expect("name"), 1, 1))
            .collect();
        let msg = Message {
            id,
            kind: MessageKind::Query,
            questions,
            sections: Sections::default(),
        };
        msg.encode(Instant::now()).expect("encode query")
    }

    async fn forwarder_for(upstream: &MockUpstream, timeout: Duration) -> Forwarder {
        let client = UpstreamClient::connect(upstream.addr, timeout)
            .await
            .expect("connect upstream");
        Forwarder::new(AnswerCache::new(64), client)
    }

    fn example_a() -> Question {
        Question::new("example.com".parse().expect("name"), 1, 1)
    }

    #[tokio::test]
    async fn miss_is_forwarded_then_served_from_cache() {
        let upstream = MockUpstream::spawn(a_responder(300, Ipv4Addr::new(93, 184, 216, 34))).await;
        let mut forwarder = forwarder_for(&upstream, Duration::from_secs(2)).await;
        let t0 = Instant::now();

        let wire = forwarder
            .answer(&client_query(0x1234, &["example.com"]), t0)
            .await
            .expect("answer");
        let resp = Message::decode(&wire, t0).expect("decode response");
        assert_eq!(resp.id, 0x1234);
        assert_eq!(resp.kind, MessageKind::Response);
        assert_eq!(resp.questions, vec![example_a()]);
        assert_eq!(resp.sections.answers.len(), 1);
        assert!(resp.sections.answers[0].ttl <= 300);
        assert_eq!(&resp.sections.answers[0].data[..], &[93, 184, 216, 34]);
        assert_eq!(upstream.hits(), 1);

        let t1 = t0 + Duration::from_secs(10);
        let wire = forwarder
            .answer(&client_query(0x5678, &["example.com"]), t1)
            .await
            .expect("answer");
        let resp = Message::decode(&wire, t1).expect("decode response");
        assert_eq!(resp.id, 0x5678);
        assert!(resp.sections.answers[0].ttl <= 290);
        assert_eq!(upstream.hits(), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_fetched_again() {
        let upstream = MockUpstream::spawn(a_responder(5, Ipv4Addr::new(10, 0, 0, 1))).await;
        let mut forwarder = forwarder_for(&upstream, Duration::from_secs(2)).await;
        let t0 = Instant::now();

        forwarder.resolve(&[example_a()], t0).await.expect("resolve");
        forwarder
            .resolve(&[example_a()], t0 + Duration::from_secs(4))
            .await
            .expect("resolve");
        assert_eq!(upstream.hits(), 1);

        let later = t0 + Duration::from_secs(6);
        let sections = forwarder.resolve(&[example_a()], later).await.expect("resolve");
        assert_eq!(upstream.hits(), 2);
        assert_eq!(sections.answers[0].remaining_ttl(later), 5);
    }

    #[tokio::test]
    async fn mismatched_reply_id_is_rejected_and_not_cached() {
        let inner = a_responder(300, Ipv4Addr::new(192, 0, 2, 1));
        let upstream = MockUpstream::spawn(move |query| {
            let mut resp = inner(query)?;
            resp[1] ^= 0x01;
            Some(resp)
        })
        .await;
        let mut forwarder = forwarder_for(&upstream, Duration::from_secs(2)).await;

        let err = forwarder
            .resolve(&[example_a()], Instant::now())
            .await
            .expect_err("must fail");
        assert!(matches!(
            err,
            ForwardError::UpstreamIntegrity { expected, received } if expected ^ received == 1
        ));
        assert!(!forwarder.cache().contains(&example_a()));
    }

    #[tokio::test]
    async fn silent_upstream_times_out() {
        let upstream = MockUpstream::spawn(|_| None).await;
        let mut forwarder = forwarder_for(&upstream, Duration::from_millis(100)).await;

        let err = forwarder
            .answer(&client_query(1, &["example.com"]), Instant::now())
            .await
            .expect_err("must time out");
        assert!(matches!(
            err,
            ForwardError::UpstreamTimeout { upstream: addr, .. } if addr == upstream.addr
        ));
        assert_eq!(upstream.hits(), 1);
        assert!(!forwarder.cache().contains(&example_a()));
    }

    #[tokio::test]
    async fn late_reply_does_not_break_later_queries() {
        let upstream = MockUpstream::spawn_delayed(
            a_responder(300, Ipv4Addr::new(192, 0, 2, 9)),
            Duration::from_millis(250),
        )
        .await;
        let mut forwarder = forwarder_for(&upstream, Duration::from_millis(150)).await;

        let err = forwarder
            .resolve(&[example_a()], Instant::now())
            .await
            .expect_err("first reply arrives too late");
        assert_eq!(err.kind(), "upstream_timeout");
        // Let the late reply land on the upstream socket.
        tokio::time::sleep(Duration::from_millis(250)).await;

        for name in ["b.example", "c.example", "d.example", "e.example"] {
            let question = Question::new(name.parse().expect("name"), 1, 1);
            let sections = forwarder
                .resolve(std::slice::from_ref(&question), Instant::now())
                .await
                .expect("later query is answered");
            assert_eq!(sections.answers.len(), 1);
            assert_eq!(sections.answers[0].name, question.name);
            assert!(forwarder.cache().contains(&question));
        }
        assert_eq!(upstream.hits(), 5);
        assert!(!forwarder.cache().contains(&example_a()));
    }

    #[tokio::test]
    async fn one_failed_question_fails_the_request() {
        let inner = a_responder(300, Ipv4Addr::new(192, 0, 2, 7));
        let upstream = MockUpstream::spawn(move |query| {
            let request = Message::decode(query, Instant::now()).ok()?;
            let asks_example = request.questions[0].name == "example.com".parse::<Name>().ok()?;
            if asks_example { inner(query) } else { None }
        })
        .await;
        let mut forwarder = forwarder_for(&upstream, Duration::from_millis(200)).await;

        let err = forwarder
            .answer(&client_query(9, &["example.com", "slow.example.net"]), Instant::now())
            .await
            .expect_err("second question times out");
        assert_eq!(err.kind(), "upstream_timeout");
        assert_eq!(upstream.hits(), 2);
        assert!(forwarder.cache().contains(&example_a()));
    }

    #[tokio::test]
    async fn cached_and_forwarded_questions_are_combined() {
        let upstream = MockUpstream::spawn(a_responder(60, Ipv4Addr::new(198, 51, 100, 4))).await;
        let mut forwarder = forwarder_for(&upstream, Duration::from_secs(2)).await;
        let now = Instant::now();
        forwarder.cache().store(
            example_a(),
            Sections {
                answers: vec![ResourceRecord::new(
                    "example.com".parse().expect("name"),
                    1,
                    1,
                    300,
                    Bytes::from_static(&[1, 2, 3, 4]),
                    now,
                )],
                ..Default::default()
            },
        );

        let wire = forwarder
            .answer(&client_query(77, &["www.example.org", "example.com"]), now)
            .await
            .expect("answer");
        let resp = Message::decode(&wire, now).expect("decode");
        assert_eq!(upstream.hits(), 1);
        assert_eq!(resp.questions.len(), 2);
        // Hits are listed before forwarded answers.
        assert_eq!(&resp.sections.answers[0].data[..], &[1, 2, 3, 4]);
        assert_eq!(&resp.sections.answers[1].data[..], &[198, 51, 100, 4]);
    }

    #[tokio::test]
    async fn malformed_traffic_is_reported() {
        let upstream = MockUpstream::spawn(|query| Some(query[..query.len() - 3].to_vec())).await;
        let mut forwarder = forwarder_for(&upstream, Duration::from_secs(2)).await;

        let err = forwarder
            .answer(&[0x00, 0x01, 0x00], Instant::now())
            .await
            .expect_err("bad query");
        assert_eq!(err.kind(), "malformed");
        assert_eq!(upstream.hits(), 0);

        let err = forwarder
            .resolve(&[example_a()], Instant::now())
            .await
            .expect_err("bad reply");
        assert!(matches!(err, ForwardError::Malformed(_)));
        assert_eq!(upstream.hits(), 1);
    }
}
