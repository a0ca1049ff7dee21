use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, Record, RecordType};
use hickory_proto::serialize::binary::BinDecodable;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{NetworkError, RuleError, UpstreamError};
use crate::query::Query;
use crate::response::{self, is_address_record};

const DNS_PORT: u16 = 53;
const MAX_UDP_RESPONSE: usize = 4096;

/// One request/response exchange with an upstream nameserver.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn exchange(&self, resolver: SocketAddr, request: Bytes) -> Result<Bytes, UpstreamError>;
}

/// Plain UDP: a fresh socket per exchange, answered by the datagram whose id
/// matches the request.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpTransport;

impl UdpTransport {
    fn bind_for(resolver: SocketAddr) -> std::io::Result<UdpSocket> {
        let (domain, local) = if resolver.is_ipv4() {
            (Domain::IPV4, SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
        } else {
            (Domain::IPV6, SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0))
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.bind(&local.into())?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket.into())
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn exchange(&self, resolver: SocketAddr, request: Bytes) -> Result<Bytes, UpstreamError> {
        let sock = Self::bind_for(resolver)?;
        sock.connect(resolver).await?;
        sock.send(&request).await?;

        let mut buf = [0u8; MAX_UDP_RESPONSE];
        loop {
            let size = sock.recv(&mut buf).await?;
            // Connected socket: only the resolver can reach us, but stale or
            // spoofed ids are still possible.
            if size >= 2 && request.len() >= 2 && buf[..2] == request[..2] {
                return Ok(Bytes::copy_from_slice(&buf[..size]));
            }
            debug!(
                event = "upstream_mismatch",
                upstream = %resolver,
                size,
                "dropping datagram with foreign id"
            );
        }
    }
}

/// Parses a comma separated resolver list; entries are `ip` or `ip:port`.
pub fn parse_resolvers(list: &str) -> Result<Vec<SocketAddr>, RuleError> {
    let mut out = Vec::new();
    for part in list.split(',') {
        let s = part.trim();
        if s.is_empty() {
            continue;
        }
        out.push(parse_resolver(s)?);
    }
    if out.is_empty() {
        return Err(RuleError::NoResolvers);
    }
    Ok(out)
}

pub fn parse_resolver(s: &str) -> Result<SocketAddr, RuleError> {
    s.parse::<SocketAddr>()
        .or_else(|_| s.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, DNS_PORT)))
        .map_err(|_| RuleError::Resolver(s.to_string()))
}

/// Races one query across a fixed set of upstreams.
///
/// Every call spawns one task per resolver. The first task to *complete*
/// decides the race, whether it succeeded or not; the others are aborted and
/// their results never looked at. Each task is bounded by the pool timeout on
/// its own, there is no deadline on the race as a whole.
pub struct ResolverPool {
    resolvers: Arc<[SocketAddr]>,
    timeout: Duration,
    transport: Arc<dyn Transport>,
    slots: Arc<Semaphore>,
}

impl ResolverPool {
    pub fn new(
        resolvers: Vec<SocketAddr>,
        timeout: Duration,
        workers_per_resolver: usize,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, RuleError> {
        if resolvers.is_empty() {
            return Err(RuleError::NoResolvers);
        }
        let slots = resolvers.len() * workers_per_resolver.max(1);
        Ok(Self {
            resolvers: resolvers.into(),
            timeout,
            transport,
            slots: Arc::new(Semaphore::new(slots)),
        })
    }

    pub fn resolvers(&self) -> &[SocketAddr] {
        &self.resolvers
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends the query verbatim and hands back the winner's raw answer.
    pub async fn forward(&self, query: &Query) -> Result<Bytes, NetworkError> {
        let request = match response::encode(query.message()) {
            Ok(bytes) => bytes,
            Err(err) => return Err(self.network_error(query, err.into())),
        };
        self.race(query, request, |raw: Bytes| Ok(raw)).await
    }

    /// Looks up address records of `name` (always class IN) and returns the
    /// winning answer section. A non-NOERROR answer or one without any IN A/AAAA record is a
    /// failed task.
    pub async fn lookup(
        &self,
        query: &Query,
        name: &Name,
        record_type: RecordType,
    ) -> Result<Vec<Record>, NetworkError> {
        let lookup = Query::new(query.id(), name.clone(), record_type, DNSClass::IN);
        let request = match response::encode(lookup.message()) {
            Ok(bytes) => bytes,
            Err(err) => return Err(self.network_error(query, err.into())),
        };
        self.race(query, request, address_answers).await
    }

    async fn race<T, F>(&self, query: &Query, request: Bytes, accept: F) -> Result<T, NetworkError>
    where
        T: Send + 'static,
        F: Fn(Bytes) -> Result<T, UpstreamError> + Copy + Send + 'static,
    {
        let mut abort_handles = Vec::with_capacity(self.resolvers.len());
        let mut tasks = FuturesUnordered::new();

        for &resolver in self.resolvers.iter() {
            let transport = Arc::clone(&self.transport);
            let slots = Arc::clone(&self.slots);
            let request = request.clone();
            let timeout_dur = self.timeout;
            let handle = tokio::spawn(async move {
                let _slot = match slots.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(err) => return Err(UpstreamError::Task(err.to_string())),
                };
                let start = Instant::now();
                let res = match timeout(timeout_dur, transport.exchange(resolver, request)).await {
                    Ok(res) => res.and_then(accept),
                    Err(_) => Err(UpstreamError::Timeout),
                };
                debug!(
                    event = "upstream_done",
                    upstream = %resolver,
                    ok = res.is_ok(),
                    elapsed_us = start.elapsed().as_micros() as u64,
                    "resolution task completed"
                );
                res.map(|value| (resolver, value))
            });
            abort_handles.push(handle.abort_handle());
            tasks.push(handle);
        }

        let first = tasks.next().await;
        for handle in &abort_handles {
            handle.abort();
        }

        let cause = match first {
            Some(Ok(Ok((resolver, value)))) => {
                debug!(
                    event = "race_won",
                    upstream = %resolver,
                    qname = %query.name(),
                    "fastest resolver answered"
                );
                return Ok(value);
            }
            Some(Ok(Err(err))) => err,
            Some(Err(join_err)) => UpstreamError::Task(join_err.to_string()),
            None => UpstreamError::Task("no resolution task ran".to_string()),
        };
        warn!(
            event = "race_failed",
            qname = %query.name(),
            resolvers = ?self.resolvers,
            error = %cause,
            "first completed resolution failed"
        );
        Err(self.network_error(query, cause))
    }

    fn network_error(&self, query: &Query, cause: UpstreamError) -> NetworkError {
        NetworkError {
            query: query.clone(),
            resolvers: self.resolvers.to_vec(),
            cause,
        }
    }
}

fn address_answers(raw: Bytes) -> Result<Vec<Record>, UpstreamError> {
    let mut msg = Message::from_bytes(&raw)?;
    if msg.response_code() != ResponseCode::NoError {
        return Err(UpstreamError::Rcode(msg.response_code()));
    }
    let answers = msg.take_answers();
    if !answers.iter().any(is_address_record) {
        return Err(UpstreamError::NoAnswer);
    }
    Ok(answers)
}

/// Builds the pool that serves queries no rule answered.
pub fn default_pool(
    resolvers: &[String],
    timeout: Duration,
    transport: Arc<dyn Transport>,
) -> anyhow::Result<ResolverPool> {
    let addrs = resolvers
        .iter()
        .map(|s| parse_resolver(s.trim()))
        .collect::<Result<Vec<_>, _>>()
        .context("parse default_resolvers")?;
    ResolverPool::new(addrs, timeout, 1, transport).context("build default resolver pool")
}
