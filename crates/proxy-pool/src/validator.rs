//! Proxy probing.
//!
//! Each probe opens a raw TCP connection to the proxy and drives the
//! protocol-appropriate handshake toward a test target: HTTP CONNECT (or a
//! plain GET) for HTTP proxies, hand-rolled SOCKS4 and RFC 1928/1929 SOCKS5
//! negotiation otherwise. Any socket error, timeout or mis-framed reply
//! marks the proxy invalid; sockets are scoped and dropped on every exit
//! path.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;
use url::Url;

use crate::error::{PoolError, Result};
use crate::proxy::{Proxy, ProxyProtocol};

const RESPONSE_HEAD_CAP: usize = 2048;

/// Outcome of a single probe.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub test_url: String,
    pub timeout: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            test_url: "https://www.google.com".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Destination the probe tunnels toward.
#[derive(Debug, Clone)]
struct ProbeTarget {
    host: String,
    port: u16,
    https: bool,
    path: String,
}

impl ProbeTarget {
    fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| PoolError::Validation(format!("bad test url {:?}: {}", raw, e)))?;
        let https = match url.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(PoolError::Validation(format!(
                    "unsupported test url scheme {:?}",
                    other
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| PoolError::Validation(format!("test url {:?} has no host", raw)))?
            .to_string();
        let port = url.port().unwrap_or(if https { 443 } else { 80 });
        let path = if url.path().is_empty() { "/".to_string() } else { url.path().to_string() };
        Ok(Self { host, port, https, path })
    }
}

pub struct ProxyValidator {
    config: ValidatorConfig,
    resolver: TokioAsyncResolver,
}

impl ProxyValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self { config, resolver }
    }

    /// Probes with the configured target and deadline, dispatching on the
    /// proxy's protocol.
    pub async fn validate(&self, proxy: &Proxy) -> Result<ValidationOutcome> {
        self.validate_with(proxy, &self.config.test_url, self.config.timeout).await
    }

    pub async fn validate_with(
        &self,
        proxy: &Proxy,
        test_url: &str,
        timeout: Duration,
    ) -> Result<ValidationOutcome> {
        let target = ProbeTarget::parse(test_url)?;
        let started = Instant::now();

        let probe = async {
            match proxy.protocol {
                ProxyProtocol::Http | ProxyProtocol::Https => self.probe_http(proxy, &target).await,
                ProxyProtocol::Socks4 => self.probe_socks4(proxy, &target).await,
                ProxyProtocol::Socks5 => self.probe_socks5(proxy, &target).await,
            }
        };

        let valid = match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("probe of {} failed: {}", proxy.key(), e);
                false
            }
            Err(_) => {
                debug!("probe of {} timed out after {:?}", proxy.key(), timeout);
                false
            }
        };

        let response_time_ms = started.elapsed().as_millis() as u64;
        if valid {
            debug!("proxy {} valid in {}ms", proxy.key(), response_time_ms);
        }
        Ok(ValidationOutcome { valid, response_time_ms })
    }

    /// HTTP-proxy probe; rejects SOCKS proxies outright.
    pub async fn validate_http(&self, proxy: &Proxy) -> Result<ValidationOutcome> {
        if !proxy.protocol.is_http() {
            return Err(PoolError::Validation(format!(
                "HTTP probe requested for {} proxy {}",
                proxy.protocol,
                proxy.key()
            )));
        }
        self.validate(proxy).await
    }

    /// SOCKS4 probe; rejects anything that is not a SOCKS4 proxy.
    pub async fn validate_socks4(&self, proxy: &Proxy) -> Result<ValidationOutcome> {
        if proxy.protocol != ProxyProtocol::Socks4 {
            return Err(PoolError::Validation(format!(
                "SOCKS4 probe requested for {} proxy {}",
                proxy.protocol,
                proxy.key()
            )));
        }
        self.validate(proxy).await
    }

    /// SOCKS5 probe; rejects anything that is not a SOCKS5 proxy.
    pub async fn validate_socks5(&self, proxy: &Proxy) -> Result<ValidationOutcome> {
        if proxy.protocol != ProxyProtocol::Socks5 {
            return Err(PoolError::Validation(format!(
                "SOCKS5 probe requested for {} proxy {}",
                proxy.protocol,
                proxy.key()
            )));
        }
        self.validate(proxy).await
    }

    // -- HTTP ---------------------------------------------------------------

    async fn probe_http(&self, proxy: &Proxy, target: &ProbeTarget) -> anyhow::Result<()> {
        let mut stream = TcpStream::connect((proxy.ip.as_str(), proxy.port))
            .await
            .with_context(|| format!("connect to {}", proxy.endpoint()))?;

        if target.https {
            let mut request = format!(
                "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
                host = target.host,
                port = target.port,
            );
            if let Some(token) = proxy.basic_auth_token() {
                request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
            }
            request.push_str("\r\n");

            stream.write_all(request.as_bytes()).await?;
            let status = read_status_line(&mut stream).await?;
            if !(status.starts_with("HTTP/1.") && status_code(&status) == Some(200)) {
                bail!("CONNECT refused: {:?}", status);
            }
        } else {
            let request = format!(
                "GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n",
                path = target.path,
                host = target.host,
            );
            stream.write_all(request.as_bytes()).await?;
            let status = read_status_line(&mut stream).await?;
            if !(status.starts_with("HTTP/1.0 200") || status.starts_with("HTTP/1.1 200")) {
                bail!("GET refused: {:?}", status);
            }
        }
        Ok(())
    }

    // -- SOCKS4 -------------------------------------------------------------

    async fn probe_socks4(&self, proxy: &Proxy, target: &ProbeTarget) -> anyhow::Result<()> {
        // SOCKS4 carries a raw IPv4 address; no A record means no probe.
        let dest = self.resolve_v4(&target.host).await?;

        let mut stream = TcpStream::connect((proxy.ip.as_str(), proxy.port))
            .await
            .with_context(|| format!("connect to {}", proxy.endpoint()))?;

        let mut request = vec![0x04, 0x01, (target.port >> 8) as u8, (target.port & 0xff) as u8];
        request.extend_from_slice(&dest.octets());
        if let Some(user) = &proxy.username {
            request.extend_from_slice(user.as_bytes());
        }
        request.push(0x00);
        stream.write_all(&request).await?;

        let mut reply = [0u8; 8];
        stream.read_exact(&mut reply).await.context("short SOCKS4 reply")?;
        if reply[0] != 0x00 {
            bail!("SOCKS4 reply has bad version byte 0x{:02x}", reply[0]);
        }
        if reply[1] != 0x5a {
            bail!("SOCKS4 request rejected, code 0x{:02x}", reply[1]);
        }
        Ok(())
    }

    // -- SOCKS5 -------------------------------------------------------------

    async fn probe_socks5(&self, proxy: &Proxy, target: &ProbeTarget) -> anyhow::Result<()> {
        let mut stream = TcpStream::connect((proxy.ip.as_str(), proxy.port))
            .await
            .with_context(|| format!("connect to {}", proxy.endpoint()))?;

        // Method negotiation: no-auth, plus user/pass when credentialed.
        let greeting: &[u8] = if proxy.has_credentials() {
            &[0x05, 0x02, 0x00, 0x02]
        } else {
            &[0x05, 0x01, 0x00]
        };
        stream.write_all(greeting).await?;

        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await.context("short method reply")?;
        if choice[0] != 0x05 {
            bail!("not a SOCKS5 server (version 0x{:02x})", choice[0]);
        }
        match choice[1] {
            0x00 => {}
            0x02 => self.socks5_authenticate(proxy, &mut stream).await?,
            0xff => bail!("server rejected all auth methods"),
            method => bail!("server chose unsupported auth method 0x{:02x}", method),
        }

        // CONNECT request, preferring IPv4, then IPv6, then the domain name.
        let mut request = vec![0x05, 0x01, 0x00];
        match self.resolve_preferred(&target.host).await {
            ResolvedAddr::V4(v4) => {
                request.push(0x01);
                request.extend_from_slice(&v4.octets());
            }
            ResolvedAddr::V6(v6) => {
                request.push(0x04);
                request.extend_from_slice(&v6.octets());
            }
            ResolvedAddr::Domain => {
                let name = target.host.as_bytes();
                if name.len() > 255 {
                    bail!("target host name exceeds 255 bytes");
                }
                request.push(0x03);
                request.push(name.len() as u8);
                request.extend_from_slice(name);
            }
        }
        request.extend_from_slice(&target.port.to_be_bytes());
        stream.write_all(&request).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await.context("short connect reply")?;
        if head[0] != 0x05 {
            bail!("connect reply has bad version byte 0x{:02x}", head[0]);
        }
        if head[1] != 0x00 {
            bail!("connect rejected, code 0x{:02x}", head[1]);
        }

        // Drain the bound address so the reply is fully framed.
        let addr_len = match head[3] {
            0x01 => 4,
            0x04 => 16,
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize
            }
            atyp => bail!("connect reply has bad address type 0x{:02x}", atyp),
        };
        let mut tail = vec![0u8; addr_len + 2];
        stream.read_exact(&mut tail).await.context("short bound address")?;
        Ok(())
    }

    /// RFC 1929 username/password subnegotiation.
    async fn socks5_authenticate(&self, proxy: &Proxy, stream: &mut TcpStream) -> anyhow::Result<()> {
        let user = proxy.username.as_deref().unwrap_or("");
        let pass = proxy.password.as_deref().unwrap_or("");
        if user.len() > 255 || pass.len() > 255 {
            bail!("credentials exceed 255 bytes");
        }

        let mut frame = vec![0x01, user.len() as u8];
        frame.extend_from_slice(user.as_bytes());
        frame.push(pass.len() as u8);
        frame.extend_from_slice(pass.as_bytes());
        stream.write_all(&frame).await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await.context("short auth reply")?;
        if reply[1] != 0x00 {
            bail!("authentication rejected, code 0x{:02x}", reply[1]);
        }
        Ok(())
    }

    // -- resolution ---------------------------------------------------------

    async fn resolve_v4(&self, host: &str) -> anyhow::Result<Ipv4Addr> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(ip);
        }
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .with_context(|| format!("resolving {}", host))?;
        lookup
            .iter()
            .find_map(|ip| match ip {
                std::net::IpAddr::V4(v4) => Some(v4),
                _ => None,
            })
            .ok_or_else(|| anyhow!("no A record for {}", host))
    }

    async fn resolve_preferred(&self, host: &str) -> ResolvedAddr {
        if let Ok(v4) = host.parse::<Ipv4Addr>() {
            return ResolvedAddr::V4(v4);
        }
        if let Ok(v6) = host.parse::<Ipv6Addr>() {
            return ResolvedAddr::V6(v6);
        }
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => {
                let mut v6 = None;
                for ip in lookup.iter() {
                    match ip {
                        std::net::IpAddr::V4(addr) => return ResolvedAddr::V4(addr),
                        std::net::IpAddr::V6(addr) => v6.get_or_insert(addr),
                    };
                }
                v6.map(ResolvedAddr::V6).unwrap_or(ResolvedAddr::Domain)
            }
            Err(e) => {
                warn!("resolution of {} failed ({}), sending domain name", host, e);
                ResolvedAddr::Domain
            }
        }
    }
}

enum ResolvedAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain,
}

/// Reads the first response line, capped at [`RESPONSE_HEAD_CAP`] bytes.
async fn read_status_line(stream: &mut TcpStream) -> anyhow::Result<String> {
    let mut buf = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            bail!("connection closed before status line");
        }
        if byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
        if buf.len() > RESPONSE_HEAD_CAP {
            bail!("status line exceeds {} bytes", RESPONSE_HEAD_CAP);
        }
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn status_code(status_line: &str) -> Option<u16> {
    status_line.split_whitespace().nth(1)?.parse().ok()
}
