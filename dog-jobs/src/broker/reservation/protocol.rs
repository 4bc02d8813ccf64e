//! Line-framed text protocol of the reservation server.
//!
//! Every command and reply ends with `\r\n`. Commands that carry a job
//! body send it on the following line, length-prefixed in the command.
//! A reserved job belongs to the connection that reserved it: only that
//! connection may delete, release, touch or bury it, and closing the
//! connection releases it.

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use crate::{JobsError, JobsResult};

/// Outcome of a `reserve-with-timeout` command
#[derive(Debug)]
pub(crate) enum Reserved {
    Job { id: u64, body: Vec<u8> },
    TimedOut,
    /// A job reserved by this connection is about to hit its TTR
    DeadlineSoon,
}

/// Counters from `stats-tube`
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct TubeStats {
    pub ready: u64,
    pub reserved: u64,
    pub delayed: u64,
}

/// One server connection bound to a tube for both producing and consuming
pub(crate) struct Connection {
    stream: BufStream<TcpStream>,
}

impl Connection {
    pub(crate) async fn open(
        addr: &str,
        tube: &str,
        connect_timeout: Duration,
    ) -> JobsResult<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| JobsError::BrokerUnavailable(format!("connect to {addr} timed out")))?
            .map_err(|e| JobsError::BrokerUnavailable(format!("connect to {addr}: {e}")))?;
        let _ = stream.set_nodelay(true);

        let mut conn = Self {
            stream: BufStream::new(stream),
        };
        conn.use_tube(tube).await?;
        conn.watch(tube).await?;
        if tube != "default" {
            conn.ignore("default").await?;
        }
        Ok(conn)
    }

    async fn use_tube(&mut self, tube: &str) -> JobsResult<()> {
        let line = self.command(&format!("use {tube}"), None).await?;
        match line.strip_prefix("USING ") {
            Some(name) if name == tube => Ok(()),
            _ => Err(unexpected("use", &line)),
        }
    }

    async fn watch(&mut self, tube: &str) -> JobsResult<()> {
        let line = self.command(&format!("watch {tube}"), None).await?;
        if line.starts_with("WATCHING") {
            Ok(())
        } else {
            Err(unexpected("watch", &line))
        }
    }

    async fn ignore(&mut self, tube: &str) -> JobsResult<()> {
        let line = self.command(&format!("ignore {tube}"), None).await?;
        if line.starts_with("WATCHING") || line == "NOT_IGNORED" {
            Ok(())
        } else {
            Err(unexpected("ignore", &line))
        }
    }

    /// Store a job, returning the server-assigned id
    pub(crate) async fn put(
        &mut self,
        priority: u32,
        delay: u64,
        ttr: u64,
        body: &[u8],
    ) -> JobsResult<u64> {
        let line = self
            .command(&format!("put {priority} {delay} {ttr} {}", body.len()), Some(body))
            .await?;

        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("INSERTED") => parse_u64("put", parts.next(), &line),
            Some("BURIED") => Err(JobsError::BrokerUnavailable(
                "server is out of memory, job was buried".to_string(),
            )),
            Some("JOB_TOO_BIG") => Err(JobsError::InvalidPayload(format!(
                "server rejected a {} byte job as too big",
                body.len()
            ))),
            Some("DRAINING") => Err(JobsError::BrokerUnavailable(
                "server is draining".to_string(),
            )),
            _ => Err(unexpected("put", &line)),
        }
    }

    pub(crate) async fn reserve(&mut self, timeout_secs: u64) -> JobsResult<Reserved> {
        let line = self
            .command(&format!("reserve-with-timeout {timeout_secs}"), None)
            .await?;

        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("RESERVED") => {
                let id = parse_u64("reserve", parts.next(), &line)?;
                let len = parse_u64("reserve", parts.next(), &line)? as usize;
                let body = self.read_body(len).await?;
                Ok(Reserved::Job { id, body })
            }
            Some("TIMED_OUT") => Ok(Reserved::TimedOut),
            Some("DEADLINE_SOON") => Ok(Reserved::DeadlineSoon),
            _ => Err(unexpected("reserve", &line)),
        }
    }

    /// `false` when the server no longer knows the job
    pub(crate) async fn delete(&mut self, id: u64) -> JobsResult<bool> {
        let line = self.command(&format!("delete {id}"), None).await?;
        found("delete", "DELETED", &line)
    }

    pub(crate) async fn touch(&mut self, id: u64) -> JobsResult<bool> {
        let line = self.command(&format!("touch {id}"), None).await?;
        found("touch", "TOUCHED", &line)
    }

    /// Hand a reserved job back to the tube, ready after `delay` seconds.
    /// The stored body is unchanged.
    pub(crate) async fn release(&mut self, id: u64, priority: u32, delay: u64) -> JobsResult<bool> {
        let line = self
            .command(&format!("release {id} {priority} {delay}"), None)
            .await?;
        match line.as_str() {
            "BURIED" => Err(JobsError::BrokerUnavailable(
                "server is out of memory, released job was buried".to_string(),
            )),
            _ => found("release", "RELEASED", &line),
        }
    }

    /// Park an undeliverable job where operators can inspect it
    pub(crate) async fn bury(&mut self, id: u64, priority: u32) -> JobsResult<bool> {
        let line = self.command(&format!("bury {id} {priority}"), None).await?;
        found("bury", "BURIED", &line)
    }

    pub(crate) async fn stats_tube(&mut self, tube: &str) -> JobsResult<TubeStats> {
        let line = self.command(&format!("stats-tube {tube}"), None).await?;

        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("OK") => {
                let len = parse_u64("stats-tube", parts.next(), &line)? as usize;
                let body = self.read_body(len).await?;
                Ok(parse_tube_stats(&String::from_utf8_lossy(&body)))
            }
            // The tube is created lazily by the first put
            Some("NOT_FOUND") => Ok(TubeStats::default()),
            _ => Err(unexpected("stats-tube", &line)),
        }
    }

    async fn command(&mut self, command: &str, body: Option<&[u8]>) -> JobsResult<String> {
        self.stream.write_all(command.as_bytes()).await.map_err(io_error)?;
        self.stream.write_all(b"\r\n").await.map_err(io_error)?;
        if let Some(body) = body {
            self.stream.write_all(body).await.map_err(io_error)?;
            self.stream.write_all(b"\r\n").await.map_err(io_error)?;
        }
        self.stream.flush().await.map_err(io_error)?;

        self.read_line().await
    }

    async fn read_line(&mut self) -> JobsResult<String> {
        let mut line = String::new();
        let read = self.stream.read_line(&mut line).await.map_err(io_error)?;
        if read == 0 {
            return Err(JobsError::BrokerUnavailable(
                "connection closed by server".to_string(),
            ));
        }

        let line = line.trim_end_matches(&['\r', '\n'][..]).to_string();
        match line.as_str() {
            "OUT_OF_MEMORY" | "INTERNAL_ERROR" => Err(JobsError::BrokerUnavailable(format!(
                "server error: {line}"
            ))),
            "BAD_FORMAT" | "UNKNOWN_COMMAND" | "EXPECTED_CRLF" => {
                Err(JobsError::Protocol(format!("server rejected command: {line}")))
            }
            _ => Ok(line),
        }
    }

    async fn read_body(&mut self, len: usize) -> JobsResult<Vec<u8>> {
        let mut body = vec![0u8; len + 2];
        self.stream.read_exact(&mut body).await.map_err(io_error)?;
        if !body.ends_with(b"\r\n") {
            return Err(JobsError::Protocol("job body is not CRLF terminated".to_string()));
        }
        body.truncate(len);
        Ok(body)
    }
}

fn io_error(err: std::io::Error) -> JobsError {
    JobsError::BrokerUnavailable(format!("connection error: {err}"))
}

fn unexpected(command: &str, line: &str) -> JobsError {
    JobsError::Protocol(format!("unexpected reply to {command}: {line:?}"))
}

fn parse_u64(command: &str, field: Option<&str>, line: &str) -> JobsResult<u64> {
    field
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| unexpected(command, line))
}

fn found(command: &str, success: &str, line: &str) -> JobsResult<bool> {
    if line == success {
        Ok(true)
    } else if line == "NOT_FOUND" {
        Ok(false)
    } else {
        Err(unexpected(command, line))
    }
}

/// Parse the YAML mapping returned by `stats-tube`
pub(crate) fn parse_tube_stats(body: &str) -> TubeStats {
    let mut stats = TubeStats::default();
    for line in body.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().parse().unwrap_or(0);
        match key.trim() {
            "current-jobs-ready" => stats.ready = value,
            "current-jobs-reserved" => stats.reserved = value,
            "current-jobs-delayed" => stats.delayed = value,
            _ => {}
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tube_stats_yaml() {
        let body = "---\nname: emails\ncurrent-jobs-urgent: 0\ncurrent-jobs-ready: 3\n\
                    current-jobs-reserved: 1\ncurrent-jobs-delayed: 2\ntotal-jobs: 9\n";
        assert_eq!(
            parse_tube_stats(body),
            TubeStats {
                ready: 3,
                reserved: 1,
                delayed: 2,
            }
        );
    }

    #[test]
    fn classifies_found_replies() {
        assert!(found("delete", "DELETED", "DELETED").unwrap());
        assert!(!found("delete", "DELETED", "NOT_FOUND").unwrap());
        assert!(matches!(
            found("delete", "DELETED", "WHAT"),
            Err(JobsError::Protocol(_))
        ));
    }
}
