//! Text administrative dialogue with the broker.
//!
//! `status` lists one line per registered function:
//! `<function>\t<queued>\t<running>\t<workers>`, terminated by a lone `.`.
//! The dispatcher scrapes the worker column to size its admission ceiling.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::BrokerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub function: String,
    pub queued: u64,
    pub running: u64,
    pub workers: u64,
}

pub fn parse_status_line(line: &str) -> Option<QueueStatus> {
    let mut fields = line.split(['\t', ' ']).filter(|f| !f.is_empty());
    Some(QueueStatus {
        function: fields.next()?.to_string(),
        queued: fields.next()?.parse().ok()?,
        running: fields.next()?.parse().ok()?,
        workers: fields.next()?.parse().ok()?,
    })
}

pub async fn status(host: &str, port: u16) -> Result<Vec<QueueStatus>, BrokerError> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(BrokerError::Connect)?;
    let mut reader = BufReader::new(stream);
    reader
        .get_mut()
        .write_all(b"status\n")
        .await
        .map_err(BrokerError::Connect)?;

    let mut out = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(BrokerError::Connect)?;
        if n == 0 || line.trim() == "." {
            break;
        }
        if let Some(row) = parse_status_line(line.trim()) {
            out.push(row);
        }
    }
    Ok(out)
}

/// Registered worker count for one function, when the broker reports it.
pub async fn worker_count(host: &str, port: u16, function: &str) -> Result<Option<u64>, BrokerError> {
    let rows = status(host, port).await?;
    Ok(rows
        .into_iter()
        .find(|row| row.function == function)
        .map(|row| row.workers))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lines_parse() {
        let row = parse_status_line("vr_stt\t3\t1\t12").unwrap();
        assert_eq!(row.function, "vr_stt");
        assert_eq!(row.queued, 3);
        assert_eq!(row.running, 1);
        assert_eq!(row.workers, 12);
        assert!(parse_status_line(".").is_none());
        assert!(parse_status_line("vr_stt\tx\t0\t1").is_none());
    }
}
