//! HTTP client a replica uses to talk to its master

use crate::common::{Error, Result};
use crate::replication::offset::Position;
use crate::replication::wal::WalEntry;
use crate::replication::{OffsetInfo, OffsetReport, WalBatch, CURRENT_OFFSET_HEADER};
use bytes::Bytes;
use reqwest::StatusCode;
use std::time::Duration;

/// A dump fetched from the master
#[derive(Debug, Clone)]
pub struct Dump {
    /// Position the dump reflects
    pub position: Position,
    /// Length announced by the master
    pub declared_len: u64,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct MasterClient {
    http: reqwest::Client,
    base_url: String,
}

impl MasterClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::GONE {
            return Err(Error::OffsetTrimmed(body));
        }
        Err(Error::MasterStatus {
            status: status.as_u16(),
            body,
        })
    }

    /// Entries after `position`, at most `limit` (`0` = unbounded)
    pub async fn fetch_wal(&self, position: Position, limit: usize) -> Result<Vec<WalEntry>> {
        let resp = self
            .http
            .get(self.url("/replication/wal"))
            .query(&[
                ("limit", limit.to_string()),
                ("offset", position.to_string()),
            ])
            .send()
            .await?;
        let batch: WalBatch = Self::check(resp).await?.json().await?;
        Ok(batch.entries)
    }

    /// The master's own applied position
    pub async fn current_offset(&self) -> Result<Position> {
        let resp = self.http.get(self.url("/replication/offset")).send().await?;
        let info: OffsetInfo = Self::check(resp).await?.json().await?;
        Ok(info.offset)
    }

    pub async fn report_offset(&self, replica_id: &str, position: Position) -> Result<()> {
        let resp = self
            .http
            .post(self.url("/replication/offset"))
            .json(&OffsetReport {
                replica_id: replica_id.to_string(),
                offset: position,
            })
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    /// Download a full dump. The body is buffered so its length can be checked.
    ///
    /// The master registers `replica_id` at the dump's position.
    pub async fn fetch_dump(&self, replica_id: &str) -> Result<Dump> {
        let req = self
            .http
            .get(self.url("/dump"))
            .query(&[("replica_id", replica_id)]);
        let resp = Self::check(req.send().await?).await?;

        let declared_len = resp
            .content_length()
            .ok_or_else(|| Error::Bootstrap("dump response has no Content-Length".into()))?;
        let position: Position = resp
            .headers()
            .get(CURRENT_OFFSET_HEADER)
            .ok_or_else(|| Error::Bootstrap(format!("dump response has no {} header", CURRENT_OFFSET_HEADER)))?
            .to_str()
            .map_err(|_| Error::InvalidOffset("non-ASCII offset header".into()))?
            .parse()?;
        let body = resp.bytes().await?;

        tracing::info!(offset = %position, bytes = declared_len, "dump downloaded from {}", self.base_url);
        Ok(Dump {
            position,
            declared_len,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        let client = MasterClient::new("http://127.0.0.1:6380/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:6380");
        assert_eq!(
            client.url("/replication/wal"),
            "http://127.0.0.1:6380/replication/wal"
        );
    }
}
