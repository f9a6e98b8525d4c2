//! Streams rows from a channel into the store, one upsert statement per batch.
//!
//! Rows are collected until either `max_size` rows are waiting or `max_fill` has passed since the
//! first row of the batch arrived, whichever comes first. The first failed write ends the stream with
//! that error. Nothing is retried here, since every write is an idempotent upsert that can simply be
//! replayed by restarting the stream.
use crate::error::{Cancelled, Error};
use crate::schema::Row;
use crate::store::{Store, UpsertStatement};

use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamerConfig {
    pub max_size: usize,
    pub max_fill: Duration,
}

impl StreamerConfig {
    pub fn new(max_size: usize, max_fill: Duration) -> StreamerConfig {
        StreamerConfig {
            max_size: max_size.max(1),
            max_fill,
        }
    }
}

impl Default for StreamerConfig {
    fn default() -> StreamerConfig {
        StreamerConfig::new(100, Duration::from_millis(250))
    }
}

#[derive(Debug, Clone)]
pub struct Streamer<S: Store> {
    store: S,
    statement: UpsertStatement,
    config: StreamerConfig,
}

impl<S: Store> Streamer<S> {
    pub fn new(store: S, statement: UpsertStatement, config: StreamerConfig) -> Streamer<S> {
        Streamer {
            store,
            statement,
            config,
        }
    }

    /// Consumes the channel until it is closed, returning the total number of rows written. Returns
    /// `Cancelled` if the token is cancelled first, in which case rows of the unfinished batch are
    /// dropped. An in flight write is always allowed to finish before the token is checked again.
    pub async fn stream<T>(
        &self,
        mut records: mpsc::Receiver<T>,
        cancel: CancellationToken,
    ) -> Result<u64, Error>
    where
        T: Into<Row> + Send,
    {
        let table = self.statement.table;
        let mut batch: Vec<Row> = Vec::with_capacity(self.config.max_size);
        let mut deadline: Option<Instant> = None;
        let mut written = 0u64;

        log::debug!("Starting upsert stream for table: {}", table);
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    if !batch.is_empty() {
                        log::warn!(
                            "Upsert stream for {} was cancelled, discarding {} unwritten rows",
                            table,
                            batch.len()
                        );
                    }
                    return Err(Cancelled.into());
                }
                next = records.recv() => match next {
                    Some(record) => {
                        batch.push(record.into());
                        if deadline.is_none() {
                            deadline = Some(Instant::now() + self.config.max_fill);
                        }
                        if batch.len() >= self.config.max_size {
                            written += self.flush(&mut batch).await?;
                            deadline = None;
                        }
                    }
                    None => {
                        written += self.flush(&mut batch).await?;
                        log::info!(
                            "Upsert stream for {} finished after writing {} rows",
                            table,
                            written
                        );
                        return Ok(written);
                    }
                },
                _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    written += self.flush(&mut batch).await?;
                    deadline = None;
                }
            }
        }
    }

    async fn flush(&self, batch: &mut Vec<Row>) -> Result<u64, Error> {
        if batch.is_empty() {
            return Ok(0);
        }
        let rows = std::mem::replace(batch, Vec::with_capacity(self.config.max_size));
        let count = rows.len() as u64;
        match self.store.upsert(&self.statement, rows).await {
            Ok(_) => {
                log::debug!("Upserted batch of {} rows into {}", count, self.statement.table);
                Ok(count)
            }
            Err(err) => {
                log::error!(
                    "Failed to upsert batch of {} rows into {}: {}",
                    count,
                    self.statement.table,
                    err
                );
                Err(err.into())
            }
        }
    }
}
