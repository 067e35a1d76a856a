//! [`BookingStore`] over the JSON-lines protocol.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::api::{ApiError, BookingStore};
use crate::availability::AvailabilityPayload;
use crate::limits::{MAX_BATCH_SPACES, MAX_LINE_LEN};
use crate::model::*;
use crate::protocol::{ErrorBody, Request, Response};
use crate::slots::TimeSlot;
use crate::store::StoreError;

/// Attempts per chunk in [`RemoteStore::batch_check_all`].
pub const BATCH_ATTEMPTS: u32 = 3;
/// First retry delay; doubles per attempt.
pub const BATCH_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("connection closed by server")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Remote(StoreError),
}

impl ClientError {
    fn is_transient(&self) -> bool {
        matches!(self, ClientError::Io(_) | ClientError::Timeout(_) | ClientError::Closed)
    }
}

impl From<LinesCodecError> for ClientError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::Io(e) => ClientError::Io(e),
            LinesCodecError::MaxLineLengthExceeded => ClientError::Protocol("response line too long".into()),
        }
    }
}

impl From<ErrorBody> for ClientError {
    fn from(body: ErrorBody) -> Self {
        match body.detail {
            Some(e) => ClientError::Remote(e),
            None => ClientError::Protocol(format!("{}: {}", body.kind, body.message)),
        }
    }
}

type Lines = Framed<TcpStream, LinesCodec>;

async fn connect(addr: &str) -> Result<Lines, ClientError> {
    let socket = TcpStream::connect(addr).await?;
    socket.set_nodelay(true)?;
    Ok(Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN)))
}

async fn round_trip(conn: &mut Lines, line: String) -> Result<Response, ClientError> {
    conn.send(line).await?;
    let reply = conn.next().await.ok_or(ClientError::Closed)??;
    serde_json::from_str(&reply).map_err(|e| ClientError::Protocol(format!("bad response: {e}")))
}

/// One lazily opened connection, reopened after any transport failure.
/// Requests on one `RemoteStore` are serialized.
pub struct RemoteStore {
    addr: String,
    timeout: Duration,
    conn: Mutex<Option<Lines>>,
}

impl RemoteStore {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            conn: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one request and wait for its response.
    pub async fn call(&self, req: &Request) -> Result<Value, ClientError> {
        let line = serde_json::to_string(req).map_err(|e| ClientError::Protocol(e.to_string()))?;
        let mut guard = self.conn.lock().await;
        let attempt = async {
            if guard.is_none() {
                *guard = Some(connect(&self.addr).await?);
            }
            match guard.as_mut() {
                Some(conn) => round_trip(conn, line).await,
                None => Err(ClientError::Closed),
            }
        };
        let result = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(self.timeout)),
        };
        if result.as_ref().is_err_and(ClientError::is_transient) {
            // A late reply would be read as the answer to the next request.
            *guard = None;
        }
        match result? {
            Response::Ok(value) => Ok(value),
            Response::Error(body) => Err(body.into()),
            Response::Event(_) => Err(ClientError::Protocol("unexpected event outside watch".into())),
        }
    }

    pub async fn call_as<T: DeserializeOwned>(&self, req: &Request) -> Result<T, ClientError> {
        let value = self.call(req).await?;
        serde_json::from_value(value).map_err(|e| ClientError::Protocol(format!("unexpected payload: {e}")))
    }

    /// Free seats for any number of spaces. Ids go out in chunks the server
    /// accepts; a chunk that fails on transport is retried with backoff.
    pub async fn batch_check_all(
        &self,
        space_ids: &[SpaceId],
        date: NaiveDate,
        start_time: Clock,
        end_time: Clock,
    ) -> Result<HashMap<SpaceId, SpotAvailability>, ClientError> {
        let mut out = HashMap::with_capacity(space_ids.len());
        for chunk in space_ids.chunks(MAX_BATCH_SPACES) {
            let req = Request::BatchCheck {
                space_ids: chunk.to_vec(),
                date,
                start_time,
                end_time,
            };
            let mut attempt = 0;
            let part: HashMap<SpaceId, SpotAvailability> = loop {
                attempt += 1;
                match self.call_as(&req).await {
                    Ok(part) => break part,
                    Err(e) if e.is_transient() && attempt < BATCH_ATTEMPTS => {
                        let delay = BATCH_BACKOFF * 2u32.pow(attempt - 1);
                        warn!(attempt, ?delay, "batch check failed, retrying: {e}");
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => return Err(e),
                }
            };
            out.extend(part);
        }
        Ok(out)
    }

    /// Open a separate connection that streams the space's events.
    pub async fn watch(&self, space_id: SpaceId) -> Result<Watcher, ClientError> {
        self.open_watch(space_id, None).await
    }

    /// Like [`RemoteStore::watch`], limited to claims on `date` plus
    /// space-wide changes.
    pub async fn watch_day(&self, space_id: SpaceId, date: NaiveDate) -> Result<Watcher, ClientError> {
        self.open_watch(space_id, Some(date)).await
    }

    async fn open_watch(&self, space_id: SpaceId, date: Option<NaiveDate>) -> Result<Watcher, ClientError> {
        let mut conn = connect(&self.addr).await?;
        let line = serde_json::to_string(&Request::Watch { space_id, date })
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        match tokio::time::timeout(self.timeout, round_trip(&mut conn, line)).await {
            Err(_) => Err(ClientError::Timeout(self.timeout)),
            Ok(Err(e)) => Err(e),
            Ok(Ok(Response::Ok(_))) => {
                debug!(space = %space_id, "watching");
                Ok(Watcher { conn })
            }
            Ok(Ok(Response::Error(body))) => Err(body.into()),
            Ok(Ok(Response::Event(_))) => Err(ClientError::Protocol("event before watch ack".into())),
        }
    }
}

/// Event stream of one watched space.
#[derive(Debug)]
pub struct Watcher {
    conn: Lines,
}

impl Watcher {
    /// Next event; `None` once the server closes the stream.
    pub async fn next_event(&mut self) -> Option<Result<Event, ClientError>> {
        let line = match self.conn.next().await? {
            Ok(line) => line,
            Err(e) => return Some(Err(e.into())),
        };
        Some(match serde_json::from_str::<Response>(&line) {
            Ok(Response::Event(event)) => Ok(event),
            Ok(Response::Error(body)) => Err(body.into()),
            Ok(Response::Ok(_)) => Err(ClientError::Protocol("unexpected reply in watch stream".into())),
            Err(e) => Err(ClientError::Protocol(format!("bad event: {e}"))),
        })
    }
}

#[async_trait]
impl BookingStore for RemoteStore {
    async fn get_space(&self, space_id: SpaceId) -> Result<SpaceInfo, ApiError> {
        Ok(self.call_as(&Request::GetSpace { id: space_id }).await?)
    }

    async fn get_availability(&self, space_id: SpaceId) -> Result<AvailabilityPayload, ApiError> {
        Ok(self.call_as(&Request::GetAvailability { id: space_id }).await?)
    }

    async fn check_conflicts(
        &self,
        space_id: SpaceId,
        date: NaiveDate,
        start: Clock,
        end: Clock,
        seats: u32,
    ) -> Result<ConflictReport, ApiError> {
        let req = Request::CheckConflicts {
            space_id,
            date,
            start_time: start,
            end_time: end,
            seats,
        };
        Ok(self.call_as(&req).await?)
    }

    async fn acquire_reservation_lock(&self, req: LockRequest) -> Result<LockResult, ApiError> {
        Ok(self.call_as(&Request::AcquireLock(req)).await?)
    }

    async fn release_hold(&self, token: Ulid) -> Result<(), ApiError> {
        self.call(&Request::ReleaseHold { token }).await?;
        Ok(())
    }

    async fn promote_hold(&self, req: PromoteRequest) -> Result<Booking, ApiError> {
        Ok(self.call_as(&Request::PromoteHold(req)).await?)
    }

    async fn get_alternative_slots(
        &self,
        space_id: SpaceId,
        date: NaiveDate,
        duration_minutes: u32,
    ) -> Result<Vec<TimeSlot>, ApiError> {
        let req = Request::AlternativeSlots {
            space_id,
            date,
            duration_minutes,
        };
        Ok(self.call_as(&req).await?)
    }

    async fn batch_check_availability(
        &self,
        space_ids: &[SpaceId],
        date: NaiveDate,
        start: Clock,
        end: Clock,
    ) -> Result<HashMap<SpaceId, SpotAvailability>, ApiError> {
        Ok(self.batch_check_all(space_ids, date, start, end).await?)
    }

    async fn day_bookings(&self, space_id: SpaceId, date: NaiveDate) -> Result<Vec<Claim>, ApiError> {
        Ok(self.call_as(&Request::DayBookings { space_id, date }).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let remote = RemoteStore::new(addr, Duration::from_secs(1));
        let err = BookingStore::get_space(&remote, Ulid::new()).await.unwrap_err();
        assert!(err.is_unreachable(), "{err}");
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });
        let remote = RemoteStore::new(addr, Duration::from_millis(100));
        let err = remote.call(&Request::GetSpace { id: Ulid::new() }).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
    }

    #[tokio::test]
    async fn error_bodies_map_to_remote_or_protocol() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let id = Ulid::new();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            let replies = [
                Response::Error(StoreError::NotFound { id }.into()).to_line(),
                Response::Error(ErrorBody::bad_request("nope")).to_line(),
            ];
            for reply in replies {
                lines.next_line().await.unwrap();
                write.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
            }
        });

        let remote = RemoteStore::new(addr, Duration::from_secs(1));
        let err = remote.call(&Request::GetSpace { id }).await.unwrap_err();
        assert!(matches!(err, ClientError::Remote(StoreError::NotFound { .. })));
        let err = remote.call(&Request::GetSpace { id }).await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol(ref m) if m.starts_with("bad_request")));
    }
}
