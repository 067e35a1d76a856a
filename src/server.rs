use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

use crate::limits::MAX_LINE_LEN;
use crate::model::SpaceId;
use crate::observability;
use crate::protocol::{ErrorBody, Request, Response, availability_text};
use crate::store::{Store, StoreError, now_ms};

type Lines = Framed<TcpStream, LinesCodec>;

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

async fn send(framed: &mut Lines, response: Response) -> io::Result<()> {
    framed.send(response.to_line()).await.map_err(codec_err)
}

/// Run one store request.
async fn execute(store: &Store, req: Request) -> Result<Response, StoreError> {
    let now = now_ms();
    let response = match req {
        Request::RegisterSpace { id, name, settings, availability } => {
            store
                .register_space(id, name, settings, availability_text(&availability))
                .await?;
            Response::ok(json!({ "id": id }))
        }
        Request::UpdateSpace { id, name, settings, availability } => {
            store
                .update_space(id, name, settings, availability_text(&availability))
                .await?;
            Response::ok(json!({ "id": id }))
        }
        Request::RemoveSpace { id } => {
            store.remove_space(id, now).await?;
            Response::ok(json!({ "id": id }))
        }
        Request::GetSpace { id } => Response::ok(store.get_space(id).await?),
        Request::GetAvailability { id } => Response::ok(store.get_availability(id).await?),
        Request::CheckConflicts { space_id, date, start_time, end_time, seats } => Response::ok(
            store
                .check_conflicts(space_id, date, start_time, end_time, seats, now)
                .await?,
        ),
        Request::AcquireLock(lock) => Response::ok(store.acquire_lock(lock, now).await?),
        Request::ReleaseHold { token } => {
            let space_id = store.release_hold(token).await?;
            Response::ok(json!({ "space_id": space_id }))
        }
        Request::RefreshHold { token, ttl_ms } => {
            Response::ok(store.refresh_hold(token, ttl_ms, now).await?)
        }
        Request::PromoteHold(req) => Response::ok(store.promote_hold(req, now).await?),
        Request::TransitionBooking { id, action } => {
            Response::ok(store.transition_booking(id, action, now).await?)
        }
        Request::CancelBooking { id } => Response::ok(store.cancel_booking(id).await?),
        Request::AlternativeSlots { space_id, date, duration_minutes } => Response::ok(
            store
                .alternative_slots(space_id, date, duration_minutes, now)
                .await?,
        ),
        Request::BatchCheck { space_ids, date, start_time, end_time } => Response::ok(
            store
                .batch_check(&space_ids, date, start_time, end_time, now)
                .await?,
        ),
        Request::DaySlots { space_id, date } => Response::ok(store.day_slots(space_id, date, now).await?),
        Request::DayBookings { space_id, date } => {
            Response::ok(store.day_claims(space_id, date, now).await?)
        }
        Request::Watch { .. } => Response::Error(ErrorBody::bad_request(
            "watch takes over the connection and cannot be mixed with other requests",
        )),
    };
    Ok(response)
}

/// Serve one connection until the peer hangs up.
pub async fn process_connection(socket: TcpStream, store: Arc<Store>) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                send(&mut framed, Response::Error(ErrorBody::bad_request("request line too long"))).await?;
                continue;
            }
            Err(LinesCodecError::Io(e)) => return Err(e),
        };
        if line.trim().is_empty() {
            continue;
        }
        let req: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                debug!("bad request line: {e}");
                send(&mut framed, Response::Error(ErrorBody::bad_request(e))).await?;
                continue;
            }
        };
        if let Request::Watch { space_id, date } = req {
            return watch(framed, &store, space_id, date).await;
        }

        let label = observability::request_label(&req);
        let started = Instant::now();
        let response = match execute(&store, req).await {
            Ok(response) => response,
            Err(e) => Response::Error(e.into()),
        };
        let status = if matches!(response, Response::Ok(_)) { "ok" } else { "error" };
        metrics::counter!(observability::REQUESTS_TOTAL, "op" => label, "status" => status).increment(1);
        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => label)
            .record(started.elapsed().as_secs_f64());
        send(&mut framed, response).await?;
    }
    Ok(())
}

/// Stream the applied events of one space, optionally one day of it, until
/// the peer hangs up or the space goes away. A watcher that falls behind
/// gets a `lagged` error and should re-read the day it shows.
async fn watch(mut framed: Lines, store: &Store, space_id: SpaceId, date: Option<NaiveDate>) -> io::Result<()> {
    if store.get_space_state(&space_id).is_none() {
        return send(&mut framed, Response::Error(StoreError::NotFound { id: space_id }.into())).await;
    }
    let mut rx = store.notify.subscribe(space_id, date);
    send(&mut framed, Response::ok(json!({ "watching": space_id, "date": date }))).await?;
    info!(space = %space_id, ?date, "watcher attached");

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => send(&mut framed, Response::Event(event)).await?,
                Err(RecvError::Lagged(missed)) => {
                    warn!(space = %space_id, missed, "watcher lagged");
                    let body = ErrorBody {
                        kind: "lagged".into(),
                        message: format!("{missed} event(s) dropped"),
                        detail: None,
                    };
                    send(&mut framed, Response::Error(body)).await?;
                }
                Err(RecvError::Closed) => break,
            },
            line = framed.next() => match line {
                None | Some(Err(LinesCodecError::Io(_))) => break,
                Some(_) => {}
            },
        }
    }
    debug!(space = %space_id, "watcher detached");
    Ok(())
}

/// Accept connections until `shutdown` resolves, then wait up to 10s for
/// open connections to finish.
pub async fn serve(
    listener: TcpListener,
    store: Arc<Store>,
    max_connections: usize,
    shutdown: impl Future<Output = ()>,
) {
    let semaphore = Arc::new(Semaphore::new(max_connections));
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                debug!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let store = store.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = process_connection(socket, store).await {
                        error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
}
