use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::{MAX_LINE_LEN, MAX_SUBSCRIPTIONS_PER_CONNECTION};
use crate::model::*;
use crate::observability;
use crate::protocol::{self, Command, Reply};
use crate::service::Service;

const NOTICE_QUEUE: usize = 64;

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "request line too long")
        }
    }
}

fn to_json<T: Serialize>(value: T) -> Result<serde_json::Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Collaborator(format!("encode: {e}")))
}

/// Serve one client: one JSON request per line, one JSON reply per line, with
/// confirmation notices for subscribed accounts interleaved as they arrive.
pub async fn process_connection(socket: TcpStream, service: Arc<Service>) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (notice_tx, mut notice_rx) = mpsc::channel::<ConfirmationNotice>(NOTICE_QUEUE);
    let mut forwarders: HashMap<Ulid, JoinHandle<()>> = HashMap::new();

    let result = loop {
        tokio::select! {
            frame = framed.next() => {
                let line = match frame {
                    None => break Ok(()),
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let reply = Reply::from(&EngineError::LimitExceeded("request line too long"));
                        let _ = framed.send(reply.to_line()).await;
                        break Err(codec_err(LinesCodecError::MaxLineLengthExceeded));
                    }
                    Some(Err(e)) => break Err(codec_err(e)),
                };
                if line.trim().is_empty() {
                    continue;
                }

                let reply = match protocol::parse_command(&line) {
                    Err(e) => {
                        debug!("malformed request: {e}");
                        Reply::malformed(&e)
                    }
                    Ok(Command::Subscribe { account_id }) => {
                        subscribe(&service, &mut forwarders, account_id, &notice_tx)
                    }
                    Ok(cmd) => handle_command(&service, cmd).await,
                };
                if let Err(e) = framed.send(reply.to_line()).await {
                    break Err(codec_err(e));
                }
            }
            Some(notice) = notice_rx.recv() => {
                if let Err(e) = framed.send(Reply::Notice(notice).to_line()).await {
                    break Err(codec_err(e));
                }
            }
        }
    };

    for forwarder in forwarders.into_values() {
        forwarder.abort();
    }
    result
}

/// Start forwarding notices for `account_id` unless this connection already
/// does. Repeats are acknowledged without a second forwarder.
fn subscribe(
    service: &Service,
    forwarders: &mut HashMap<Ulid, JoinHandle<()>>,
    account_id: Ulid,
    tx: &mpsc::Sender<ConfirmationNotice>,
) -> Reply {
    if !forwarders.contains_key(&account_id) {
        if forwarders.len() >= MAX_SUBSCRIPTIONS_PER_CONNECTION {
            metrics::counter!(observability::COMMANDS_TOTAL, "command" => "subscribe", "status" => "error")
                .increment(1);
            return Reply::from(&EngineError::LimitExceeded("too many subscriptions"));
        }
        forwarders.insert(account_id, forward_notices(service, account_id, tx.clone()));
    }
    metrics::counter!(observability::COMMANDS_TOTAL, "command" => "subscribe", "status" => "ok")
        .increment(1);
    Reply::Ok(json!({ "subscribed": account_id }))
}

/// Pipe the account's broadcast channel into this connection's notice queue.
fn forward_notices(
    service: &Service,
    account_id: Ulid,
    tx: mpsc::Sender<ConfirmationNotice>,
) -> JoinHandle<()> {
    let mut rx = service.hub.subscribe(account_id);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(notice) => {
                    if tx.send(notice).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("subscriber for {account_id} lagged, {skipped} notices dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn handle_command(service: &Service, cmd: Command) -> Reply {
    let label = observability::command_label(&cmd);
    let start = Instant::now();
    let result = execute_command(service, cmd).await;
    metrics::histogram!(observability::COMMAND_DURATION_SECONDS, "command" => label)
        .record(start.elapsed().as_secs_f64());

    match result {
        Ok(value) => {
            metrics::counter!(observability::COMMANDS_TOTAL, "command" => label, "status" => "ok")
                .increment(1);
            Reply::Ok(value)
        }
        Err(e) => {
            metrics::counter!(observability::COMMANDS_TOTAL, "command" => label, "status" => "error")
                .increment(1);
            debug!("{label} failed: {e}");
            Reply::from(&e)
        }
    }
}

pub async fn execute_command(
    service: &Service,
    cmd: Command,
) -> Result<serde_json::Value, EngineError> {
    let engine = &service.engine;
    let directory = &service.directory;
    match cmd {
        Command::RegisterAccount { id, role, contact } => {
            let account = Account { id, role, contact };
            directory.register_account(account.clone())?;
            to_json(account)
        }
        Command::UpsertMentor {
            mentor_id,
            account_id,
            session_price,
            session_duration,
            active,
        } => to_json(directory.upsert_mentor(
            mentor_id,
            account_id,
            session_price,
            session_duration,
            active,
        )?),
        Command::ReplaceAvailability { mentor_id, windows } => {
            to_json(directory.replace_availability(mentor_id, windows)?)
        }
        Command::Availability { mentor_id } => {
            if directory.mentor(&mentor_id).is_none() {
                return Err(EngineError::NotFound(mentor_id));
            }
            to_json(directory.windows(&mentor_id))
        }
        Command::CreateBooking {
            mentee_id,
            mentor_id,
            date,
            time,
            notes,
        } => to_json(
            engine
                .create_booking(mentee_id, mentor_id, SlotKey::new(date, time), notes)
                .await?,
        ),
        Command::ConfirmBooking { booking_id } => to_json(engine.confirm_booking(booking_id).await?),
        Command::CancelBooking {
            booking_id,
            actor_id,
        } => to_json(engine.cancel_booking(booking_id, actor_id).await?),
        Command::CompleteBooking { booking_id } => {
            to_json(engine.complete_booking(booking_id).await?)
        }
        Command::GetBooking { booking_id } => to_json(engine.get_booking(booking_id).await?),
        Command::ListMentorBookings { mentor_id } => {
            to_json(engine.list_bookings_for_mentor(mentor_id).await)
        }
        Command::ListMenteeBookings { mentee_id } => {
            to_json(engine.list_bookings_for_mentee(mentee_id).await)
        }
        Command::SettlePayment { booking_id, method } => {
            to_json(engine.settle_payment(booking_id, method).await?)
        }
        Command::GetPayment { booking_id } => {
            to_json(engine.get_payment_for_booking(booking_id).await?)
        }
        Command::Subscribe { .. } => Err(EngineError::Invalid(
            "subscribe is only available on a live connection",
        )),
    }
}
