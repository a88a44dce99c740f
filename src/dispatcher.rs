//! Background reader thread and handler table.
//!
//! The reader thread owns the transport exclusively for reads; the
//! command path writes through the same handler-table mutex so that
//! installing a one-shot reply handler and sending the command that
//! provokes it are atomic with respect to any other command in flight.
//! Completions are signalled with a `Condvar` rather than a thread-park
//! primitive, giving `Condvar::wait_timeout_while` as the natural home
//! for the per-command timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::{DongleError, DongleResult};
use crate::frame::{self, DecodeOutcome};
use crate::opcode;
use crate::packet::Packet;
use crate::transport::HidTransport;

pub type Handler = Box<dyn FnMut(Packet) + Send>;

#[derive(Clone)]
struct HandlerEntry {
    handler: Arc<Mutex<Handler>>,
    one_shot: bool,
}

struct DispatchState {
    handlers: HashMap<u16, HandlerEntry>,
    last_error: Option<DongleError>,
}

type CompletionSlot = Arc<(Mutex<Option<Packet>>, Condvar)>;

pub struct Dispatcher {
    state: Mutex<DispatchState>,
    transport: Mutex<Box<dyn HidTransport>>,
    exit: AtomicBool,
}

impl Dispatcher {
    /// Spawns the reader thread and returns a handle shared between the
    /// caller (for commands) and the thread (for dispatch).
    pub fn spawn(transport: Box<dyn HidTransport>) -> (Arc<Self>, JoinHandle<()>) {
        let dispatcher = Arc::new(Dispatcher {
            state: Mutex::new(DispatchState {
                handlers: HashMap::new(),
                last_error: None,
            }),
            transport: Mutex::new(transport),
            exit: AtomicBool::new(false),
        });

        let reader_handle = {
            let dispatcher = dispatcher.clone();
            std::thread::Builder::new()
                .name("dongle-reader".into())
                .spawn(move || dispatcher.reader_loop())
                .expect("failed to spawn dongle reader thread")
        };

        (dispatcher, reader_handle)
    }

    /// Installs a persistent handler for an asynchronous notification
    /// opcode. Used at session construction time for the notification
    /// opcodes that always have a home (alarm/status, scan-found,
    /// event-log, sync-time, HMS/keypad).
    pub fn set_persistent_handler(&self, opcode: u16, handler: Handler) {
        let mut state = self.state.lock().unwrap();
        state.handlers.insert(
            opcode,
            HandlerEntry {
                handler: Arc::new(Mutex::new(handler)),
                one_shot: false,
            },
        );
    }

    /// Swaps in a handler for `opcode`, returning whatever was installed
    /// before so the caller can restore it later. Used by `Session::Scan`
    /// to temporarily take over the scan-found notification.
    fn swap_handler(&self, opcode: u16, handler: Handler, one_shot: bool) -> Option<RestoreToken> {
        let mut state = self.state.lock().unwrap();
        let previous = state.handlers.insert(
            opcode,
            HandlerEntry {
                handler: Arc::new(Mutex::new(handler)),
                one_shot,
            },
        );
        previous.map(RestoreToken)
    }

    fn restore_handler(&self, opcode: u16, previous: Option<RestoreToken>) {
        let mut state = self.state.lock().unwrap();
        match previous {
            Some(RestoreToken(entry)) => {
                state.handlers.insert(opcode, entry);
            }
            None => {
                state.handlers.remove(&opcode);
            }
        }
    }

    /// Temporarily installs a notification handler, invokes `body`, then
    /// restores whatever handler was there before — on every exit path.
    pub fn with_temporary_handler<T>(
        &self,
        opcode: u16,
        handler: Handler,
        body: impl FnOnce() -> T,
    ) -> T {
        let previous = self.swap_handler(opcode, handler, false);
        let result = body();
        self.restore_handler(opcode, previous);
        result
    }

    fn write_locked(&self, pkt: &Packet) -> DongleResult<()> {
        let wire = frame::encode(pkt);
        let mut transport = self.transport.lock().unwrap();
        transport.write(&wire)
    }

    /// Issues `pkt` without waiting for a reply. Used for fire-and-forget
    /// writes (enable/disable scan, sync-time ack) that the caller either
    /// doesn't expect a reply to, or is already tracking via a separately
    /// installed handler.
    pub fn send(&self, pkt: &Packet) -> DongleResult<()> {
        self.write_locked(pkt)
    }

    /// Issues `pkt`, waits up to `timeout` for the dongle's reply
    /// (opcode `pkt.opcode() + 1`), and returns it.
    pub fn do_command(&self, pkt: Packet, timeout: Duration) -> DongleResult<Packet> {
        let command_opcode = pkt.opcode();
        let reply_opcode = opcode::reply_opcode(command_opcode);

        let slot: CompletionSlot = Arc::new((Mutex::new(None), Condvar::new()));
        let slot_for_handler = slot.clone();
        let handler: Handler = Box::new(move |reply: Packet| {
            let (lock, cvar) = &*slot_for_handler;
            let mut guard = lock.lock().unwrap();
            *guard = Some(reply);
            cvar.notify_one();
        });

        // Install-then-send is one critical section (the state lock is
        // held across both) so a send can never race a different
        // caller's handler installation for the same reply opcode.
        let previous = {
            let mut state = self.state.lock().unwrap();
            let previous = state.handlers.insert(
                reply_opcode,
                HandlerEntry {
                    handler: Arc::new(Mutex::new(handler)),
                    one_shot: true,
                },
            );
            if let Err(e) = self.write_locked(&pkt) {
                match previous {
                    Some(p) => {
                        state.handlers.insert(reply_opcode, p);
                    }
                    None => {
                        state.handlers.remove(&reply_opcode);
                    }
                }
                return Err(e);
            }
            previous.map(RestoreToken)
        };

        let (lock, cvar) = &*slot;
        let guard = lock.lock().unwrap();
        let (mut guard, wait_result) = cvar
            .wait_timeout_while(guard, timeout, |reply| reply.is_none())
            .unwrap();

        self.restore_handler(reply_opcode, previous);

        if wait_result.timed_out() {
            return Err(DongleError::Timeout {
                opcode: command_opcode,
                millis: timeout.as_millis() as u64,
            });
        }
        Ok(guard.take().expect("condvar woke without a reply"))
    }

    pub fn check_error(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .last_error
            .as_ref()
            .map(|e| e.to_string())
    }

    pub fn stop(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }

    fn note_fatal(&self, err: DongleError) {
        warn!(error = %err, "dongle reader thread fault");
        self.state.lock().unwrap().last_error = Some(err);
    }

    fn dispatch(&self, pkt: Packet) {
        let opcode = pkt.opcode();

        if opcode::is_async(opcode) && opcode != opcode::ASYNC_ACK {
            let ack = Packet::async_ack(opcode);
            if let Err(e) = self.write_locked(&ack) {
                self.note_fatal(e);
                return;
            }
        }

        let entry = {
            let mut state = self.state.lock().unwrap();
            if let Some(entry) = state.handlers.get(&opcode).cloned() {
                if entry.one_shot {
                    state.handlers.remove(&opcode);
                }
                Some(entry)
            } else {
                None
            }
        };

        match entry {
            Some(entry) => {
                let mut handler = entry.handler.lock().unwrap();
                handler(pkt);
            }
            None => trace!(opcode = format!("{opcode:#06x}"), "no handler installed"),
        }
    }

    fn reader_loop(self: Arc<Self>) {
        let mut buf: Vec<u8> = Vec::new();

        loop {
            if self.exit.load(Ordering::SeqCst) {
                break;
            }

            let chunk = {
                let mut transport = self.transport.lock().unwrap();
                transport.read()
            };
            match chunk {
                Ok(bytes) => {
                    if bytes.is_empty() {
                        std::thread::sleep(Duration::from_millis(100));
                        continue;
                    }
                    buf.extend_from_slice(&bytes);
                }
                Err(e) => {
                    self.note_fatal(e);
                    break;
                }
            }

            loop {
                match frame::decode(&buf) {
                    DecodeOutcome::NeedMore => break,
                    DecodeOutcome::Invalid => {
                        let drop_n = buf.len().min(2);
                        buf.drain(..drop_n);
                    }
                    DecodeOutcome::Decoded(pkt, consumed) => {
                        debug!(opcode = format!("{:#06x}", pkt.opcode()), "received packet");
                        buf.drain(..consumed);
                        self.dispatch(pkt);
                    }
                }
            }
        }
    }
}

struct RestoreToken(HandlerEntry);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::scripted::ScriptedTransport;
    use std::sync::mpsc;

    fn spawn_with_reads(reads: Vec<Vec<u8>>) -> (Arc<Dispatcher>, JoinHandle<()>) {
        let mut transport = ScriptedTransport::new();
        for r in reads {
            transport.push_read(r);
        }
        Dispatcher::spawn(Box::new(transport))
    }

    #[test]
    fn inquiry_round_trip_receives_reply() {
        let reply = frame::encode(&Packet::Command {
            opcode: opcode::reply_opcode(opcode::INQUIRY),
            payload: vec![0x01],
        });
        let (dispatcher, _reader) = spawn_with_reads(vec![reply]);

        let result = dispatcher
            .do_command(Packet::inquiry(), Duration::from_secs(1))
            .expect("inquiry should succeed");
        assert_eq!(result.payload(), &[0x01]);
        dispatcher.stop();
    }

    #[test]
    fn timeout_when_no_reply_arrives() {
        let (dispatcher, _reader) = spawn_with_reads(vec![]);
        let result = dispatcher.do_command(Packet::inquiry(), Duration::from_millis(150));
        assert!(matches!(result, Err(DongleError::Timeout { .. })));
        dispatcher.stop();
    }

    #[test]
    fn async_notification_gets_acked_and_dispatched_in_order() {
        let alarm_opcode = opcode::NOTIFY_ALARM;
        let alarm = frame::encode(&Packet::Command {
            opcode: alarm_opcode,
            payload: vec![1, 2, 3],
        });
        let (dispatcher, _reader) = spawn_with_reads(vec![alarm]);

        let (tx, rx) = mpsc::channel();
        dispatcher.set_persistent_handler(
            alarm_opcode,
            Box::new(move |pkt| {
                tx.send(pkt).unwrap();
            }),
        );

        let received = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(received.opcode(), alarm_opcode);
        dispatcher.stop();
    }

    #[test]
    fn split_frame_still_decodes_to_one_event() {
        let alarm = frame::encode(&Packet::Command {
            opcode: opcode::NOTIFY_ALARM,
            payload: vec![9, 9, 9],
        });
        let (first, second) = alarm.split_at(3);
        let (dispatcher, _reader) = spawn_with_reads(vec![first.to_vec(), second.to_vec()]);

        let (tx, rx) = mpsc::channel();
        dispatcher.set_persistent_handler(
            opcode::NOTIFY_ALARM,
            Box::new(move |pkt| tx.send(pkt).unwrap()),
        );

        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received.payload(), &[9, 9, 9]);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        dispatcher.stop();
    }

    #[test]
    fn garbage_prefix_is_skipped() {
        let alarm = frame::encode(&Packet::Command {
            opcode: opcode::NOTIFY_ALARM,
            payload: vec![7],
        });
        let mut stream = vec![0xDE, 0xAD, 0xBE, 0xEF];
        stream.extend_from_slice(&alarm);
        let (dispatcher, _reader) = spawn_with_reads(vec![stream]);

        let (tx, rx) = mpsc::channel();
        dispatcher.set_persistent_handler(
            opcode::NOTIFY_ALARM,
            Box::new(move |pkt| tx.send(pkt).unwrap()),
        );
        let received = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(received.payload(), &[7]);
        dispatcher.stop();
    }
}
