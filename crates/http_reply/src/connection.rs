use std::{net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::broadcast,
};

use crate::{
    activity::{ActivityEvent, ActivityLog, CloseReason},
    emitter,
    sequencer::{DispatchTrigger, Sequencer},
    server::{ServerSettings, Shutdown},
    sniffer::{RequestSniffer, Termination},
    store::ClosingHint,
};

const DEFAULT_BUF_SIZE: usize = 1024;

/// How a connection ended, as tallied by the acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// Closed normally after `dispatched` cases.
    Closed { dispatched: usize },
    /// Closed without a payload because the cases ran out.
    Refused,
    /// Ended by an I/O error after `dispatched` cases.
    Aborted { dispatched: usize },
}

/// Everything connections share: the sequencer, the activity log, the
/// settings and the channel used to stop the acceptor.
#[derive(Debug)]
pub(crate) struct ConnectionContext {
    pub(crate) sequencer: Arc<Sequencer>,
    pub(crate) activity: ActivityLog,
    pub(crate) settings: ServerSettings,
    pub(crate) stop: broadcast::Sender<Shutdown>,
}

impl ConnectionContext {
    fn signal_exhausted(&self) {
        // no receiver only means the acceptor is already gone
        let _ = self.stop.send(Shutdown::Exhausted);
    }
}

enum Exit {
    Closed(CloseReason),
    Refused,
    Aborted(String),
}

/// `Connection` exclusively owns one accepted stream for its whole life.
pub(crate) struct Connection<S> {
    id: u64,
    peer: SocketAddr,
    stream: S,
    sniffer: RequestSniffer,
    dispatched: usize,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(id: u64, peer: SocketAddr, stream: S, settings: &ServerSettings) -> Self {
        Self {
            id,
            peer,
            stream,
            sniffer: RequestSniffer::new(settings.max_request_bytes),
            dispatched: 0,
        }
    }

    pub(crate) async fn run(mut self, ctx: &ConnectionContext) -> ConnectionOutcome {
        ctx.activity.record(ActivityEvent::ConnectionAccepted {
            connection: self.id,
            peer: self.peer,
        });

        let (reason, outcome) = match self.exchange(ctx).await {
            Exit::Closed(reason) => (
                reason,
                ConnectionOutcome::Closed {
                    dispatched: self.dispatched,
                },
            ),
            Exit::Refused => (CloseReason::Exhausted, ConnectionOutcome::Refused),
            Exit::Aborted(message) => {
                ctx.activity.record(ActivityEvent::Error {
                    connection: Some(self.id),
                    peer: Some(self.peer),
                    message,
                });
                (
                    CloseReason::Aborted,
                    ConnectionOutcome::Aborted {
                        dispatched: self.dispatched,
                    },
                )
            }
        };

        if reason != CloseReason::Aborted {
            self.close(ctx).await;
        }

        ctx.activity.record(ActivityEvent::ConnectionClosed {
            connection: self.id,
            peer: self.peer,
            reason,
        });

        outcome
    }

    async fn exchange(&mut self, ctx: &ConnectionContext) -> Exit {
        loop {
            let summary = match self
                .sniffer
                .sniff(&mut self.stream, ctx.settings.read_timeout)
                .await
            {
                Ok(summary) => summary,
                Err(err) => return Exit::Aborted(format!("Error reading request: {err}")),
            };

            // follow-ups need an actual request, the first case goes out regardless
            if self.dispatched > 0 && summary.is_empty() {
                return Exit::Closed(match summary.termination {
                    Termination::PeerClosed => CloseReason::PeerClosed,
                    _ => CloseReason::Idle,
                });
            }

            ctx.activity.record(ActivityEvent::RequestBytes {
                connection: self.id,
                peer: self.peer,
                summary,
            });

            let Some(dispatch) = ctx.sequencer.next() else {
                ctx.signal_exhausted();
                return if self.dispatched == 0 {
                    Exit::Refused
                } else {
                    Exit::Closed(CloseReason::Exhausted)
                };
            };

            if dispatch.exhausts {
                ctx.signal_exhausted();
            }

            let bytes = match emitter::emit(&mut self.stream, dispatch.case.payload()).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    return Exit::Aborted(format!(
                        "Failed injecting testcase #{} ({}): {err}",
                        dispatch.position,
                        dispatch.case.name()
                    ))
                }
            };

            self.dispatched += 1;
            ctx.activity.record(ActivityEvent::ResponseDispatched {
                connection: self.id,
                peer: self.peer,
                sequence: dispatch.sequence,
                position: dispatch.position,
                name: dispatch.case.name().to_owned(),
                bytes,
            });

            match (ctx.settings.trigger, dispatch.case.closing()) {
                (_, ClosingHint::Close) => return Exit::Closed(CloseReason::Completed),
                (DispatchTrigger::PerRequest, ClosingHint::KeepOpen) => continue,
                (DispatchTrigger::PerConnection, ClosingHint::KeepOpen) => {
                    return self.linger(ctx).await
                }
            }
        }
    }

    /// Holds a kept-open connection, discarding input, until the client
    /// leaves or stays quiet for a whole read timeout.
    async fn linger(&mut self, ctx: &ConnectionContext) -> Exit {
        let mut scratch = [0u8; DEFAULT_BUF_SIZE];

        loop {
            let read =
                tokio::time::timeout(ctx.settings.read_timeout, self.stream.read(&mut scratch))
                    .await;

            match read {
                Err(_elapsed) => return Exit::Closed(CloseReason::Idle),
                Ok(Ok(0)) => return Exit::Closed(CloseReason::PeerClosed),
                Ok(Ok(_)) => continue,
                Ok(Err(err)) => {
                    use std::io::ErrorKind::{ConnectionAborted, ConnectionReset};
                    return match err.kind() {
                        ConnectionReset | ConnectionAborted => {
                            Exit::Closed(CloseReason::PeerClosed)
                        }
                        _ => Exit::Aborted(format!("Error reading from client: {err}")),
                    };
                }
            }
        }
    }

    async fn close(&mut self, ctx: &ConnectionContext) {
        if !ctx.settings.close_delay.is_zero() {
            tokio::time::sleep(ctx.settings.close_delay).await;
        }

        if let Err(err) = self.stream.shutdown().await {
            reply_trace::debug!("Connection #{}: error closing socket: {}", self.id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        activity::{ActivityRecord, MemoryActivity},
        sequencer::SequenceMode,
        store::{TestCase, TestCaseStore},
    };
    use std::time::Duration;

    fn context(
        cases: Vec<TestCase>,
        mode: SequenceMode,
        trigger: DispatchTrigger,
        activity: Arc<MemoryActivity>,
    ) -> (ConnectionContext, broadcast::Receiver<Shutdown>) {
        let store = TestCaseStore::from_cases("memory", cases).expect("should build store");
        let (stop, stop_signal) = broadcast::channel(8);
        let settings = ServerSettings {
            read_timeout: Duration::from_millis(150),
            trigger,
            ..ServerSettings::default()
        };

        (
            ConnectionContext {
                sequencer: Sequencer::shared(store, mode),
                activity: ActivityLog::default().with_sink(activity),
                settings,
                stop,
            },
            stop_signal,
        )
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 50000))
    }

    fn closed_reasons(records: &[ActivityRecord]) -> Vec<CloseReason> {
        records
            .iter()
            .filter_map(|record| match record.event {
                ActivityEvent::ConnectionClosed { reason, .. } => Some(reason),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn one_case_per_connection_then_close() {
        let activity = MemoryActivity::shared();
        let (ctx, _stop) = context(
            vec![TestCase::new("A", &b"HTTP/1.1 200 OK\r\n\r\n"[..])],
            SequenceMode::Loop,
            DispatchTrigger::PerConnection,
            activity.clone(),
        );

        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"GET / HTTP/1.1\r\n\r\n")
            .await
            .expect("should send request");

        let outcome = Connection::new(1, peer(), server, &ctx.settings).run(&ctx).await;
        assert_eq!(outcome, ConnectionOutcome::Closed { dispatched: 1 });

        let mut received = Vec::new();
        client
            .read_to_end(&mut received)
            .await
            .expect("should read response");
        assert_eq!(received, b"HTTP/1.1 200 OK\r\n\r\n");

        assert_eq!(
            closed_reasons(&activity.snapshot()),
            vec![CloseReason::Completed]
        );
    }

    #[tokio::test]
    async fn close_delay_holds_the_socket_after_the_payload() {
        const DELAY: Duration = Duration::from_millis(300);

        let activity = MemoryActivity::shared();
        let (mut ctx, _stop) = context(
            vec![TestCase::new("A", &b"HTTP/1.1 200 OK\r\n\r\n"[..])],
            SequenceMode::Loop,
            DispatchTrigger::PerConnection,
            activity,
        );
        ctx.settings.close_delay = DELAY;

        let (mut client, server) = tokio::io::duplex(1024);
        let handler = tokio::spawn(async move {
            Connection::new(1, peer(), server, &ctx.settings).run(&ctx).await
        });

        let started = tokio::time::Instant::now();
        client
            .write_all(b"GET / HTTP/1.1\r\n\r\n")
            .await
            .expect("should send request");

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.expect("should read");

        assert!(started.elapsed() >= DELAY);
        assert_eq!(received, b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(
            handler.await.expect("handler should finish"),
            ConnectionOutcome::Closed { dispatched: 1 }
        );
    }

    #[tokio::test]
    async fn silent_client_still_receives_a_case() {
        let activity = MemoryActivity::shared();
        let (ctx, _stop) = context(
            vec![TestCase::new("A", &b"not even http"[..])],
            SequenceMode::Loop,
            DispatchTrigger::PerConnection,
            activity.clone(),
        );

        let (mut client, server) = tokio::io::duplex(1024);
        let outcome = Connection::new(1, peer(), server, &ctx.settings).run(&ctx).await;
        assert_eq!(outcome, ConnectionOutcome::Closed { dispatched: 1 });

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.expect("should read");
        assert_eq!(received, b"not even http");
    }

    #[tokio::test]
    async fn per_request_trigger_chains_keep_open_cases() {
        let activity = MemoryActivity::shared();
        let (ctx, _stop) = context(
            vec![
                TestCase::new("1.keep", &b"first|"[..]),
                TestCase::new("2", &b"second|"[..]),
                TestCase::new("3", &b"third|"[..]),
            ],
            SequenceMode::Loop,
            DispatchTrigger::PerRequest,
            activity.clone(),
        );

        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"GET /1 HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\nGET /3 HTTP/1.1\r\n\r\n")
            .await
            .expect("should send requests");

        let outcome = Connection::new(1, peer(), server, &ctx.settings).run(&ctx).await;
        assert_eq!(outcome, ConnectionOutcome::Closed { dispatched: 2 });

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.expect("should read");
        assert_eq!(received, b"first|second|");
        assert_eq!(activity.dispatches(), vec![(1, 0, 0), (1, 1, 1)]);
    }

    #[tokio::test]
    async fn per_request_follow_up_needs_a_request() {
        let activity = MemoryActivity::shared();
        let (ctx, _stop) = context(
            vec![TestCase::new("1.keep", &b"kept"[..]), TestCase::new("2", &b"x"[..])],
            SequenceMode::Loop,
            DispatchTrigger::PerRequest,
            activity.clone(),
        );

        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"GET / HTTP/1.1\r\n\r\n")
            .await
            .expect("should send request");

        let outcome = Connection::new(1, peer(), server, &ctx.settings).run(&ctx).await;
        assert_eq!(outcome, ConnectionOutcome::Closed { dispatched: 1 });
        assert_eq!(closed_reasons(&activity.snapshot()), vec![CloseReason::Idle]);
        assert_eq!(ctx.sequencer.issued(), 1);
    }

    #[tokio::test]
    async fn keep_open_case_lingers_until_client_leaves() {
        let activity = MemoryActivity::shared();
        let (ctx, _stop) = context(
            vec![TestCase::new("1.keep", &b"HTTP/1.1 200 OK\r\n\r\npartial"[..])],
            SequenceMode::Loop,
            DispatchTrigger::PerConnection,
            activity.clone(),
        );

        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"GET / HTTP/1.1\r\n\r\n")
            .await
            .expect("should send request");

        let handler = tokio::spawn(async move {
            let outcome = Connection::new(1, peer(), server, &ctx.settings).run(&ctx).await;
            (outcome, ctx)
        });

        let mut head = [0u8; 26];
        client.read_exact(&mut head).await.expect("should read payload");
        assert_eq!(&head, b"HTTP/1.1 200 OK\r\n\r\npartial");
        drop(client);

        let (outcome, ctx) = handler.await.expect("handler should finish");
        assert_eq!(outcome, ConnectionOutcome::Closed { dispatched: 1 });
        assert_eq!(ctx.sequencer.issued(), 1);
        assert_eq!(
            closed_reasons(&activity.snapshot()),
            vec![CloseReason::PeerClosed]
        );
    }

    #[tokio::test]
    async fn exhausted_single_pass_refuses_and_signals_stop() {
        let activity = MemoryActivity::shared();
        let (ctx, mut stop) = context(
            vec![TestCase::new("A", &b"only"[..])],
            SequenceMode::SinglePass,
            DispatchTrigger::PerConnection,
            activity.clone(),
        );

        let (_first_client, first) = tokio::io::duplex(1024);
        let outcome = Connection::new(1, peer(), first, &ctx.settings).run(&ctx).await;
        assert_eq!(outcome, ConnectionOutcome::Closed { dispatched: 1 });
        assert_eq!(stop.try_recv().ok(), Some(Shutdown::Exhausted));

        let (mut second_client, second) = tokio::io::duplex(1024);
        let outcome = Connection::new(2, peer(), second, &ctx.settings).run(&ctx).await;
        assert_eq!(outcome, ConnectionOutcome::Refused);

        let mut received = Vec::new();
        second_client
            .read_to_end(&mut received)
            .await
            .expect("should read");
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn write_failure_aborts_the_connection() {
        let activity = MemoryActivity::shared();
        let (ctx, _stop) = context(
            vec![TestCase::new("A", &b"HTTP/1.1 200 OK\r\n\r\n"[..])],
            SequenceMode::Loop,
            DispatchTrigger::PerConnection,
            activity.clone(),
        );

        let (client, server) = tokio::io::duplex(1024);
        drop(client);

        let outcome = Connection::new(1, peer(), server, &ctx.settings).run(&ctx).await;
        assert_eq!(outcome, ConnectionOutcome::Aborted { dispatched: 0 });
        assert_eq!(ctx.sequencer.issued(), 1);

        let records = activity.snapshot();
        assert!(records
            .iter()
            .any(|record| matches!(record.event, ActivityEvent::Error { .. })));
        assert_eq!(closed_reasons(&records), vec![CloseReason::Aborted]);
    }
}
