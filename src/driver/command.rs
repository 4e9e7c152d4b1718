//! Retry wrapper for command handlers.
//!
//! Callers tune each invocation with labels on the command message:
//! `retry` (extra attempts), `timeout` (seconds per attempt) and
//! `backoff_ms` (first delay, doubled after every failed attempt).
//!
//! A handler completes by returning, optionally after writing a reply to
//! the message's [`Reply`] slot (see [`respond`]). A returned error, a
//! panic, a timeout, or a reply whose `status` is not `success` all count
//! as a failed attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::codec::FrameSink;
use crate::domain::message::{label, NO_REPLY_ID, STATUS_SUCCESS};
use crate::domain::{Labels, Message, Reply};
use crate::rpc::{panic_message, return_frame, BoxFuture, HandlerError};

/// A registered command handler
pub type CommandHandler =
    Arc<dyn Fn(Message) -> BoxFuture<Result<(), HandlerError>> + Send + Sync>;

/// Box a closure as a [`CommandHandler`]
pub fn command_handler<F, Fut>(handler: F) -> CommandHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(handler(message)))
}

const DEFAULT_RETRY: u32 = 0;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_BACKOFF_MS: u64 = 100;

/// Per-invocation retry settings, read from message labels
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub retry: u32,

    /// Limit for a single attempt
    pub timeout: Duration,

    /// Delay after the first failed attempt
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry: DEFAULT_RETRY,
            timeout: DEFAULT_TIMEOUT,
            backoff_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    /// Read `retry`, `timeout` and `backoff_ms`; missing or unparsable
    /// labels fall back to the defaults.
    pub fn from_labels(labels: &Labels) -> Self {
        let defaults = Self::default();

        let retry = labels
            .get(label::RETRY)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.retry);
        let timeout = labels
            .get(label::TIMEOUT)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(defaults.timeout);
        let backoff_ms = labels
            .get(label::BACKOFF_MS)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.backoff_ms);

        Self {
            retry,
            timeout,
            backoff_ms,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry.saturating_add(1)
    }

    /// Delay after failed attempt `attempt` (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }

    /// Check if another attempt is allowed after `attempt`
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }
}

/// What happened to one wrapped command
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub attempts: u32,
    pub delays: Vec<Duration>,
    pub result: Result<Vec<u8>, HandlerError>,
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Answer a command from inside its handler.
///
/// Returns false when the message has no reply slot or nobody waits on it.
pub async fn respond(message: &Message, result: Result<Vec<u8>, HandlerError>) -> bool {
    let Some(reply) = &message.reply else {
        return false;
    };
    let rpc_id = message.label(label::RPC_ID).unwrap_or(NO_REPLY_ID);
    reply
        .send(return_frame(rpc_id, &message.labels, result))
        .await
}

/// Run `handler` under the retry policy carried by `message`
pub async fn run_with_retry(handler: &CommandHandler, message: &Message) -> CommandOutcome {
    let policy = RetryPolicy::from_labels(&message.labels);
    let mut delays = Vec::new();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match attempt_once(handler, message, policy.timeout).await {
            Ok(payload) => {
                debug!(command = %message.subject, attempt, "command succeeded");
                return CommandOutcome {
                    attempts: attempt,
                    delays,
                    result: Ok(payload),
                };
            }
            Err(e) if policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    command = %message.subject,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "command failed, retrying"
                );
                delays.push(delay);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(command = %message.subject, attempts = attempt, error = %e, "command failed");
                return CommandOutcome {
                    attempts: attempt,
                    delays,
                    result: Err(e),
                };
            }
        }
    }
}

/// Run with retries, then send the final result back as `rpc:return`
/// when the command carries a reply ID.
pub async fn execute(
    handler: &CommandHandler,
    message: &Message,
    return_to: &dyn FrameSink,
) -> CommandOutcome {
    let outcome = run_with_retry(handler, message).await;

    if let Some(rpc_id) = message.label(label::RPC_ID) {
        if rpc_id != NO_REPLY_ID {
            let reply = return_frame(rpc_id, &message.labels, outcome.result.clone());
            if let Err(e) = return_to.send_frame(&reply).await {
                warn!(command = %message.subject, error = %e, "failed to relay command result");
            }
        }
    }

    outcome
}

enum Completion {
    Replied(Message),
    Finished(Result<Result<(), HandlerError>, tokio::task::JoinError>),
}

/// One attempt on a private copy of the message
async fn attempt_once(
    handler: &CommandHandler,
    message: &Message,
    timeout: Duration,
) -> Result<Vec<u8>, HandlerError> {
    let (reply, mut rx) = Reply::channel();
    let private = Message {
        channel: message.channel.clone(),
        subject: message.subject.clone(),
        labels: message.labels.clone(),
        payload: message.payload.clone(),
        reply: Some(reply),
    };

    let mut task = tokio::spawn(handler(private));

    let completion = tokio::time::timeout(timeout, async {
        tokio::select! {
            biased;
            Some(reply) = rx.recv() => Completion::Replied(reply),
            joined = &mut task => Completion::Finished(joined),
        }
    })
    .await;

    match completion {
        Ok(Completion::Replied(reply)) => reply_result(reply),
        Ok(Completion::Finished(Ok(Ok(())))) => match rx.try_recv() {
            Ok(reply) => reply_result(reply),
            Err(_) => Ok(Vec::new()),
        },
        Ok(Completion::Finished(Ok(Err(e)))) => Err(e),
        Ok(Completion::Finished(Err(join_err))) => Err(HandlerError(panic_message(join_err))),
        Err(_) => Err(HandlerError(format!(
            "command timed out after {:?}",
            timeout
        ))),
    }
}

fn reply_result(reply: Message) -> Result<Vec<u8>, HandlerError> {
    let failed = match reply.label(label::STATUS) {
        Some(status) => status != STATUS_SUCCESS,
        None => reply.label(label::ERROR).is_some(),
    };

    if failed {
        let error = reply
            .label(label::ERROR)
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!(
                    "command replied with status {}",
                    reply.label(label::STATUS).unwrap_or_default()
                )
            });
        return Err(HandlerError(error));
    }

    reply.payload_bytes().map_err(HandlerError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use crate::domain::message::STATUS_ERROR;
    use crate::rpc::testing::RecordingSink;

    fn command(labels: &[(&str, &str)]) -> Message {
        let mut msg = Message::new("command", "flush");
        for (name, value) in labels {
            msg.set_label(*name, *value);
        }
        msg
    }

    #[test]
    fn test_policy_from_labels() {
        let policy = RetryPolicy::from_labels(&command(&[]).labels);
        assert_eq!(policy, RetryPolicy::default());

        let policy = RetryPolicy::from_labels(
            &command(&[("retry", "3"), ("timeout", "1.5"), ("backoff_ms", "40")]).labels,
        );
        assert_eq!(policy.retry, 3);
        assert_eq!(policy.timeout, Duration::from_millis(1500));
        assert_eq!(policy.backoff_ms, 40);
        assert_eq!(policy.max_attempts(), 4);

        let policy = RetryPolicy::from_labels(&command(&[("retry", "lots"), ("timeout", "-1")]).labels);
        assert_eq!(policy, RetryPolicy::default());
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            backoff_ms: 100,
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_millis(u64::MAX));
    }

    #[tokio::test]
    async fn test_always_failing_handler_is_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = command_handler(move |_msg| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::from("disk full"))
            }
        });

        let outcome = run_with_retry(
            &handler,
            &command(&[("retry", "3"), ("backoff_ms", "5")]),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.attempts, 4);
        assert_eq!(
            outcome.delays,
            vec![
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(20)
            ]
        );
        assert_eq!(outcome.result.unwrap_err().0, "disk full");
    }

    #[tokio::test]
    async fn test_error_status_reply_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = command_handler(move |msg: Message| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    respond(&msg, Err(HandlerError::from("busy"))).await;
                } else {
                    respond(&msg, Ok(b"\"done\"".to_vec())).await;
                }
                Ok(())
            }
        });

        let outcome = run_with_retry(
            &handler,
            &command(&[("retry", "5"), ("backoff_ms", "1")]),
        )
        .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap(), b"\"done\"".to_vec());
    }

    #[tokio::test]
    async fn test_panic_counts_as_failure() {
        let handler = command_handler(|_msg| async move {
            if true {
                panic!("corrupt index");
            }
            Ok(())
        });

        let outcome = run_with_retry(
            &handler,
            &command(&[("retry", "1"), ("backoff_ms", "1")]),
        )
        .await;

        assert_eq!(outcome.attempts, 2);
        let error = outcome.result.unwrap_err().0;
        assert!(error.contains("corrupt index"), "{}", error);
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        let handler = command_handler(|_msg| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });

        let outcome = run_with_retry(&handler, &command(&[("timeout", "0.05")])).await;

        assert_eq!(outcome.attempts, 1);
        assert!(outcome.result.unwrap_err().0.contains("timed out"));
    }

    #[tokio::test]
    async fn test_attempts_see_original_labels() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let handler = command_handler(move |mut msg: Message| {
            let record = record.clone();
            async move {
                record
                    .lock()
                    .unwrap()
                    .push(msg.label("stage").unwrap_or_default().to_string());
                msg.set_label("stage", "mutated");
                Err(HandlerError::from("again"))
            }
        });

        run_with_retry(
            &handler,
            &command(&[("retry", "2"), ("backoff_ms", "1"), ("stage", "original")]),
        )
        .await;

        assert_eq!(*seen.lock().unwrap(), vec!["original"; 3]);
    }

    #[tokio::test]
    async fn test_execute_relays_final_result() {
        let handler = command_handler(|_msg| async move { Err(HandlerError::from("nope")) });
        let sink = RecordingSink::default();

        let outcome = execute(
            &handler,
            &command(&[("rpcID", "12"), ("feature", "kv"), ("caller", "-")]),
            &sink,
        )
        .await;
        assert!(!outcome.is_success());

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is("rpc", "return"));
        assert_eq!(sent[0].label(label::RPC_ID), Some("12"));
        assert_eq!(sent[0].label(label::STATUS), Some(STATUS_ERROR));
        assert_eq!(sent[0].label(label::ERROR), Some("nope"));

        execute(&handler, &command(&[("rpcID", "skip")]), &sink).await;
        execute(&handler, &command(&[]), &sink).await;
        assert_eq!(sink.sent().len(), 1);
    }
}
